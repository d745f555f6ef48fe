//! Protocol versioning and the connection handshake.
//!
//! Every connection starts with a version negotiation; application traffic
//! flows only after the peer's range has been intersected with ours. Some
//! behaviors are gated on the lowest version spoken by a whole site (see
//! [`ProtoVersion::FIRST_IGNORES_INTERMEDIATE_FORCED`]).

use serde::{Deserialize, Serialize};

use crate::synode::GroupId;

/// Wire protocol version, ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ProtoVersion {
    V1_0,
    V1_1,
    V1_2,
    V1_3,
    V1_4,
    V1_5,
    V1_6,
    V1_7,
    V1_8,
    V1_9,
}

impl ProtoVersion {
    pub const CURRENT: Self = Self::V1_9;
    pub const OLDEST_SUPPORTED: Self = Self::V1_2;
    /// First version that understands event-horizon reconfiguration.
    pub const FIRST_EVENT_HORIZON_AWARE: Self = Self::V1_4;
    /// First version that can address IPv6-only members. Groups whose
    /// lowest common version predates this may only admit nodes with an
    /// IPv4-reachable address.
    pub const FIRST_IPV6_AWARE: Self = Self::V1_5;
    /// First version whose non-owner nodes ignore forced configurations
    /// relayed mid-stream, preventing double-apply across mixed-version
    /// upgrades.
    pub const FIRST_IGNORES_INTERMEDIATE_FORCED: Self = Self::V1_8;

    /// Highest common version, if the ranges overlap at all.
    #[must_use]
    pub fn negotiate(ours: (Self, Self), theirs: (Self, Self)) -> Option<Self> {
        let low = ours.0.max(theirs.0);
        let high = ours.1.min(theirs.1);
        (low <= high).then_some(high)
    }
}

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handshake {
    VersionReq {
        group_id: GroupId,
        min: ProtoVersion,
        max: ProtoVersion,
    },
}

/// Answer to [`Handshake::VersionReq`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeResponse {
    Accepted(ProtoVersion),
    /// The ranges do not overlap; the connection will be dropped.
    Unsupported {
        min: ProtoVersion,
        max: ProtoVersion,
    },
    WrongGroup,
}
