//! The Paxos wire message and application cargo.
//!
//! `PaxMsg` is the single message shape exchanged between nodes; the `op`
//! field selects the handler. Cargo rides inside [`AppData`] entries; a
//! learned slot may carry several batched payloads sharing one `lsn`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::site::NodeAddress;
use crate::snapshot::GcsSnapshot;
use crate::synode::{Ballot, NodeNo, Synode};

/// The closed set of message operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaxOp {
    /// Request from a local client, not yet assigned a slot.
    ClientMsg,
    /// Fresh slot, no traffic yet.
    Initial,
    /// Phase 1a.
    Prepare,
    /// Phase 1b carrying a previously accepted value.
    AckPrepare,
    /// Phase 1b with nothing accepted.
    AckPrepareEmpty,
    /// Phase 2a.
    Accept,
    /// Phase 2b.
    AckAccept,
    /// Phase 2b that also acknowledges a piggybacked skip.
    MultiAckAccept,
    /// Broadcast of a decided value.
    Learn,
    /// Decision broadcast without the value; peers promote their accepted
    /// message or ask for a read.
    TinyLearn,
    /// Re-broadcast of a decided value during snapshot catch-up.
    RecoverLearn,
    /// Unilateral no-op decision by the slot owner.
    Skip,
    /// Ask a peer for a decided value.
    Read,
    /// Ask a peer for a full snapshot.
    NeedBoot,
    /// Snapshot transfer.
    Snapshot,
    /// "You are too far behind; rejoin via snapshot."
    Die,
    /// Liveness beacon.
    IAmAlive,
    /// Liveness probe.
    AreYouAlive,
    /// Reply to a local client request.
    ClientReply,
}

/// Whether a decided value is a real payload or a no-op filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MsgType {
    #[default]
    Normal,
    NoOp,
}

/// Outcome code returned to a local client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyCode {
    Ok,
    Fail,
    Retry,
}

/// Reply to a local client request, with any payload the operation returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReply {
    pub code: ReplyCode,
    /// Answer to `GetEventHorizon`.
    pub event_horizon: Option<u32>,
    /// Answer to `GetSynodeAppData`.
    pub app_data: Vec<AppData>,
}

impl ClientReply {
    #[must_use]
    pub fn code(code: ReplyCode) -> Self {
        Self {
            code,
            event_horizon: None,
            app_data: Vec::new(),
        }
    }
}

/// Delivery outcome passed to the application callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Ok,
    Failure,
}

/// The closed set of client cargo kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cargo {
    /// Opaque application payload, delivered in total order.
    App(Bytes),
    /// Bootstrap a brand new group with this member list.
    UnifiedBoot(Vec<NodeAddress>),
    AddNode(Vec<NodeAddress>),
    RemoveNode(Vec<NodeAddress>),
    ForceConfig(Vec<NodeAddress>),
    SetEventHorizon(u32),
    GetEventHorizon,
    GetSynodeAppData(Vec<Synode>),
    /// Membership-view notification payload.
    ViewMsg,
    EnableArbitrator,
    DisableArbitrator,
    SetCacheLimit(u64),
    Exit,
    Reset,
    RemoveReset,
    TerminateAndExit,
    ConvertIntoLocalServer,
}

impl Cargo {
    /// Configuration commands get a slot of their own and are applied by the
    /// executor when their slot is reached.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Cargo::UnifiedBoot(_)
                | Cargo::AddNode(_)
                | Cargo::RemoveNode(_)
                | Cargo::ForceConfig(_)
                | Cargo::SetEventHorizon(_)
        )
    }

    #[must_use]
    pub fn is_view(&self) -> bool {
        matches!(self, Cargo::ViewMsg)
    }
}

/// One client payload inside a decided slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppData {
    /// The slot this payload was decided at; set when the proposer brands
    /// the message with its slot.
    pub app_key: Synode,
    /// Proposer-unique tag used to recognize our own message in a learned
    /// value (`(node, timestamp-hash, slot)` folded into a synode).
    pub unique_id: Synode,
    /// Per-node monotonic sequence tag, shared by all payloads of a batch.
    pub lsn: u64,
    /// Set once consensus has decided this payload.
    pub chosen: bool,
    pub body: Cargo,
}

impl AppData {
    #[must_use]
    pub fn new(body: Cargo) -> Self {
        Self {
            app_key: Synode::NULL,
            unique_id: Synode::NULL,
            lsn: 0,
            chosen: false,
            body,
        }
    }
}

/// The Paxos message. One shape for every `op`; unused fields stay at their
/// defaults and serialize compactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxMsg {
    pub synode: Synode,
    pub from: NodeNo,
    pub to: NodeNo,
    pub op: PaxOp,
    /// Ballot this message proposes or acknowledges.
    pub proposal: Ballot,
    /// For acks: the ballot of the request being answered.
    pub reply_to: Ballot,
    pub msg_type: MsgType,
    pub force_delivery: bool,
    /// Batched payloads; empty for no-ops and protocol-only traffic.
    pub cargo: Vec<AppData>,
    /// Piggybacked high-water marks.
    pub max_synode: Synode,
    pub delivered_msg: Synode,
    /// Present on `Snapshot` only.
    pub snapshot: Option<GcsSnapshot>,
    /// Present on `ClientReply` only.
    pub client_reply: Option<ClientReply>,
    /// Identity of the requester on `NeedBoot`.
    pub boot_identity: Option<NodeAddress>,
}

impl PaxMsg {
    #[must_use]
    pub fn new(synode: Synode, op: PaxOp) -> Self {
        Self {
            synode,
            from: NodeNo::VOID,
            to: NodeNo::VOID,
            op,
            proposal: Ballot::default(),
            reply_to: Ballot::default(),
            msg_type: MsgType::Normal,
            force_delivery: false,
            cargo: Vec::new(),
            max_synode: Synode::NULL,
            delivered_msg: Synode::NULL,
            snapshot: None,
            client_reply: None,
            boot_identity: None,
        }
    }

    /// Start a reply to this message: same slot, addressed back to the
    /// sender, acknowledging the sender's ballot.
    #[must_use]
    pub fn reply(&self, op: PaxOp) -> Self {
        let mut reply = Self::new(self.synode, op);
        reply.to = self.from;
        reply.reply_to = self.proposal;
        reply
    }

    /// Turn this message into a no-op (used for gap filling and for
    /// teaching peers about slots outside the owner space).
    pub fn set_noop(&mut self) {
        self.msg_type = MsgType::NoOp;
        self.cargo.clear();
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.msg_type == MsgType::NoOp
    }

    /// Whether the decided value carries a configuration command.
    #[must_use]
    pub fn config_cargo(&self) -> Option<&Cargo> {
        self.cargo
            .first()
            .map(|a| &a.body)
            .filter(|c| c.is_config())
    }
}
