//! Membership generations.
//!
//! A [`SiteDef`] is one generation of group membership: its member list, the
//! slot at which it takes effect (`start`), the slot at which its boot
//! command was decided (`boot_key`, the site's identity), and the event
//! horizon in force while it is active. Sites form an append-only history;
//! the site governing a slot is the one with the largest `start` not above
//! that slot.

use serde::{Deserialize, Serialize};

use crate::proto::ProtoVersion;
use crate::synode::{NodeNo, Synode};

/// Smallest admissible event horizon, and the default for new groups.
pub const EVENT_HORIZON_MIN: u32 = 10;
/// Largest admissible event horizon.
pub const EVENT_HORIZON_MAX: u32 = 200;
pub const DEFAULT_EVENT_HORIZON: u32 = EVENT_HORIZON_MIN;

/// A member's network identity: dialable address plus a stable unique id
/// that survives address changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    /// `host:port`.
    pub address: String,
    /// Opaque stable identity, compared byte-wise.
    pub uuid: Vec<u8>,
    /// Protocol range this node speaks.
    pub proto_min: ProtoVersion,
    pub proto_max: ProtoVersion,
}

impl NodeAddress {
    #[must_use]
    pub fn new(address: impl Into<String>, uuid: impl Into<Vec<u8>>) -> Self {
        Self {
            address: address.into(),
            uuid: uuid.into(),
            proto_min: ProtoVersion::OLDEST_SUPPORTED,
            proto_max: ProtoVersion::CURRENT,
        }
    }

    /// Whether the address literal is IPv4-reachable (not a bare IPv6
    /// literal). Pre-IPv6 groups may only admit such nodes.
    #[must_use]
    pub fn has_ipv4_address(&self) -> bool {
        !self.address.starts_with('[')
    }
}

/// Fixed-width member bitset. Sites are capped well below 64 members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSet {
    bits: u64,
}

impl NodeSet {
    #[must_use]
    pub fn empty() -> Self {
        Self { bits: 0 }
    }

    /// All of the first `n` nodes.
    #[must_use]
    pub fn full(n: u16) -> Self {
        if n == 0 {
            Self::empty()
        } else {
            Self {
                bits: u64::MAX >> (64 - u32::from(n.min(64))),
            }
        }
    }

    pub fn set(&mut self, node: NodeNo) {
        if !node.is_void() && node.0 < 64 {
            self.bits |= 1 << node.0;
        }
    }

    pub fn clear(&mut self, node: NodeNo) {
        if !node.is_void() && node.0 < 64 {
            self.bits &= !(1 << node.0);
        }
    }

    #[must_use]
    pub fn contains(&self, node: NodeNo) -> bool {
        !node.is_void() && node.0 < 64 && self.bits & (1 << node.0) != 0
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    pub fn zero(&mut self) {
        self.bits = 0;
    }

    /// True if this set covers every member of `all`.
    #[must_use]
    pub fn covers(&self, all: Self) -> bool {
        self.bits & all.bits == all.bits
    }
}

/// One membership generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDef {
    /// First slot governed by this site.
    pub start: Synode,
    /// Slot at which the command creating this site was decided. This is
    /// the site's identity.
    pub boot_key: Synode,
    pub nodes: Vec<NodeAddress>,
    pub event_horizon: u32,
    /// Lowest protocol version spoken by every member.
    pub x_proto: ProtoVersion,
    /// Members considered part of the group for view reporting.
    pub global_node_set: NodeSet,
    /// This node's index in `nodes`, recomputed after deserialization.
    #[serde(skip)]
    pub nodeno: NodeNo,
}

impl SiteDef {
    #[must_use]
    pub fn new(nodes: Vec<NodeAddress>, event_horizon: u32) -> Self {
        let n = u16::try_from(nodes.len()).unwrap_or(u16::MAX);
        Self {
            start: Synode::NULL,
            boot_key: Synode::NULL,
            nodes,
            event_horizon,
            x_proto: ProtoVersion::CURRENT,
            global_node_set: NodeSet::full(n),
            nodeno: NodeNo::VOID,
        }
    }

    #[must_use]
    pub fn max_nodes(&self) -> u16 {
        u16::try_from(self.nodes.len()).unwrap_or(u16::MAX)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Recompute this node's index from its stable identity.
    pub fn set_nodeno_for(&mut self, uuid: &[u8]) {
        self.nodeno = self.find_uuid(uuid).unwrap_or(NodeNo::VOID);
    }

    #[must_use]
    pub fn find_uuid(&self, uuid: &[u8]) -> Option<NodeNo> {
        self.nodes
            .iter()
            .position(|n| n.uuid == uuid)
            .and_then(|i| u16::try_from(i).ok())
            .map(NodeNo)
    }

    #[must_use]
    pub fn contains_address(&self, address: &str) -> bool {
        self.nodes.iter().any(|n| n.address == address)
    }

    #[must_use]
    pub fn address_of(&self, node: NodeNo) -> Option<&NodeAddress> {
        self.nodes.get(usize::from(node.0))
    }

    /// Slot `start + event_horizon`, the far edge of this site's window.
    #[must_use]
    pub fn horizon_edge(&self, from: Synode) -> Synode {
        from.add_msgno(u64::from(self.event_horizon))
    }

    /// Every member speaks a protocol that understands event-horizon
    /// reconfiguration.
    #[must_use]
    pub fn all_nodes_reconfigurable(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| n.proto_max >= ProtoVersion::FIRST_EVENT_HORIZON_AWARE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str, uuid: u8) -> NodeAddress {
        NodeAddress::new(s, vec![uuid])
    }

    #[test]
    fn node_set_basics() {
        let mut ns = NodeSet::empty();
        ns.set(NodeNo(0));
        ns.set(NodeNo(2));
        assert!(ns.contains(NodeNo(0)));
        assert!(!ns.contains(NodeNo(1)));
        assert_eq!(ns.count(), 2);

        ns.clear(NodeNo(0));
        assert!(!ns.contains(NodeNo(0)));

        // VOID never lands in the set.
        ns.set(NodeNo::VOID);
        assert_eq!(ns.count(), 1);
    }

    #[test]
    fn full_set_covers_members() {
        let all = NodeSet::full(3);
        assert_eq!(all.count(), 3);
        let mut some = NodeSet::empty();
        some.set(NodeNo(0));
        some.set(NodeNo(1));
        assert!(!some.covers(all));
        some.set(NodeNo(2));
        assert!(some.covers(all));
    }

    #[test]
    fn nodeno_follows_uuid() {
        let mut site = SiteDef::new(vec![addr("a:1", 1), addr("b:1", 2)], 10);
        site.set_nodeno_for(&[2]);
        assert_eq!(site.nodeno, NodeNo(1));
        site.set_nodeno_for(&[9]);
        assert!(site.nodeno.is_void());
    }

    #[test]
    fn ipv6_literal_is_not_ipv4_reachable() {
        assert!(addr("10.0.0.1:7000", 1).has_ipv4_address());
        assert!(!addr("[::1]:7000", 1).has_ipv4_address());
    }
}
