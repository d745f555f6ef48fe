//! Slot and ballot identifiers.
//!
//! A [`Synode`] names one consensus instance: `(group_id, msgno, node)`.
//! The `node` component is the *owner* of the slot, the only node allowed
//! to propose a value other than no-op there. Total order within a group is
//! lexicographic on `(msgno, node)`; `group_id` partitions unrelated engine
//! instances and never participates in ordering.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an engine instance. Messages from a different group are
/// ignored wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Index of a node within a site's member list.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeNo(pub u16);

impl NodeNo {
    /// Sentinel for "not a member of this site".
    pub const VOID: Self = Self(u16::MAX);

    #[must_use]
    pub fn is_void(self) -> bool {
        self == Self::VOID
    }
}

impl fmt::Display for NodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_void() {
            f.write_str("void")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A slot identifier, the atomic unit of consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Synode {
    pub group_id: GroupId,
    pub msgno: u64,
    pub node: NodeNo,
}

impl Synode {
    /// The all-zero synode, used as "no synode".
    pub const NULL: Self = Self {
        group_id: GroupId(0),
        msgno: 0,
        node: NodeNo(0),
    };

    #[must_use]
    pub fn new(group_id: GroupId, msgno: u64, node: NodeNo) -> Self {
        Self {
            group_id,
            msgno,
            node,
        }
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// Next synode in delivery order, given the owner space of the active
    /// site. Wraps from the last owner of one msgno to owner 0 of the next.
    #[must_use]
    pub fn incr(self, max_nodes: u16) -> Self {
        let next = self.node.0 + 1;
        if next >= max_nodes {
            Self {
                group_id: self.group_id,
                msgno: self.msgno + 1,
                node: NodeNo(0),
            }
        } else {
            Self {
                group_id: self.group_id,
                msgno: self.msgno,
                node: NodeNo(next),
            }
        }
    }

    /// First synode of the next msgno.
    #[must_use]
    pub fn incr_msgno(self) -> Self {
        Self {
            group_id: self.group_id,
            msgno: self.msgno + 1,
            node: NodeNo(0),
        }
    }

    /// Previous synode in delivery order.
    #[must_use]
    pub fn decr(self, max_nodes: u16) -> Self {
        if self.node.0 == 0 {
            Self {
                group_id: self.group_id,
                msgno: self.msgno.saturating_sub(1),
                node: NodeNo(max_nodes.saturating_sub(1)),
            }
        } else {
            Self {
                group_id: self.group_id,
                msgno: self.msgno,
                node: NodeNo(self.node.0 - 1),
            }
        }
    }

    #[must_use]
    pub fn with_node(self, node: NodeNo) -> Self {
        Self { node, ..self }
    }

    /// Slot advanced by `n` whole msgnos, owner reset to 0. Used for
    /// event-horizon arithmetic.
    #[must_use]
    pub fn add_msgno(self, n: u64) -> Self {
        Self {
            group_id: self.group_id,
            msgno: self.msgno + n,
            node: NodeNo(0),
        }
    }
}

// Delivery order is (msgno, node); group_id only breaks ties so that the
// ordering stays consistent with Eq. Cross-group comparisons are meaningless
// and never reach a decision point.
impl Ord for Synode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.msgno
            .cmp(&other.msgno)
            .then(self.node.cmp(&other.node))
            .then(self.group_id.0.cmp(&other.group_id.0))
    }
}

impl PartialOrd for Synode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Synode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} {} {}}}", self.group_id, self.msgno, self.node)
    }
}

/// A Paxos ballot. Ordered by `(cnt, node)` with the node number as the
/// tiebreak between concurrent proposers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ballot {
    pub cnt: i32,
    pub node: NodeNo,
}

impl Ballot {
    /// The implicit initial ballot of the owner fast path.
    #[must_use]
    pub fn initial(node: NodeNo) -> Self {
        Self { cnt: 0, node }
    }

    /// The ballot for the next round driven by `node`.
    #[must_use]
    pub fn next(self, node: NodeNo) -> Self {
        Self {
            cnt: self.cnt + 1,
            node,
        }
    }

    /// Inflate the count so a forced round dominates concurrent contenders,
    /// without overflowing. Applied once per forced slot.
    #[must_use]
    pub fn inflated(self) -> Self {
        let delta = (i32::MAX - self.cnt.max(0)) / 3;
        Self {
            cnt: self.cnt + delta,
            node: self.node,
        }
    }
}

impl Default for Ballot {
    fn default() -> Self {
        // Sorts below every real ballot, so any prepare beats it.
        Self {
            cnt: -1,
            node: NodeNo(0),
        }
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}.{})", self.cnt, self.node)
    }
}
