//! The slot cache: an LRU-bounded map from synode to Paxos slot state.
//!
//! The cache is the only home of per-slot state and the unit of memory
//! accounting. Decided slots old enough to be outside the reserve window
//! are evicted under pressure; a watermark records what has been evicted so
//! late traffic for a gone slot can be answered with `Die`.

use std::collections::HashMap;
use std::collections::BTreeMap;
use std::rc::Rc;

use tokio::sync::Notify;
use tokio::time::Instant;

use groupcast_core::{Ballot, MsgType, NodeSet, PaxMsg, Synode};

use crate::config::MIN_CACHED;

/// Proposer-side fields of one slot.
#[derive(Debug, Default)]
pub struct SlotProposer {
    /// Ballot of the current attempt.
    pub bal: Ballot,
    /// Highest ballot we have sent an accept for.
    pub sent_prop: Ballot,
    /// Highest ballot we have sent a learn for.
    pub sent_learn: Ballot,
    /// Acceptors that answered our prepare.
    pub prep_nodeset: NodeSet,
    /// Acceptors that answered our accept.
    pub prop_nodeset: NodeSet,
    /// The proposal we are driving.
    pub msg: Option<PaxMsg>,
}

/// Acceptor-side fields of one slot.
#[derive(Debug, Default)]
pub struct SlotAcceptor {
    /// Highest ballot promised. Never decreases.
    pub promise: Ballot,
    /// Highest-ballot accepted message.
    pub msg: Option<PaxMsg>,
}

/// One Paxos instance.
#[derive(Debug)]
pub struct PaxSlot {
    pub synode: Synode,
    pub proposer: SlotProposer,
    pub acceptor: SlotAcceptor,
    /// The learned value, once decided.
    pub learner: Option<PaxMsg>,
    pub last_modified: Instant,
    pub force_delivery: bool,
    /// This node initiated the forced round.
    pub enforcer: bool,
    /// Held by a proposer task while it drives a round; the cache never
    /// evicts a locked slot.
    pub locked: bool,
    /// Wait queue for tasks blocked on this slot.
    pub rv: Rc<Notify>,
    /// Client-payload bytes accounted to this slot.
    bytes: u64,
    /// LRU stamp, maintained by the cache.
    stamp: u64,
}

impl PaxSlot {
    fn new(synode: Synode, now: Instant) -> Self {
        Self {
            synode,
            proposer: SlotProposer::default(),
            acceptor: SlotAcceptor::default(),
            learner: None,
            last_modified: now,
            force_delivery: false,
            enforcer: false,
            locked: false,
            rv: Rc::new(Notify::new()),
            bytes: 0,
            stamp: 0,
        }
    }

    /// A decided slot.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.learner.is_some()
    }

    /// An accepted-but-not-yet-decided slot.
    #[must_use]
    pub fn accepted(&self) -> bool {
        self.acceptor.msg.is_some()
    }

    #[must_use]
    pub fn accepted_noop(&self) -> bool {
        self.acceptor
            .msg
            .as_ref()
            .is_some_and(|m| m.msg_type == MsgType::NoOp)
    }

    /// A no-op prepare matches a slot that has already accepted a no-op:
    /// the value cannot change, so the promise check may be skipped.
    #[must_use]
    pub fn noop_match(&self, msg: &PaxMsg) -> bool {
        msg.msg_type == MsgType::NoOp && self.accepted_noop()
    }

    /// Any Paxos activity at all.
    #[must_use]
    pub fn started(&self) -> bool {
        self.proposer.msg.is_some() || self.accepted() || self.finished()
    }

    #[must_use]
    pub fn recently_active(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_modified) < std::time::Duration::from_millis(500)
    }

    /// A slot a proposer is currently driving, or that has traffic in
    /// flight. Such a slot is skipped when hunting for a free one.
    #[must_use]
    pub fn busy(&self) -> bool {
        self.locked || self.started()
    }
}

/// LRU-bounded slot cache with byte accounting.
pub struct SlotCache {
    slots: HashMap<Synode, PaxSlot>,
    /// LRU index: stamp -> synode. Stamps are unique and monotonic.
    lru: BTreeMap<u64, Synode>,
    next_stamp: u64,
    bytes: u64,
    limit: u64,
    max_slots: usize,
    /// Everything at or below this synode that is not resident has been
    /// evicted at some point.
    highest_evicted: Synode,
    /// Set when the cache cannot be shrunk below its limit. Terminal.
    pub no_cache_abort: bool,
}

impl SlotCache {
    #[must_use]
    pub fn new(limit: u64, max_slots: usize) -> Self {
        Self {
            slots: HashMap::new(),
            lru: BTreeMap::new(),
            next_stamp: 1,
            bytes: 0,
            limit,
            max_slots,
            highest_evicted: Synode::NULL,
            no_cache_abort: false,
        }
    }

    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    #[must_use]
    pub fn is_cached(&self, synode: Synode) -> bool {
        self.slots.contains_key(&synode)
    }

    /// Whether a missing slot was once resident and has been evicted.
    #[must_use]
    pub fn was_removed(&self, synode: Synode) -> bool {
        !self.is_cached(synode) && synode <= self.highest_evicted
    }

    fn touch(&mut self, synode: Synode) {
        if let Some(slot) = self.slots.get_mut(&synode) {
            self.lru.remove(&slot.stamp);
            slot.stamp = self.next_stamp;
            self.lru.insert(self.next_stamp, synode);
            self.next_stamp += 1;
        }
    }

    /// Get or create the slot, refreshing its LRU position. Returns `None`
    /// when the cache is saturated and nothing below `executed_msg` can be
    /// evicted.
    pub fn get(
        &mut self,
        synode: Synode,
        executed_msg: Synode,
        now: Instant,
    ) -> Option<&mut PaxSlot> {
        if !self.slots.contains_key(&synode) {
            if self.slots.len() >= self.max_slots {
                self.shrink(self.limit, executed_msg);
            }
            if self.slots.len() >= self.max_slots {
                return None;
            }
            self.insert(synode, now);
        }
        self.touch(synode);
        self.slots.get_mut(&synode)
    }

    /// Create the slot even under pressure. Used on paths where refusing
    /// would wedge the engine (executor fetch, forced rounds).
    pub fn force_get(&mut self, synode: Synode, now: Instant) -> &mut PaxSlot {
        if !self.slots.contains_key(&synode) {
            self.insert(synode, now);
        }
        self.touch(synode);
        self.slots
            .get_mut(&synode)
            .unwrap_or_else(|| unreachable!("slot was just inserted"))
    }

    /// Look without refreshing the LRU position.
    pub fn get_no_touch(&mut self, synode: Synode) -> Option<&mut PaxSlot> {
        self.slots.get_mut(&synode)
    }

    #[must_use]
    pub fn peek(&self, synode: Synode) -> Option<&PaxSlot> {
        self.slots.get(&synode)
    }

    fn insert(&mut self, synode: Synode, now: Instant) {
        let mut slot = PaxSlot::new(synode, now);
        slot.stamp = self.next_stamp;
        self.lru.insert(self.next_stamp, synode);
        self.next_stamp += 1;
        self.slots.insert(synode, slot);
    }

    /// Account payload bytes of a newly decided value.
    pub fn add_cache_size(&mut self, synode: Synode) {
        let Some(slot) = self.slots.get_mut(&synode) else {
            return;
        };
        let add = slot
            .learner
            .as_ref()
            .map(|m| payload_bytes(m))
            .unwrap_or_default();
        slot.bytes = add;
        self.bytes += add;
    }

    /// Evict decided, unlocked slots from the LRU tail until resident bytes
    /// drop to `limit`. Only slots older than `executed_msg - MIN_CACHED`
    /// are candidates. Sets `no_cache_abort` when over limit with nothing
    /// evictable.
    pub fn shrink(&mut self, limit: u64, executed_msg: Synode) {
        if self.bytes <= limit && self.slots.len() < self.max_slots {
            return;
        }

        let reserve_floor = executed_msg.msgno.saturating_sub(MIN_CACHED);
        let mut victims = Vec::new();
        for (&stamp, &synode) in &self.lru {
            if self.bytes.saturating_sub(
                victims
                    .iter()
                    .map(|&(_, s)| self.slots[&s].bytes)
                    .sum::<u64>(),
            ) <= limit
                && self.slots.len() - victims.len() < self.max_slots
            {
                break;
            }
            let slot = &self.slots[&synode];
            if slot.locked || !slot.finished() {
                continue;
            }
            if synode.msgno >= reserve_floor {
                continue;
            }
            victims.push((stamp, synode));
        }

        for (stamp, synode) in victims {
            if let Some(slot) = self.slots.remove(&synode) {
                self.lru.remove(&stamp);
                self.bytes -= slot.bytes;
                if synode > self.highest_evicted {
                    self.highest_evicted = synode;
                }
            }
        }

        if self.bytes > limit && !self.any_evictable(executed_msg) {
            self.no_cache_abort = true;
        }
    }

    /// Shrink against the configured limit.
    pub fn shrink_to_limit(&mut self, executed_msg: Synode) {
        self.shrink(self.limit, executed_msg);
    }

    fn any_evictable(&self, executed_msg: Synode) -> bool {
        let reserve_floor = executed_msg.msgno.saturating_sub(MIN_CACHED);
        self.slots
            .values()
            .any(|s| s.finished() && !s.locked && s.synode.msgno < reserve_floor)
    }

    /// Iterate decided slots in `[from, to]`, in order. Recovery replay.
    pub fn finished_in_range(&self, from: Synode, to: Synode) -> Vec<&PaxMsg> {
        let mut out: Vec<(&Synode, &PaxMsg)> = self
            .slots
            .iter()
            .filter(|(s, slot)| **s >= from && **s <= to && slot.finished())
            .map(|(s, slot)| {
                (
                    s,
                    slot.learner
                        .as_ref()
                        .unwrap_or_else(|| unreachable!("finished slot has learner msg")),
                )
            })
            .collect();
        out.sort_by_key(|(s, _)| **s);
        out.into_iter().map(|(_, m)| m).collect()
    }
}

fn payload_bytes(msg: &PaxMsg) -> u64 {
    msg.cargo
        .iter()
        .map(|a| match &a.body {
            groupcast_core::Cargo::App(b) => b.len() as u64,
            _ => 0,
        })
        .sum()
}
