//! Engine-global mutable state.
//!
//! Everything here is owned by the single engine thread and reached through
//! one `RefCell`. Tasks never hold a borrow across a suspension point;
//! anything needed across an await is cloned out first.

use tokio::time::Instant;

use groupcast_core::{GroupId, NodeNo, NodeSet, PaxMsg, SiteDef, Synode};

use crate::cache::SlotCache;
use crate::config::EngineConfig;
use crate::sites::ConfigHistory;

/// How many buried group ids to remember.
const MAX_DEAD_GROUPS: usize = 10;

pub(crate) struct Core {
    /// Stable identity of this node, matched against site member lists.
    pub my_uuid: Vec<u8>,
    /// Process-unique id mixed into payload unique ids.
    pub my_id: u32,
    pub group_id: GroupId,

    /// Next slot the executor waits to decide.
    pub executed_msg: Synode,
    /// Slot the executor is delivering; may lag `executed_msg` by one.
    pub delivered_msg: Synode,
    /// Last slot actually handed to the application.
    pub last_delivered_msg: Synode,
    /// Highest slot seen anywhere.
    pub max_synode: Synode,
    /// The proposer's next candidate slot.
    pub current_message: Synode,
    /// Per-node monotonic sequence tag for client payloads.
    pub lsn: u64,

    pub sites: ConfigHistory,
    pub cache: SlotCache,

    /// Set once the boot handshake completed; before that this node
    /// refuses to act as a Paxos acceptor (amnesia guard).
    pub booted: bool,

    /// Snapshot bookkeeping for `recover_wait`.
    pub snapshot_mask: NodeSet,
    pub log_start_max: Synode,
    pub log_end_max: Synode,
    /// Boot key of the last installed snapshot config, to drop duplicates.
    pub start_config: Synode,
    pub last_received_config: Synode,

    /// Forced configuration currently being driven, if any.
    pub forced_config: Option<SiteDef>,

    /// Decayed round-trip estimate feeding the proposer backoff.
    pub rtt: std::time::Duration,
    /// Per-node last-heard-from timestamps, indexed like the active site.
    pub detected: Vec<Instant>,

    /// Recently dissolved groups; their traffic is ignored.
    dead_groups: Vec<GroupId>,

    /// Terminal out-of-memory/out-of-cache condition.
    pub fatal: Option<groupcast_core::error::FatalError>,
}

impl Core {
    pub fn new(cfg: &EngineConfig, my_uuid: Vec<u8>, my_id: u32, group_id: GroupId) -> Self {
        let start = Synode::new(group_id, 0, NodeNo(0));
        Self {
            my_uuid: my_uuid.clone(),
            my_id,
            group_id,
            executed_msg: start,
            delivered_msg: start,
            last_delivered_msg: start,
            max_synode: start,
            current_message: start,
            lsn: 0,
            sites: ConfigHistory::new(my_uuid),
            cache: SlotCache::new(cfg.cache_limit, cfg.max_cached_slots),
            booted: false,
            snapshot_mask: NodeSet::empty(),
            log_start_max: Synode::NULL,
            log_end_max: Synode::NULL,
            start_config: Synode::NULL,
            last_received_config: Synode::NULL,
            forced_config: None,
            rtt: cfg.initial_rtt,
            detected: Vec::new(),
            dead_groups: Vec::new(),
            fatal: None,
        }
    }

    /// The site governing the executor's position.
    pub fn active_site(&self) -> Option<&SiteDef> {
        self.sites.find(self.executed_msg)
    }

    pub fn my_nodeno(&self) -> NodeNo {
        self.active_site().map_or(NodeNo::VOID, |s| s.nodeno)
    }

    /// First msgno the proposer must not touch. When an event-horizon
    /// change is pending, the tighter of the active window and the pending
    /// site's window applies.
    pub fn too_far_threshold(&self) -> u64 {
        let Some(active) = self.active_site() else {
            return u64::MAX;
        };
        let active_threshold = self.executed_msg.msgno + u64::from(active.event_horizon);
        match self.sites.first_event_horizon_reconfig(self.executed_msg) {
            Some(pending) => {
                let pending_threshold =
                    pending.start.msgno - 1 + u64::from(pending.event_horizon);
                active_threshold.min(pending_threshold)
            }
            None => active_threshold,
        }
    }

    pub fn too_far(&self, synode: Synode) -> bool {
        synode.msgno >= self.too_far_threshold()
    }

    /// Start slot for a reconfiguration decided at `app_key`: one horizon
    /// past the decision, under the pending-EH rule.
    pub fn add_event_horizon(&self, app_key: Synode) -> Synode {
        let horizon = self
            .sites
            .latest_event_horizon_reconfig(self.executed_msg)
            .or_else(|| self.active_site())
            .map_or(u64::from(groupcast_core::DEFAULT_EVENT_HORIZON), |s| {
                u64::from(s.event_horizon)
            });
        app_key.add_msgno(horizon + 1)
    }

    pub fn set_max_synode(&mut self, synode: Synode) {
        self.max_synode = synode;
    }

    /// Fold a message's piggybacked high-water marks into ours.
    pub fn update_max_synode(&mut self, msg: &PaxMsg) {
        if self.is_dead_group(msg.synode.group_id) {
            return;
        }
        if self.group_id.0 == 0 || self.max_synode.group_id.0 == 0 {
            self.max_synode = msg.synode;
            return;
        }
        if self.max_synode.group_id == msg.synode.group_id {
            if msg.synode > self.max_synode {
                self.max_synode = msg.synode;
            }
            if msg.max_synode.group_id == self.max_synode.group_id
                && msg.max_synode > self.max_synode
            {
                self.max_synode = msg.max_synode;
            }
        }
    }

    pub fn assign_lsn(&mut self) -> u64 {
        self.lsn += 1;
        self.lsn
    }

    /// Proposer-unique payload tag derived from this process and slot.
    pub fn unique_id(&self, synode: Synode) -> Synode {
        Synode {
            group_id: GroupId(self.my_id),
            msgno: synode.msgno,
            node: self.my_nodeno(),
        }
    }

    /// A slot some task is driving or that already has traffic.
    pub fn is_busy(&self, synode: Synode) -> bool {
        self.cache.peek(synode).is_some_and(super::cache::PaxSlot::busy)
    }

    pub fn bury_group(&mut self, group_id: GroupId) {
        if self.dead_groups.len() >= MAX_DEAD_GROUPS {
            self.dead_groups.remove(0);
        }
        self.dead_groups.push(group_id);
    }

    pub fn is_dead_group(&self, group_id: GroupId) -> bool {
        self.dead_groups.contains(&group_id)
    }

    /// Record that we heard from a peer just now.
    pub fn note_detected(&mut self, node: NodeNo, now: Instant) {
        if node.is_void() {
            return;
        }
        let idx = usize::from(node.0);
        if idx >= self.detected.len() {
            self.detected.resize(idx + 1, now);
        }
        self.detected[idx] = now;
    }

    pub fn last_detected(&self, node: NodeNo) -> Option<Instant> {
        self.detected.get(usize::from(node.0)).copied()
    }

    /// Fold one round-trip sample into the decayed estimate.
    pub fn note_rtt(&mut self, sample: std::time::Duration) {
        self.rtt = (self.rtt * 7 + sample) / 8;
    }

    /// Stamp outgoing traffic with our high-water marks.
    pub fn stamp_outgoing(&self, msg: &mut PaxMsg, from: NodeNo) {
        msg.from = from;
        msg.max_synode = self.max_synode;
        msg.delivered_msg = self.delivered_msg;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupcast_core::NodeAddress;

    fn core_with_sites(sites: Vec<SiteDef>) -> Core {
        let mut core = Core::new(&EngineConfig::default(), vec![1], 42, GroupId(7));
        for s in sites {
            core.sites.install(s);
        }
        core
    }

    fn syn(msgno: u64) -> Synode {
        Synode::new(GroupId(7), msgno, NodeNo(0))
    }

    fn site(start: u64, eh: u32) -> SiteDef {
        let mut s = SiteDef::new(
            vec![NodeAddress::new("a:1", vec![1]), NodeAddress::new("b:1", vec![2])],
            eh,
        );
        s.start = syn(start);
        s
    }

    #[test]
    fn threshold_without_pending_reconfig() {
        let mut core = core_with_sites(vec![site(1, 10)]);
        core.executed_msg = syn(100);
        assert_eq!(core.too_far_threshold(), 110);
        assert!(!core.too_far(syn(109)));
        assert!(core.too_far(syn(110)));
    }

    #[test]
    fn pending_event_horizon_clamps_threshold() {
        let mut core = core_with_sites(vec![site(1, 10), site(120, 50)]);
        core.executed_msg = syn(100);
        // min(100 + 10, 120 - 1 + 50) = 110.
        assert_eq!(core.too_far_threshold(), 110);

        let mut core = core_with_sites(vec![site(1, 100), site(120, 10)]);
        core.executed_msg = syn(100);
        // min(100 + 100, 120 - 1 + 10) = 129.
        assert_eq!(core.too_far_threshold(), 129);
    }

    #[test]
    fn add_event_horizon_prefers_pending_config() {
        let mut core = core_with_sites(vec![site(1, 10)]);
        core.executed_msg = syn(5);
        assert_eq!(core.add_event_horizon(syn(5)).msgno, 16);

        let core2 = {
            let mut c = core_with_sites(vec![site(1, 10), site(50, 30)]);
            c.executed_msg = syn(5);
            c
        };
        assert_eq!(core2.add_event_horizon(syn(5)).msgno, 36);
    }

    #[test]
    fn max_synode_tracks_piggybacked_marks() {
        let mut core = core_with_sites(vec![site(1, 10)]);
        core.max_synode = syn(5);

        let mut msg = PaxMsg::new(syn(9), groupcast_core::PaxOp::Learn);
        msg.max_synode = syn(12);
        core.update_max_synode(&msg);
        assert_eq!(core.max_synode, syn(12));

        // Traffic from a buried group is ignored.
        core.bury_group(GroupId(9));
        let mut foreign = PaxMsg::new(Synode::new(GroupId(9), 99, NodeNo(0)), groupcast_core::PaxOp::Learn);
        foreign.max_synode = Synode::new(GroupId(9), 100, NodeNo(0));
        core.update_max_synode(&foreign);
        assert_eq!(core.max_synode, syn(12));
    }

    #[test]
    fn lsn_is_strictly_monotonic() {
        let mut core = core_with_sites(vec![site(1, 10)]);
        let a = core.assign_lsn();
        let b = core.assign_lsn();
        let c = core.assign_lsn();
        assert!(a < b && b < c);
    }
}
