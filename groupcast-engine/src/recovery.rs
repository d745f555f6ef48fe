//! Snapshot-based recovery and log catch-up.
//!
//! A joining or lagging node broadcasts `NeedBoot`; any running member
//! answers with its exported configuration history plus the application
//! blob, followed by a `RecoverLearn` replay of every decided slot it still
//! caches in `[log_start, max_synode]`. The recipient keeps the best
//! snapshot seen, ordered by `(boot_key, log_start, log_end)`, and
//! installs it when recovery completes.

use tracing::{debug, info};

use groupcast_core::{GcsSnapshot, NodeAddress, PaxMsg, PaxOp, SiteDef, Synode};

use crate::dispatch::Out;
use crate::engine::Ctx;
use crate::state::Core;

/// Only a running, booted node with an installed configuration may answer
/// `NeedBoot`.
pub(crate) fn can_send_snapshot(core: &Core) -> bool {
    core.booted && !core.sites.is_empty()
}

/// Export a snapshot of this node's state. `None` when the application
/// cannot produce one.
pub(crate) fn create_snapshot(ctx: &Ctx, core: &Core) -> Option<GcsSnapshot> {
    let (app_snap, app_synode) = ctx.app.snapshot_get()?;
    if app_snap.is_empty() {
        return None;
    }
    let configs = core.sites.export();
    if configs.is_empty() {
        return None;
    }

    let log_start = if app_synode.is_null() {
        core.last_received_config
    } else {
        app_synode
    };
    Some(GcsSnapshot {
        configs,
        app_snap,
        log_start,
        log_end: core.max_synode,
    })
}

/// Answer a `NeedBoot`: the snapshot itself, then the decided log tail.
pub(crate) fn handle_need_boot(ctx: &Ctx, core: &mut Core, msg: &PaxMsg, out: &mut Vec<Out>) {
    let Some(snapshot) = create_snapshot(ctx, core) else {
        debug!("cannot answer need_boot: no snapshot available");
        return;
    };
    info!(
        from = %msg.from,
        log_start = %snapshot.log_start,
        log_end = %snapshot.log_end,
        "sending snapshot"
    );

    let log_start = snapshot.log_start;
    let mut reply = msg.reply(PaxOp::Snapshot);
    reply.snapshot = Some(snapshot);
    out.push(Out::Reply(reply));

    // Replay the decided tail so the peer can execute forward from
    // log_start without running Paxos for history.
    for learned in core.cache.finished_in_range(log_start, core.max_synode) {
        let mut replay = learned.clone();
        replay.op = PaxOp::RecoverLearn;
        replay.to = msg.from;
        out.push(Out::Reply(replay));
    }
}

/// Whether `snapshot` beats the best one reflected in our current state.
pub(crate) fn better_snapshot(core: &Core, snapshot: &GcsSnapshot) -> bool {
    let Some(site) = core.sites.latest() else {
        return true;
    };
    let current = (site.boot_key, core.log_start_max, core.log_end_max);
    snapshot.preference() > current
}

/// Install a snapshot: adopt its configuration history, hand the blob to
/// the application, and position the executor just past `log_start`.
pub(crate) fn install_snapshot(ctx: &Ctx, core: &mut Core, snapshot: &GcsSnapshot) {
    let mut snapshot = snapshot.clone();
    core.sites.import(&snapshot);

    // A non-member must not try to execute the log tail.
    let member = core
        .sites
        .latest()
        .is_some_and(|s| !s.nodeno.is_void());
    if !member {
        snapshot.log_end = snapshot.log_start;
    }

    ctx.app
        .snapshot_install(&snapshot.app_snap, snapshot.log_start, snapshot.log_end);

    if snapshot.log_end > core.max_synode {
        core.set_max_synode(snapshot.log_end);
    }
    let max_nodes = core
        .sites
        .find(snapshot.log_start)
        .map_or(1, SiteDef::max_nodes);
    core.executed_msg = snapshot.log_start.incr(max_nodes);
    core.delivered_msg = core.executed_msg;
    core.log_start_max = snapshot.log_start;
    core.log_end_max = snapshot.log_end;
    core.last_received_config = snapshot.highest_boot_key();

    info!(
        executed = %core.executed_msg,
        configs = snapshot.configs.len(),
        "snapshot installed"
    );
}

/// Install `snapshot` if it beats the current best. Returns whether it was
/// installed.
pub(crate) fn update_best_snapshot(ctx: &Ctx, core: &mut Core, snapshot: &GcsSnapshot) -> bool {
    if better_snapshot(core, snapshot) {
        install_snapshot(ctx, core, snapshot);
        true
    } else {
        false
    }
}

/// A snapshot has been received from every member of the current site.
pub(crate) fn got_all_snapshots(core: &Core) -> bool {
    let Some(site) = core.sites.latest() else {
        return false;
    };
    if site.is_empty() {
        return false;
    }
    core.snapshot_mask.covers(site.global_node_set)
}

/// Solicit snapshots from the given peers. Used when joining (seeds) and
/// when recovering (current members).
pub(crate) fn send_need_boot(ctx: &Ctx, core: &Core, seeds: &[NodeAddress]) {
    let mut site = SiteDef::new(seeds.to_vec(), groupcast_core::DEFAULT_EVENT_HORIZON);
    site.set_nodeno_for(&core.my_uuid);
    let start = core
        .sites
        .latest()
        .map_or(Synode::new(core.group_id, 0, groupcast_core::NodeNo(0)), |s| s.start);

    let mut msg = PaxMsg::new(start, PaxOp::NeedBoot);
    msg.boot_identity = seeds
        .iter()
        .find(|n| n.uuid == core.my_uuid)
        .cloned();
    debug!(peers = seeds.len(), "soliciting snapshots");
    ctx.send_to_others(&site, msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use bytes::Bytes;
    use groupcast_core::{ConfigSnapshot, GroupId, NodeNo};

    fn syn(msgno: u64, node: u16) -> Synode {
        Synode::new(GroupId(7), msgno, NodeNo(node))
    }

    fn site(start: u64, boot: u64) -> SiteDef {
        let mut s = SiteDef::new(
            vec![
                NodeAddress::new("a:1", vec![1]),
                NodeAddress::new("b:1", vec![2]),
            ],
            10,
        );
        s.start = syn(start, 0);
        s.boot_key = syn(boot, 0);
        s
    }

    fn snap(boot: u64, start: u64, end: u64) -> GcsSnapshot {
        GcsSnapshot {
            configs: vec![ConfigSnapshot { site: site(boot + 11, boot) }],
            app_snap: Bytes::from_static(b"blob"),
            log_start: syn(start, 0),
            log_end: syn(end, 0),
        }
    }

    fn core() -> Core {
        Core::new(&EngineConfig::default(), vec![1], 1, GroupId(7))
    }

    #[test]
    fn any_snapshot_beats_no_configuration() {
        let core = core();
        assert!(better_snapshot(&core, &snap(1, 2, 3)));
    }

    #[test]
    fn snapshot_preference_is_lexicographic() {
        let mut c = core();
        c.sites.install(site(12, 1));
        c.log_start_max = syn(3, 0);
        c.log_end_max = syn(9, 0);

        // Newer configuration wins regardless of log bounds.
        assert!(better_snapshot(&c, &snap(2, 0, 0)));
        // Same configuration: later log_start wins.
        assert!(better_snapshot(&c, &snap(1, 4, 9)));
        // Same start: longer tail wins.
        assert!(better_snapshot(&c, &snap(1, 3, 12)));
        // Strictly worse is refused.
        assert!(!better_snapshot(&c, &snap(0, 1, 1)));
    }

    #[test]
    fn got_all_snapshots_requires_every_member() {
        let mut c = core();
        c.sites.install(site(1, 0));
        assert!(!got_all_snapshots(&c));
        c.snapshot_mask.set(NodeNo(0));
        assert!(!got_all_snapshots(&c));
        c.snapshot_mask.set(NodeNo(1));
        assert!(got_all_snapshots(&c));
    }
}
