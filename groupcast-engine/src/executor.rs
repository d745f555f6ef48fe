//! The executor: walks slots in total order and delivers decided values.
//!
//! A small state machine alternates between fetching the next decided slot
//! (`executed_msg`) and delivering the tail it has fetched
//! (`delivered_msg`). Configuration commands are applied the moment their
//! slot is fetched; removal of this node computes an exit plan that delays
//! departure until a majority of the new site can no longer need us.

use std::collections::VecDeque;
use std::rc::Rc;

use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use groupcast_core::{DeliveryStatus, MsgType, NodeNo, PaxMsg, PaxOp, SiteDef, Synode};

use crate::config::{TERMINATE_DELAY, WakeupDelay};
use crate::engine::{Ctx, FsmEvent};
use crate::machine;
use crate::state::Core;

enum XState {
    Fetch,
    Execute,
    Terminate,
}

/// Decided values owed to nodes that leave the group (or to the survivors,
/// when we are the one leaving).
struct InformEntry {
    /// Push once `executed_msg` reaches this slot.
    until: Synode,
    /// Push decided slots from here up to `max_synode`.
    from: Synode,
    /// Who gets the push, addressed through which site.
    site: SiteDef,
    targets: Vec<NodeNo>,
}

struct ExecuteContext {
    state: XState,
    exit_synode: Synode,
    delivery_limit: Synode,
    exit_flag: bool,
    inform: VecDeque<InformEntry>,
}

/// The slot owner is outside the site's member set; its value is never
/// delivered.
fn loser(core: &Core, synode: Synode) -> bool {
    core.sites
        .find(synode)
        .is_none_or(|site| !site.global_node_set.contains(synode.node))
}

#[instrument(skip_all, name = "executor")]
pub(crate) async fn executor_task(ctx: Rc<Ctx>, token: CancellationToken) {
    let mut xc = ExecuteContext {
        state: XState::Fetch,
        exit_synode: Synode::NULL,
        delivery_limit: Synode::NULL,
        exit_flag: false,
        inform: VecDeque::new(),
    };

    {
        let mut core = ctx.core.borrow_mut();
        if core.executed_msg.msgno == 0 {
            core.executed_msg = Synode::new(core.group_id, 1, NodeNo(0));
        }
        if core.sites.find(core.executed_msg).is_none()
            && let Some(start) = core.sites.latest().map(|s| s.start)
        {
            core.executed_msg = start;
        }
        core.delivered_msg = core.executed_msg;
        debug!(executed = %core.executed_msg, "executor starting");
    }

    let mut aborted = false;
    while !token.is_cancelled() {
        match xc.state {
            XState::Fetch => {
                let executed = ctx.core.borrow().executed_msg;
                if loser(&ctx.core.borrow(), executed) {
                    trace!(synode = %executed, "skipping loser slot");
                    check_increment_fetch(&ctx, &mut xc);
                    continue;
                }
                let Some(learned) = fetch_value(&ctx, &token, executed).await else {
                    if token.is_cancelled() {
                        return;
                    }
                    aborted = true;
                    break;
                };
                x_fetch(&ctx, &mut xc, executed, &learned);
            }
            XState::Execute => x_execute(&ctx, &mut xc),
            XState::Terminate => break,
        }
    }
    if token.is_cancelled() {
        return;
    }

    if aborted {
        warn!("executor ran out of cache, terminating");
    } else {
        // Push anything owed before going away.
        while let Some(entry) = xc.inform.pop_front() {
            inform(&ctx, &entry);
        }
        // Drain delay so learns in flight still propagate.
        let _ = timeout(TERMINATE_DELAY, token.cancelled()).await;
    }
    ctx.post_fsm(FsmEvent::Terminate);
    ctx.post_fsm(FsmEvent::Exit);
}

/// Process one fetched slot: apply configuration commands, then advance.
fn x_fetch(ctx: &Ctx, xc: &mut ExecuteContext, executed: Synode, learned: &PaxMsg) {
    let installed = {
        let mut core = ctx.core.borrow_mut();
        let applies = learned
            .cargo
            .first()
            .is_some_and(|a| a.body.is_config())
            && core
                .sites
                .latest()
                .is_some_and(|s| executed > s.boot_key);
        if applies {
            let app = learned.cargo[0].clone();
            let forced = learned.force_delivery;
            let installed = crate::reconfig::handle_config(&mut core, &app, forced);
            if installed.is_some() {
                core.last_received_config = executed;
                let delivered = core.delivered_msg;
                core.sites.gc(delivered);
            }
            installed
        } else {
            None
        }
    };

    if let Some(site) = installed {
        ctx.app.global_view(&site, executed);
        if !xc.exit_flag {
            setup_exit_handling(ctx, xc, &site);
        }
    }
    check_increment_fetch(ctx, xc);
}

/// Exit or advance `executed_msg`, then see whether delivery can proceed.
fn check_increment_fetch(ctx: &Ctx, xc: &mut ExecuteContext) {
    if check_exit(ctx, xc) {
        xc.state = XState::Terminate;
        return;
    }
    {
        let mut core = ctx.core.borrow_mut();
        let max_nodes = core
            .sites
            .find(core.executed_msg)
            .map_or(1, SiteDef::max_nodes);
        core.executed_msg = core.executed_msg.incr(max_nodes);
        if core.executed_msg > core.max_synode {
            let m = core.executed_msg;
            core.set_max_synode(m);
        }
    }
    ctx.exec_wait.notify_waiters();

    // Push messages owed to departed nodes once we are past the trigger.
    let executed = ctx.core.borrow().executed_msg;
    while let Some(front) = xc.inform.front() {
        if executed < front.until {
            break;
        }
        let entry = xc
            .inform
            .pop_front()
            .unwrap_or_else(|| unreachable!("front was just inspected"));
        inform(ctx, &entry);
    }
    if xc.inform.iter().all(|e| executed < e.until) {
        xc.state = XState::Execute;
    }
}

/// Deliver one slot if it should be delivered, then advance.
fn x_execute(ctx: &Ctx, xc: &mut ExecuteContext) {
    let (delivered, learned) = {
        let mut core = ctx.core.borrow_mut();
        let delivered = core.delivered_msg;
        let now = Instant::now();
        let learned = core
            .cache
            .force_get(delivered, now)
            .learner
            .clone();
        (delivered, learned)
    };

    let deliverable = {
        let core = ctx.core.borrow();
        !loser(&core, delivered)
            && learned
                .as_ref()
                .is_some_and(|m| m.msg_type != MsgType::NoOp)
            && (!xc.exit_flag || delivered < xc.delivery_limit)
    };

    if deliverable {
        let learned = learned.unwrap_or_else(|| unreachable!("deliverable implies learned"));
        {
            let mut core = ctx.core.borrow_mut();
            core.last_delivered_msg = delivered;
        }
        trace!(synode = %delivered, payloads = learned.cargo.len(), "delivering");
        for a in &learned.cargo {
            ctx.app.deliver(delivered, a, DeliveryStatus::Ok);
        }
    }

    if check_exit(ctx, xc) {
        xc.state = XState::Terminate;
        return;
    }
    let mut core = ctx.core.borrow_mut();
    let max_nodes = core
        .sites
        .find(core.delivered_msg)
        .map_or(1, SiteDef::max_nodes);
    core.delivered_msg = core.delivered_msg.incr(max_nodes);
    if core.delivered_msg == core.executed_msg {
        xc.state = XState::Fetch;
    }
}

/// We may exit once every slot up to the exit synode is decided and
/// delivery has reached its limit.
fn check_exit(ctx: &Ctx, xc: &ExecuteContext) -> bool {
    if !xc.exit_flag {
        return false;
    }
    let core = ctx.core.borrow();
    core.executed_msg >= xc.exit_synode && core.delivered_msg >= xc.delivery_limit
}

/// React to an installed configuration: arm the inform push, and when the
/// new site does not contain us, compute the exit plan.
fn setup_exit_handling(ctx: &Ctx, xc: &mut ExecuteContext, new_site: &SiteDef) {
    let mut core = ctx.core.borrow_mut();
    let horizon = u64::from(new_site.event_horizon);

    if new_site.nodeno.is_void() {
        // We are being removed. Deliver nothing at or past the new site's
        // start, and wait until a majority of the new site must have
        // executed everything we could still owe.
        xc.delivery_limit = new_site.start;
        xc.exit_synode = new_site.start.add_msgno(horizon);
        xc.exit_flag = true;

        if new_site.is_empty() {
            // Last one out: pretend a successor exists one more horizon
            // ahead so the old majority can still agree on the tail.
            if let Some(site) = core.sites.latest_mut() {
                site.start = site.start.add_msgno(2 * horizon);
            }
        }
        if xc.exit_synode >= core.max_synode {
            let m = xc.exit_synode.incr_msgno();
            core.set_max_synode(m);
        }
        info!(
            exit_synode = %xc.exit_synode,
            delivery_limit = %xc.delivery_limit,
            "removed from the group, computing exit plan"
        );

        // The survivors get everything we decided past the cut.
        let targets = (0..new_site.max_nodes()).map(NodeNo).collect();
        xc.inform.push_back(InformEntry {
            until: xc.exit_synode,
            from: xc.delivery_limit,
            site: new_site.clone(),
            targets,
        });
    } else {
        let until = new_site.start.add_msgno(horizon);
        if until > core.max_synode {
            let m = until.incr_msgno();
            core.set_max_synode(m);
        }
        // Departed members still get the tail of the old configuration.
        let old_site = core.sites.find(new_site.boot_key).cloned();
        if let Some(old_site) = old_site {
            let removed: Vec<NodeNo> = old_site
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| new_site.find_uuid(&n.uuid).is_none())
                .map(|(i, _)| NodeNo(u16::try_from(i).unwrap_or(u16::MAX)))
                .collect();
            if !removed.is_empty() {
                xc.inform.push_back(InformEntry {
                    until,
                    from: new_site.start,
                    site: old_site,
                    targets: removed,
                });
            }
        }
    }
}

/// Push every decided slot in `[entry.from, max_synode]` to the targets.
fn inform(ctx: &Ctx, entry: &InformEntry) {
    let learns: Vec<PaxMsg> = {
        let core = ctx.core.borrow();
        core.cache
            .finished_in_range(entry.from, core.max_synode)
            .into_iter()
            .cloned()
            .collect()
    };
    debug!(
        count = learns.len(),
        targets = entry.targets.len(),
        "pushing decided values to departed/remaining nodes"
    );
    for learned in learns {
        for &target in &entry.targets {
            if target == entry.site.nodeno {
                continue;
            }
            let mut msg = learned.clone();
            msg.op = PaxOp::Learn;
            ctx.send_to_node(&entry.site, target, msg);
        }
    }
}

/// Wait until the slot `synode` is decided, nudging the group along with
/// reads and eventually no-op proposals for the gap.
async fn fetch_value(ctx: &Rc<Ctx>, token: &CancellationToken, synode: Synode) -> Option<PaxMsg> {
    let mut delay = WakeupDelay::new(ctx.core.borrow().rtt);
    let mut attempts: u32 = 0;
    loop {
        let (learned, rv) = {
            let mut core = ctx.core.borrow_mut();
            if core.cache.no_cache_abort {
                return None;
            }
            let now = Instant::now();
            let slot = core.cache.force_get(synode, now);
            (slot.learner.clone(), slot.rv.clone())
        };
        if let Some(m) = learned {
            return Some(m);
        }

        tokio::select! {
            () = token.cancelled() => return None,
            _ = timeout(delay.next(), rv.notified()) => {}
        }

        attempts += 1;
        if attempts.is_multiple_of(3) {
            nudge_missing(ctx, attempts);
        }
    }
}

/// Ask for missing values: reads first, no-op proposals once the gap has
/// clearly stalled.
fn nudge_missing(ctx: &Ctx, attempts: u32) {
    let mut out: Vec<(SiteDef, Option<NodeNo>, PaxMsg)> = Vec::new();
    {
        let mut core = ctx.core.borrow_mut();
        let find = core.executed_msg;
        let Some(site) = core.sites.find(find).cloned() else {
            return;
        };
        if site.nodeno.is_void() {
            return;
        }

        if attempts < 12 {
            // Read: ask the owner, or everyone else if we are the owner.
            let read = PaxMsg::new(find, PaxOp::Read);
            if find.node == site.nodeno {
                out.push((site, None, read));
            } else {
                out.push((site.clone(), Some(find.node), read));
            }
        } else {
            // Reads went unanswered: force the gap shut with no-ops.
            let end = core.max_synode;
            let mut s = find;
            let mut n = 0;
            while s <= end && n < 10 && !core.too_far(s) {
                let wait_forced = core.forced_config.is_some();
                let now = Instant::now();
                let slot = core.cache.force_get(s, now);
                if wait_forced {
                    machine::force_slot(slot, true);
                }
                let ok = (slot.enforcer || !slot.recently_active(now))
                    && !slot.finished()
                    && !slot.busy();
                if ok {
                    let mut noop = PaxMsg::new(s, PaxOp::ClientMsg);
                    noop.set_noop();
                    slot.proposer.msg = Some(noop);
                    let prepare = machine::prepare_push_3p(&site, slot, MsgType::NoOp, now);
                    out.push((site.clone(), None, prepare));
                }
                s = s.incr(site.max_nodes());
                n += 1;
            }
        }
    }
    for (site, target, msg) in out {
        match target {
            Some(node) => ctx.send_to_node(&site, node, msg),
            None => ctx.send_to_all(&site, msg),
        }
    }
}
