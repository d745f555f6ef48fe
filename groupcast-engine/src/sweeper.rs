//! Housekeeping tasks: the sweeper and the cache manager.
//!
//! The sweeper fills idle slots owned by this node with unilateral no-ops
//! so the executor never stalls on gaps in our own owner space. It runs at
//! the lowest priority: it is armed by learns and always yields to
//! foreground work before scanning.

use std::rc::Rc;

use tokio::time::{Duration, Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

use groupcast_core::{PaxMsg, PaxOp, SiteDef, Synode};

use crate::engine::Ctx;
use crate::machine;

/// First candidate for sweeping: our owner slot at the executor's position.
fn sweep_start(core: &crate::state::Core) -> Option<Synode> {
    let nodeno = core.my_nodeno();
    if nodeno.is_void() {
        return None;
    }
    let mut find = core.executed_msg.with_node(nodeno);
    if find < core.executed_msg {
        find = find.incr_msgno().with_node(nodeno);
    }
    Some(find)
}

#[instrument(skip_all, name = "sweeper")]
pub(crate) async fn sweeper_task(ctx: Rc<Ctx>, token: CancellationToken) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = timeout(Duration::from_millis(500), ctx.sweeper_wake.notified()) => {}
        }
        // Lowest priority: let every ready task run first.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        if token.is_cancelled() {
            return;
        }
        sweep(&ctx);
    }
}

/// One pass over our idle owner slots in `(executed_msg, max_synode)`.
fn sweep(ctx: &Ctx) {
    let mut skips: Vec<(SiteDef, PaxMsg)> = Vec::new();
    let now = Instant::now();
    {
        let mut core = ctx.core.borrow_mut();
        let Some(mut find) = sweep_start(&core) else {
            return;
        };
        while find < core.max_synode && !core.too_far(find) {
            let Some(site) = core.sites.find(find).cloned() else {
                break;
            };
            if site.nodeno.is_void() {
                break;
            }
            let find_here = find.with_node(site.nodeno);
            find = find_here.incr_msgno();

            let executed = core.executed_msg;
            let Some(slot) = core.cache.get(find_here, executed, now) else {
                break;
            };
            // Forced slots get full Paxos; anything started is left alone.
            if slot.force_delivery
                || slot.busy()
                || slot.finished()
                || slot.accepted()
                || slot.proposer.bal.cnt > 0
                || slot.acceptor.promise.cnt > 0
            {
                continue;
            }
            let skip = PaxMsg::new(find_here, PaxOp::Skip);
            if machine::handle_skip(slot, &skip, now) {
                crate::dispatch::post_learn(ctx, &mut core, &skip, now, &mut []);
                skips.push((site, skip));
            }
        }
    }
    for (site, skip) in skips {
        trace!(synode = %skip.synode, "sweeping idle slot with a no-op");
        ctx.send_to_others(&site, skip);
    }
}

/// Periodically enforce the cache limit even when nothing is learning.
#[instrument(skip_all, name = "cache_manager")]
pub(crate) async fn cache_manager_task(ctx: Rc<Ctx>, token: CancellationToken) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        let mut core = ctx.core.borrow_mut();
        let executed = core.executed_msg;
        core.cache.shrink_to_limit(executed);
        if core.cache.no_cache_abort {
            core.fatal = Some(groupcast_core::error::FatalError::OutOfCache);
            drop(core);
            ctx.post_fsm(crate::engine::FsmEvent::Terminate);
            ctx.post_fsm(crate::engine::FsmEvent::Exit);
            return;
        }
    }
}
