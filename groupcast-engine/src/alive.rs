//! Liveness: the alive beacon and the failure detector.
//!
//! Every member periodically broadcasts `IAmAlive` carrying its high-water
//! marks; the detector ages the per-node last-heard timestamps and reports
//! suspicion changes to the application as membership views.

use std::rc::Rc;

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use groupcast_core::{NodeNo, NodeSet, PaxMsg, PaxOp, SiteDef};

use crate::config::{ALIVE_INTERVAL, DETECTOR_LIVENESS_LAG};
use crate::engine::Ctx;

#[instrument(skip_all, name = "alive")]
pub(crate) async fn alive_task(ctx: Rc<Ctx>, token: CancellationToken) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(ALIVE_INTERVAL) => {}
        }
        let (site, msg) = {
            let mut core = ctx.core.borrow_mut();
            let Some(site) = core.active_site().cloned() else {
                continue;
            };
            if site.nodeno.is_void() {
                continue;
            }
            // We are trivially alive.
            let nodeno = site.nodeno;
            core.note_detected(nodeno, Instant::now());
            (site.clone(), PaxMsg::new(site.start, PaxOp::IAmAlive))
        };
        ctx.send_to_others(&site, msg);
    }
}

/// Which members have been heard from recently enough.
fn alive_set(core: &crate::state::Core, site: &SiteDef, now: Instant) -> NodeSet {
    let mut set = NodeSet::empty();
    for no in 0..site.max_nodes() {
        let node = NodeNo(no);
        if node == site.nodeno {
            set.set(node);
            continue;
        }
        if core
            .last_detected(node)
            .is_some_and(|t| now.saturating_duration_since(t) < DETECTOR_LIVENESS_LAG)
        {
            set.set(node);
        }
    }
    set
}

#[instrument(skip_all, name = "detector")]
pub(crate) async fn detector_task(ctx: Rc<Ctx>, token: CancellationToken) {
    let mut last_view = NodeSet::empty();
    let mut first = true;
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        let view = {
            let core = ctx.core.borrow();
            let Some(site) = core.active_site() else {
                continue;
            };
            if site.nodeno.is_void() {
                continue;
            }
            let now = Instant::now();
            let set = alive_set(&core, site, now);
            (set != last_view || first).then(|| (site.clone(), core.executed_msg, set))
        };
        if let Some((site, executed, set)) = view {
            debug!(alive = set.count(), members = site.max_nodes(), "membership view changed");
            last_view = set;
            first = false;
            ctx.app.global_view(&site, executed);
        }
    }
}
