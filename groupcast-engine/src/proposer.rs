//! The proposer task: claims owned slots and drives client messages to
//! consensus.
//!
//! One task (or a few identical ones) drains the input queue. Each message
//! is opportunistically batched with whatever else is queued, branded with
//! this node's lsn and unique id, and pushed through the owner fast path,
//! or a full 3-phase round when the slot is contested, forced, or the
//! engine is configured three-phase. A proposal that loses its slot to a
//! competing no-op is retried on the next free slot with the same payload.

use std::rc::Rc;

use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use groupcast_core::{
    Cargo, ClientReply, DeliveryStatus, MsgType, PaxMsg, ReplyCode, SiteDef, Synode,
};

use crate::config::{
    CACHE_WAIT_TIMEOUT, MAX_BATCH_APP_DATA, MAX_BATCH_SIZE, PROPOSE_RETRY_INTERVAL, WakeupDelay,
};
use crate::engine::Ctx;
use crate::input::ClientSubmit;
use crate::machine;

/// Unlocks the slot when the round ends, normally or by cancellation.
struct SlotLock {
    ctx: Rc<Ctx>,
    synode: Synode,
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        if let Ok(mut core) = self.ctx.core.try_borrow_mut()
            && let Some(slot) = core.cache.get_no_touch(self.synode)
        {
            slot.locked = false;
        }
    }
}

fn payload_size(msg: &PaxMsg) -> usize {
    msg.cargo
        .iter()
        .map(|a| match &a.body {
            Cargo::App(b) => b.len() + 16,
            _ => 64,
        })
        .sum()
}

fn is_unbatchable(msg: &PaxMsg) -> bool {
    msg.cargo
        .first()
        .is_some_and(|a| a.body.is_config() || a.body.is_view())
}

fn fail_all(replies: Vec<tokio::sync::oneshot::Sender<ClientReply>>) {
    for r in replies {
        let _ = r.send(ClientReply::code(ReplyCode::Fail));
    }
}

#[instrument(skip_all, name = "proposer", fields(task = task_no))]
pub(crate) async fn proposer_task(ctx: Rc<Ctx>, token: CancellationToken, task_no: usize) {
    debug!("proposer started");
    loop {
        let submit = tokio::select! {
            () = token.cancelled() => {
                debug!("proposer stopping");
                return;
            }
            s = ctx.input.get() => s,
        };
        propose_one(&ctx, &token, submit).await;
        if token.is_cancelled() {
            return;
        }
    }
}

/// Drive one client message (plus whatever batched onto it) to consensus.
async fn propose_one(ctx: &Rc<Ctx>, token: &CancellationToken, mut submit: ClientSubmit) {
    let mut replies: Vec<_> = submit.reply.take().into_iter().collect();

    // Batch more payloads into the same slot. Config and view messages
    // need a slot of their own and never batch.
    if !is_unbatchable(&submit.msg) {
        let mut size = payload_size(&submit.msg);
        loop {
            if size > MAX_BATCH_SIZE || submit.msg.cargo.len() >= MAX_BATCH_APP_DATA {
                break;
            }
            let Some(mut extra) = ctx.input.try_get() else {
                break;
            };
            let extra_size = payload_size(&extra.msg);
            if is_unbatchable(&extra.msg)
                || size + extra_size > MAX_BATCH_SIZE
                || submit.msg.cargo.len() + extra.msg.cargo.len() > MAX_BATCH_APP_DATA
            {
                ctx.input.put_front(extra);
                break;
            }
            size += extra_size;
            if let Some(r) = extra.reply.take() {
                replies.push(r);
            }
            submit.msg.cargo.append(&mut extra.msg.cargo);
        }
        trace!(payloads = submit.msg.cargo.len(), bytes = size, "batched");
    }

    // One lsn for the whole batch, assigned exactly once.
    {
        let mut core = ctx.core.borrow_mut();
        let lsn = core.assign_lsn();
        for a in &mut submit.msg.cargo {
            a.lsn = lsn;
        }
    }

    let mut delay = WakeupDelay::new(ctx.core.borrow().rtt);

    // Loop until our payload is the learned value for some slot.
    loop {
        if token.is_cancelled() {
            fail_all(replies);
            return;
        }

        let Some((msgno, site)) = claim_slot(ctx, token).await else {
            if token.is_cancelled() {
                fail_all(replies);
                return;
            }
            // Not a member: the client must be told, delivery has failed.
            warn!("not a member of any site, delivery fails");
            for a in &submit.msg.cargo {
                ctx.app.deliver(Synode::NULL, a, DeliveryStatus::Failure);
            }
            fail_all(replies);
            return;
        };

        // Brand the payload with its slot and our unique id.
        let my_unique = {
            let mut core = ctx.core.borrow_mut();
            core.current_message = msgno;
            let unique = core.unique_id(msgno);
            submit.msg.synode = msgno;
            for a in &mut submit.msg.cargo {
                a.app_key = msgno;
                a.unique_id = unique;
            }
            unique
        };

        if !wait_for_cache(ctx, token, msgno).await {
            debug!(synode = %msgno, "could not get a slot state, retrying");
            continue;
        }

        // Set up the round under one borrow, then release before awaiting.
        let (push, rv, start_push) = {
            let mut core = ctx.core.borrow_mut();
            let wait_forced = core.forced_config.is_some();
            let three_phase = ctx.cfg.three_phase;
            let now = Instant::now();
            let Some(slot) = core.cache.get_no_touch(msgno) else {
                continue;
            };
            slot.locked = true;
            if submit.msg.force_delivery {
                slot.force_delivery = true;
            }
            if wait_forced {
                machine::force_slot(slot, true);
            }
            slot.proposer.msg = Some(submit.msg.clone());

            // Prior promises mean someone else has been here; the fast
            // path is no longer safe for our ballot.
            let push = if three_phase || slot.force_delivery || slot.acceptor.promise.cnt > 0 {
                machine::prepare_push_3p(&site, slot, MsgType::Normal, now)
            } else {
                machine::prepare_push_2p(&site, slot, now)
                    .unwrap_or_else(|| unreachable!("proposer msg was just set"))
            };
            (push, slot.rv.clone(), now)
        };
        let _lock = SlotLock {
            ctx: ctx.clone(),
            synode: msgno,
        };
        ctx.send_to_all(&site, push);

        delay.reset();
        let mut last_push = start_push;

        // Wait for the slot to be decided, re-pushing if it stalls.
        let learned = loop {
            let wait = delay.next();
            tokio::select! {
                () = token.cancelled() => {
                    fail_all(replies);
                    return;
                }
                _ = timeout(wait, rv.notified()) => {}
            }

            let now = Instant::now();
            let repush = {
                let mut core = ctx.core.borrow_mut();
                let Some(slot) = core.cache.get_no_touch(msgno) else {
                    break None;
                };
                if slot.proposer.msg.is_none() {
                    break None;
                }
                if slot.finished() {
                    break slot.learner.clone();
                }
                if now.saturating_duration_since(last_push) >= PROPOSE_RETRY_INTERVAL {
                    Some(machine::prepare_push_3p(&site, slot, MsgType::Normal, now))
                } else {
                    None
                }
            };
            if let Some(prepare) = repush {
                trace!(synode = %msgno, "re-pushing with a higher ballot");
                last_push = now;
                ctx.send_to_all(&site, prepare);
            }
        };
        drop(_lock);
        let round_time = Instant::now().saturating_duration_since(last_push);

        match learned {
            Some(value)
                if value
                    .cargo
                    .first()
                    .is_some_and(|a| a.unique_id == my_unique) =>
            {
                trace!(synode = %msgno, "our message was learned");
                let mut core = ctx.core.borrow_mut();
                core.note_rtt(round_time.min(std::time::Duration::from_secs(1)));
                core.current_message = next_candidate(&core, msgno);
                drop(core);
                for r in replies {
                    let _ = r.send(ClientReply::code(ReplyCode::Ok));
                }
                return;
            }
            _ => {
                // Preempted (usually by a no-op): same payload, next slot.
                debug!(synode = %msgno, "slot decided against us, retrying");
                let mut core = ctx.core.borrow_mut();
                core.current_message = next_candidate(&core, msgno);
            }
        }
    }
}

/// Our next owned slot after `msgno`.
fn next_candidate(core: &crate::state::Core, msgno: Synode) -> Synode {
    Synode {
        group_id: msgno.group_id,
        msgno: msgno.msgno + 1,
        node: core.my_nodeno(),
    }
}

/// Find the next free slot owned by this node, blocking on executor
/// progress whenever the candidate would cross the event horizon.
/// `None` when this node is not a member.
async fn claim_slot(ctx: &Rc<Ctx>, token: &CancellationToken) -> Option<(Synode, SiteDef)> {
    loop {
        // Pick a candidate under one borrow.
        enum Step {
            Claim(Synode, SiteDef),
            NotMember,
            WaitHorizon,
        }
        let step = {
            let core = ctx.core.borrow();
            let mut msgno = core.current_message;
            loop {
                let Some(site) = core.sites.find(msgno) else {
                    break Step::NotMember;
                };
                if site.nodeno.is_void() {
                    break Step::NotMember;
                }
                // Own the candidate slot.
                let candidate = msgno.with_node(site.nodeno);
                let candidate = if candidate < core.executed_msg {
                    Synode {
                        msgno: core.executed_msg.msgno,
                        node: site.nodeno,
                        group_id: candidate.group_id,
                    }
                } else {
                    candidate
                };
                if core.too_far(candidate) {
                    break Step::WaitHorizon;
                }
                if !core.is_busy(candidate) {
                    break Step::Claim(candidate, site.clone());
                }
                msgno = candidate.incr_msgno();
            }
        };

        match step {
            Step::Claim(synode, site) => return Some((synode, site)),
            Step::NotMember => return None,
            Step::WaitHorizon => {
                trace!("candidate beyond the event horizon, waiting on executor");
                tokio::select! {
                    () = token.cancelled() => return None,
                    _ = timeout(std::time::Duration::from_secs(1), ctx.exec_wait.notified()) => {}
                }
            }
        }
    }
}

/// Wait until the cache can hand out a slot state for `synode`. Bails out
/// on cancellation so a torn-down run epoch never touches the reset core.
async fn wait_for_cache(ctx: &Rc<Ctx>, token: &CancellationToken, synode: Synode) -> bool {
    let start = Instant::now();
    loop {
        {
            let mut core = ctx.core.borrow_mut();
            let executed = core.executed_msg;
            let now = Instant::now();
            if core.cache.get(synode, executed, now).is_some() {
                return true;
            }
        }
        if Instant::now().saturating_duration_since(start) > CACHE_WAIT_TIMEOUT {
            return false;
        }
        tokio::select! {
            () = token.cancelled() => return false,
            _ = timeout(
                std::time::Duration::from_millis(500),
                ctx.exec_wait.notified(),
            ) => {}
        }
    }
}
