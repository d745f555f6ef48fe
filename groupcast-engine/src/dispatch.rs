//! Inbound message demux - the acceptor-learner side of the engine.
//!
//! The transport deframes and validates the envelope; everything else
//! happens here. State mutation runs under a single short borrow of the
//! core; outgoing traffic is collected and sent after the borrow is
//! released.

use std::rc::Rc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use groupcast_core::{MsgType, PaxMsg, PaxOp, SiteDef};

use crate::engine::{Ctx, FsmEvent, Inbound, StateChange};
use crate::machine::{self, TinyLearnOutcome};
use crate::state::Core;

/// Where an outgoing message goes once the core borrow is released.
pub(crate) enum Out {
    Reply(PaxMsg),
    All(SiteDef, PaxMsg),
}

/// A message is harmless if processing it past the event horizon cannot
/// change the outcome of a consensus round. Learns qualify: the sender
/// already derived the value from a majority.
#[must_use]
pub(crate) fn harmless(msg: &PaxMsg) -> bool {
    if msg.synode.msgno == 0 {
        return true;
    }
    matches!(
        msg.op,
        PaxOp::IAmAlive
            | PaxOp::AreYouAlive
            | PaxOp::NeedBoot
            | PaxOp::Snapshot
            | PaxOp::Learn
            | PaxOp::RecoverLearn
            | PaxOp::TinyLearn
            | PaxOp::Die
    )
}

/// Drain the inbound queue until shutdown.
#[instrument(skip_all, name = "acceptor_learner")]
pub(crate) async fn inbound_pump(ctx: Rc<Ctx>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    loop {
        let inbound = tokio::select! {
            () = ctx.shutdown.cancelled() => return,
            r = rx.recv() => match r {
                Some(r) => r,
                None => return,
            },
        };
        dispatch_one(&ctx, inbound);
    }
}

/// Handle one inbound message end to end.
pub(crate) fn dispatch_one(ctx: &Ctx, inbound: Inbound) {
    let Inbound { msg, reply } = inbound;
    let now = Instant::now();
    let mut out: Vec<Out> = Vec::new();

    {
        let mut core = ctx.core.borrow_mut();

        if msg.synode.group_id != core.group_id || core.is_dead_group(msg.synode.group_id) {
            trace!(synode = %msg.synode, "dropping message from foreign group");
            return;
        }
        core.note_detected(msg.from, now);

        let harmless_msg = harmless(&msg);

        // Amnesia guard: a node that has not completed its boot handshake
        // must not vote, or a forgotten promise could surface.
        if !core.booted && matches!(msg.op, PaxOp::Prepare | PaxOp::Accept) {
            trace!(op = ?msg.op, "refusing to act as acceptor before boot");
            return;
        }

        if !harmless_msg {
            // Evicted slot below the watermark: the peer is hopelessly
            // behind and must rejoin via snapshot.
            if msg.synode < core.delivered_msg && core.cache.was_removed(msg.synode) {
                debug!(synode = %msg.synode, from = %msg.from, "answering evicted slot with die");
                out.push(Out::Reply(msg.reply(PaxOp::Die)));
                drop(core);
                flush(ctx, out, &reply);
                return;
            }
            // Beyond the event horizon: silently dropped.
            if core.too_far(msg.synode) {
                trace!(synode = %msg.synode, "dropping message beyond the event horizon");
                return;
            }
            // Bogus owner: answer with a no-op learn so the sender stops.
            if let Some(site) = core.sites.find(msg.synode)
                && matches!(msg.op, PaxOp::Read | PaxOp::Prepare | PaxOp::Accept)
                && msg.synode.node.0 >= site.max_nodes()
            {
                let mut noop = msg.reply(PaxOp::Learn);
                noop.set_noop();
                out.push(Out::Reply(noop));
                drop(core);
                flush(ctx, out, &reply);
                return;
            }
        }

        dispatch_op(ctx, &mut core, &msg, now, &mut out);

        if core.fatal.is_some() {
            let fatal = core.fatal;
            drop(core);
            warn!(?fatal, "fatal condition, terminating");
            ctx.app.state_change(StateChange::Expel);
            ctx.post_fsm(FsmEvent::Terminate);
            ctx.post_fsm(FsmEvent::Exit);
            flush(ctx, out, &reply);
            return;
        }
    }

    flush(ctx, out, &reply);
}

fn flush(ctx: &Ctx, out: Vec<Out>, reply: &mpsc::UnboundedSender<PaxMsg>) {
    for o in out {
        match o {
            Out::Reply(mut m) => {
                {
                    let core = ctx.core.borrow();
                    let from = core.my_nodeno();
                    core.stamp_outgoing(&mut m, from);
                }
                let _ = reply.send(m);
            }
            Out::All(site, m) => ctx.send_to_all(&site, m),
        }
    }
}

/// The per-op dispatch table.
#[expect(clippy::too_many_lines)]
fn dispatch_op(ctx: &Ctx, core: &mut Core, msg: &PaxMsg, now: Instant, out: &mut Vec<Out>) {
    match msg.op {
        PaxOp::Prepare => {
            let Some(slot) = get_slot(core, msg, now) else {
                return;
            };
            if let Some(reply) = machine::handle_prepare(slot, msg, now) {
                out.push(Out::Reply(reply));
            }
        }
        PaxOp::AckPrepare | PaxOp::AckPrepareEmpty => {
            let Some(site) = core.sites.find(msg.synode).cloned() else {
                return;
            };
            let forced_max = core.forced_config.as_ref().map(SiteDef::max_nodes);
            let Some(slot) = get_slot(core, msg, now) else {
                return;
            };
            if let Some(accept) = machine::handle_ack_prepare(&site, slot, msg, forced_max) {
                out.push(Out::All(site, accept));
            }
        }
        PaxOp::Accept => {
            let Some(slot) = get_slot(core, msg, now) else {
                return;
            };
            if let Some(reply) = machine::handle_accept(slot, msg, now) {
                out.push(Out::Reply(reply));
            }
        }
        PaxOp::AckAccept | PaxOp::MultiAckAccept => {
            let Some(site) = core.sites.find(msg.synode).cloned() else {
                return;
            };
            let forced_max = core.forced_config.as_ref().map(SiteDef::max_nodes);
            let Some(slot) = get_slot(core, msg, now) else {
                return;
            };
            if let Some(learn) = machine::handle_ack_accept(&site, slot, msg, forced_max) {
                out.push(Out::All(site, learn));
            }
        }
        PaxOp::Learn => {
            core.update_max_synode(msg);
            learn_and_follow_up(ctx, core, msg, now, out);
        }
        PaxOp::RecoverLearn => {
            core.update_max_synode(msg);
            let mut promoted = msg.clone();
            promoted.op = PaxOp::Learn;
            learn_and_follow_up(ctx, core, &promoted, now, out);
        }
        PaxOp::TinyLearn => {
            if msg.msg_type == MsgType::NoOp {
                core.update_max_synode(msg);
                learn_and_follow_up(ctx, core, msg, now, out);
                return;
            }
            let Some(slot) = get_slot(core, msg, now) else {
                return;
            };
            let force = msg.force_delivery;
            if force {
                slot.force_delivery = true;
            }
            match machine::handle_tiny_learn(slot, msg, now) {
                TinyLearnOutcome::Promoted => {
                    core.update_max_synode(msg);
                    post_learn(ctx, core, msg, now, out);
                }
                TinyLearnOutcome::NeedRead => {
                    out.push(Out::Reply(msg.reply(PaxOp::Read)));
                }
                TinyLearnOutcome::AlreadyFinished => {}
            }
        }
        PaxOp::Skip => {
            let Some(slot) = get_slot(core, msg, now) else {
                return;
            };
            if msg.force_delivery {
                slot.force_delivery = true;
            }
            if machine::handle_skip(slot, msg, now) {
                post_learn(ctx, core, msg, now, out);
            } else {
                slot.rv.notify_waiters();
            }
        }
        PaxOp::Read => {
            let Some(slot) = get_slot(core, msg, now) else {
                return;
            };
            if let Some(teach) = machine::handle_read(slot, msg) {
                out.push(Out::Reply(teach));
            }
        }
        PaxOp::NeedBoot => {
            if crate::recovery::can_send_snapshot(core) {
                crate::recovery::handle_need_boot(ctx, core, msg, out);
            }
        }
        PaxOp::Snapshot => {
            let Some(snapshot) = &msg.snapshot else {
                return;
            };
            // Skip duplicates of the configuration we already installed.
            if core.start_config == snapshot.highest_boot_key() {
                return;
            }
            core.update_max_synode(msg);
            core.snapshot_mask.set(msg.from);
            ctx.post_fsm(FsmEvent::Snapshot(snapshot.clone()));
        }
        PaxOp::Die => {
            // If the slot in question was already executed we got consensus
            // after all; only an unexecuted slot means we are truly behind.
            if msg.synode >= core.executed_msg {
                warn!(
                    synode = %msg.synode,
                    executed = %core.executed_msg,
                    last_delivered = %core.last_delivered_msg,
                    "group is too far ahead, this node must exit"
                );
                core.fatal = Some(groupcast_core::error::FatalError::TooFarBehind);
            }
        }
        PaxOp::IAmAlive => {
            if !core.is_dead_group(msg.synode.group_id)
                && core.max_synode.group_id == msg.synode.group_id
                && msg.max_synode.group_id == core.max_synode.group_id
                && msg.max_synode > core.max_synode
            {
                core.set_max_synode(msg.max_synode);
            }
        }
        PaxOp::AreYouAlive => {
            out.push(Out::Reply(msg.reply(PaxOp::IAmAlive)));
        }
        // Client traffic is terminated by the transport and the local
        // server; protocol-only markers carry no action.
        PaxOp::ClientMsg | PaxOp::ClientReply | PaxOp::Initial => {}
    }
}

fn get_slot<'a>(
    core: &'a mut Core,
    msg: &PaxMsg,
    now: Instant,
) -> Option<&'a mut crate::cache::PaxSlot> {
    let executed = core.executed_msg;
    if core.cache.get(msg.synode, executed, now).is_none() {
        core.fatal = Some(groupcast_core::error::FatalError::OutOfCache);
        return None;
    }
    core.cache.get_no_touch(msg.synode)
}

/// Record a learn and run its side effects.
fn learn_and_follow_up(
    ctx: &Ctx,
    core: &mut Core,
    msg: &PaxMsg,
    now: Instant,
    out: &mut Vec<Out>,
) {
    let Some(slot) = get_slot(core, msg, now) else {
        return;
    };
    if msg.force_delivery {
        slot.force_delivery = true;
    }
    if machine::handle_learn(slot, msg, now) {
        post_learn(ctx, core, msg, now, out);
    } else {
        slot.rv.notify_waiters();
    }
}

/// Side effects of a newly decided slot: accounting, wakeups, and the
/// reconfiguration hooks.
pub(crate) fn post_learn(
    ctx: &Ctx,
    core: &mut Core,
    msg: &PaxMsg,
    now: Instant,
    _out: &mut [Out],
) {
    core.cache.add_cache_size(msg.synode);
    let executed = core.executed_msg;
    core.cache.shrink_to_limit(executed);
    if core.cache.no_cache_abort {
        core.fatal = Some(groupcast_core::error::FatalError::OutOfCache);
    }

    if let Some(slot) = core.cache.get_no_touch(msg.synode) {
        slot.rv.notify_waiters();
    }
    ctx.sweeper_wake.notify_one();

    let Some(learned) = core
        .cache
        .peek(msg.synode)
        .and_then(|s| s.learner.clone())
    else {
        return;
    };

    // A decided boot teaches a fresh node its group; queued, never called
    // into the FSM synchronously.
    if let Some(groupcast_core::Cargo::UnifiedBoot(nodes)) =
        learned.cargo.first().map(|a| &a.body)
        && !core.booted
    {
        ctx.post_fsm(FsmEvent::NetBoot {
            nodes: nodes.clone(),
        });
    }

    // Forced reconfigurations take effect immediately on the nodes that
    // see the learn, unless this site's protocol says intermediates are
    // ignored (the enforcer still applies its own).
    if learned.force_delivery
        && let Some(app) = learned.cargo.first()
        && app.body.is_config()
        && !matches!(app.body, groupcast_core::Cargo::UnifiedBoot(_))
    {
        let enforcer = core
            .cache
            .peek(msg.synode)
            .is_some_and(|s| s.enforcer);
        let ignores = core
            .sites
            .find(msg.synode)
            .is_some_and(|s| s.x_proto >= groupcast_core::ProtoVersion::FIRST_IGNORES_INTERMEDIATE_FORCED);
        if ignores && !enforcer {
            debug!(synode = %msg.synode, "ignoring intermediate forced configuration");
        } else if let Some(site) = crate::reconfig::handle_config(core, app, true) {
            crate::reconfig::start_force_config(core, site, enforcer, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::Bytes;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use groupcast_core::{
        AppData, Cargo, DeliveryStatus, GroupId, NodeAddress, NodeNo, Synode,
    };

    use crate::config::EngineConfig;
    use crate::engine::{Application, StateChange, Transport};
    use crate::input::InputQueue;

    #[derive(Default)]
    struct RecordingTransport {
        sent: RefCell<Vec<(NodeNo, PaxMsg)>>,
    }

    impl Transport for RecordingTransport {
        fn send(&self, _site: &SiteDef, to: NodeNo, msg: PaxMsg) {
            self.sent.borrow_mut().push((to, msg));
        }
    }

    struct NullApp;

    impl Application for NullApp {
        fn snapshot_get(&self) -> Option<(Bytes, Synode)> {
            Some((Bytes::from_static(b"snap"), Synode::NULL))
        }
        fn snapshot_install(&self, _: &Bytes, _: Synode, _: Synode) {}
        fn deliver(&self, _: Synode, _: &AppData, _: DeliveryStatus) {}
        fn global_view(&self, _: &SiteDef, _: Synode) {}
        fn state_change(&self, _: StateChange) {}
    }

    fn syn(msgno: u64, node: u16) -> Synode {
        Synode::new(GroupId(7), msgno, NodeNo(node))
    }

    fn test_ctx() -> (
        Rc<Ctx>,
        tokio::sync::mpsc::UnboundedReceiver<FsmEvent>,
        Rc<RecordingTransport>,
    ) {
        let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
        let transport = Rc::new(RecordingTransport::default());
        let cfg = EngineConfig::default();
        let core = Core::new(&cfg, vec![1], 99, GroupId(7));
        let ctx = Rc::new(Ctx {
            cfg,
            core: RefCell::new(core),
            transport: transport.clone(),
            app: Rc::new(NullApp),
            exec_wait: Notify::new(),
            sweeper_wake: Notify::new(),
            fsm_tx,
            input: InputQueue::new(),
            shutdown: CancellationToken::new(),
        });
        (ctx, fsm_rx, transport)
    }

    fn booted_ctx() -> (
        Rc<Ctx>,
        tokio::sync::mpsc::UnboundedReceiver<FsmEvent>,
        Rc<RecordingTransport>,
    ) {
        let (ctx, fsm_rx, transport) = test_ctx();
        {
            let mut core = ctx.core.borrow_mut();
            let mut site = SiteDef::new(
                vec![
                    NodeAddress::new("a:1", vec![1]),
                    NodeAddress::new("b:1", vec![2]),
                    NodeAddress::new("c:1", vec![3]),
                ],
                10,
            );
            site.start = syn(1, 0);
            core.sites.install(site);
            core.executed_msg = syn(1, 0);
            core.delivered_msg = syn(1, 0);
            core.booted = true;
        }
        (ctx, fsm_rx, transport)
    }

    fn inbound(msg: PaxMsg) -> (Inbound, mpsc::UnboundedReceiver<PaxMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Inbound { msg, reply: tx }, rx)
    }

    fn prepare_from(synode: Synode, from: u16, cnt: i32) -> PaxMsg {
        let mut m = PaxMsg::new(synode, PaxOp::Prepare);
        m.from = NodeNo(from);
        m.proposal = groupcast_core::Ballot {
            cnt,
            node: NodeNo(from),
        };
        m
    }

    #[test]
    fn prepare_is_answered_when_booted() {
        let (ctx, _fsm, _t) = booted_ctx();
        let (inb, mut rx) = inbound(prepare_from(syn(1, 1), 1, 1));
        dispatch_one(&ctx, inb);
        let reply = rx.try_recv().expect("prepare must be answered");
        assert_eq!(reply.op, PaxOp::AckPrepareEmpty);
        assert_eq!(reply.to, NodeNo(1));
    }

    #[test]
    fn acceptor_refuses_votes_before_boot() {
        let (ctx, _fsm, _t) = test_ctx();
        {
            let mut core = ctx.core.borrow_mut();
            let mut site = SiteDef::new(vec![NodeAddress::new("a:1", vec![1])], 10);
            site.start = syn(1, 0);
            core.sites.install(site);
            core.executed_msg = syn(1, 0);
            // booted stays false.
        }
        let (inb, mut rx) = inbound(prepare_from(syn(1, 0), 1, 1));
        dispatch_one(&ctx, inb);
        assert!(rx.try_recv().is_err(), "no vote before the boot handshake");
    }

    #[test]
    fn evicted_slot_is_answered_with_die() {
        let (ctx, _fsm, _t) = booted_ctx();
        {
            let mut core = ctx.core.borrow_mut();
            core.executed_msg = syn(10_000, 0);
            core.delivered_msg = syn(10_000, 0);
            // A decided slot far below the window, then force it out.
            let now = tokio::time::Instant::now();
            let slot = core.cache.force_get(syn(200, 0), now);
            let mut learned = PaxMsg::new(syn(200, 0), PaxOp::Learn);
            learned
                .cargo
                .push(AppData::new(Cargo::App(Bytes::from(vec![0u8; 64]))));
            slot.learner = Some(learned);
            core.cache.add_cache_size(syn(200, 0));
            let executed = core.executed_msg;
            core.cache.shrink(0, executed);
            assert!(core.cache.was_removed(syn(200, 0)));
        }
        let (inb, mut rx) = inbound(prepare_from(syn(200, 0), 1, 1));
        dispatch_one(&ctx, inb);
        let reply = rx.try_recv().expect("must answer with die");
        assert_eq!(reply.op, PaxOp::Die);
    }

    #[test]
    fn messages_beyond_the_horizon_are_dropped() {
        let (ctx, _fsm, _t) = booted_ctx();
        let far = syn(500, 0);
        let (inb, mut rx) = inbound(prepare_from(far, 1, 1));
        dispatch_one(&ctx, inb);
        assert!(rx.try_recv().is_err());
        assert!(!ctx.core.borrow().cache.is_cached(far));
    }

    #[test]
    fn learn_beyond_the_horizon_is_still_processed() {
        let (ctx, _fsm, _t) = booted_ctx();
        let far = syn(500, 0);
        let mut learn = PaxMsg::new(far, PaxOp::Learn);
        learn.from = NodeNo(1);
        learn
            .cargo
            .push(AppData::new(Cargo::App(Bytes::from_static(b"x"))));
        let (inb, _rx) = inbound(learn);
        dispatch_one(&ctx, inb);
        let mut core = ctx.core.borrow_mut();
        assert!(core.cache.get_no_touch(far).unwrap().finished());
        assert_eq!(core.max_synode, far);
    }

    #[test]
    fn learned_boot_is_queued_to_the_fsm() {
        let (ctx, mut fsm, _t) = test_ctx();
        {
            let mut core = ctx.core.borrow_mut();
            let mut site = SiteDef::new(vec![NodeAddress::new("a:1", vec![1])], 10);
            site.start = syn(1, 0);
            core.sites.install(site);
        }
        let mut learn = PaxMsg::new(syn(1, 0), PaxOp::Learn);
        learn.from = NodeNo(0);
        learn.cargo.push(AppData::new(Cargo::UnifiedBoot(vec![
            NodeAddress::new("a:1", vec![1]),
        ])));
        let (inb, _rx) = inbound(learn);
        dispatch_one(&ctx, inb);
        assert!(matches!(fsm.try_recv(), Ok(FsmEvent::NetBoot { .. })));
    }

    #[test]
    fn are_you_alive_is_answered() {
        let (ctx, _fsm, _t) = booted_ctx();
        let mut probe = PaxMsg::new(syn(0, 0), PaxOp::AreYouAlive);
        probe.from = NodeNo(2);
        let (inb, mut rx) = inbound(probe);
        dispatch_one(&ctx, inb);
        let reply = rx.try_recv().expect("probe must be answered");
        assert_eq!(reply.op, PaxOp::IAmAlive);
    }

    #[test]
    fn die_for_unexecuted_slot_is_fatal() {
        let (ctx, mut fsm, _t) = booted_ctx();
        let mut die = PaxMsg::new(syn(50, 0), PaxOp::Die);
        die.from = NodeNo(1);
        let (inb, _rx) = inbound(die);
        dispatch_one(&ctx, inb);
        assert!(matches!(fsm.try_recv(), Ok(FsmEvent::Terminate)));
        assert!(matches!(fsm.try_recv(), Ok(FsmEvent::Exit)));
    }

    #[test]
    fn die_for_executed_slot_is_ignored() {
        let (ctx, mut fsm, _t) = booted_ctx();
        {
            let mut core = ctx.core.borrow_mut();
            core.executed_msg = syn(100, 0);
        }
        let mut die = PaxMsg::new(syn(50, 0), PaxOp::Die);
        die.from = NodeNo(1);
        let (inb, _rx) = inbound(die);
        dispatch_one(&ctx, inb);
        assert!(fsm.try_recv().is_err(), "consensus was reached after all");
    }

    #[test]
    fn tiny_learn_without_value_asks_for_a_read() {
        let (ctx, _fsm, _t) = booted_ctx();
        let mut tiny = PaxMsg::new(syn(2, 1), PaxOp::TinyLearn);
        tiny.from = NodeNo(1);
        tiny.proposal = groupcast_core::Ballot::initial(NodeNo(1));
        let (inb, mut rx) = inbound(tiny);
        dispatch_one(&ctx, inb);
        let reply = rx.try_recv().expect("must ask for the value");
        assert_eq!(reply.op, PaxOp::Read);
        assert_eq!(reply.synode, syn(2, 1));
    }

    #[test]
    fn harmless_set_matches_the_contract() {
        let syn = groupcast_core::Synode::new(groupcast_core::GroupId(7), 5, NodeNo(0));
        for op in [
            PaxOp::IAmAlive,
            PaxOp::AreYouAlive,
            PaxOp::NeedBoot,
            PaxOp::Snapshot,
            PaxOp::Learn,
            PaxOp::RecoverLearn,
            PaxOp::TinyLearn,
            PaxOp::Die,
        ] {
            assert!(harmless(&PaxMsg::new(syn, op)), "{op:?} should be harmless");
        }
        for op in [PaxOp::Prepare, PaxOp::Accept, PaxOp::Read, PaxOp::Skip] {
            assert!(!harmless(&PaxMsg::new(syn, op)), "{op:?} should not be harmless");
        }
        // msgno 0 traffic is always harmless.
        let zero = groupcast_core::Synode::new(groupcast_core::GroupId(7), 0, NodeNo(0));
        assert!(harmless(&PaxMsg::new(zero, PaxOp::Prepare)));
    }
}
