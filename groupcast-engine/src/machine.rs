//! Pure per-slot Paxos transitions - no I/O, no async.
//!
//! Every function here mutates exactly one slot and returns the message (if
//! any) the caller should put on the wire. Keeping the transition core free
//! of I/O lets the model-checker tests drive the exact code the engine
//! runs.
//!
//! The owner fast path: the owner of a synode may open with an `Accept` at
//! ballot `(0, owner)` because every other node may only propose no-op
//! there, so no competing *value* can exist at a higher ballot. The owner
//! falls back to a full 3-phase round as soon as it has seen any promise on
//! the slot.

use tokio::time::Instant;

use groupcast_core::{Ballot, MsgType, PaxMsg, PaxOp, SiteDef};

use crate::cache::PaxSlot;

/// Majority decision over an answer set.
///
/// Forced rounds demand unanimity of the forced membership: counting is
/// still done against the normal site, but the threshold is the size of the
/// forced configuration, since nodes outside it will never answer.
#[must_use]
pub fn majority(
    answered: u32,
    site: &SiteDef,
    all: bool,
    forced: bool,
    forced_maxnodes: Option<u16>,
) -> bool {
    let max = u32::from(site.max_nodes());
    if forced {
        let need = u32::from(forced_maxnodes.unwrap_or(site.max_nodes()));
        answered == need
    } else if all {
        answered == max
    } else {
        answered > max / 2
    }
}

fn prep_majority(site: &SiteDef, slot: &PaxSlot, forced_maxnodes: Option<u16>) -> bool {
    let forced = slot.force_delivery
        || slot
            .proposer
            .msg
            .as_ref()
            .is_some_and(|m| m.force_delivery);
    majority(
        slot.proposer.prep_nodeset.count(),
        site,
        false,
        forced,
        forced_maxnodes,
    )
}

fn prop_majority(site: &SiteDef, slot: &PaxSlot, forced_maxnodes: Option<u16>) -> bool {
    let forced = slot.force_delivery
        || slot
            .proposer
            .msg
            .as_ref()
            .is_some_and(|m| m.force_delivery);
    majority(
        slot.proposer.prop_nodeset.count(),
        site,
        false,
        forced,
        forced_maxnodes,
    )
}

/// Learn reply that teaches a peer which is still running Paxos on a slot
/// we have already decided.
#[must_use]
pub fn create_learn_for_ignorant(slot: &PaxSlot, pm: &PaxMsg) -> Option<PaxMsg> {
    let learned = slot.learner.as_ref()?;
    let mut reply = pm.reply(PaxOp::Learn);
    reply.proposal = learned.proposal;
    reply.msg_type = learned.msg_type;
    reply.cargo = learned.cargo.clone();
    Some(reply)
}

fn create_ack_prepare(slot: &PaxSlot, pm: &PaxMsg) -> PaxMsg {
    match &slot.acceptor.msg {
        Some(accepted) => {
            let mut reply = pm.reply(PaxOp::AckPrepare);
            reply.proposal = accepted.proposal;
            reply.msg_type = accepted.msg_type;
            reply.cargo = accepted.cargo.clone();
            reply
        }
        None => pm.reply(PaxOp::AckPrepareEmpty),
    }
}

/// Acceptor phase 1. Returns the reply to send, or `None` to drop.
pub fn handle_prepare(slot: &mut PaxSlot, pm: &PaxMsg, now: Instant) -> Option<PaxMsg> {
    if slot.finished() {
        return create_learn_for_ignorant(slot, pm);
    }
    let greater = pm.proposal > slot.acceptor.promise;
    if greater || slot.noop_match(pm) {
        slot.last_modified = now;
        if greater {
            slot.acceptor.promise = pm.proposal;
        }
        Some(create_ack_prepare(slot, pm))
    } else {
        None
    }
}

/// Move a prepared proposal to the accept phase once a majority answered.
/// Returns the `Accept` to broadcast.
pub fn check_propose(
    site: &SiteDef,
    slot: &mut PaxSlot,
    forced_maxnodes: Option<u16>,
) -> Option<PaxMsg> {
    if !prep_majority(site, slot, forced_maxnodes) {
        return None;
    }
    let bal = slot.proposer.bal;
    let synode = slot.synode;
    let msg = slot.proposer.msg.as_mut()?;
    msg.proposal = bal;
    msg.synode = synode;
    msg.op = PaxOp::Accept;
    slot.proposer.prop_nodeset.zero();
    slot.proposer.sent_prop = bal;
    Some(msg.clone())
}

/// Proposer receiving phase-1 answers. Returns the `Accept` to broadcast
/// once a majority has answered our current prepare.
pub fn handle_ack_prepare(
    site: &SiteDef,
    slot: &mut PaxSlot,
    m: &PaxMsg,
    forced_maxnodes: Option<u16>,
) -> Option<PaxMsg> {
    // A no-op round for someone else's slot may race the owner; once the
    // value is decided there is nothing left to move forward.
    if slot.finished() {
        return None;
    }
    if m.from.is_void() || m.reply_to != slot.proposer.bal {
        return None;
    }

    if !site.nodeno.is_void() {
        slot.proposer.prep_nodeset.set(m.from);
    }

    // Adopt a previously accepted value carried by a higher-ballot answer.
    if m.op == PaxOp::AckPrepare
        && slot
            .proposer
            .msg
            .as_ref()
            .is_some_and(|mine| m.proposal > mine.proposal)
    {
        slot.proposer.msg = Some(m.clone());
    }

    if m.reply_to > slot.proposer.sent_prop {
        check_propose(site, slot, forced_maxnodes)
    } else {
        None
    }
}

/// Acceptor phase 2. Returns the reply to send, or `None` to drop.
pub fn handle_accept(slot: &mut PaxSlot, m: &PaxMsg, now: Instant) -> Option<PaxMsg> {
    if slot.finished() {
        return create_learn_for_ignorant(slot, m);
    }
    if slot.acceptor.promise > m.proposal && !slot.noop_match(m) {
        return None;
    }
    slot.last_modified = now;
    slot.acceptor.msg = Some(m.clone());
    Some(m.reply(PaxOp::AckAccept))
}

/// Once a majority accepted, build the decision broadcast. The value itself
/// is elided (`TinyLearn`) since a majority already holds it; receivers
/// promote their accepted message or ask for a read.
pub fn check_learn(
    site: &SiteDef,
    slot: &mut PaxSlot,
    forced_maxnodes: Option<u16>,
) -> Option<PaxMsg> {
    if site.nodeno.is_void() || !prop_majority(site, slot, forced_maxnodes) {
        return None;
    }
    let synode = slot.synode;
    let bal = slot.proposer.bal;
    let msg = slot.proposer.msg.as_mut()?;
    msg.synode = synode;

    let mut learn = PaxMsg::new(synode, PaxOp::TinyLearn);
    learn.proposal = msg.proposal;
    learn.msg_type = msg.msg_type;
    learn.reply_to = bal;
    slot.proposer.sent_learn = bal;
    Some(learn)
}

/// Proposer receiving phase-2 answers. Returns the learn broadcast once a
/// majority has accepted.
pub fn handle_ack_accept(
    site: &SiteDef,
    slot: &mut PaxSlot,
    m: &PaxMsg,
    forced_maxnodes: Option<u16>,
) -> Option<PaxMsg> {
    if site.nodeno.is_void() || m.from.is_void() || m.reply_to != slot.proposer.bal {
        return None;
    }
    slot.proposer.prop_nodeset.set(m.from);
    if m.proposal > slot.proposer.sent_learn {
        check_learn(site, slot, forced_maxnodes)
    } else {
        None
    }
}

/// Record a decided value. Returns `true` if the slot was newly decided
/// (replays are no-ops).
pub fn handle_learn(slot: &mut PaxSlot, m: &PaxMsg, now: Instant) -> bool {
    if slot.finished() {
        return false;
    }
    slot.last_modified = now;
    let mut learned = m.clone();
    learned.op = PaxOp::Learn;
    for a in &mut learned.cargo {
        a.chosen = true;
    }
    slot.acceptor.msg = Some(learned.clone());
    slot.learner = Some(learned);
    true
}

/// Outcome of a `TinyLearn`.
#[derive(Debug)]
pub enum TinyLearnOutcome {
    /// Our accepted message carried the decided ballot; it has been
    /// promoted to learned.
    Promoted,
    /// We do not hold the decided value; fetch it with a `Read`.
    NeedRead,
    /// Already decided, nothing to do.
    AlreadyFinished,
}

pub fn handle_tiny_learn(slot: &mut PaxSlot, m: &PaxMsg, now: Instant) -> TinyLearnOutcome {
    if slot.finished() {
        return TinyLearnOutcome::AlreadyFinished;
    }
    let Some(accepted) = slot.acceptor.msg.clone() else {
        return TinyLearnOutcome::NeedRead;
    };
    if accepted.proposal == m.proposal {
        slot.last_modified = now;
        handle_learn(slot, &accepted, now);
        TinyLearnOutcome::Promoted
    } else {
        TinyLearnOutcome::NeedRead
    }
}

/// Record a unilateral no-op decision. Legal only because the sender owns
/// the synode (or is sweeping its own owner space). Returns `true` if newly
/// decided.
pub fn handle_skip(slot: &mut PaxSlot, m: &PaxMsg, now: Instant) -> bool {
    if slot.finished() {
        return false;
    }
    let mut noop = m.clone();
    noop.set_noop();
    handle_learn(slot, &noop, now)
}

/// Answer a read for a decided slot.
#[must_use]
pub fn handle_read(slot: &PaxSlot, pm: &PaxMsg) -> Option<PaxMsg> {
    create_learn_for_ignorant(slot, pm)
}

/// Open a 3-phase round: pick a ballot above anything seen on this slot and
/// return the `Prepare` to broadcast.
pub fn prepare_push_3p(
    site: &SiteDef,
    slot: &mut PaxSlot,
    msg_type: MsgType,
    now: Instant,
) -> PaxMsg {
    let node = site.nodeno;
    let cnt = slot.proposer.bal.cnt.max(slot.acceptor.promise.cnt).max(0) + 1;
    slot.proposer.bal = Ballot { cnt, node };
    slot.proposer.prep_nodeset.zero();
    slot.last_modified = now;

    let mut prepare = PaxMsg::new(slot.synode, PaxOp::Prepare);
    prepare.proposal = slot.proposer.bal;
    prepare.msg_type = msg_type;
    prepare.force_delivery = slot.force_delivery;
    prepare
}

/// Open the owner fast path: an immediate `Accept` at ballot `(0, owner)`.
pub fn prepare_push_2p(site: &SiteDef, slot: &mut PaxSlot, now: Instant) -> Option<PaxMsg> {
    slot.proposer.prop_nodeset.zero();
    slot.proposer.bal = Ballot::initial(site.nodeno);
    slot.last_modified = now;

    let bal = slot.proposer.bal;
    let synode = slot.synode;
    let msg = slot.proposer.msg.as_mut()?;
    msg.proposal = bal;
    msg.synode = synode;
    msg.op = PaxOp::Accept;
    slot.proposer.sent_prop = bal;
    Some(msg.clone())
}

/// Mark a slot as part of a forced reconfiguration. The forcing node
/// inflates its ballot so concurrent contenders cannot outbid it.
pub fn force_slot(slot: &mut PaxSlot, enforcer: bool) {
    if !slot.enforcer && enforcer {
        slot.proposer.bal = slot.proposer.bal.inflated();
    }
    slot.force_delivery = true;
    slot.enforcer = enforcer;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use groupcast_core::{AppData, Cargo, GroupId, NodeAddress, NodeNo, Synode};

    fn site3() -> SiteDef {
        let mut site = SiteDef::new(
            vec![
                NodeAddress::new("a:1", vec![1]),
                NodeAddress::new("b:1", vec![2]),
                NodeAddress::new("c:1", vec![3]),
            ],
            10,
        );
        site.nodeno = NodeNo(0);
        site
    }

    fn syn(msgno: u64, node: u16) -> Synode {
        Synode::new(GroupId(7), msgno, NodeNo(node))
    }

    fn payload(b: &'static [u8]) -> Vec<AppData> {
        vec![AppData::new(Cargo::App(Bytes::from_static(b)))]
    }

    fn prepare_msg(s: Synode, from: u16, cnt: i32) -> PaxMsg {
        let mut m = PaxMsg::new(s, PaxOp::Prepare);
        m.from = NodeNo(from);
        m.proposal = Ballot {
            cnt,
            node: NodeNo(from),
        };
        m
    }

    #[test]
    fn prepare_promises_higher_ballots_only() {
        let mut cache = crate::cache::SlotCache::new(u64::MAX, 10);
        let now = Instant::now();
        let slot = cache.force_get(syn(1, 0), now);

        let reply = handle_prepare(slot, &prepare_msg(syn(1, 0), 1, 1), now).unwrap();
        assert_eq!(reply.op, PaxOp::AckPrepareEmpty);
        assert_eq!(slot.acceptor.promise.cnt, 1);

        // A lower ballot is dropped and the promise is unchanged.
        assert!(handle_prepare(slot, &prepare_msg(syn(1, 0), 2, 0), now).is_none());
        assert_eq!(slot.acceptor.promise.cnt, 1);

        // A higher one raises the promise.
        let _ = handle_prepare(slot, &prepare_msg(syn(1, 0), 2, 5), now).unwrap();
        assert_eq!(slot.acceptor.promise.cnt, 5);
    }

    #[test]
    fn prepare_on_finished_slot_teaches() {
        let mut cache = crate::cache::SlotCache::new(u64::MAX, 10);
        let now = Instant::now();
        let slot = cache.force_get(syn(1, 0), now);

        let mut learned = PaxMsg::new(syn(1, 0), PaxOp::Learn);
        learned.cargo = payload(b"v");
        learned.proposal = Ballot::initial(NodeNo(0));
        assert!(handle_learn(slot, &learned, now));

        let reply = handle_prepare(slot, &prepare_msg(syn(1, 0), 1, 99), now).unwrap();
        assert_eq!(reply.op, PaxOp::Learn);
        assert_eq!(reply.cargo, slot.learner.as_ref().unwrap().cargo);
        // The promise did not move for a finished slot.
        assert_eq!(slot.acceptor.promise, Ballot::default());
    }

    #[test]
    fn accept_respects_promise() {
        let mut cache = crate::cache::SlotCache::new(u64::MAX, 10);
        let now = Instant::now();
        let slot = cache.force_get(syn(1, 0), now);
        slot.acceptor.promise = Ballot {
            cnt: 5,
            node: NodeNo(1),
        };

        let mut low = PaxMsg::new(syn(1, 0), PaxOp::Accept);
        low.from = NodeNo(0);
        low.proposal = Ballot::initial(NodeNo(0));
        assert!(handle_accept(slot, &low, now).is_none());

        let mut high = low.clone();
        high.proposal = Ballot {
            cnt: 6,
            node: NodeNo(0),
        };
        let reply = handle_accept(slot, &high, now).unwrap();
        assert_eq!(reply.op, PaxOp::AckAccept);
        assert_eq!(reply.reply_to, high.proposal);
    }

    #[test]
    fn owner_fast_path_decides_with_majority() {
        let site = site3();
        let now = Instant::now();
        let mut cache = crate::cache::SlotCache::new(u64::MAX, 10);
        let slot = cache.force_get(syn(1, 0), now);

        let mut proposal = PaxMsg::new(syn(1, 0), PaxOp::ClientMsg);
        proposal.cargo = payload(b"hello");
        slot.proposer.msg = Some(proposal);

        let accept = prepare_push_2p(&site, slot, now).unwrap();
        assert_eq!(accept.op, PaxOp::Accept);
        assert_eq!(accept.proposal, Ballot::initial(NodeNo(0)));

        // Two of three acks: decision.
        let mut ack = accept.reply(PaxOp::AckAccept);
        ack.from = NodeNo(1);
        ack.proposal = accept.proposal;
        assert!(handle_ack_accept(&site, slot, &ack, None).is_none());

        ack.from = NodeNo(2);
        let learn = handle_ack_accept(&site, slot, &ack, None).unwrap();
        assert_eq!(learn.op, PaxOp::TinyLearn);
        assert_eq!(learn.proposal, accept.proposal);
    }

    #[test]
    fn three_phase_adopts_previously_accepted_value() {
        let site = site3();
        let now = Instant::now();
        let mut cache = crate::cache::SlotCache::new(u64::MAX, 10);
        let slot = cache.force_get(syn(1, 1), now);

        let mut noop = PaxMsg::new(syn(1, 1), PaxOp::ClientMsg);
        noop.set_noop();
        slot.proposer.msg = Some(noop);

        let prepare = prepare_push_3p(&site, slot, MsgType::NoOp, now);
        assert_eq!(prepare.op, PaxOp::Prepare);
        assert_eq!(prepare.proposal.cnt, 1);

        // One answer carries a real value accepted at the owner's ballot.
        let mut carried = prepare.reply(PaxOp::AckPrepare);
        carried.from = NodeNo(1);
        carried.proposal = Ballot::initial(NodeNo(1));
        carried.cargo = payload(b"owner-value");
        assert!(handle_ack_prepare(&site, slot, &carried, None).is_none());

        let mut empty = prepare.reply(PaxOp::AckPrepareEmpty);
        empty.from = NodeNo(2);
        let accept = handle_ack_prepare(&site, slot, &empty, None).unwrap();

        // The adopted value wins over our no-op.
        assert_eq!(accept.op, PaxOp::Accept);
        assert_eq!(accept.cargo, payload(b"owner-value"));
        assert_eq!(accept.proposal, slot.proposer.bal);
    }

    #[test]
    fn replayed_learn_is_a_noop() {
        let now = Instant::now();
        let mut cache = crate::cache::SlotCache::new(u64::MAX, 10);
        let slot = cache.force_get(syn(1, 0), now);

        let mut learned = PaxMsg::new(syn(1, 0), PaxOp::Learn);
        learned.cargo = payload(b"v1");
        assert!(handle_learn(slot, &learned, now));

        let mut other = PaxMsg::new(syn(1, 0), PaxOp::Learn);
        other.cargo = payload(b"v2");
        assert!(!handle_learn(slot, &other, now));
        assert_eq!(slot.learner.as_ref().unwrap().cargo, payload(b"v1"));
    }

    #[test]
    fn skip_equals_learned_noop() {
        let now = Instant::now();
        let mut cache = crate::cache::SlotCache::new(u64::MAX, 10);

        let a = cache.force_get(syn(1, 0), now);
        let skip = PaxMsg::new(syn(1, 0), PaxOp::Skip);
        assert!(handle_skip(a, &skip, now));
        let learned_by_skip = a.learner.clone().unwrap();

        let b = cache.force_get(syn(2, 0), now);
        let mut noop_learn = PaxMsg::new(syn(2, 0), PaxOp::Learn);
        noop_learn.set_noop();
        assert!(handle_learn(b, &noop_learn, now));
        let learned_by_learn = b.learner.clone().unwrap();

        assert_eq!(learned_by_skip.msg_type, MsgType::NoOp);
        assert_eq!(learned_by_skip.msg_type, learned_by_learn.msg_type);
        assert!(learned_by_skip.cargo.is_empty());
        assert!(learned_by_learn.cargo.is_empty());
    }

    #[test]
    fn tiny_learn_promotes_or_asks_for_read() {
        let now = Instant::now();
        let mut cache = crate::cache::SlotCache::new(u64::MAX, 10);
        let slot = cache.force_get(syn(1, 0), now);

        let mut tiny = PaxMsg::new(syn(1, 0), PaxOp::TinyLearn);
        tiny.proposal = Ballot::initial(NodeNo(0));

        // Nothing accepted: must read.
        assert!(matches!(
            handle_tiny_learn(slot, &tiny, now),
            TinyLearnOutcome::NeedRead
        ));

        // Accepted at the decided ballot: promoted.
        let mut accepted = PaxMsg::new(syn(1, 0), PaxOp::Accept);
        accepted.proposal = Ballot::initial(NodeNo(0));
        accepted.cargo = payload(b"v");
        slot.acceptor.msg = Some(accepted);
        assert!(matches!(
            handle_tiny_learn(slot, &tiny, now),
            TinyLearnOutcome::Promoted
        ));
        assert!(slot.finished());
        assert_eq!(slot.learner.as_ref().unwrap().cargo, payload(b"v"));
    }

    #[test]
    fn forced_round_requires_unanimity_of_forced_membership() {
        let mut site = site3();
        site.nodeno = NodeNo(0);
        let now = Instant::now();
        let mut cache = crate::cache::SlotCache::new(u64::MAX, 10);
        let slot = cache.force_get(syn(1, 0), now);

        let mut msg = PaxMsg::new(syn(1, 0), PaxOp::ClientMsg);
        msg.cargo = payload(b"forced");
        slot.proposer.msg = Some(msg);
        force_slot(slot, true);
        assert!(slot.proposer.bal.cnt > 1_000_000);

        slot.proposer.bal = Ballot {
            cnt: slot.proposer.bal.cnt,
            node: NodeNo(0),
        };
        let bal = slot.proposer.bal;
        slot.proposer.msg.as_mut().unwrap().proposal = bal;

        // Forced membership of 2: one ack is not enough even though it
        // would be a majority of 3.
        let mut ack = PaxMsg::new(syn(1, 0), PaxOp::AckAccept);
        ack.from = NodeNo(0);
        ack.reply_to = bal;
        ack.proposal = bal;
        assert!(handle_ack_accept(&site, slot, &ack, Some(2)).is_none());
        ack.from = NodeNo(1);
        assert!(handle_ack_accept(&site, slot, &ack, Some(2)).is_some());
    }

    #[test]
    fn ballot_promise_is_monotonic_under_any_traffic() {
        let now = Instant::now();
        let mut cache = crate::cache::SlotCache::new(u64::MAX, 10);
        let slot = cache.force_get(syn(1, 0), now);

        let mut last = slot.acceptor.promise;
        for (from, cnt) in [(1u16, 3), (2, 1), (1, 7), (2, 2), (1, 4)] {
            let _ = handle_prepare(slot, &prepare_msg(syn(1, 0), from, cnt), now);
            assert!(slot.acceptor.promise >= last);
            last = slot.acceptor.promise;
        }
    }
}
