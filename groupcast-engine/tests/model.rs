//! Stateright model check of the single-slot consensus rules.
//!
//! The model drives the same ballot ordering and majority predicate the
//! engine uses (`groupcast_core::Ballot`, `machine::majority`) through an
//! exhaustive interleaving of two competing proposers and three acceptors,
//! and verifies Agreement (no two proposers ever decide different values
//! for the slot) and Validity (every decided value was proposed by one of
//! the model's proposers).

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use stateright::actor::{Actor, ActorModel, Id, Network, Out};
use stateright::{Checker, Model};

use groupcast_core::{Ballot, NodeAddress, NodeNo, SiteDef};
use groupcast_engine::machine::majority;

type Value = u8;

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

fn quorum_reached(answers: usize) -> bool {
    majority(
        u32::try_from(answers).expect("answer count fits"),
        &site3(),
        false,
        false,
        None,
    )
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum Msg {
    Prepare(Ballot),
    AckPrepare {
        promised: Ballot,
        accepted: Option<(Ballot, Value)>,
    },
    Accept(Ballot, Value),
    AckAccept {
        accepted: Ballot,
    },
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct AcceptorState {
    promise: Ballot,
    accepted: Option<(Ballot, Value)>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum Phase {
    Preparing {
        promises: BTreeMap<Id, Option<(Ballot, Value)>>,
    },
    Accepting {
        value: Value,
        accepts: BTreeSet<Id>,
    },
    Done {
        value: Value,
    },
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct ProposerState {
    ballot: Ballot,
    phase: Phase,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum SlotActor {
    Acceptor,
    Proposer {
        node: u16,
        value: Value,
        acceptors: Vec<Id>,
    },
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum SlotActorState {
    Acceptor(AcceptorState),
    Proposer(ProposerState),
}

impl Actor for SlotActor {
    type Msg = Msg;
    type State = SlotActorState;
    type Timer = ();
    type Storage = ();
    type Random = ();

    fn on_start(&self, _id: Id, _storage: &Option<Self::Storage>, o: &mut Out<Self>) -> Self::State {
        match self {
            SlotActor::Acceptor => SlotActorState::Acceptor(AcceptorState {
                promise: Ballot {
                    cnt: -1,
                    node: NodeNo(0),
                },
                accepted: None,
            }),
            SlotActor::Proposer {
                node, acceptors, ..
            } => {
                let ballot = Ballot {
                    cnt: 1,
                    node: NodeNo(*node),
                };
                for &acc in acceptors {
                    o.send(acc, Msg::Prepare(ballot));
                }
                SlotActorState::Proposer(ProposerState {
                    ballot,
                    phase: Phase::Preparing {
                        promises: BTreeMap::new(),
                    },
                })
            }
        }
    }

    fn on_msg(
        &self,
        _id: Id,
        state: &mut Cow<Self::State>,
        src: Id,
        msg: Self::Msg,
        o: &mut Out<Self>,
    ) {
        match (self, state.as_ref().clone()) {
            (SlotActor::Acceptor, SlotActorState::Acceptor(acc)) => {
                handle_acceptor(&acc, state, src, &msg, o);
            }
            (
                SlotActor::Proposer {
                    value, acceptors, ..
                },
                SlotActorState::Proposer(prop),
            ) => {
                handle_proposer(*value, acceptors, &prop, state, src, &msg, o);
            }
            _ => {}
        }
    }
}

/// The acceptor side, mirroring `handle_prepare`/`handle_accept`: promise
/// only strictly higher ballots, accept anything not below the promise.
fn handle_acceptor(
    acc: &AcceptorState,
    state: &mut Cow<SlotActorState>,
    src: Id,
    msg: &Msg,
    o: &mut Out<SlotActor>,
) {
    match *msg {
        Msg::Prepare(proposal) => {
            if proposal > acc.promise {
                let mut next = acc.clone();
                next.promise = proposal;
                o.send(
                    src,
                    Msg::AckPrepare {
                        promised: proposal,
                        accepted: next.accepted,
                    },
                );
                *state.to_mut() = SlotActorState::Acceptor(next);
            }
        }
        Msg::Accept(proposal, value) => {
            if acc.promise <= proposal {
                let mut next = acc.clone();
                next.accepted = Some((proposal, value));
                o.send(src, Msg::AckAccept { accepted: proposal });
                *state.to_mut() = SlotActorState::Acceptor(next);
            }
        }
        Msg::AckPrepare { .. } | Msg::AckAccept { .. } => {}
    }
}

fn handle_proposer(
    my_value: Value,
    acceptors: &[Id],
    prop: &ProposerState,
    state: &mut Cow<SlotActorState>,
    src: Id,
    msg: &Msg,
    o: &mut Out<SlotActor>,
) {
    match (&prop.phase, msg) {
        (Phase::Preparing { promises }, Msg::AckPrepare { promised, accepted })
            if *promised == prop.ballot =>
        {
            let mut promises = promises.clone();
            promises.insert(src, *accepted);
            if quorum_reached(promises.len()) {
                // Adopt the highest previously accepted value, if any.
                let value = promises
                    .values()
                    .filter_map(|a| *a)
                    .max_by_key(|(b, _)| *b)
                    .map_or(my_value, |(_, v)| v);
                for &acc in acceptors {
                    o.send(acc, Msg::Accept(prop.ballot, value));
                }
                *state.to_mut() = SlotActorState::Proposer(ProposerState {
                    ballot: prop.ballot,
                    phase: Phase::Accepting {
                        value,
                        accepts: BTreeSet::new(),
                    },
                });
            } else {
                *state.to_mut() = SlotActorState::Proposer(ProposerState {
                    ballot: prop.ballot,
                    phase: Phase::Preparing { promises },
                });
            }
        }
        (Phase::Accepting { value, accepts }, Msg::AckAccept { accepted })
            if *accepted == prop.ballot =>
        {
            let mut accepts = accepts.clone();
            accepts.insert(src);
            let next = if quorum_reached(accepts.len()) {
                Phase::Done { value: *value }
            } else {
                Phase::Accepting {
                    value: *value,
                    accepts,
                }
            };
            *state.to_mut() = SlotActorState::Proposer(ProposerState {
                ballot: prop.ballot,
                phase: next,
            });
        }
        _ => {}
    }
}

fn slot_model(values: &[Value]) -> ActorModel<SlotActor, (), ()> {
    let acceptors: Vec<Id> = (0..3).map(Id::from).collect();
    let mut model = ActorModel::new((), ()).init_network(Network::new_ordered([]));
    for _ in 0..3 {
        model = model.actor(SlotActor::Acceptor);
    }
    for (i, &value) in values.iter().enumerate() {
        model = model.actor(SlotActor::Proposer {
            node: u16::try_from(i).expect("small model"),
            value,
            acceptors: acceptors.clone(),
        });
    }
    model
        .property(stateright::Expectation::Always, "Agreement", |_, state| {
            let decided: Vec<Value> = state
                .actor_states
                .iter()
                .filter_map(|s| {
                    if let SlotActorState::Proposer(p) = s.as_ref()
                        && let Phase::Done { value } = p.phase
                    {
                        return Some(value);
                    }
                    None
                })
                .collect();
            decided.windows(2).all(|w| w[0] == w[1])
        })
        .property(stateright::Expectation::Always, "Validity", |model, state| {
            let proposed: Vec<Value> = model
                .actors
                .iter()
                .filter_map(|a| match a {
                    SlotActor::Proposer { value, .. } => Some(*value),
                    SlotActor::Acceptor => None,
                })
                .collect();
            state.actor_states.iter().all(|s| {
                if let SlotActorState::Proposer(p) = s.as_ref()
                    && let Phase::Done { value } = p.phase
                {
                    proposed.contains(&value)
                } else {
                    true
                }
            })
        })
}

#[test]
fn agreement_with_a_single_proposer() {
    let checker = slot_model(&[1])
        .checker()
        .threads(num_cpus::get())
        .spawn_bfs()
        .join();
    checker.assert_properties();
}

#[test]
fn agreement_with_competing_proposers() {
    let checker = slot_model(&[1, 2])
        .checker()
        .threads(num_cpus::get())
        .spawn_bfs()
        .join();
    checker.assert_properties();
}
