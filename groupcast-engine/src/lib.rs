//! The groupcast replicated log engine.
//!
//! A multi-decree Paxos variant with per-slot owners: every member owns a
//! lane of slots it alone may fill with real values, giving an
//! uncontended 2-phase fast path; gaps are closed with unilateral no-ops.
//! The engine delivers one totally ordered stream of client payloads to
//! every member, supports online reconfiguration (add/remove members,
//! event-horizon changes, forced configurations) and recovers joiners and
//! stragglers through a snapshot handshake.
//!
//! # Architecture
//!
//! The engine is a single-threaded cooperative system: a fixed set of
//! long-lived tasks on one `LocalSet` sharing state through a `RefCell`.
//!
//! | Task | Responsibility |
//! |------|----------------|
//! | proposer | claims owned slots, batches client payloads, drives Paxos rounds through the pure [`machine`] transitions |
//! | acceptor-learner | demuxes inbound traffic |
//! | executor | walks slots in order and delivers decided values |
//! | sweeper | fills idle owned slots with no-ops |
//! | fsm | boot / snapshot recovery / run / terminate lifecycle |
//!
//! Transport and application are external collaborators behind the
//! [`Transport`] and [`Application`] traits; clients on other threads talk
//! through the [`EngineHandle`].

#![warn(clippy::pedantic)]

mod alive;
pub mod cache;
pub mod config;
mod dispatch;
mod engine;
mod executor;
mod fsm;
mod input;
pub mod machine;
mod proposer;
mod recovery;
mod reconfig;
pub mod sites;
mod state;
mod sweeper;

pub use engine::{Application, Engine, Inbound, StateChange, Transport};
pub use input::{EngineClosed, EngineHandle};
