//! Wire-level data model for the groupcast total-order broadcast engine.
//!
//! This crate defines everything that crosses a node boundary or a thread
//! boundary: slot identifiers ([`Synode`], [`Ballot`]), the Paxos message
//! ([`PaxMsg`]) and its closed operation set ([`PaxOp`]), application cargo
//! ([`AppData`], [`Cargo`]), membership generations ([`SiteDef`]), recovery
//! snapshots ([`GcsSnapshot`]), protocol version negotiation, and the framed
//! postcard codec used by the transport.
//!
//! The engine itself lives in `groupcast-engine`; the TCP transport and the
//! daemon binary live in `groupcast-server`.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod error;
mod message;
mod proto;
mod site;
mod snapshot;
mod synode;

pub use message::{
    AppData, Cargo, ClientReply, DeliveryStatus, MsgType, PaxMsg, PaxOp, ReplyCode,
};
pub use proto::{Handshake, HandshakeResponse, ProtoVersion};
pub use site::{
    DEFAULT_EVENT_HORIZON, EVENT_HORIZON_MAX, EVENT_HORIZON_MIN, NodeAddress, NodeSet, SiteDef,
};
pub use snapshot::{ConfigSnapshot, GcsSnapshot};
pub use synode::{Ballot, GroupId, NodeNo, Synode};
