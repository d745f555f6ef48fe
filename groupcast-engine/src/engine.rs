//! Engine wiring: shared context, external collaborator traits, lifecycle.
//!
//! The engine is single-threaded and cooperative: every task runs on the
//! same thread inside a `LocalSet` and shares [`Core`] through one
//! `RefCell`. Suspension happens only at explicit awaits, and no borrow is
//! ever held across one. Other threads talk to the engine exclusively
//! through the [`EngineHandle`] request channel.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use groupcast_core::{
    AppData, DeliveryStatus, GcsSnapshot, GroupId, NodeAddress, NodeNo, PaxMsg, SiteDef, Synode,
};

use crate::config::EngineConfig;
use crate::input::{ClientRequest, EngineHandle, InputQueue};
use crate::state::Core;

/// Outbound side of the transport contract. The transport owns framing,
/// version negotiation, reconnection, and buffering; the engine only names
/// a destination within a site.
///
/// A message addressed to this node itself must loop back into the inbound
/// queue; the engine uses one path for all members.
pub trait Transport {
    fn send(&self, site: &SiteDef, to: NodeNo, msg: PaxMsg);
}

/// Engine state transitions reported to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    CommsOk,
    CommsError,
    Run,
    Terminate,
    Exit,
    Expel,
}

/// Application callbacks. All are invoked on the engine thread; a callback
/// that wants to mutate engine state must go back through the
/// [`EngineHandle`].
pub trait Application {
    /// Produce a snapshot of application state and the highest synode it
    /// reflects. `None` means no snapshot can be produced.
    fn snapshot_get(&self) -> Option<(Bytes, Synode)>;

    /// Install a snapshot; logs outside `[log_start, log_end]` are gone.
    fn snapshot_install(&self, app_snap: &Bytes, log_start: Synode, log_end: Synode);

    /// Totally-ordered delivery.
    fn deliver(&self, synode: Synode, data: &AppData, status: DeliveryStatus);

    /// Membership-view notification.
    fn global_view(&self, site: &SiteDef, synode: Synode);

    fn state_change(&self, change: StateChange);
}

/// Events posted to the lifecycle FSM. Handlers never call the FSM
/// synchronously; everything goes through the queue.
#[derive(Debug)]
pub enum FsmEvent {
    /// A `UnifiedBoot` command was submitted or learned.
    NetBoot { nodes: Vec<NodeAddress> },
    /// A snapshot arrived from a peer.
    Snapshot(GcsSnapshot),
    /// A locally produced snapshot (recovery shortcut).
    LocalSnapshot(GcsSnapshot),
    /// Join an existing group: solicit snapshots from the seeds.
    SnapshotWait { seeds: Vec<NodeAddress> },
    /// The armed FSM timer fired. Carries the arming epoch so stale timers
    /// are ignored.
    Timeout(u64),
    /// Snapshots have been received from every member.
    Complete,
    Terminate,
    /// An admin forced a configuration while running.
    ForceConfig(Vec<NodeAddress>),
    Exit,
}

/// One deframed message from the transport, with the connection's reply
/// queue.
pub struct Inbound {
    pub msg: PaxMsg,
    pub reply: mpsc::UnboundedSender<PaxMsg>,
}

/// Everything the engine tasks share.
pub(crate) struct Ctx {
    pub cfg: EngineConfig,
    pub core: RefCell<Core>,
    pub transport: Rc<dyn Transport>,
    pub app: Rc<dyn Application>,
    /// Signalled every time the executor makes progress.
    pub exec_wait: Notify,
    /// Arms the sweeper; signalled on every learn.
    pub sweeper_wake: Notify,
    pub fsm_tx: mpsc::UnboundedSender<FsmEvent>,
    /// Proposer input queue.
    pub input: InputQueue,
    /// Engine-wide shutdown.
    pub shutdown: CancellationToken,
}

impl Ctx {
    /// Stamp and send to one member. The core borrow is taken here; the
    /// caller must not hold one.
    pub fn send_to_node(&self, site: &SiteDef, to: NodeNo, mut msg: PaxMsg) {
        {
            let core = self.core.borrow();
            core.stamp_outgoing(&mut msg, site.nodeno);
        }
        msg.to = to;
        self.transport.send(site, to, msg);
    }

    /// Stamp and send to every member, self included (loopback).
    pub fn send_to_all(&self, site: &SiteDef, msg: PaxMsg) {
        for no in 0..site.max_nodes() {
            self.send_to_node(site, NodeNo(no), msg.clone());
        }
    }

    /// Stamp and send to every member except this node.
    pub fn send_to_others(&self, site: &SiteDef, msg: PaxMsg) {
        for no in 0..site.max_nodes() {
            if NodeNo(no) != site.nodeno {
                self.send_to_node(site, NodeNo(no), msg.clone());
            }
        }
    }

    /// Post an event to the lifecycle FSM.
    pub fn post_fsm(&self, event: FsmEvent) {
        let _ = self.fsm_tx.send(event);
    }
}

/// The engine. Construct with [`Engine::new`] (the transport keeps the
/// send side of the inbound channel), hand [`Engine::handle`] to clients,
/// then drive it with [`Engine::run`] inside a `LocalSet`.
pub struct Engine {
    ctx: Rc<Ctx>,
    fsm_rx: mpsc::UnboundedReceiver<FsmEvent>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    request_rx: mpsc::UnboundedReceiver<ClientRequest>,
    request_tx: mpsc::UnboundedSender<ClientRequest>,
}

impl Engine {
    /// Build an engine. The transport keeps the send side of the inbound
    /// channel and pushes every deframed message through it.
    #[must_use]
    pub fn new(
        cfg: EngineConfig,
        group_id: GroupId,
        my_uuid: Vec<u8>,
        transport: Rc<dyn Transport>,
        app: Rc<dyn Application>,
        inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let my_id: u32 = rand::random();

        let ctx = Rc::new(Ctx {
            core: RefCell::new(Core::new(&cfg, my_uuid, my_id, group_id)),
            cfg,
            transport,
            app,
            exec_wait: Notify::new(),
            sweeper_wake: Notify::new(),
            fsm_tx,
            input: InputQueue::new(),
            shutdown: CancellationToken::new(),
        });

        Self {
            ctx,
            fsm_rx,
            inbound_rx,
            request_rx,
            request_tx,
        }
    }

    /// Cross-thread client handle.
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(self.request_tx.clone())
    }

    /// Run the engine until it exits. Must be called inside a `LocalSet`.
    pub async fn run(self) {
        let Self {
            ctx,
            fsm_rx,
            inbound_rx,
            request_rx,
            ..
        } = self;

        info!(group = %ctx.core.borrow().group_id, "engine starting");

        let local_server = tokio::task::spawn_local(crate::input::local_server(
            ctx.clone(),
            request_rx,
        ));
        let pump = tokio::task::spawn_local(crate::dispatch::inbound_pump(
            ctx.clone(),
            inbound_rx,
        ));
        let fsm = tokio::task::spawn_local(crate::fsm::fsm_task(ctx.clone(), fsm_rx));

        ctx.shutdown.cancelled().await;
        debug!("engine shutdown flag observed");

        let _ = fsm.await;
        local_server.abort();
        pump.abort();
        info!("engine stopped");
    }
}
