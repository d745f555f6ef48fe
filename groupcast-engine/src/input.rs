//! The local request channel.
//!
//! Clients on other threads submit requests through an [`EngineHandle`];
//! each write wakes the engine, which drains the queue on its own thread.
//! Admin operations that need no consensus are answered directly; anything
//! that must be ordered is wrapped into a client message and handed to the
//! proposer queue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, instrument, warn};

use groupcast_core::{AppData, Cargo, ClientReply, PaxMsg, PaxOp, ReplyCode, Synode};

use crate::engine::{Ctx, FsmEvent};

/// A client message queued for the proposer, with its reply slot.
pub(crate) struct ClientSubmit {
    pub msg: PaxMsg,
    pub reply: Option<oneshot::Sender<ClientReply>>,
}

/// Single-threaded channel between the local server and the proposers.
/// Supports put-back at the front, which batching needs.
pub(crate) struct InputQueue {
    q: RefCell<VecDeque<ClientSubmit>>,
    notify: Notify,
}

impl InputQueue {
    pub fn new() -> Self {
        Self {
            q: RefCell::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn put(&self, item: ClientSubmit) {
        self.q.borrow_mut().push_back(item);
        self.notify.notify_one();
    }

    pub fn put_front(&self, item: ClientSubmit) {
        self.q.borrow_mut().push_front(item);
        self.notify.notify_one();
    }

    pub fn try_get(&self) -> Option<ClientSubmit> {
        self.q.borrow_mut().pop_front()
    }

    pub async fn get(&self) -> ClientSubmit {
        loop {
            if let Some(item) = self.try_get() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Fail every queued request. Used on teardown.
    pub fn drain_failing(&self) {
        let mut q = self.q.borrow_mut();
        while let Some(item) = q.pop_front() {
            if let Some(reply) = item.reply {
                let _ = reply.send(ClientReply::code(ReplyCode::Fail));
            }
        }
    }
}

/// Requests crossing the thread boundary.
pub(crate) enum ClientRequest {
    Submit {
        cargo: Cargo,
        reply: oneshot::Sender<ClientReply>,
    },
    /// Join an existing group by soliciting snapshots from the seeds.
    Join {
        seeds: Vec<groupcast_core::NodeAddress>,
    },
    Terminate,
}

/// Cloneable, `Send` handle other threads use to reach the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<ClientRequest>,
}

/// The engine is gone.
#[derive(Debug)]
pub struct EngineClosed;

impl std::fmt::Display for EngineClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("engine has shut down")
    }
}

impl std::error::Error for EngineClosed {}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ClientRequest>) -> Self {
        Self { tx }
    }

    /// Submit a cargo and wait for its outcome.
    ///
    /// # Errors
    ///
    /// Fails if the engine has shut down.
    pub async fn submit(&self, cargo: Cargo) -> Result<ClientReply, EngineClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ClientRequest::Submit {
                cargo,
                reply: reply_tx,
            })
            .map_err(|_| EngineClosed)?;
        reply_rx.await.map_err(|_| EngineClosed)
    }

    /// Bootstrap a brand-new group with this member list.
    ///
    /// # Errors
    ///
    /// Fails if the engine has shut down.
    pub async fn bootstrap(
        &self,
        nodes: Vec<groupcast_core::NodeAddress>,
    ) -> Result<ClientReply, EngineClosed> {
        self.submit(Cargo::UnifiedBoot(nodes)).await
    }

    /// Join an existing group via the snapshot handshake.
    ///
    /// # Errors
    ///
    /// Fails if the engine has shut down.
    pub fn join(&self, seeds: Vec<groupcast_core::NodeAddress>) -> Result<(), EngineClosed> {
        self.tx
            .send(ClientRequest::Join { seeds })
            .map_err(|_| EngineClosed)
    }

    /// Ask the engine to terminate (reset to `start`).
    ///
    /// # Errors
    ///
    /// Fails if the engine has shut down.
    pub fn terminate(&self) -> Result<(), EngineClosed> {
        self.tx.send(ClientRequest::Terminate).map_err(|_| EngineClosed)
    }
}

/// Wrap a cargo into a proposable client message.
fn client_msg(cargo: Cargo) -> PaxMsg {
    let mut msg = PaxMsg::new(Synode::NULL, PaxOp::ClientMsg);
    msg.cargo.push(AppData::new(cargo));
    msg
}

/// Drain the cross-thread request queue on the engine thread.
#[instrument(skip_all, name = "local_server")]
pub(crate) async fn local_server(
    ctx: Rc<Ctx>,
    mut rx: mpsc::UnboundedReceiver<ClientRequest>,
) {
    loop {
        let request = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            r = rx.recv() => match r {
                Some(r) => r,
                None => break,
            },
        };

        match request {
            ClientRequest::Submit { cargo, reply } => handle_submit(&ctx, cargo, reply),
            ClientRequest::Join { seeds } => {
                debug!(seeds = seeds.len(), "join requested");
                ctx.post_fsm(FsmEvent::SnapshotWait { seeds });
            }
            ClientRequest::Terminate => {
                debug!("terminate requested");
                ctx.post_fsm(FsmEvent::Terminate);
            }
        }
    }
    ctx.input.drain_failing();
}

fn handle_submit(ctx: &Ctx, cargo: Cargo, reply: oneshot::Sender<ClientReply>) {
    match cargo {
        // Answered locally, no consensus round.
        Cargo::GetEventHorizon => {
            let core = ctx.core.borrow();
            let answer = match core.sites.latest() {
                Some(site) => ClientReply {
                    code: ReplyCode::Ok,
                    event_horizon: Some(site.event_horizon),
                    app_data: Vec::new(),
                },
                None => ClientReply::code(ReplyCode::Fail),
            };
            let _ = reply.send(answer);
        }
        Cargo::GetSynodeAppData(synods) => {
            let mut core = ctx.core.borrow_mut();
            let mut out = Vec::new();
            for s in synods {
                if let Some(slot) = core.cache.get_no_touch(s)
                    && let Some(learned) = &slot.learner
                {
                    out.extend(learned.cargo.iter().cloned());
                }
            }
            let _ = reply.send(ClientReply {
                code: ReplyCode::Ok,
                event_horizon: None,
                app_data: out,
            });
        }
        Cargo::SetCacheLimit(limit) => {
            let mut core = ctx.core.borrow_mut();
            core.cache.set_limit(limit);
            let executed = core.executed_msg;
            core.cache.shrink_to_limit(executed);
            let _ = reply.send(ClientReply::code(ReplyCode::Ok));
        }
        Cargo::EnableArbitrator | Cargo::DisableArbitrator | Cargo::RemoveReset => {
            let _ = reply.send(ClientReply::code(ReplyCode::Ok));
        }
        Cargo::Exit => {
            ctx.post_fsm(FsmEvent::Exit);
            let _ = reply.send(ClientReply::code(ReplyCode::Ok));
        }
        Cargo::Reset => {
            ctx.post_fsm(FsmEvent::Terminate);
            let _ = reply.send(ClientReply::code(ReplyCode::Ok));
        }
        Cargo::TerminateAndExit => {
            ctx.post_fsm(FsmEvent::Terminate);
            ctx.post_fsm(FsmEvent::Exit);
            let _ = reply.send(ClientReply::code(ReplyCode::Ok));
        }
        Cargo::ConvertIntoLocalServer => {
            // Connection conversion happens in the transport; by the time
            // the request reaches the engine the conversion has succeeded.
            let _ = reply.send(ClientReply::code(ReplyCode::Ok));
        }

        // Reconfigurations are validated before any Paxos round.
        Cargo::UnifiedBoot(nodes) => {
            if ctx.core.borrow().booted {
                warn!("unified boot rejected: already booted");
                let _ = reply.send(ClientReply::code(ReplyCode::Fail));
                return;
            }
            ctx.post_fsm(FsmEvent::NetBoot {
                nodes: nodes.clone(),
            });
            ctx.input.put(ClientSubmit {
                msg: client_msg(Cargo::UnifiedBoot(nodes)),
                reply: Some(reply),
            });
        }
        cargo @ (Cargo::AddNode(_)
        | Cargo::RemoveNode(_)
        | Cargo::SetEventHorizon(_)
        | Cargo::ForceConfig(_)) => {
            // The group is still settling its first slots; membership is
            // not yet stable enough to change.
            if ctx.core.borrow().executed_msg.msgno <= 2 {
                let _ = reply.send(ClientReply::code(ReplyCode::Retry));
                return;
            }
            if let Err(reason) = crate::reconfig::validate(&ctx.core.borrow(), &cargo) {
                warn!(%reason, "reconfiguration rejected");
                let _ = reply.send(ClientReply::code(ReplyCode::Fail));
                return;
            }
            // The forcing node applies the new membership immediately; the
            // proposal then carries it to everyone else.
            let forced = if let Cargo::ForceConfig(nodes) = &cargo {
                ctx.post_fsm(FsmEvent::ForceConfig(nodes.clone()));
                true
            } else {
                false
            };
            let mut msg = client_msg(cargo);
            msg.force_delivery = forced;
            ctx.input.put(ClientSubmit {
                msg,
                reply: Some(reply),
            });
        }

        // Ordered application payloads.
        cargo @ (Cargo::App(_) | Cargo::ViewMsg) => {
            ctx.input.put(ClientSubmit {
                msg: client_msg(cargo),
                reply: Some(reply),
            });
        }
    }
}
