//! The top-level lifecycle state machine.
//!
//! ```text
//! init -> start -> (net_boot | snapshot) ----------------> run
//!           \--> snapshot_wait --> recover_wait --timeout/complete--> run
//! run --terminate--> start        run --force_config--> run
//! any --exit--> teardown (terminal)
//! ```
//!
//! Events are posted to the FSM queue from anywhere in the engine; nothing
//! calls a transition synchronously from a Paxos handler. `run_enter`
//! spawns the worker tasks, `terminate` cancels them and resets the core.

use std::rc::Rc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use groupcast_core::{NodeAddress, Synode};

use crate::config::{PROPOSERS, SNAPSHOT_WAIT_TIME};
use crate::engine::{Ctx, FsmEvent, StateChange};
use crate::recovery;
use crate::state::Core;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmState {
    Start,
    SnapshotWait,
    RecoverWait,
    Run,
}

struct Fsm {
    ctx: Rc<Ctx>,
    state: FsmState,
    run_token: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    timer_epoch: u64,
    timer: Option<JoinHandle<()>>,
}

#[instrument(skip_all, name = "fsm")]
pub(crate) async fn fsm_task(ctx: Rc<Ctx>, mut rx: mpsc::UnboundedReceiver<FsmEvent>) {
    let mut fsm = Fsm {
        ctx,
        state: FsmState::Start,
        run_token: None,
        tasks: Vec::new(),
        timer_epoch: 0,
        timer: None,
    };
    debug!("fsm entering start");

    loop {
        let event = tokio::select! {
            () = fsm.ctx.shutdown.cancelled() => return,
            e = rx.recv() => match e {
                Some(e) => e,
                None => return,
            },
        };

        if matches!(event, FsmEvent::Exit) {
            fsm.exit();
            return;
        }

        match fsm.state {
            FsmState::Start => fsm.on_start(event),
            FsmState::SnapshotWait => fsm.on_snapshot_wait(event),
            FsmState::RecoverWait => fsm.on_recover_wait(event),
            FsmState::Run => fsm.on_run(event),
        }
    }
}

impl Fsm {
    fn on_start(&mut self, event: FsmEvent) {
        match event {
            FsmEvent::NetBoot { nodes } => {
                info!(members = nodes.len(), "booting group");
                {
                    let mut core = self.ctx.core.borrow_mut();
                    let app_key = core.executed_msg;
                    crate::reconfig::install_node_group(&mut core, nodes, app_key);
                }
                self.run_enter();
            }
            FsmEvent::Snapshot(snapshot) | FsmEvent::LocalSnapshot(snapshot) => {
                // A snapshot while idle installs directly and runs.
                {
                    let mut core = self.ctx.core.borrow_mut();
                    recovery::install_snapshot(&self.ctx, &mut core, &snapshot);
                }
                self.run_enter();
            }
            FsmEvent::SnapshotWait { seeds } => self.snapshot_wait_enter(&seeds),
            FsmEvent::Terminate | FsmEvent::Timeout(_) | FsmEvent::Complete => {}
            FsmEvent::ForceConfig(_) => {
                warn!("force_config ignored outside run");
            }
            FsmEvent::Exit => unreachable!("exit handled by the driver"),
        }
    }

    fn on_snapshot_wait(&mut self, event: FsmEvent) {
        match event {
            FsmEvent::Snapshot(snapshot) | FsmEvent::LocalSnapshot(snapshot) => {
                {
                    let mut core = self.ctx.core.borrow_mut();
                    let mut snapshot = snapshot;
                    if core.max_synode > snapshot.log_end {
                        snapshot.log_end = core.max_synode;
                    }
                    recovery::install_snapshot(&self.ctx, &mut core, &snapshot);
                }
                self.recover_wait_enter();
            }
            FsmEvent::Timeout(epoch) if epoch == self.timer_epoch => {
                // No snapshot arrived; give up and return to start.
                warn!("no snapshot received before the deadline");
                self.state = FsmState::Start;
            }
            _ => {}
        }
    }

    fn on_recover_wait(&mut self, event: FsmEvent) {
        match event {
            FsmEvent::Snapshot(snapshot) => {
                let done = {
                    let mut core = self.ctx.core.borrow_mut();
                    let mut snapshot = snapshot;
                    if core.max_synode > snapshot.log_end {
                        snapshot.log_end = core.max_synode;
                    }
                    recovery::update_best_snapshot(&self.ctx, &mut core, &snapshot);
                    recovery::got_all_snapshots(&core)
                };
                if done {
                    info!("snapshots received from every member");
                    self.run_enter();
                }
            }
            FsmEvent::Timeout(epoch) if epoch == self.timer_epoch => self.run_enter(),
            FsmEvent::Complete => self.run_enter(),
            _ => {}
        }
    }

    fn on_run(&mut self, event: FsmEvent) {
        match event {
            FsmEvent::Terminate => {
                info!("terminating, back to start");
                self.teardown();
                self.ctx.app.state_change(StateChange::Terminate);
                self.state = FsmState::Start;
            }
            FsmEvent::ForceConfig(nodes) => {
                info!(members = nodes.len(), "applying forced configuration");
                let mut core = self.ctx.core.borrow_mut();
                let app_key = core.executed_msg;
                let mut site = groupcast_core::SiteDef::new(
                    nodes,
                    core.sites
                        .latest()
                        .map_or(groupcast_core::DEFAULT_EVENT_HORIZON, |s| s.event_horizon),
                );
                site.start = app_key;
                site.boot_key = app_key;
                core.sites.install(site.clone());
                crate::reconfig::start_force_config(
                    &mut core,
                    site,
                    true,
                    tokio::time::Instant::now(),
                );
            }
            // Already running; late boots and snapshots change nothing.
            _ => {}
        }
    }

    fn snapshot_wait_enter(&mut self, seeds: &[NodeAddress]) {
        debug!("entering snapshot_wait");
        {
            let mut core = self.ctx.core.borrow_mut();
            core.snapshot_mask.zero();
            core.log_start_max = Synode::NULL;
            core.log_end_max = Synode::NULL;
        }
        {
            let core = self.ctx.core.borrow();
            recovery::send_need_boot(&self.ctx, &core, seeds);
        }
        self.arm_timer(SNAPSHOT_WAIT_TIME);
        self.state = FsmState::SnapshotWait;
    }

    fn recover_wait_enter(&mut self) {
        debug!("entering recover_wait");
        let done = recovery::got_all_snapshots(&self.ctx.core.borrow());
        if done {
            self.run_enter();
        } else {
            self.arm_timer(SNAPSHOT_WAIT_TIME);
            self.state = FsmState::RecoverWait;
        }
    }

    fn run_enter(&mut self) {
        self.stop_timer();
        {
            let mut core = self.ctx.core.borrow_mut();
            let Some(latest) = core.sites.latest().cloned() else {
                warn!("run_enter without a configuration, staying in start");
                self.state = FsmState::Start;
                return;
            };
            core.start_config = latest.boot_key;
            if core.sites.find(core.executed_msg).is_none() {
                core.executed_msg = latest.start;
                core.delivered_msg = latest.start;
            }
            core.booted = true;

            // Proposer start point: our first owned slot not behind either
            // the executor or the highest slot seen.
            let from = core.executed_msg.max(core.max_synode);
            core.current_message = from.with_node(latest.nodeno);
            if core.current_message < from {
                core.current_message = core.current_message.incr_msgno().with_node(latest.nodeno);
            }
        }
        info!("entering run");
        self.ctx.app.state_change(StateChange::Run);

        let token = self.ctx.shutdown.child_token();
        self.tasks.push(tokio::task::spawn_local(
            crate::executor::executor_task(self.ctx.clone(), token.clone()),
        ));
        self.tasks.push(tokio::task::spawn_local(
            crate::sweeper::sweeper_task(self.ctx.clone(), token.clone()),
        ));
        self.tasks.push(tokio::task::spawn_local(
            crate::sweeper::cache_manager_task(self.ctx.clone(), token.clone()),
        ));
        self.tasks.push(tokio::task::spawn_local(crate::alive::alive_task(
            self.ctx.clone(),
            token.clone(),
        )));
        self.tasks.push(tokio::task::spawn_local(
            crate::alive::detector_task(self.ctx.clone(), token.clone()),
        ));
        for task_no in 0..PROPOSERS {
            self.tasks.push(tokio::task::spawn_local(
                crate::proposer::proposer_task(self.ctx.clone(), token.clone(), task_no),
            ));
        }
        self.run_token = Some(token);
        self.state = FsmState::Run;
    }

    /// Cancel the run-epoch tasks and reset the engine state.
    fn teardown(&mut self) {
        if let Some(token) = self.run_token.take() {
            token.cancel();
        }
        self.tasks.clear();
        self.stop_timer();
        self.ctx.input.drain_failing();

        let mut core = self.ctx.core.borrow_mut();
        let uuid = core.my_uuid.clone();
        let my_id = core.my_id;
        let group = core.group_id;
        *core = Core::new(&self.ctx.cfg, uuid, my_id, group);
    }

    fn exit(&mut self) {
        info!("exiting");
        self.teardown();
        {
            let mut core = self.ctx.core.borrow_mut();
            let group = core.group_id;
            core.bury_group(group);
        }
        self.ctx.app.state_change(StateChange::Exit);
        self.ctx.shutdown.cancel();
    }

    fn arm_timer(&mut self, after: std::time::Duration) {
        self.stop_timer();
        self.timer_epoch += 1;
        let epoch = self.timer_epoch;
        let ctx = self.ctx.clone();
        self.timer = Some(tokio::task::spawn_local(async move {
            tokio::time::sleep(after).await;
            ctx.post_fsm(FsmEvent::Timeout(epoch));
        }));
    }

    fn stop_timer(&mut self) {
        if let Some(t) = self.timer.take() {
            t.abort();
        }
    }
}
