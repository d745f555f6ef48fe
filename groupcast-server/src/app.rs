//! A minimal embedder: keeps the delivered log in memory and snapshots it
//! wholesale. Real deployments implement [`Application`] themselves.

use std::cell::RefCell;

use bytes::Bytes;
use tracing::{debug, info};

use groupcast_core::{AppData, Cargo, DeliveryStatus, SiteDef, Synode};
use groupcast_engine::{Application, StateChange};

use crate::metrics::SharedMetrics;

#[derive(Default)]
struct LogState {
    /// Delivered `(synode, payload)` pairs in delivery order.
    entries: Vec<(Synode, Bytes)>,
    high_water: Synode,
}

/// In-memory log application.
pub struct LogApplication {
    state: RefCell<LogState>,
    metrics: SharedMetrics,
}

impl LogApplication {
    #[must_use]
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            state: RefCell::new(LogState::default()),
            metrics,
        }
    }

    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.state.borrow().entries.len()
    }
}

impl Application for LogApplication {
    fn snapshot_get(&self) -> Option<(Bytes, Synode)> {
        let state = self.state.borrow();
        let blob: Vec<(Synode, Vec<u8>)> = state
            .entries
            .iter()
            .map(|(s, b)| (*s, b.to_vec()))
            .collect();
        let bytes = postcard::to_allocvec(&(blob, state.high_water)).ok()?;
        if bytes.is_empty() {
            return None;
        }
        Some((Bytes::from(bytes), state.high_water))
    }

    fn snapshot_install(&self, app_snap: &Bytes, log_start: Synode, log_end: Synode) {
        let Ok((blob, high_water)) =
            postcard::from_bytes::<(Vec<(Synode, Vec<u8>)>, Synode)>(app_snap)
        else {
            debug!("ignoring undecodable snapshot blob");
            return;
        };
        info!(entries = blob.len(), %log_start, %log_end, "installing application snapshot");
        let mut state = self.state.borrow_mut();
        state.entries = blob
            .into_iter()
            .map(|(s, b)| (s, Bytes::from(b)))
            .collect();
        state.high_water = high_water;
    }

    fn deliver(&self, synode: Synode, data: &AppData, status: DeliveryStatus) {
        if status == DeliveryStatus::Failure {
            debug!(%synode, lsn = data.lsn, "delivery failure");
            return;
        }
        if let Cargo::App(bytes) = &data.body {
            self.metrics.metrics.deliveries_total.inc();
            let mut state = self.state.borrow_mut();
            state.entries.push((synode, bytes.clone()));
            state.high_water = synode;
        }
    }

    fn global_view(&self, site: &SiteDef, synode: Synode) {
        info!(
            members = site.nodes.len(),
            start = %site.start,
            at = %synode,
            "membership view"
        );
    }

    fn state_change(&self, change: StateChange) {
        info!(?change, "engine state change");
    }
}
