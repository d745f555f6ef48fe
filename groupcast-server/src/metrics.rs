//! Prometheus metrics for the daemon.

use std::rc::Rc;

use measured::text::BufferedTextEncoder;
use measured::{Counter, MetricGroup};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, warn};

#[derive(MetricGroup)]
#[metric(new())]
pub struct ServerMetrics {
    /// Connections accepted or dialed.
    pub connections_opened_total: Counter,
    pub connections_closed_total: Counter,

    pub frames_sent_total: Counter,
    pub frames_received_total: Counter,
    pub bytes_sent_total: Counter,
    pub bytes_received_total: Counter,

    /// Payloads delivered to the application in total order.
    pub deliveries_total: Counter,
}

pub struct MetricsEncoder {
    encoder: std::cell::RefCell<BufferedTextEncoder>,
    pub metrics: ServerMetrics,
}

impl Default for MetricsEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            encoder: std::cell::RefCell::default(),
            metrics: ServerMetrics::new(),
        }
    }

    /// Render the Prometheus text exposition.
    ///
    /// # Panics
    ///
    /// Panics if metric collection fails, which the text encoder never
    /// does.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = self.encoder.borrow_mut();
        self.metrics.collect_group_into(&mut *encoder).unwrap();
        encoder.finish().to_vec()
    }
}

pub type SharedMetrics = Rc<MetricsEncoder>;

/// Serve the metrics text to anyone who connects, one shot per
/// connection (`curl`/`nc` friendly, no HTTP).
pub async fn serve_metrics(listener: TcpListener, metrics: SharedMetrics) {
    loop {
        match listener.accept().await {
            Ok((mut stream, peer)) => {
                debug!(%peer, "metrics scrape");
                let text = metrics.encode();
                let _ = stream.write_all(&text).await;
                let _ = stream.shutdown().await;
            }
            Err(e) => {
                warn!(error = %e, "metrics accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
