//! TCP transport for the engine.
//!
//! Frames are length-delimited postcard; every connection opens with a
//! version handshake before any engine traffic. Outbound connections are created lazily per peer and
//! reconnect with jittered backoff; replies ride back on the connection
//! the request arrived on. Messages addressed to this node loop straight
//! back into the engine's inbound queue.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, trace, warn};

use groupcast_core::codec::Envelope;
use groupcast_core::error::WireError;
use groupcast_core::{
    GroupId, Handshake, HandshakeResponse, NodeNo, PaxMsg, ProtoVersion, SiteDef,
};
use groupcast_engine::{Inbound, Transport};

use crate::metrics::SharedMetrics;

const MAX_FRAME: usize = 16 * 1024 * 1024;
/// Protocol-mismatch warnings are throttled to one per peer per this long.
const VERSION_WARN_INTERVAL: Duration = Duration::from_secs(600);

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes, WireError> {
    postcard::to_allocvec(value)
        .map(Bytes::from)
        .map_err(|e| WireError::Codec(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, WireError> {
    postcard::from_bytes(bytes).map_err(|e| WireError::Codec(e.to_string()))
}

struct Peer {
    tx: mpsc::UnboundedSender<PaxMsg>,
    invalid: Cell<bool>,
}

/// Lazily connecting TCP transport. Lives on the engine's `LocalSet`.
pub struct TcpTransport {
    my_address: String,
    group_id: GroupId,
    inbound: mpsc::UnboundedSender<Inbound>,
    peers: RefCell<HashMap<String, Rc<Peer>>>,
    /// Reply sink for loopback traffic: replies to self-addressed messages
    /// re-enter the inbound queue.
    loop_reply: mpsc::UnboundedSender<PaxMsg>,
    metrics: SharedMetrics,
    last_version_warn: Cell<Option<Instant>>,
    /// Back-reference so `send` can spawn peer tasks from `&self`.
    this: RefCell<std::rc::Weak<TcpTransport>>,
}

impl TcpTransport {
    /// Create the transport and its loopback pump. Must run inside a
    /// `LocalSet`.
    #[must_use]
    pub fn new(
        my_address: String,
        group_id: GroupId,
        inbound: mpsc::UnboundedSender<Inbound>,
        metrics: SharedMetrics,
    ) -> Rc<Self> {
        let (loop_tx, mut loop_rx) = mpsc::unbounded_channel::<PaxMsg>();
        let transport = Rc::new(Self {
            my_address,
            group_id,
            inbound: inbound.clone(),
            peers: RefCell::new(HashMap::new()),
            loop_reply: loop_tx.clone(),
            metrics,
            last_version_warn: Cell::new(None),
            this: RefCell::new(std::rc::Weak::new()),
        });
        *transport.this.borrow_mut() = Rc::downgrade(&transport);

        // Loopback replies become fresh inbound messages.
        tokio::task::spawn_local(async move {
            while let Some(msg) = loop_rx.recv().await {
                let _ = inbound.send(Inbound {
                    msg,
                    reply: loop_tx.clone(),
                });
            }
        });
        transport
    }

    /// Accept inbound connections forever.
    pub async fn listen(self: Rc<Self>, listener: TcpListener) {
        info!(addr = %self.my_address, "transport listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(%peer_addr, "accepted connection");
                    self.metrics.metrics.connections_opened_total.inc();
                    let this = self.clone();
                    tokio::task::spawn_local(async move {
                        if let Err(e) = this.serve_connection(stream).await {
                            debug!(%peer_addr, error = %e, "connection closed");
                        }
                        this.metrics.metrics.connections_closed_total.inc();
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Server side of one connection: handshake, then relay frames in and
    /// replies out.
    async fn serve_connection(&self, stream: TcpStream) -> Result<(), WireError> {
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, codec());
        let mut writer = FramedWrite::new(write, codec());

        // Handshake first; no engine traffic before versions agree.
        let first = reader
            .next()
            .await
            .ok_or_else(|| WireError::Handshake("closed before handshake".into()))??;
        let Handshake::VersionReq { group_id, min, max } = decode(&first)?;

        if group_id != self.group_id {
            writer.send(encode(&HandshakeResponse::WrongGroup)?).await?;
            return Err(WireError::Handshake("wrong group".into()));
        }
        let ours = (ProtoVersion::OLDEST_SUPPORTED, ProtoVersion::CURRENT);
        let Some(version) = ProtoVersion::negotiate(ours, (min, max)) else {
            writer
                .send(encode(&HandshakeResponse::Unsupported {
                    min: ours.0,
                    max: ours.1,
                })?)
                .await?;
            self.warn_version(&format!("{min:?}..{max:?}"));
            return Err(WireError::Version(format!("peer speaks {min:?}..{max:?}")));
        };
        writer.send(encode(&HandshakeResponse::Accepted(version))?).await?;
        trace!(?version, "handshake complete");

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::task::spawn_local(Self::write_frames(
            writer,
            reply_rx,
            version,
            self.metrics.clone(),
        ));
        let result = self.read_frames(&mut reader, &reply_tx).await;
        drop(reply_tx);
        let _ = writer_task.await;
        result
    }

    /// Pull engine messages off a connection and push them inbound.
    async fn read_frames(
        &self,
        reader: &mut FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
        reply: &mpsc::UnboundedSender<PaxMsg>,
    ) -> Result<(), WireError> {
        while let Some(frame) = reader.next().await {
            let frame = frame?;
            self.metrics.metrics.frames_received_total.inc();
            self.metrics
                .metrics
                .bytes_received_total
                .inc_by(frame.len() as u64);
            let envelope: Envelope<PaxMsg> = decode(&frame)?;
            let _ = self.inbound.send(Inbound {
                msg: envelope.msg,
                reply: reply.clone(),
            });
        }
        Ok(())
    }

    /// Drain a reply/outbound queue onto a socket.
    async fn write_frames(
        mut writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
        mut rx: mpsc::UnboundedReceiver<PaxMsg>,
        version: ProtoVersion,
        metrics: SharedMetrics,
    ) {
        while let Some(msg) = rx.recv().await {
            let envelope = Envelope::new(version, msg);
            match encode(&envelope) {
                Ok(bytes) => {
                    metrics.metrics.frames_sent_total.inc();
                    metrics.metrics.bytes_sent_total.inc_by(bytes.len() as u64);
                    if writer.send(bytes).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dropping unencodable message");
                }
            }
        }
    }

    /// Get or create the outbound peer handle for an address.
    fn peer(&self, address: &str) -> Rc<Peer> {
        if let Some(peer) = self.peers.borrow().get(address)
            && !peer.invalid.get()
        {
            return peer.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Rc::new(Peer {
            tx,
            invalid: Cell::new(false),
        });
        self.peers
            .borrow_mut()
            .insert(address.to_string(), peer.clone());
        if let Some(this) = self.this.borrow().upgrade() {
            let addr = address.to_string();
            tokio::task::spawn_local(async move {
                this.run_peer(addr, rx).await;
            });
        }
        peer
    }

    /// Outbound connection loop for one peer: connect, handshake, relay.
    /// Reconnects with jittered backoff for as long as traffic flows.
    async fn run_peer(self: Rc<Self>, address: String, mut rx: mpsc::UnboundedReceiver<PaxMsg>) {
        let mut failures: u32 = 0;
        loop {
            let stream = match TcpStream::connect(&address).await {
                Ok(s) => s,
                Err(e) => {
                    failures += 1;
                    let backoff = reconnect_backoff(failures);
                    trace!(%address, error = %e, ?backoff, "connect failed");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };
            if stream.set_nodelay(true).is_err() {
                continue;
            }
            self.metrics.metrics.connections_opened_total.inc();
            debug!(%address, "connected to peer");

            match self.drive_peer(stream, &mut rx).await {
                Ok(()) => {
                    // Outbound queue closed: the peer was invalidated.
                    debug!(%address, "peer writer stopping");
                    self.metrics.metrics.connections_closed_total.inc();
                    return;
                }
                Err(WireError::Version(e)) => {
                    // Mismatch will not heal by retrying quickly.
                    self.warn_version(&e);
                    failures = failures.max(8);
                }
                Err(e) => {
                    debug!(%address, error = %e, "peer connection lost");
                    failures += 1;
                }
            }
            self.metrics.metrics.connections_closed_total.inc();
            tokio::time::sleep(reconnect_backoff(failures)).await;
        }
    }

    async fn drive_peer(
        &self,
        stream: TcpStream,
        rx: &mut mpsc::UnboundedReceiver<PaxMsg>,
    ) -> Result<(), WireError> {
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, codec());
        let mut writer = FramedWrite::new(write, codec());

        writer
            .send(encode(&Handshake::VersionReq {
                group_id: self.group_id,
                min: ProtoVersion::OLDEST_SUPPORTED,
                max: ProtoVersion::CURRENT,
            })?)
            .await?;
        let first = reader
            .next()
            .await
            .ok_or_else(|| WireError::Handshake("closed during handshake".into()))??;
        let version = match decode::<HandshakeResponse>(&first)? {
            HandshakeResponse::Accepted(v) => v,
            HandshakeResponse::Unsupported { min, max } => {
                return Err(WireError::Version(format!("peer speaks {min:?}..{max:?}")));
            }
            HandshakeResponse::WrongGroup => {
                return Err(WireError::Handshake("wrong group".into()));
            }
        };

        // Answers to our requests come back on this connection and are
        // themselves answered over it.
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<PaxMsg>();
        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(msg) = outbound else { return Ok(()) };
                    let bytes = encode(&Envelope::new(version, msg))?;
                    self.metrics.metrics.frames_sent_total.inc();
                    self.metrics.metrics.bytes_sent_total.inc_by(bytes.len() as u64);
                    writer.send(bytes).await?;
                }
                reply = reply_rx.recv() => {
                    if let Some(msg) = reply {
                        let bytes = encode(&Envelope::new(version, msg))?;
                        writer.send(bytes).await?;
                    }
                }
                frame = reader.next() => {
                    let Some(frame) = frame else {
                        return Err(WireError::Connect("peer closed".into()));
                    };
                    let frame = frame?;
                    self.metrics.metrics.frames_received_total.inc();
                    self.metrics.metrics.bytes_received_total.inc_by(frame.len() as u64);
                    let envelope: Envelope<PaxMsg> = decode(&frame)?;
                    let _ = self.inbound.send(Inbound {
                        msg: envelope.msg,
                        reply: reply_tx.clone(),
                    });
                }
            }
        }
    }

    fn warn_version(&self, detail: &str) {
        let now = Instant::now();
        let due = self
            .last_version_warn
            .get()
            .is_none_or(|t| now.duration_since(t) >= VERSION_WARN_INTERVAL);
        if due {
            self.last_version_warn.set(Some(now));
            warn!(detail, "dropping peer with unsupported protocol version");
        }
    }
}

fn reconnect_backoff(failures: u32) -> Duration {
    let base = Duration::from_millis(50);
    let capped = base.saturating_mul(2u32.saturating_pow(failures.min(6)));
    let jitter = rand::rng().random_range(0.5..1.5);
    capped.min(Duration::from_secs(5)).mul_f64(jitter)
}

impl Transport for TcpTransport {
    fn send(&self, site: &SiteDef, to: NodeNo, msg: PaxMsg) {
        let Some(peer) = site.address_of(to) else {
            return;
        };
        if peer.address == self.my_address {
            let _ = self.inbound.send(Inbound {
                msg,
                reply: self.loop_reply.clone(),
            });
            return;
        }
        let _ = self.peer(&peer.address).tx.send(msg);
    }
}

impl TcpTransport {
    /// Ensure an outbound connection exists for every member of the site.
    /// Call whenever a new configuration is seen.
    pub fn connect_site(&self, site: &SiteDef) {
        for node in &site.nodes {
            if node.address != self.my_address {
                let _ = self.peer(&node.address);
            }
        }
    }

    /// Ensure an outbound connection exists for one address.
    pub fn connect_peer(&self, address: &str) {
        if address != self.my_address {
            let _ = self.peer(address);
        }
    }

    /// Drop a peer and mark its handle invalid so lookups never revive a
    /// zombie; the next send dials a fresh connection. Used when a
    /// configuration change replaces a member.
    pub fn invalidate_peer(&self, address: &str) {
        if let Some(peer) = self.peers.borrow_mut().remove(address) {
            peer.invalid.set(true);
        }
    }
}
