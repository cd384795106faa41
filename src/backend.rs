//! Gateway backend.
//!
//! Listens for link connections from frontends, assigns each a disjoint
//! slice of the client-identifier space (the slot index in the top 8 bits),
//! and demultiplexes inbound traffic by the embedded client id. Outbound it
//! offers unicast, delete-client, and broadcast operations without holding
//! its own socket to any client.

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::codec::{FrameReader, FrameWidth, FrameWriter};
use crate::conn::{FrameSink, PacketConn, PacketListener};
use crate::error::{GatewayError, Result};
use crate::link::command;
use crate::pool::BufferPool;

/// Capacity of the link-slot table; slot indexes fit the top 8 bits of a
/// client id.
pub const MAX_LINKS: usize = 256;

/// Gateway backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Address the link listener binds to.
    pub addr: String,
    /// Length-prefix width; must match every connecting frontend.
    pub width: FrameWidth,
    /// Depth of the inbound message queue handed to the application.
    pub queue_depth: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:0".to_string(),
            width: FrameWidth::default(),
            queue_depth: 128,
        }
    }
}

/// One demultiplexed message from an external client.
///
/// An empty payload is the implicit disconnect notification: the client
/// behind `client_id` is gone and no further messages for it will arrive.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    pub client_id: u32,
    pub payload: Bytes,
}

impl ClientMessage {
    pub fn is_disconnect(&self) -> bool {
        self.payload.is_empty()
    }

    /// Cursor over the payload.
    pub fn reader(&self) -> FrameReader {
        FrameReader::new(self.payload.clone())
    }
}

/// Slot lifecycle: claimed at accept time, attached once the handshake is
/// on the wire. Outbound sends resolve only attached sinks, so the base-id
/// handshake is always the first frame a frontend reads on a new link.
enum LinkSlot {
    Claimed,
    Attached(FrameSink),
}

struct BackendShared {
    width: FrameWidth,
    pool: Arc<dyn BufferPool>,
    slots: RwLock<Vec<Option<LinkSlot>>>,
    shutdown: watch::Sender<()>,
    closed: AtomicBool,
}

impl BackendShared {
    /// Resolve a client id to its owning link's sink; the slot index lives
    /// in the top 8 bits.
    fn slot_for(&self, client_id: u32) -> Option<FrameSink> {
        match &self.slots.read()[(client_id >> 24) as usize] {
            Some(LinkSlot::Attached(sink)) => Some(sink.clone()),
            _ => None,
        }
    }

    fn has_links(&self) -> bool {
        self.slots
            .read()
            .iter()
            .any(|slot| matches!(slot, Some(LinkSlot::Attached(_))))
    }

    fn snapshot_links(&self) -> Vec<FrameSink> {
        self.slots
            .read()
            .iter()
            .filter_map(|slot| match slot {
                Some(LinkSlot::Attached(sink)) => Some(sink.clone()),
                _ => None,
            })
            .collect()
    }

    /// Reserve the first free slot without exposing it to outbound sends.
    fn claim_slot(&self) -> Option<usize> {
        let mut slots = self.slots.write();
        let index = slots.iter().position(|slot| slot.is_none())?;
        slots[index] = Some(LinkSlot::Claimed);
        Some(index)
    }

    fn attach_slot(&self, slot: usize, sink: FrameSink) {
        self.slots.write()[slot] = Some(LinkSlot::Attached(sink));
    }

    fn clear_slot(&self, slot: usize) {
        self.slots.write()[slot] = None;
    }
}

/// Gateway backend: the demultiplexing side of the gateway.
pub struct GatewayBackend {
    shared: Arc<BackendShared>,
    local_addr: SocketAddr,
}

impl GatewayBackend {
    /// Bind the link listener and return the backend together with the
    /// queue delivering demultiplexed [`ClientMessage`]s.
    ///
    /// One backend accepts links from many frontends; the slot-based id
    /// partitioning keeps their client ids from colliding.
    pub async fn bind(
        config: BackendConfig,
        pool: Arc<dyn BufferPool>,
    ) -> Result<(Self, mpsc::Receiver<ClientMessage>)> {
        if config.queue_depth == 0 {
            return Err(GatewayError::config("queue_depth must be at least 1"));
        }
        let listener = PacketListener::bind(&config.addr, config.width, 0, pool.clone()).await?;
        let local_addr = listener.local_addr();

        let (tx, rx) = mpsc::channel(config.queue_depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let shared = Arc::new(BackendShared {
            width: config.width,
            pool,
            slots: RwLock::new((0..MAX_LINKS).map(|_| None).collect()),
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(accept_loop(shared.clone(), listener, tx, shutdown_rx));
        info!(%local_addr, "gateway backend listening");
        Ok((Self { shared, local_addr }, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Build a unicast frame of `size` writable payload bytes for one
    /// client. Refuses when the client's slot holds no attached link.
    ///
    /// The frame embeds its own inner length prefix, so the receiving link
    /// can forward the tail to the client verbatim.
    pub fn unicast(&self, client_id: u32, size: usize) -> Result<OutboundFrame> {
        let sink = self
            .shared
            .slot_for(client_id)
            .ok_or(GatewayError::ClientUnreachable { client_id })?;

        let width = self.shared.width;
        let payload_len = 1 + 4 + width.size() + size;
        let mut frame = FrameWriter::with_pool(&*self.shared.pool, width, payload_len)?;
        frame
            .write_u8(command::NONE)
            .write_u32(client_id)
            .write_uint(width, size as u64);
        Ok(OutboundFrame {
            frame,
            target: Target::Link(sink),
        })
    }

    /// Tell the owning frontend to drop one client. An emptied slot is a
    /// silent no-op: the sender cannot know the current client
    /// distribution.
    pub async fn delete_client(&self, client_id: u32) -> Result<()> {
        let Some(sink) = self.shared.slot_for(client_id) else {
            return Ok(());
        };
        let mut frame = FrameWriter::with_pool(&*self.shared.pool, self.shared.width, 1 + 4)?;
        frame.write_u8(command::DEL_CLIENT).write_u32(client_id);
        sink.send_raw(frame.as_bytes()).await
    }

    /// Build a broadcast frame for a set of clients.
    ///
    /// Refuses only when no link is attached at all; the listed ids need
    /// not resolve anywhere. At send time the identical frame fans out to
    /// every attached link, and each link filters to the clients it
    /// actually owns.
    pub fn broadcast(&self, client_ids: &[u32], size: usize) -> Result<OutboundFrame> {
        if !self.shared.has_links() {
            return Err(GatewayError::NoLinks);
        }
        if client_ids.len() > u16::MAX as usize {
            return Err(GatewayError::config(format!(
                "broadcast id list of {} exceeds u16 count",
                client_ids.len()
            )));
        }

        let width = self.shared.width;
        let payload_len = 1 + 2 + 4 * client_ids.len() + width.size() + size;
        let mut frame = FrameWriter::with_pool(&*self.shared.pool, width, payload_len)?;
        frame
            .write_u8(command::BROADCAST)
            .write_u16(client_ids.len() as u16);
        for &client_id in client_ids {
            frame.write_u32(client_id);
        }
        frame.write_uint(width, size as u64);
        Ok(OutboundFrame {
            frame,
            target: Target::AllLinks(self.shared.clone()),
        })
    }

    /// Close the listener and every attached link. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.shutdown.send(());

        let sinks: Vec<FrameSink> = {
            let mut slots = self.shared.slots.write();
            slots
                .iter_mut()
                .filter_map(|slot| match slot.take() {
                    Some(LinkSlot::Attached(sink)) => Some(sink),
                    _ => None,
                })
                .collect()
        };
        for sink in sinks {
            sink.shutdown().await;
        }
        info!("gateway backend closed");
    }
}

async fn accept_loop(
    shared: Arc<BackendShared>,
    listener: PacketListener,
    tx: mpsc::Sender<ClientMessage>,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        let conn = tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "link accept failed");
                    break;
                }
            },
        };
        tokio::spawn(link_session(
            shared.clone(),
            conn,
            tx.clone(),
            shutdown.clone(),
        ));
    }
    debug!("backend accept loop ended");
}

/// One attached link: slot claim, handshake, then the per-link read loop.
async fn link_session(
    shared: Arc<BackendShared>,
    conn: PacketConn,
    tx: mpsc::Sender<ClientMessage>,
    mut shutdown: watch::Receiver<()>,
) {
    let peer = conn.peer_addr();
    let (mut stream, sink) = conn.split();

    let Some(slot) = shared.claim_slot() else {
        warn!(%peer, "link slot table full, dropping connection");
        return;
    };

    // Handshake response: the slot's base client id. Sent before the sink
    // is published, so no concurrent unicast or broadcast can put a frame
    // on the wire ahead of it.
    let base_id = (slot as u32) << 24;
    let handshake = FrameWriter::with_pool(&*shared.pool, shared.width, 4).map(|mut frame| {
        frame.write_u32(base_id);
        frame
    });
    let sent = match handshake {
        Ok(frame) => sink.send_raw(frame.as_bytes()).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        warn!(%peer, slot, error = %e, "link handshake send failed");
        shared.clear_slot(slot);
        return;
    }
    shared.attach_slot(slot, sink.clone());
    info!(%peer, slot, "link attached");

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            res = stream.read_frame() => match res {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(%peer, slot, error = %e, "link read ended");
                    break;
                }
            },
        };

        if frame.len() < 4 {
            warn!(%peer, slot, len = frame.len(), "malformed link frame");
            break;
        }
        let mut msg = FrameReader::new(frame.freeze());
        let client_id = msg.read_u32();
        let message = ClientMessage {
            client_id,
            payload: msg.into_remaining(),
        };
        // A dropped receiver means the application is gone; stop reading.
        if tx.send(message).await.is_err() {
            break;
        }
    }

    shared.clear_slot(slot);
    sink.shutdown().await;
    info!(%peer, slot, "link detached");
}

enum Target {
    Link(FrameSink),
    AllLinks(Arc<BackendShared>),
}

/// An outbound frame under construction; write the payload through the
/// [`FrameWriter`] interface, then [`send`](OutboundFrame::send) it.
pub struct OutboundFrame {
    frame: FrameWriter,
    target: Target,
}

impl OutboundFrame {
    /// Transmit the finished frame.
    ///
    /// Unicast and delete frames go to the resolved link; broadcast frames
    /// go to every link attached at this moment. Socket I/O happens outside
    /// the slot-table lock. With multiple targets the last error wins.
    pub async fn send(self) -> Result<()> {
        let buf = self.frame.into_inner();
        match self.target {
            Target::Link(sink) => sink.send_raw(&buf).await,
            Target::AllLinks(shared) => {
                let mut result = Ok(());
                for sink in shared.snapshot_links() {
                    if let Err(e) = sink.send_raw(&buf).await {
                        result = Err(e);
                    }
                }
                result
            }
        }
    }
}

impl Deref for OutboundFrame {
    type Target = FrameWriter;

    fn deref(&self) -> &FrameWriter {
        &self.frame
    }
}

impl DerefMut for OutboundFrame {
    fn deref_mut(&mut self) -> &mut FrameWriter {
        &mut self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SlabPool;
    use tokio::net::{TcpListener, TcpStream};

    fn shared() -> Arc<BackendShared> {
        let (shutdown, _) = watch::channel(());
        Arc::new(BackendShared {
            width: FrameWidth::U32,
            pool: Arc::new(SlabPool::new(1024, 1024).unwrap()),
            slots: RwLock::new((0..MAX_LINKS).map(|_| None).collect()),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    async fn test_sink() -> (FrameSink, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_, wr) = client.into_split();
        (FrameSink::new(wr), server)
    }

    #[tokio::test]
    async fn claimed_slot_is_invisible_until_attached() {
        let shared = shared();
        let slot = shared.claim_slot().unwrap();

        // A slot mid-handshake must not resolve for any outbound send.
        assert!(!shared.has_links());
        assert!(shared.snapshot_links().is_empty());
        assert!(shared.slot_for((slot as u32) << 24).is_none());

        let (sink, _peer) = test_sink().await;
        shared.attach_slot(slot, sink);
        assert!(shared.has_links());
        assert_eq!(shared.snapshot_links().len(), 1);
        assert!(shared.slot_for((slot as u32) << 24).is_some());

        shared.clear_slot(slot);
        assert!(!shared.has_links());
    }

    #[tokio::test]
    async fn claimed_slots_are_not_reissued() {
        let shared = shared();
        let a = shared.claim_slot().unwrap();
        let b = shared.claim_slot().unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn zero_queue_depth_is_a_config_error() {
        let config = BackendConfig {
            queue_depth: 0,
            ..Default::default()
        };
        let pool: Arc<dyn BufferPool> = Arc::new(SlabPool::new(1024, 1024).unwrap());
        let err = GatewayBackend::bind(config, pool)
            .await
            .err()
            .expect("bind must refuse a zero-depth queue");
        assert!(matches!(err, GatewayError::Config { .. }));
    }
}
