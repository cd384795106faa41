//! Multiplexed link between a frontend and one backend.
//!
//! A `Link` owns the client-identifier namespace handed to it at handshake
//! time (the backend's slot base value) and the registry of external client
//! connections currently routed through it. Its read loop demultiplexes
//! command-tagged frames coming back from the backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::codec::{FrameReader, FrameWidth, FrameWriter};
use crate::conn::{self, FrameSink, FrameStream};
use crate::error::{GatewayError, Result};
use crate::frontend::{BackendInfo, FrontendShared};
use crate::pool::BufferPool;

/// Command byte on every backend-to-link frame.
pub(crate) mod command {
    pub const NONE: u8 = 0;
    /// Reserved by the wire protocol; no current flow emits it.
    pub const ADD_CLIENT: u8 = 1;
    pub const DEL_CLIENT: u8 = 2;
    pub const BROADCAST: u8 = 3;
}

/// One registered external client connection.
pub(crate) struct ClientEntry {
    sink: FrameSink,
    gone: Arc<Notify>,
}

impl ClientEntry {
    /// Close the client connection and wake its relay task.
    async fn close(self) {
        self.sink.shutdown().await;
        self.gone.notify_one();
    }
}

struct ClientTable {
    next_id: u32,
    map: HashMap<u32, ClientEntry>,
}

/// One persistent multiplexed connection from a frontend to one backend.
pub(crate) struct Link {
    pub(crate) id: u32,
    pub(crate) addr: String,
    pub(crate) take_client_addr: bool,
    width: FrameWidth,
    pool: Arc<dyn BufferPool>,
    sink: FrameSink,
    clients: RwLock<ClientTable>,
    owner: Weak<FrontendShared>,
    shutdown: watch::Sender<()>,
    closed: AtomicBool,
}

impl Link {
    /// Connect to the backend, perform the handshake read that seeds the
    /// client-id sequence, and start the backend read loop.
    pub(crate) async fn connect(
        owner: Weak<FrontendShared>,
        info: &BackendInfo,
        width: FrameWidth,
        pool: Arc<dyn BufferPool>,
    ) -> Result<Arc<Self>> {
        let mut conn = conn::connect(&info.addr, width, 0, pool.clone()).await?;

        let frame = conn.read_frame().await.map_err(|_| {
            GatewayError::handshake(format!("link handshake read from {} failed", info.addr))
        })?;
        if frame.len() != 4 {
            return Err(GatewayError::handshake(format!(
                "link handshake frame must be 4 bytes, got {}",
                frame.len()
            )));
        }
        let base_id = FrameReader::new(frame.freeze()).read_u32();

        let (stream, sink) = conn.split();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let link = Arc::new(Self {
            id: info.id,
            addr: info.addr.clone(),
            take_client_addr: info.take_client_addr,
            width,
            pool,
            sink,
            clients: RwLock::new(ClientTable {
                next_id: base_id,
                map: HashMap::new(),
            }),
            owner,
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
        });

        debug!(backend_id = info.id, addr = %info.addr, base_id, "link established");
        tokio::spawn(Self::read_loop(link.clone(), stream, shutdown_rx));
        Ok(link)
    }

    /// Register an external client connection and issue its id.
    ///
    /// The sequence counter is incremented before use, so the handshake
    /// base value itself is never issued and detached ids are never reused.
    pub(crate) fn attach_client(&self, sink: FrameSink, gone: Arc<Notify>) -> Option<u32> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut table = self.clients.write();
        // 24-bit rollover would bleed into a neighbouring slot's id space;
        // accepted limitation of the id scheme.
        table.next_id = table.next_id.wrapping_add(1);
        let id = table.next_id;
        table.map.insert(id, ClientEntry { sink, gone });
        Some(id)
    }

    pub(crate) fn detach_client(&self, client_id: u32) {
        self.clients.write().map.remove(&client_id);
    }

    fn client_sink(&self, client_id: u32) -> Option<FrameSink> {
        self.clients.read().map.get(&client_id).map(|e| e.sink.clone())
    }

    fn remove_client(&self, client_id: u32) -> Option<ClientEntry> {
        self.clients.write().map.remove(&client_id)
    }

    /// Forward pre-framed bytes to the backend verbatim.
    pub(crate) async fn relay(&self, buf: &[u8]) -> Result<()> {
        self.sink.send_raw(buf).await
    }

    /// Bare disconnect notice: client id with no trailing payload.
    pub(crate) async fn send_disconnect_notice(&self, client_id: u32) -> Result<()> {
        let mut frame = FrameWriter::with_pool(&*self.pool, self.width, 4)?;
        frame.write_u32(client_id);
        self.sink.send_raw(frame.as_bytes()).await
    }

    /// Address announcement: client id plus its length-prefixed remote
    /// address string, sent before any client traffic.
    pub(crate) async fn send_client_addr(&self, client_id: u32, addr: &str) -> Result<()> {
        let bytes = addr.as_bytes();
        let mut frame = FrameWriter::with_pool(&*self.pool, self.width, 4 + 1 + bytes.len())?;
        frame.write_u32(client_id).write_bytes8(bytes);
        self.sink.send_raw(frame.as_bytes()).await
    }

    /// Demultiplex command-tagged frames coming back from the backend.
    async fn read_loop(
        self: Arc<Self>,
        mut stream: FrameStream,
        mut shutdown: watch::Receiver<()>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                res = stream.read_frame() => match res {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(backend_id = self.id, error = %e, "link read loop ended");
                        break;
                    }
                },
            };

            let mut msg = FrameReader::new(frame.freeze());
            if msg.is_empty() {
                warn!(backend_id = self.id, "empty gateway frame, dropping link");
                break;
            }
            match msg.read_u8() {
                command::NONE => {
                    if msg.len() < 4 {
                        break;
                    }
                    let client_id = msg.read_u32();
                    // Absent ids were detached locally or belong to another
                    // link that received the same broadcast.
                    if let Some(sink) = self.client_sink(client_id) {
                        let _ = sink.send_raw(msg.remaining()).await;
                    }
                }
                command::ADD_CLIENT => {}
                command::DEL_CLIENT => {
                    if msg.len() < 4 {
                        break;
                    }
                    let client_id = msg.read_u32();
                    if let Some(entry) = self.remove_client(client_id) {
                        entry.close().await;
                        debug!(backend_id = self.id, client_id, "client deleted on backend request");
                    }
                }
                command::BROADCAST => {
                    if msg.len() < 2 {
                        break;
                    }
                    let count = msg.read_u16() as usize;
                    if msg.len() < count * 4 {
                        break;
                    }
                    let mut ids = Vec::with_capacity(count);
                    for _ in 0..count {
                        ids.push(msg.read_u32());
                    }
                    let payload = msg.into_remaining();
                    // Filtering step that makes backend-side fan-out
                    // correct: only locally registered ids are delivered.
                    for client_id in ids {
                        if let Some(sink) = self.client_sink(client_id) {
                            let _ = sink.send_raw(&payload).await;
                        }
                    }
                }
                other => {
                    warn!(backend_id = self.id, command = other, "unknown gateway command, dropping link");
                    break;
                }
            }
        }

        self.close(true).await;
    }

    /// Close the backend connection and every registered client.
    ///
    /// With `remove_from_owner` the link also deregisters itself from the
    /// frontend's table (unless a reconfiguration already replaced it).
    pub(crate) async fn close(self: Arc<Self>, remove_from_owner: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        self.sink.shutdown().await;

        let entries: Vec<ClientEntry> = {
            let mut table = self.clients.write();
            table.map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.close().await;
        }

        if remove_from_owner {
            if let Some(owner) = self.owner.upgrade() {
                owner.remove_link(self.id, &self).await;
            }
        }
        debug!(backend_id = self.id, addr = %self.addr, "link closed");
    }
}
