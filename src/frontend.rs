//! Gateway frontend.
//!
//! Terminates external client connections, routes each to a backend link
//! chosen by the client's handshake, and relays traffic with an in-place
//! re-frame of the reserved buffer head: the new length prefix and the
//! client id are written over the padding bytes, so the payload is never
//! copied on the relay path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{FrameReader, FrameWidth};
use crate::conn::{self, PacketConn, PacketListener};
use crate::error::{GatewayError, Result};
use crate::link::Link;
use crate::pool::BufferPool;

/// Gateway frontend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    /// Address the client listener binds to.
    pub addr: String,
    /// Length-prefix width; must match the backends and their clients.
    pub width: FrameWidth,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:0".to_string(),
            width: FrameWidth::default(),
        }
    }
}

/// One entry of the backend-address table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Backend id clients select during their handshake.
    pub id: u32,
    /// Backend listener address.
    pub addr: String,
    /// Announce each new client's remote address to this backend.
    #[serde(default)]
    pub take_client_addr: bool,
}

/// Per-id outcome of a reconfiguration pass.
#[derive(Debug)]
pub struct BackendUpdate {
    pub id: u32,
    pub addr: String,
    pub outcome: UpdateOutcome,
}

/// What happened to one backend id during reconfiguration.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// A new link was established.
    Created,
    /// The live link was closed (id removed or address changed).
    Closed,
    /// Establishing the link failed.
    Failed(GatewayError),
}

pub(crate) struct FrontendShared {
    width: FrameWidth,
    pool: Arc<dyn BufferPool>,
    links: RwLock<HashMap<u32, Arc<Link>>>,
    shutdown: watch::Sender<()>,
    closed: AtomicBool,
}

impl FrontendShared {
    /// Deregister `link` if the table still maps its id to this instance;
    /// a reconfiguration may already have replaced it.
    pub(crate) async fn remove_link(&self, id: u32, link: &Arc<Link>) {
        let mut links = self.links.write().await;
        if let Some(existing) = links.get(&id) {
            if Arc::ptr_eq(existing, link) {
                links.remove(&id);
                debug!(backend_id = id, "link deregistered");
            }
        }
    }
}

/// Gateway frontend: the client-facing side of the gateway.
pub struct GatewayFrontend {
    shared: Arc<FrontendShared>,
    local_addr: SocketAddr,
}

impl GatewayFrontend {
    /// Bind the client listener, connect the initial backend set, and start
    /// accepting clients.
    ///
    /// Backends that cannot be reached at construction time are logged and
    /// skipped; a later [`update_backends`](Self::update_backends) retries
    /// them.
    pub async fn bind(
        config: FrontendConfig,
        backends: &[BackendInfo],
        pool: Arc<dyn BufferPool>,
    ) -> Result<Self> {
        // Reserved head: the relay path rewrites it with a new prefix plus
        // the client id.
        let padding = config.width.size() + 4;
        let listener =
            PacketListener::bind(&config.addr, config.width, padding, pool.clone()).await?;
        let local_addr = listener.local_addr();

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let shared = Arc::new(FrontendShared {
            width: config.width,
            pool,
            links: RwLock::new(HashMap::new()),
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
        });

        let frontend = Self {
            shared: shared.clone(),
            local_addr,
        };
        for update in frontend.update_backends(backends).await {
            if let UpdateOutcome::Failed(e) = &update.outcome {
                warn!(
                    backend_id = update.id,
                    addr = %update.addr,
                    error = %e,
                    "initial backend connect failed"
                );
            }
        }

        tokio::spawn(accept_loop(shared, listener, shutdown_rx));
        info!(%local_addr, "gateway frontend listening");
        Ok(frontend)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Reconcile the live link table against `backends`.
    ///
    /// Links whose id vanished or whose address changed are closed; list
    /// entries without a live link are connected. Unchanged id+address
    /// pairs are left untouched, including ones whose `take_client_addr`
    /// flag differs: applying that flag requires recreating the link, which
    /// is deliberately not done behind the caller's back.
    ///
    /// The whole diff runs under the table's write lock, so concurrent
    /// client handshakes observe either the old or the new topology, never
    /// an intermediate one. On a closed frontend every entry is refused
    /// with [`GatewayError::Closed`]; no link is dialed.
    pub async fn update_backends(&self, backends: &[BackendInfo]) -> Vec<BackendUpdate> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return backends
                .iter()
                .map(|info| BackendUpdate {
                    id: info.id,
                    addr: info.addr.clone(),
                    outcome: UpdateOutcome::Failed(GatewayError::Closed),
                })
                .collect();
        }

        let mut results = Vec::new();
        let mut links = self.shared.links.write().await;

        let stale: Vec<u32> = links
            .iter()
            .filter(|(id, link)| match backends.iter().find(|b| b.id == **id) {
                None => true,
                Some(info) => info.addr != link.addr,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(link) = links.remove(&id) {
                let addr = link.addr.clone();
                link.close(false).await;
                info!(backend_id = id, %addr, "link closed by reconfiguration");
                results.push(BackendUpdate {
                    id,
                    addr,
                    outcome: UpdateOutcome::Closed,
                });
            }
        }

        for info in backends {
            if links.contains_key(&info.id) {
                continue;
            }
            let outcome = match Link::connect(
                Arc::downgrade(&self.shared),
                info,
                self.shared.width,
                self.shared.pool.clone(),
            )
            .await
            {
                Ok(link) => {
                    links.insert(info.id, link);
                    info!(backend_id = info.id, addr = %info.addr, "link created by reconfiguration");
                    UpdateOutcome::Created
                }
                Err(e) => UpdateOutcome::Failed(e),
            };
            results.push(BackendUpdate {
                id: info.id,
                addr: info.addr.clone(),
                outcome,
            });
        }

        results
    }

    /// Close the listener and every link. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.shutdown.send(());

        let links: Vec<Arc<Link>> = {
            let mut links = self.shared.links.write().await;
            links.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            link.close(false).await;
        }
        info!("gateway frontend closed");
    }
}

async fn accept_loop(
    shared: Arc<FrontendShared>,
    listener: PacketListener,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        let conn = tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "client accept failed");
                    break;
                }
            },
        };
        tokio::spawn(client_session(shared.clone(), conn));
    }
    debug!("frontend accept loop ended");
}

/// One external client: handshake, registration, then the relay loop.
async fn client_session(shared: Arc<FrontendShared>, mut conn: PacketConn) {
    let peer = conn.peer_addr();
    let padding = conn.padding();

    // First frame must carry exactly the desired backend id.
    let handshake = match conn.read_frame().await {
        Ok(frame) => frame,
        Err(_) => return,
    };
    if handshake.len() != padding + 4 {
        debug!(%peer, len = handshake.len(), "malformed gateway handshake");
        return;
    }
    let backend_id = FrameReader::new(handshake.freeze().slice(padding..)).read_u32();

    let link = match shared.links.read().await.get(&backend_id).cloned() {
        Some(link) => link,
        None => {
            debug!(%peer, backend_id, "no live link for requested backend");
            return;
        }
    };

    let (mut stream, sink) = conn.split();
    let gone = Arc::new(Notify::new());
    let Some(client_id) = link.attach_client(sink, gone.clone()) else {
        return;
    };
    debug!(%peer, backend_id, client_id, "client attached");

    if link.take_client_addr {
        if let Err(e) = link.send_client_addr(client_id, &peer.to_string()).await {
            debug!(%peer, error = %e, "client address announcement failed");
            link.detach_client(client_id);
            return;
        }
    }

    let width = shared.width;
    loop {
        let mut frame = tokio::select! {
            _ = gone.notified() => break,
            res = stream.read_frame() => match res {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };

        // In-place re-frame over the reserved head: a new prefix covering
        // payload + client id, then the id, then the untouched payload.
        let inner_len = (frame.len() - width.size()) as u64;
        width.put(&mut frame[..width.size()], inner_len);
        LittleEndian::write_u32(&mut frame[width.size()..width.size() + 4], client_id);

        if link.relay(&frame).await.is_err() {
            break;
        }
    }

    link.detach_client(client_id);
    let _ = link.send_disconnect_notice(client_id).await;
    debug!(client_id, "client detached");
}

/// Dial a gateway frontend and perform the client handshake selecting
/// `backend_id`.
pub async fn connect_gateway(
    addr: &str,
    width: FrameWidth,
    padding: usize,
    pool: Arc<dyn BufferPool>,
    backend_id: u32,
) -> Result<PacketConn> {
    let conn = conn::connect(addr, width, padding, pool).await?;
    let mut handshake = conn.new_frame(4)?;
    handshake.write_u32(backend_id);
    conn.send(handshake).await?;
    Ok(conn)
}
