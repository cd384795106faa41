//! Packet-oriented TCP wrappers.
//!
//! [`PacketListener`] and [`PacketConn`] wrap plain TCP sockets with the
//! length-prefixed framing from [`crate::codec`]. Reads block until a full
//! frame arrives or the peer goes away; any short read ends the connection.
//!
//! A connection is configured with a fixed `padding`: every buffer returned
//! by [`FrameStream::read_frame`] carries that many spare bytes ahead of the
//! payload, never populated from the wire. A relayer can rewrite that head
//! region in place with a new prefix plus auxiliary fields and forward the
//! whole buffer without copying the payload.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::trace;

use crate::codec::{FrameWidth, FrameWriter};
use crate::error::{GatewayError, Result};
use crate::pool::BufferPool;

/// Packet-oriented TCP listener.
pub struct PacketListener {
    listener: TcpListener,
    width: FrameWidth,
    padding: usize,
    pool: Arc<dyn BufferPool>,
    local_addr: SocketAddr,
}

impl PacketListener {
    /// Bind and listen on `addr`; accepted connections frame their traffic
    /// with `width`-byte length prefixes and reserve `padding` head bytes
    /// on every inbound buffer.
    pub async fn bind(
        addr: &str,
        width: FrameWidth,
        padding: usize,
        pool: Arc<dyn BufferPool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::connection_with_source("bind failed", None, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::io("local_addr failed", e))?;
        Ok(Self {
            listener,
            width,
            padding,
            pool,
            local_addr,
        })
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<PacketConn> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| GatewayError::connection_with_source("accept failed", None, e))?;
        trace!(%peer, "accepted packet connection");
        Ok(PacketConn::new(
            stream,
            peer,
            self.width,
            self.padding,
            self.pool.clone(),
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Dial `addr` and wrap the stream in packet framing.
pub async fn connect(
    addr: &str,
    width: FrameWidth,
    padding: usize,
    pool: Arc<dyn BufferPool>,
) -> Result<PacketConn> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| GatewayError::connection_with_source(format!("connect to {addr} failed"), None, e))?;
    let peer = stream
        .peer_addr()
        .map_err(|e| GatewayError::io("peer_addr failed", e))?;
    Ok(PacketConn::new(stream, peer, width, padding, pool))
}

/// Packet-oriented TCP connection.
pub struct PacketConn {
    stream: FrameStream,
    sink: FrameSink,
}

impl PacketConn {
    fn new(
        stream: TcpStream,
        peer: SocketAddr,
        width: FrameWidth,
        padding: usize,
        pool: Arc<dyn BufferPool>,
    ) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            stream: FrameStream {
                rd,
                width,
                padding,
                pool,
                peer,
            },
            sink: FrameSink::new(wr),
        }
    }

    /// Read one frame; see [`FrameStream::read_frame`].
    pub async fn read_frame(&mut self) -> Result<BytesMut> {
        self.stream.read_frame().await
    }

    /// Build an outgoing frame for this connection's width, allocated from
    /// its pool.
    pub fn new_frame(&self, payload_len: usize) -> Result<FrameWriter> {
        FrameWriter::with_pool(&*self.stream.pool, self.stream.width, payload_len)
    }

    /// Transmit a finished frame (prefix + payload) in one write.
    pub async fn send(&self, frame: FrameWriter) -> Result<()> {
        self.sink.send_raw(frame.as_bytes()).await
    }

    /// Transmit pre-framed bytes verbatim.
    pub async fn send_raw(&self, buf: &[u8]) -> Result<()> {
        self.sink.send_raw(buf).await
    }

    /// Split into the read-loop half and the shareable write half.
    pub fn split(self) -> (FrameStream, FrameSink) {
        (self.stream, self.sink)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.stream.peer
    }

    pub fn width(&self) -> FrameWidth {
        self.stream.width
    }

    pub fn padding(&self) -> usize {
        self.stream.padding
    }

    /// Close the write direction; the peer observes EOF.
    pub async fn shutdown(&self) {
        self.sink.shutdown().await;
    }
}

/// Read half of a packet connection; owned by exactly one read loop.
pub struct FrameStream {
    rd: OwnedReadHalf,
    width: FrameWidth,
    padding: usize,
    pool: Arc<dyn BufferPool>,
    peer: SocketAddr,
}

impl FrameStream {
    /// Read one complete frame.
    ///
    /// The returned buffer is `padding + payload_len` bytes: the head region
    /// is zeroed spare capacity, the tail is the payload. A short read, a
    /// closed peer, or a length the pool refuses all end the connection.
    pub async fn read_frame(&mut self) -> Result<BytesMut> {
        let mut head = [0u8; 8];
        let head = &mut head[..self.width.size()];
        self.rd
            .read_exact(head)
            .await
            .map_err(|e| GatewayError::io("length prefix read failed", e))?;

        let len = self.width.get(head) as usize;
        let size = self.padding + len;
        let mut buf = self.pool.alloc(size).ok_or(GatewayError::PoolExhausted {
            requested: size,
            max: self.pool.max_alloc(),
        })?;

        if len > 0 {
            self.rd
                .read_exact(&mut buf[self.padding..])
                .await
                .map_err(|e| GatewayError::io("payload read failed", e))?;
        }
        Ok(buf)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn width(&self) -> FrameWidth {
        self.width
    }

    pub fn padding(&self) -> usize {
        self.padding
    }
}

/// Write half of a packet connection.
///
/// Clonable and shareable across tasks; each send holds the write lock for
/// exactly one full-frame `write_all`, preserving frame atomicity.
#[derive(Clone)]
pub struct FrameSink {
    wr: Arc<Mutex<OwnedWriteHalf>>,
}

impl FrameSink {
    pub(crate) fn new(wr: OwnedWriteHalf) -> Self {
        Self {
            wr: Arc::new(Mutex::new(wr)),
        }
    }

    /// Write a complete frame buffer to the stream.
    pub async fn send_raw(&self, buf: &[u8]) -> Result<()> {
        let mut wr = self.wr.lock().await;
        wr.write_all(buf)
            .await
            .map_err(|e| GatewayError::io("frame write failed", e))
    }

    /// Shut down the write direction. Safe to call more than once.
    pub async fn shutdown(&self) {
        let mut wr = self.wr.lock().await;
        let _ = wr.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SlabPool;

    fn test_pool() -> Arc<dyn BufferPool> {
        Arc::new(SlabPool::new(1024, 1024).unwrap())
    }

    #[tokio::test]
    async fn frame_echo_round_trip() {
        let pool = test_pool();
        let listener = PacketListener::bind("127.0.0.1:0", FrameWidth::U32, 0, pool.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let frame = conn.read_frame().await.unwrap();
            let mut out = conn.new_frame(frame.len()).unwrap();
            out.write_bytes(&frame);
            conn.send(out).await.unwrap();
        });

        let mut client = connect(&addr, FrameWidth::U32, 0, pool).await.unwrap();
        let mut out = client.new_frame(2).unwrap();
        out.write_u16(0xFFFF);
        client.send(out).await.unwrap();

        let reply = client.read_frame().await.unwrap();
        assert_eq!(&reply[..], &0xFFFFu16.to_le_bytes());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn padding_reserves_head_bytes() {
        let pool = test_pool();
        let listener = PacketListener::bind("127.0.0.1:0", FrameWidth::U32, 6, pool.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        let client_task = tokio::spawn({
            let pool = pool.clone();
            async move {
                let client = connect(&addr, FrameWidth::U32, 0, pool).await.unwrap();
                let mut out = client.new_frame(2).unwrap();
                out.write_u16(0xABCD);
                client.send(out).await.unwrap();
                client
            }
        });

        let mut conn = listener.accept().await.unwrap();
        let frame = conn.read_frame().await.unwrap();
        assert_eq!(frame.len(), 6 + 2);
        assert_eq!(&frame[..6], &[0; 6]);
        assert_eq!(&frame[6..], &0xABCDu16.to_le_bytes());
        drop(client_task.await.unwrap());
    }

    #[tokio::test]
    async fn oversized_frame_ends_connection() {
        let pool: Arc<dyn BufferPool> = Arc::new(SlabPool::new(64, 32).unwrap());
        let listener = PacketListener::bind("127.0.0.1:0", FrameWidth::U32, 0, pool.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        let big_pool: Arc<dyn BufferPool> = Arc::new(SlabPool::new(1024, 1024).unwrap());
        let client_task = tokio::spawn(async move {
            let client = connect(&addr, FrameWidth::U32, 0, big_pool).await.unwrap();
            let mut out = client.new_frame(100).unwrap();
            out.write_bytes(&[0u8; 100]);
            client.send(out).await.unwrap();
            client
        });

        let mut conn = listener.accept().await.unwrap();
        let err = conn.read_frame().await.unwrap_err();
        assert!(matches!(err, GatewayError::PoolExhausted { .. }));
        drop(client_task.await.unwrap());
    }
}
