//! Binary TCP multiplexing gateway.
//!
//! Many external client connections terminate at a [`GatewayFrontend`],
//! which relays their traffic, tagged with a per-client identifier, over a
//! small number of persistent links to one or more [`GatewayBackend`]s. The
//! backend demultiplexes by identifier and can unicast to one client,
//! delete a client, or broadcast to a client set without holding its own
//! socket to each of them.
//!
//! The building blocks are usable on their own: [`codec`] implements the
//! length-prefixed framing, [`pool`] the arena-style buffer allocator that
//! enables the frontend's zero-copy re-framing, and [`conn`] the
//! packet-oriented TCP wrappers.

pub mod backend;
pub mod codec;
pub mod conn;
pub mod error;
pub mod frontend;
pub mod pool;

mod link;

pub use backend::{BackendConfig, ClientMessage, GatewayBackend, OutboundFrame, MAX_LINKS};
pub use codec::{FrameReader, FrameWidth, FrameWriter};
pub use conn::{connect, FrameSink, FrameStream, PacketConn, PacketListener};
pub use error::{GatewayError, Result};
pub use frontend::{
    connect_gateway, BackendInfo, BackendUpdate, FrontendConfig, GatewayFrontend, UpdateOutcome,
};
pub use pool::{BufferPool, HeapPool, SlabPool};

/// Slot index encoded in the top 8 bits of a client id.
#[inline]
pub const fn slot_of(client_id: u32) -> u8 {
    (client_id >> 24) as u8
}
