//! Pooled buffer allocator.
//!
//! A forward-only arena: allocations are split off a pre-sized slab and
//! never returned. When the current slab runs short the pool drops its
//! reference to it and starts a fresh one; buffers already handed out stay
//! valid and owned by their holders. Memory pressure is bounded only by how
//! long callers retain issued buffers.
//!
//! Pooling is a throughput optimization, not a correctness requirement:
//! [`HeapPool`] is a drop-in per-call allocator for contexts where the
//! arena does not pay off.

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::{GatewayError, Result};

/// Capability the gateway holds for sizing and allocating frame buffers.
pub trait BufferPool: Send + Sync {
    /// Allocate a zero-initialized buffer of exactly `size` bytes, or
    /// refuse if `size` exceeds the configured maximum.
    fn alloc(&self, size: usize) -> Option<BytesMut>;

    /// Largest allocation this pool will serve.
    fn max_alloc(&self) -> usize;
}

/// Arena allocator over a pre-sized slab.
pub struct SlabPool {
    slab_size: usize,
    max_alloc: usize,
    slab: Mutex<BytesMut>,
}

impl SlabPool {
    /// Create a pool with `slab_size` bytes per slab, refusing any single
    /// allocation larger than `max_alloc`.
    ///
    /// `max_alloc` must not exceed `slab_size`, otherwise an in-bounds
    /// request could never be served.
    pub fn new(slab_size: usize, max_alloc: usize) -> Result<Self> {
        if max_alloc > slab_size {
            return Err(GatewayError::config(format!(
                "max_alloc ({max_alloc}) exceeds slab_size ({slab_size})"
            )));
        }
        Ok(Self {
            slab_size,
            max_alloc,
            slab: Mutex::new(BytesMut::zeroed(slab_size)),
        })
    }
}

impl BufferPool for SlabPool {
    fn alloc(&self, size: usize) -> Option<BytesMut> {
        if size > self.max_alloc {
            return None;
        }

        let mut slab = self.slab.lock();
        if slab.len() < size {
            // Abandon the remainder; issued buffers keep their backing
            // storage alive on their own.
            *slab = BytesMut::zeroed(self.slab_size);
        }
        Some(slab.split_to(size))
    }

    fn max_alloc(&self) -> usize {
        self.max_alloc
    }
}

/// Trivial per-call allocator with the same refusal contract.
pub struct HeapPool {
    max_alloc: usize,
}

impl HeapPool {
    pub fn new(max_alloc: usize) -> Self {
        Self { max_alloc }
    }
}

impl BufferPool for HeapPool {
    fn alloc(&self, size: usize) -> Option<BytesMut> {
        if size > self.max_alloc {
            return None;
        }
        Some(BytesMut::zeroed(size))
    }

    fn max_alloc(&self) -> usize {
        self.max_alloc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_max_alloc_larger_than_slab() {
        assert!(SlabPool::new(64, 128).is_err());
        assert!(SlabPool::new(128, 128).is_ok());
    }

    #[test]
    fn refuses_oversized_requests_regardless_of_slab_state() {
        let pool = SlabPool::new(1024, 256).unwrap();
        assert!(pool.alloc(257).is_none());
        // Drain most of the slab, then check again.
        let _held = pool.alloc(256).unwrap();
        assert!(pool.alloc(257).is_none());
        assert!(pool.alloc(256).is_some());
    }

    #[test]
    fn live_allocations_do_not_overlap() {
        let pool = SlabPool::new(1024, 256).unwrap();
        let a = pool.alloc(100).unwrap();
        let b = pool.alloc(100).unwrap();

        let a_range = a.as_ptr() as usize..a.as_ptr() as usize + a.len();
        let b_start = b.as_ptr() as usize;
        assert!(!a_range.contains(&b_start));
        assert_eq!(a.len(), 100);
        assert_eq!(b.len(), 100);
    }

    #[test]
    fn issued_buffers_survive_slab_replacement() {
        let pool = SlabPool::new(128, 128).unwrap();
        let mut first = pool.alloc(100).unwrap();
        first.fill(0xAB);

        // Forces a fresh slab: only 28 bytes remain on the current one.
        let second = pool.alloc(64).unwrap();
        assert!(second.iter().all(|&b| b == 0));
        assert!(first.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn allocations_are_zeroed() {
        let pool = SlabPool::new(64, 64).unwrap();
        let buf = pool.alloc(64).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        // Next slab as well.
        let buf = pool.alloc(64).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn heap_pool_same_refusal_contract() {
        let pool = HeapPool::new(16);
        assert!(pool.alloc(17).is_none());
        assert_eq!(pool.alloc(16).unwrap().len(), 16);
        assert_eq!(pool.max_alloc(), 16);
    }
}
