//! Pooled query buffers for the hijack loop
//!
//! Every in-flight DNS exchange borrows one buffer: 1024 bytes of payload
//! behind 2 reserved bytes, so a resolver that frames for TCP transport
//! (RFC 1035 section 4.2.2 length prefix) can prepend in place without
//! copying. Buffers return to the pool when dropped.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Payload capacity of one query buffer.
pub const QUERY_PAYLOAD_SIZE: usize = 1024;

/// Reserved length-prefix headroom in front of the payload.
pub const QUERY_PREFIX: usize = 2;

/// Reuse counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    discards: AtomicU64,
}

impl PoolStats {
    /// Buffers allocated because the pool was empty
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Buffers handed out from the pool
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Buffers returned to the pool
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Buffers dropped because the pool was full
    #[must_use]
    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }
}

/// Fixed-capacity pool of query buffers.
pub struct MessagePool {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    stats: PoolStats,
}

impl MessagePool {
    /// Pool that retains up to `capacity` idle buffers.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            stats: PoolStats::default(),
        })
    }

    /// Borrow a buffer; allocates when the pool is empty.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> QueryBuffer {
        let data = self.free.lock().pop();
        let data = match data {
            Some(data) => {
                self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; QUERY_PREFIX + QUERY_PAYLOAD_SIZE]
            }
        };
        QueryBuffer {
            data,
            pool: Arc::downgrade(self),
        }
    }

    fn put_back(&self, data: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(data);
            self.stats.returns.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.discards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reuse counters.
    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

/// One borrowed buffer. Derefs to the payload region; the length-prefix
/// headroom is reachable through [`QueryBuffer::with_prefix`].
pub struct QueryBuffer {
    data: Vec<u8>,
    pool: Weak<MessagePool>,
}

impl QueryBuffer {
    /// The first `len` payload bytes preceded by the 2-byte headroom,
    /// mutable, for resolvers that frame in place.
    pub fn with_prefix(&mut self, len: usize) -> &mut [u8] {
        &mut self.data[..QUERY_PREFIX + len.min(QUERY_PAYLOAD_SIZE)]
    }
}

impl Deref for QueryBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[QUERY_PREFIX..]
    }
}

impl DerefMut for QueryBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[QUERY_PREFIX..]
    }
}

impl Drop for QueryBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.put_back(std::mem::take(&mut self.data));
        }
    }
}
