//! Pinned host staging memory.
//!
//! Pinning is expensive, so released buffers are parked in size tiers and
//! handed out again. A byte budget bounds how much pinned memory can be
//! checked out at once; staging never runs on a partial buffer.

use crate::config::HostStageConfig;
use crate::error::{HostStageError, Result};
use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Small tier: control-sized payloads.
const SMALL_BUF_CAPACITY: usize = 64 * 1024;

/// Large tier capacity: 8 MiB.
const LARGE_BUF_CAPACITY: usize = 8 * 1024 * 1024;

/// Huge tier capacity: 64 MiB.
const HUGE_BUF_CAPACITY: usize = 64 * 1024 * 1024;

/// Counters for instrumenting acquire/release pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    /// Buffers given up while device work could still target them. Their
    /// bytes stay charged against the budget.
    pub abandoned: u64,
    pub outstanding_bytes: usize,
}

/// A tiered lock-free pool of pinned staging buffers with a byte budget.
pub struct PinnedPool {
    small: ArrayQueue<Vec<u8>>,
    large: ArrayQueue<Vec<u8>>,
    huge: ArrayQueue<Vec<u8>>,
    capacity_bytes: usize,
    outstanding: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
    abandoned: AtomicU64,
}

impl PinnedPool {
    /// Create a pool sized from the default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(&HostStageConfig::default())
    }

    pub fn with_config(config: &HostStageConfig) -> Arc<Self> {
        Self::with_limits(config.pinned_capacity_bytes, config.pinned_tier_slots)
    }

    /// Create a pool that allows at most `capacity_bytes` checked out and
    /// keeps up to `tier_slots` released buffers per tier.
    pub fn with_limits(capacity_bytes: usize, tier_slots: usize) -> Arc<Self> {
        let slots = tier_slots.max(1);
        Arc::new(Self {
            small: ArrayQueue::new(slots),
            large: ArrayQueue::new(slots),
            huge: ArrayQueue::new(slots),
            capacity_bytes,
            outstanding: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        })
    }

    /// Check out a zeroed buffer of `len` bytes.
    ///
    /// Zero-length requests return an empty buffer without touching the pool.
    pub fn acquire(self: &Arc<Self>, len: usize) -> Result<PinnedBuf> {
        if len == 0 {
            return Ok(PinnedBuf::empty());
        }
        self.reserve(len)?;

        let (queue, tier, capacity) = self.tier_for_size(len);
        let mut buf = match queue {
            Some(q) => q.pop().unwrap_or_else(|| Vec::with_capacity(capacity)),
            None => Vec::with_capacity(len),
        };
        buf.resize(len, 0);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(PinnedBuf {
            buf,
            owner: Some((Arc::clone(self), tier)),
        })
    }

    /// Charge `len` bytes against the budget, or fail without side effects.
    fn reserve(&self, len: usize) -> Result<()> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(len).filter(|&next| next <= self.capacity_bytes)
            })
            .map(|_| ())
            .map_err(|outstanding| {
                tracing::warn!(
                    requested = len,
                    outstanding,
                    capacity = self.capacity_bytes,
                    "pinned pool exhausted"
                );
                HostStageError::PinnedExhausted {
                    requested: len,
                    outstanding,
                    capacity: self.capacity_bytes,
                }
            })
    }

    fn tier_for_size(&self, len: usize) -> (Option<&ArrayQueue<Vec<u8>>>, PoolTier, usize) {
        if len <= SMALL_BUF_CAPACITY {
            (Some(&self.small), PoolTier::Small, SMALL_BUF_CAPACITY)
        } else if len <= LARGE_BUF_CAPACITY {
            (Some(&self.large), PoolTier::Large, LARGE_BUF_CAPACITY)
        } else if len <= HUGE_BUF_CAPACITY {
            (Some(&self.huge), PoolTier::Huge, HUGE_BUF_CAPACITY)
        } else {
            (None, PoolTier::Unpooled, len)
        }
    }

    fn release(&self, mut buf: Vec<u8>, tier: PoolTier) {
        self.outstanding.fetch_sub(buf.len(), Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::Relaxed);

        let (queue, max_cap) = match tier {
            PoolTier::Small => (Some(&self.small), SMALL_BUF_CAPACITY * 4),
            PoolTier::Large => (Some(&self.large), LARGE_BUF_CAPACITY * 4),
            PoolTier::Huge => (Some(&self.huge), HUGE_BUF_CAPACITY * 4),
            PoolTier::Unpooled => (None, 0),
        };
        if let Some(q) = queue
            && buf.capacity() <= max_cap
        {
            buf.clear();
            let _ = q.push(buf);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            outstanding_bytes: self.outstanding.load(Ordering::Acquire),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}

#[derive(Debug, Clone, Copy)]
enum PoolTier {
    Small,
    Large,
    Huge,
    Unpooled,
}

/// A staging buffer checked out from a [`PinnedPool`]. Derefs to `[u8]`.
///
/// The backing storage never reallocates while checked out, so its address
/// can be handed to asynchronous device copies. Dropping returns it to the
/// pool exactly once.
pub struct PinnedBuf {
    buf: Vec<u8>,
    owner: Option<(Arc<PinnedPool>, PoolTier)>,
}

impl std::fmt::Debug for PinnedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBuf")
            .field("len", &self.buf.len())
            .field("tier", &self.owner.as_ref().map(|(_, t)| *t))
            .finish()
    }
}

impl PinnedBuf {
    fn empty() -> Self {
        Self {
            buf: Vec::new(),
            owner: None,
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    /// Leak the storage instead of returning it to the pool.
    ///
    /// For buffers that a queued device copy may still write into: the
    /// memory stays valid forever and is never handed to another owner.
    pub(crate) fn abandon(mut self) {
        let buf = std::mem::take(&mut self.buf);
        if let Some((pool, _)) = self.owner.take() {
            pool.abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                bytes = buf.len(),
                "staging buffer abandoned with device work in flight"
            );
        }
        std::mem::forget(buf);
    }
}

impl Deref for PinnedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PinnedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PinnedBuf {
    fn drop(&mut self) {
        if let Some((pool, tier)) = self.owner.take() {
            pool.release(std::mem::take(&mut self.buf), tier);
        }
    }
}

static GLOBAL: RwLock<Option<Arc<PinnedPool>>> = RwLock::new(None);

/// Install the process-wide pool. Must run before the first [`global`] call.
pub fn init_global(config: &HostStageConfig) -> Result<Arc<PinnedPool>> {
    let mut slot = GLOBAL
        .write()
        .map_err(|_| HostStageError::LockPoisoned("global pinned pool"))?;
    if slot.is_some() {
        return Err(HostStageError::ProtocolMisuse(
            "global pinned pool initialized twice",
        ));
    }
    let pool = PinnedPool::with_config(config);
    *slot = Some(Arc::clone(&pool));
    tracing::info!(
        capacity_bytes = config.pinned_capacity_bytes,
        "global pinned pool installed"
    );
    Ok(pool)
}

/// The process-wide pool installed by [`init_global`].
pub fn global() -> Result<Arc<PinnedPool>> {
    GLOBAL
        .read()
        .map_err(|_| HostStageError::LockPoisoned("global pinned pool"))?
        .clone()
        .ok_or(HostStageError::NotInitialized("global pinned pool"))
}

/// Tear down the process-wide pool. Buffers still checked out stay valid and
/// are freed when their owners drop them.
pub fn finalize_global() -> Result<()> {
    let pool = GLOBAL
        .write()
        .map_err(|_| HostStageError::LockPoisoned("global pinned pool"))?
        .take()
        .ok_or(HostStageError::NotInitialized("global pinned pool"))?;
    let stats = pool.stats();
    if stats.outstanding_bytes > 0 {
        tracing::warn!(
            outstanding_bytes = stats.outstanding_bytes,
            "global pinned pool finalized with buffers checked out"
        );
    }
    tracing::info!(
        acquired = stats.acquired,
        released = stats.released,
        "global pinned pool finalized"
    );
    Ok(())
}
