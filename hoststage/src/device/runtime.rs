use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Opaque handle of a device stream (an in-order device instruction queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// A 32-bit word in host-mapped memory, visible to both host and device.
///
/// Streams write it (event record) or spin on it (stream wait); the host
/// reads or stores it with acquire/release ordering.
#[derive(Debug, Clone, Default)]
pub struct HostFlag(Arc<AtomicU32>);

impl HostFlag {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, value: u32) {
        self.0.store(value, Ordering::Release);
    }
}

/// The device primitives host staging is built on.
///
/// Every call only *enqueues* work on `stream` and returns; completion is
/// observable solely through flags written by [`write_value`](Self::write_value).
/// Errors indicate driver or hardware failure and are not retried.
pub trait DeviceRuntime: Send + Sync {
    /// Enqueue a device-to-host copy of `size_bytes` bytes.
    ///
    /// # Safety
    /// `src` must be a device allocation of at least `size_bytes` bytes and
    /// `dst` must stay valid and unaliased until the copy has executed.
    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: u64,
        size_bytes: usize,
        stream: StreamId,
    ) -> Result<()>;

    /// Enqueue a host-to-device copy of `size_bytes` bytes.
    ///
    /// # Safety
    /// `dst` must be a device allocation of at least `size_bytes` bytes and
    /// `src` must stay valid until the copy has executed.
    unsafe fn memcpy_htod_async(
        &self,
        dst: u64,
        src: *const u8,
        size_bytes: usize,
        stream: StreamId,
    ) -> Result<()>;

    /// Check that `[ptr, ptr + size_bytes)` lies inside one live device
    /// allocation. Runtimes without allocation tracking accept every range.
    fn check_device_range(&self, ptr: u64, size_bytes: usize) -> Result<()> {
        let _ = (ptr, size_bytes);
        Ok(())
    }

    /// Enqueue a store of `value` into `flag`, executed once every earlier
    /// instruction on `stream` has completed.
    fn write_value(&self, stream: StreamId, flag: &HostFlag, value: u32) -> Result<()>;

    /// Enqueue a wait: later instructions on `stream` do not start until
    /// `flag >= value`. Must not block the calling thread or other streams.
    fn wait_value(&self, stream: StreamId, flag: &HostFlag, value: u32) -> Result<()>;
}
