//! Host-memory network collectives consumed by the staged states.

mod local;

pub use local::LocalComm;

use crate::error::{HostStageError, Result};
use crate::types::{DataType, NativeOp, Rank, ReduceOp, to_native_op};

/// Backend side of an in-flight non-blocking collective.
pub trait RequestHandle: Send {
    /// Non-blocking completion check. Called until it first returns `true`.
    fn test(&mut self) -> Result<bool>;
}

/// An opaque handle to a non-blocking collective.
///
/// Once `test` has reported completion the backend handle is released; a
/// further `test` is a protocol error rather than a second query.
pub struct Request {
    inner: Option<Box<dyn RequestHandle>>,
    operation: &'static str,
}

impl Request {
    pub fn new(operation: &'static str, handle: impl RequestHandle + 'static) -> Self {
        Self {
            inner: Some(Box::new(handle)),
            operation,
        }
    }

    /// Poll the collective. Errors from the backend are fatal for the request.
    pub fn test(&mut self) -> Result<bool> {
        let handle = self.inner.as_mut().ok_or(HostStageError::ProtocolMisuse(
            "request tested after completion",
        ))?;
        let done = handle.test()?;
        if done {
            self.inner = None;
            tracing::trace!(op = self.operation, "request complete");
        }
        Ok(done)
    }

    pub fn is_complete(&self) -> bool {
        self.inner.is_none()
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("operation", &self.operation)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// A group of ranks able to run non-blocking in-place collectives over host
/// memory. Construction and teardown belong to the backend.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> Rank;

    fn size(&self) -> u32;

    /// Translate a reduction operator into this backend's native token.
    fn native_op(&self, op: ReduceOp) -> Result<NativeOp> {
        Ok(to_native_op(op))
    }

    /// In-place all-to-all: block `i` of `buf` goes to rank `i`; on completion
    /// block `j` holds what rank `j` sent here.
    ///
    /// # Safety
    /// `buf` must hold `size() * count` elements of `dtype` and stay valid and
    /// untouched until the returned request completes.
    unsafe fn ialltoall(&self, buf: *mut u8, count: usize, dtype: DataType) -> Result<Request>;

    /// In-place block reduce-scatter: on completion the first `count`
    /// elements of `buf` hold the reduction of block `rank()` across ranks.
    ///
    /// # Safety
    /// Same contract as [`ialltoall`](Self::ialltoall).
    unsafe fn ireduce_scatter_block(
        &self,
        buf: *mut u8,
        count: usize,
        dtype: DataType,
        op: NativeOp,
    ) -> Result<Request>;
}
