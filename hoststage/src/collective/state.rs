use crate::device::{CompletionEvent, DeviceRuntime, StreamId, StreamWait};
use crate::error::{HostStageError, Result};
use crate::net::{Communicator, Request};
use crate::pinned::{self, PinnedBuf, PinnedPool};
use crate::types::DataType;
use std::sync::Arc;

/// The unit of work a progress engine drives.
///
/// `advance` is non-blocking and returns `true` exactly once, on the call
/// during which the operation's device-side effects became visible. After
/// that the state may be dropped; further calls are no-ops that keep
/// returning `true`.
pub trait CollectiveState: Send {
    fn advance(&mut self) -> Result<bool>;

    /// Whether the engine must run a cross-operation completion barrier
    /// after this state finishes.
    fn needs_final_barrier(&self) -> bool;

    /// The device stream this operation is ordered on.
    fn bound_stream(&self) -> StreamId;

    fn name(&self) -> &'static str;
}

/// Where a staged collective is in its pipeline. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Waiting for the device→host copy to land in the staging buffer.
    StageReady,
    /// Network collective in flight on the staging buffer.
    NetworkPending,
    /// Stream released; waiting for the host→device copy.
    DrainPending,
    Done,
}

/// The per-collective hook of a [`StagedCollective`].
pub trait HostCollective: Send {
    const NAME: &'static str;

    /// Elements copied device→host before the network call, or `None` on
    /// overflow.
    fn staged_elems(&self, count: usize, world: usize) -> Option<usize>;

    /// Elements copied host→device once the network call completed, or
    /// `None` on overflow.
    fn result_elems(&self, count: usize, world: usize) -> Option<usize>;

    /// Start the non-blocking network collective over the staging buffer.
    ///
    /// # Safety
    /// `buf` holds `staged_elems` elements of `dtype` and outlives the request.
    unsafe fn issue(
        &self,
        comm: &dyn Communicator,
        buf: *mut u8,
        count: usize,
        dtype: DataType,
    ) -> Result<Request>;
}

/// Device runtime plus staging allocator shared by every staged collective.
#[derive(Clone)]
pub struct StageContext {
    runtime: Arc<dyn DeviceRuntime>,
    pool: Arc<PinnedPool>,
}

impl StageContext {
    pub fn new(runtime: Arc<dyn DeviceRuntime>, pool: Arc<PinnedPool>) -> Self {
        Self { runtime, pool }
    }

    /// Use the process-wide pool installed by [`pinned::init_global`].
    pub fn with_global_pool(runtime: Arc<dyn DeviceRuntime>) -> Result<Self> {
        Ok(Self::new(runtime, pinned::global()?))
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    pub fn pool(&self) -> &Arc<PinnedPool> {
        &self.pool
    }
}

/// A collective run on the host but ordered on a device stream.
///
/// Construction enqueues on the stream: copy-out, event, stream wait,
/// copy-back, event. `advance` then walks the phases: once the copy-out
/// event fires, the network call is issued; once it completes the stream
/// is released; once the copy-back event fires the operation is done.
pub struct StagedCollective<C: HostCollective> {
    kind: C,
    comm: Arc<dyn Communicator>,
    stream: StreamId,
    count: usize,
    dtype: DataType,
    staging: PinnedBuf,
    d2h: CompletionEvent,
    h2d: CompletionEvent,
    stream_wait: StreamWait,
    request: Option<Request>,
    phase: Phase,
    trail: Vec<Phase>,
}

impl<C: HostCollective> StagedCollective<C> {
    /// Stage `send` out of device memory and queue the copy-back into `recv`.
    ///
    /// # Safety
    /// `send` and `recv` must be device allocations sized for this
    /// collective, left untouched by other streams until the state
    /// completes. The state must be advanced to completion before it is
    /// dropped: the staging buffer is the target of in-flight device copies.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn launch(
        kind: C,
        ctx: &StageContext,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        comm: Arc<dyn Communicator>,
        stream: StreamId,
    ) -> Result<Self> {
        let world = comm.size();
        let elem = dtype.size_in_bytes();
        let too_large = || HostStageError::PayloadTooLarge { count, world };
        let staged_bytes = kind
            .staged_elems(count, world as usize)
            .and_then(|n| n.checked_mul(elem))
            .ok_or_else(too_large)?;
        let result_bytes = kind
            .result_elems(count, world as usize)
            .and_then(|n| n.checked_mul(elem))
            .ok_or_else(too_large)?;
        if result_bytes > staged_bytes {
            return Err(HostStageError::BufferSizeMismatch {
                expected: result_bytes,
                actual: staged_bytes,
            });
        }

        // Everything that can be rejected up front is, so that once the first
        // copy is queued only a runtime failure can abort the launch.
        let runtime = ctx.runtime.as_ref();
        if staged_bytes > 0 {
            runtime.check_device_range(send, staged_bytes)?;
        }
        if result_bytes > 0 {
            runtime.check_device_range(recv, result_bytes)?;
        }

        let mut staging = ctx.pool.acquire(staged_bytes)?;
        let mut d2h = CompletionEvent::new();
        let mut h2d = CompletionEvent::new();
        let mut stream_wait = StreamWait::new();

        if staged_bytes > 0 {
            unsafe { runtime.memcpy_dtoh_async(staging.as_mut_ptr(), send, staged_bytes, stream)? };
        }
        let queued = (|| {
            d2h.record(runtime, stream)?;
            stream_wait.wait(runtime, stream)?;
            if result_bytes > 0 {
                unsafe { runtime.memcpy_htod_async(recv, staging.as_ptr(), result_bytes, stream)? };
            }
            h2d.record(runtime, stream)
        })();
        if let Err(e) = queued {
            // The copy-out may still land in `staging`; it must never go back
            // to the pool.
            if staged_bytes > 0 {
                staging.abandon();
            }
            return Err(e);
        }

        tracing::debug!(
            op = C::NAME,
            %stream,
            count,
            dtype = %dtype,
            rank = comm.rank(),
            "staged collective launched"
        );

        let mut trail = Vec::with_capacity(4);
        trail.push(Phase::StageReady);
        Ok(Self {
            kind,
            comm,
            stream,
            count,
            dtype,
            staging,
            d2h,
            h2d,
            stream_wait,
            request: None,
            phase: Phase::StageReady,
            trail,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn phase_trail(&self) -> &[Phase] {
        &self.trail
    }

    pub fn kind(&self) -> &C {
        &self.kind
    }

    fn enter(&mut self, next: Phase) {
        debug_assert!(next > self.phase, "phase regression {:?} -> {next:?}", self.phase);
        tracing::debug!(
            op = C::NAME,
            stream = %self.stream,
            from = ?self.phase,
            to = ?next,
            "phase transition"
        );
        self.phase = next;
        self.trail.push(next);
    }
}

impl<C: HostCollective> std::fmt::Debug for StagedCollective<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedCollective")
            .field("op", &C::NAME)
            .field("stream", &self.stream)
            .field("count", &self.count)
            .field("dtype", &self.dtype)
            .field("phase", &self.phase)
            .finish()
    }
}

impl<C: HostCollective> CollectiveState for StagedCollective<C> {
    fn advance(&mut self) -> Result<bool> {
        if self.phase == Phase::StageReady {
            if !self.d2h.query() {
                return Ok(false);
            }
            // An empty payload has nothing to exchange; no network call is made.
            if !self.staging.is_empty() {
                let buf = self.staging.as_mut_ptr();
                let request =
                    unsafe { self.kind.issue(&*self.comm, buf, self.count, self.dtype)? };
                self.request = Some(request);
            }
            self.enter(Phase::NetworkPending);
        }

        if self.phase == Phase::NetworkPending {
            if let Some(request) = self.request.as_mut() {
                if !request.test()? {
                    return Ok(false);
                }
                self.request = None;
            }
            self.stream_wait.signal()?;
            self.enter(Phase::DrainPending);
        }

        if self.phase == Phase::DrainPending {
            if !self.h2d.query() {
                return Ok(false);
            }
            self.enter(Phase::Done);
            return Ok(true);
        }

        Ok(self.phase == Phase::Done)
    }

    fn needs_final_barrier(&self) -> bool {
        false
    }

    fn bound_stream(&self) -> StreamId {
        self.stream
    }

    fn name(&self) -> &'static str {
        C::NAME
    }
}

impl<C: HostCollective> Drop for StagedCollective<C> {
    fn drop(&mut self) {
        if self.phase != Phase::Done {
            tracing::warn!(
                op = C::NAME,
                stream = %self.stream,
                phase = ?self.phase,
                "staged collective dropped before completion"
            );
        }
    }
}
