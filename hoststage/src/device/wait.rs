use crate::device::runtime::{DeviceRuntime, HostFlag, StreamId};
use crate::error::{HostStageError, Result};

const RELEASED: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Idle,
    Blocking(StreamId),
    Released,
}

/// Parks a device stream until the host says go.
///
/// `wait` enqueues a device-side spin on a host-mapped flag; `signal` is a
/// plain release store, so neither blocks the host thread and other streams
/// keep running. One token drives exactly one wait/signal pair, and only
/// its owner can signal.
#[derive(Debug)]
pub struct StreamWait {
    flag: HostFlag,
    state: WaitState,
}

impl StreamWait {
    pub fn new() -> Self {
        Self {
            flag: HostFlag::new(),
            state: WaitState::Idle,
        }
    }

    /// Block every later instruction on `stream` until [`signal`](Self::signal).
    pub fn wait(&mut self, runtime: &dyn DeviceRuntime, stream: StreamId) -> Result<()> {
        if self.state != WaitState::Idle {
            return Err(HostStageError::ProtocolMisuse(
                "stream wait enqueued twice on one token",
            ));
        }
        runtime.wait_value(stream, &self.flag, RELEASED)?;
        self.state = WaitState::Blocking(stream);
        Ok(())
    }

    /// Release the blocked stream.
    ///
    /// Needs the token itself, so whichever thread signals must own it
    /// (usually the progress thread, through the state holding it). The
    /// token is `Send` and may be moved to that thread.
    pub fn signal(&mut self) -> Result<()> {
        match self.state {
            WaitState::Blocking(stream) => {
                self.flag.store(RELEASED);
                self.state = WaitState::Released;
                tracing::trace!(%stream, "stream wait released");
                Ok(())
            }
            WaitState::Idle => Err(HostStageError::ProtocolMisuse(
                "stream wait signalled before it was enqueued",
            )),
            WaitState::Released => Err(HostStageError::ProtocolMisuse(
                "stream wait signalled twice",
            )),
        }
    }

    /// The stream currently parked on this token, if any.
    pub fn blocked_stream(&self) -> Option<StreamId> {
        match self.state {
            WaitState::Blocking(stream) => Some(stream),
            _ => None,
        }
    }
}

impl Default for StreamWait {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamWait {
    fn drop(&mut self) {
        // Never auto-release: work queued behind the wait may reference
        // memory the owner is about to free.
        if let WaitState::Blocking(stream) = self.state {
            tracing::warn!(%stream, "stream wait dropped unsignalled; stream stays parked");
        }
    }
}
