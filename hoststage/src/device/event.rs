use crate::device::runtime::{DeviceRuntime, HostFlag, StreamId};
use crate::error::{HostStageError, Result};

/// A stream-position marker that can be polled without synchronizing.
///
/// `record` enqueues a flag write at the tail of the stream; `query` is a
/// single acquire load, so a progress loop can check many events per sweep.
/// Re-recording moves the marker to a new position; each position, once
/// reached, stays reached.
#[derive(Debug, Default)]
pub struct CompletionEvent {
    flag: HostFlag,
    epoch: u32,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the current tail of `stream`.
    pub fn record(&mut self, runtime: &dyn DeviceRuntime, stream: StreamId) -> Result<()> {
        let epoch = self
            .epoch
            .checked_add(1)
            .ok_or(HostStageError::ProtocolMisuse("completion event re-recorded too often"))?;
        runtime.write_value(stream, &self.flag, epoch)?;
        self.epoch = epoch;
        Ok(())
    }

    /// True once every instruction enqueued before the last `record` has
    /// completed. An event that was never recorded has nothing to wait for.
    #[inline]
    pub fn query(&self) -> bool {
        self.epoch == 0 || self.flag.load() >= self.epoch
    }
}
