//! Host-staged collectives for device-resident data.
//!
//! Device buffers are copied into pinned host memory, exchanged by a
//! host-only network collective, and copied back, all ordered on the
//! caller's device stream. The stream is parked behind a host-released wait
//! while the network runs, so kernels queued after the collective see its
//! result, while the host thread, other streams and other collectives keep
//! moving.
//!
//! ```no_run
//! use hoststage::{LocalComm, PinnedPool, ProgressEngine, SimDevice, StageContext, alltoall};
//! use std::sync::Arc;
//!
//! # fn main() -> hoststage::Result<()> {
//! let device = SimDevice::new();
//! let stream = device.create_stream()?;
//! let ctx = StageContext::new(device.clone(), PinnedPool::new());
//! let comm: Arc<dyn hoststage::Communicator> =
//!     Arc::new(LocalComm::group(1).pop().expect("one rank"));
//!
//! let send = device.alloc_elems::<f32>(4)?;
//! let recv = device.alloc_elems::<f32>(4)?;
//! device.upload(stream, send, &[1.0f32, 2.0, 3.0, 4.0])?;
//!
//! let state = unsafe { alltoall::<f32>(&ctx, send, recv, 4, comm, stream)? };
//! let mut engine = ProgressEngine::new();
//! engine.enqueue(state);
//! engine.run_to_completion()?;
//! assert_eq!(device.download::<f32>(stream, recv, 4)?, vec![1.0, 2.0, 3.0, 4.0]);
//! # Ok(())
//! # }
//! ```

pub mod collective;
pub mod config;
pub mod device;
pub mod error;
pub mod net;
pub mod pinned;
pub mod progress;
mod reduce;
pub mod types;

pub use collective::{
    AllToAll, AllToAllState, CollectiveState, HostCollective, Phase, ReduceScatter,
    ReduceScatterState, StageContext, StagedCollective, alltoall, reduce_scatter,
};
pub use config::HostStageConfig;
pub use device::{CompletionEvent, DeviceRuntime, HostFlag, SimDevice, StreamId, StreamWait};
pub use error::{HostStageError, Result};
pub use net::{Communicator, LocalComm, Request, RequestHandle};
pub use pinned::{PinnedBuf, PinnedPool, PoolStats};
pub use progress::ProgressEngine;
pub use types::{DataType, Element, NativeOp, Rank, ReduceOp};
