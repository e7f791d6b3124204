use crate::collective::state::{HostCollective, StageContext, StagedCollective};
use crate::device::StreamId;
use crate::error::Result;
use crate::net::{Communicator, Request};
use crate::types::{DataType, Element, NativeOp, ReduceOp};
use std::sync::Arc;

/// In-place block reduce-scatter over the staging buffer.
///
/// Numeric behaviour (overflow, NaN, ordering) is whatever the network
/// backend's reduction does.
#[derive(Debug, Clone, Copy)]
pub struct ReduceScatter {
    op: NativeOp,
}

impl ReduceScatter {
    pub fn new(op: NativeOp) -> Self {
        Self { op }
    }

    pub fn native_op(&self) -> NativeOp {
        self.op
    }
}

impl HostCollective for ReduceScatter {
    const NAME: &'static str = "HTReduceScatter";

    fn staged_elems(&self, count: usize, world: usize) -> Option<usize> {
        count.checked_mul(world)
    }

    fn result_elems(&self, count: usize, _world: usize) -> Option<usize> {
        Some(count)
    }

    unsafe fn issue(
        &self,
        comm: &dyn Communicator,
        buf: *mut u8,
        count: usize,
        dtype: DataType,
    ) -> Result<Request> {
        unsafe { comm.ireduce_scatter_block(buf, count, dtype, self.op) }
    }
}

pub type ReduceScatterState = StagedCollective<ReduceScatter>;

/// Start a host-staged reduce-scatter on `stream`.
///
/// `send` holds `world * count` elements; `recv` receives the `count`
/// elements of block `rank`, reduced with `op` across all ranks.
///
/// # Safety
/// `send` must hold `world * count` elements and `recv` `count` elements of
/// device memory, untouched by other streams until the state completes, and
/// the returned state must be advanced to completion before it is dropped.
pub unsafe fn reduce_scatter<T: Element>(
    ctx: &StageContext,
    send: u64,
    recv: u64,
    count: usize,
    op: ReduceOp,
    comm: Arc<dyn Communicator>,
    stream: StreamId,
) -> Result<ReduceScatterState> {
    let kind = ReduceScatter::new(comm.native_op(op)?);
    unsafe { StagedCollective::launch(kind, ctx, send, recv, count, T::DTYPE, comm, stream) }
}
