use crate::collective::state::{HostCollective, StageContext, StagedCollective};
use crate::device::StreamId;
use crate::error::Result;
use crate::net::{Communicator, Request};
use crate::types::{DataType, Element};
use std::sync::Arc;

/// In-place all-to-all over the staging buffer: `count` elements per rank
/// in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllToAll;

impl HostCollective for AllToAll {
    const NAME: &'static str = "HTAlltoall";

    fn staged_elems(&self, count: usize, world: usize) -> Option<usize> {
        count.checked_mul(world)
    }

    fn result_elems(&self, count: usize, world: usize) -> Option<usize> {
        count.checked_mul(world)
    }

    unsafe fn issue(
        &self,
        comm: &dyn Communicator,
        buf: *mut u8,
        count: usize,
        dtype: DataType,
    ) -> Result<Request> {
        unsafe { comm.ialltoall(buf, count, dtype) }
    }
}

pub type AllToAllState = StagedCollective<AllToAll>;

/// Start a host-staged all-to-all on `stream`.
///
/// `send` holds `world * count` elements, block `i` destined for rank `i`;
/// `recv` receives `world * count` elements, block `j` from rank `j`. Work
/// the caller enqueues on `stream` afterwards observes the exchanged data.
///
/// # Safety
/// Both pointers must be device allocations of at least `world * count`
/// elements, untouched by other streams until the state completes, and the
/// returned state must be advanced to completion before it is dropped.
pub unsafe fn alltoall<T: Element>(
    ctx: &StageContext,
    send: u64,
    recv: u64,
    count: usize,
    comm: Arc<dyn Communicator>,
    stream: StreamId,
) -> Result<AllToAllState> {
    unsafe { StagedCollective::launch(AllToAll, ctx, send, recv, count, T::DTYPE, comm, stream) }
}
