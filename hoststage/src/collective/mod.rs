mod alltoall;
mod reduce_scatter;
mod state;

pub use alltoall::{AllToAll, AllToAllState, alltoall};
pub use reduce_scatter::{ReduceScatter, ReduceScatterState, reduce_scatter};
pub use state::{CollectiveState, HostCollective, Phase, StageContext, StagedCollective};
