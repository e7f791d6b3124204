use crate::error::{HostStageError, Result};
use crate::net::{Communicator, Request, RequestHandle};
use crate::reduce::reduce_slice;
use crate::types::{DataType, NativeOp, Rank, ReduceOp, from_native_op};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundKind {
    AllToAll,
    ReduceScatter(ReduceOp),
}

impl RoundKind {
    fn operation(self) -> &'static str {
        match self {
            RoundKind::AllToAll => "ialltoall",
            RoundKind::ReduceScatter(_) => "ireduce_scatter_block",
        }
    }
}

/// One collective call, matched across ranks by issue order.
///
/// Every rank settles its slot exactly once: by collecting its result, by
/// dropping its request early, or by arriving at a round a peer already
/// abandoned. The round leaves the table when the last slot settles.
struct Round {
    kind: RoundKind,
    count: usize,
    dtype: DataType,
    world: u32,
    inputs: Vec<Option<Vec<u8>>>,
    arrived: u32,
    outputs: Option<Vec<Option<Vec<u8>>>>,
    settled: u32,
    abandoned: bool,
}

impl Round {
    fn new(kind: RoundKind, count: usize, dtype: DataType, world: u32) -> Self {
        Self {
            kind,
            count,
            dtype,
            world,
            inputs: vec![None; world as usize],
            arrived: 0,
            outputs: None,
            settled: 0,
            abandoned: false,
        }
    }

    /// Give up on the round and free every payload it holds.
    fn abandon(&mut self) {
        self.abandoned = true;
        self.inputs.clear();
        self.outputs = None;
    }

    fn finish(&mut self) -> Result<()> {
        let world = self.inputs.len();
        let chunk = self.count * self.dtype.size_in_bytes();
        let inputs: Vec<Vec<u8>> = self.inputs.iter_mut().filter_map(Option::take).collect();
        if inputs.len() != world {
            return Err(HostStageError::ProtocolMisuse(
                "round finished with missing contributions",
            ));
        }

        let mut outputs = Vec::with_capacity(world);
        for dst in 0..world {
            let block = dst * chunk..(dst + 1) * chunk;
            let out = match self.kind {
                RoundKind::AllToAll => inputs
                    .iter()
                    .flat_map(|input| input[block.clone()].iter().copied())
                    .collect(),
                RoundKind::ReduceScatter(op) => {
                    let mut acc = inputs[0][block.clone()].to_vec();
                    for input in &inputs[1..] {
                        reduce_slice(&mut acc, &input[block.clone()], self.count, self.dtype, op)?;
                    }
                    acc
                }
            };
            outputs.push(Some(out));
        }
        self.outputs = Some(outputs);
        Ok(())
    }
}

#[derive(Default)]
struct Shared {
    rounds: Mutex<HashMap<u64, Round>>,
}

/// In-process communicator: every rank lives in the same address space and
/// collectives are matched by per-rank issue order, as with MPI.
///
/// The last rank to contribute computes every rank's result; each rank's
/// `test` then copies its share into its in-place buffer.
pub struct LocalComm {
    rank: Rank,
    size: u32,
    shared: Arc<Shared>,
    next_seq: AtomicU64,
}

impl LocalComm {
    /// Form a group of `size` communicators, one per rank.
    pub fn group(size: u32) -> Vec<LocalComm> {
        let shared = Arc::new(Shared::default());
        (0..size)
            .map(|rank| LocalComm {
                rank,
                size,
                shared: Arc::clone(&shared),
                next_seq: AtomicU64::new(0),
            })
            .collect()
    }

    /// # Safety
    /// See [`Communicator::ialltoall`].
    unsafe fn contribute(
        &self,
        kind: RoundKind,
        buf: *mut u8,
        count: usize,
        dtype: DataType,
    ) -> Result<Request> {
        let operation = kind.operation();
        let chunk = count * dtype.size_in_bytes();
        let total = chunk * self.size as usize;
        let input = if total == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(buf as *const u8, total) }.to_vec()
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        {
            let mut rounds = self
                .shared
                .rounds
                .lock()
                .map_err(|_| HostStageError::LockPoisoned("local comm rounds"))?;
            let round = rounds
                .entry(seq)
                .or_insert_with(|| Round::new(kind, count, dtype, self.size));
            let rejection = if round.abandoned {
                Some(format!("peer abandoned collective at sequence {seq}"))
            } else if round.kind != kind || round.count != count || round.dtype != dtype {
                Some(format!("mismatched collective at sequence {seq}"))
            } else {
                round.inputs[self.rank as usize] = Some(input);
                round.arrived += 1;
                if round.arrived == self.size {
                    round.finish().err().map(|e| e.to_string())
                } else {
                    None
                }
            };
            if let Some(reason) = rejection {
                // This rank will never poll the round, so it settles here.
                round.abandon();
                settle(&mut rounds, seq);
                return Err(HostStageError::network(operation, self.rank, reason));
            }
        }

        tracing::debug!(op = operation, rank = self.rank, seq, count, "local collective issued");
        let out_len = match kind {
            RoundKind::AllToAll => total,
            RoundKind::ReduceScatter(_) => chunk,
        };
        Ok(Request::new(
            operation,
            LocalRequest {
                shared: Arc::clone(&self.shared),
                seq,
                rank: self.rank,
                operation,
                buf: buf as usize,
                len: out_len,
                settled: false,
            },
        ))
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    unsafe fn ialltoall(&self, buf: *mut u8, count: usize, dtype: DataType) -> Result<Request> {
        unsafe { self.contribute(RoundKind::AllToAll, buf, count, dtype) }
    }

    unsafe fn ireduce_scatter_block(
        &self,
        buf: *mut u8,
        count: usize,
        dtype: DataType,
        op: NativeOp,
    ) -> Result<Request> {
        let op = from_native_op(op).ok_or(HostStageError::UnsupportedOp { token: op.0 })?;
        unsafe { self.contribute(RoundKind::ReduceScatter(op), buf, count, dtype) }
    }
}

/// Count one more rank as done with round `seq`, dropping it once all are.
fn settle(rounds: &mut HashMap<u64, Round>, seq: u64) {
    if let Some(round) = rounds.get_mut(&seq) {
        round.settled += 1;
        if round.settled == round.world {
            rounds.remove(&seq);
        }
    }
}

struct LocalRequest {
    shared: Arc<Shared>,
    seq: u64,
    rank: Rank,
    operation: &'static str,
    buf: usize,
    len: usize,
    settled: bool,
}

impl RequestHandle for LocalRequest {
    fn test(&mut self) -> Result<bool> {
        let mut rounds = self
            .shared
            .rounds
            .lock()
            .map_err(|_| HostStageError::LockPoisoned("local comm rounds"))?;
        let round = rounds.get_mut(&self.seq).ok_or_else(|| {
            HostStageError::network(self.operation, self.rank, "collective round vanished")
        })?;
        if round.abandoned {
            return Err(HostStageError::network(
                self.operation,
                self.rank,
                format!("peer abandoned collective at sequence {}", self.seq),
            ));
        }
        let Some(outputs) = round.outputs.as_mut() else {
            return Ok(false);
        };
        let out = outputs[self.rank as usize]
            .take()
            .ok_or(HostStageError::ProtocolMisuse("local result collected twice"))?;
        if out.len() != self.len {
            return Err(HostStageError::BufferSizeMismatch {
                expected: self.len,
                actual: out.len(),
            });
        }
        if !out.is_empty() {
            // SAFETY: the issuer guaranteed `buf` valid for `len` bytes until completion.
            unsafe { std::ptr::copy_nonoverlapping(out.as_ptr(), self.buf as *mut u8, out.len()) };
        }
        self.settled = true;
        settle(&mut rounds, self.seq);
        Ok(true)
    }
}

impl Drop for LocalRequest {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut rounds = match self.shared.rounds.lock() {
            Ok(rounds) => rounds,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(round) = rounds.get_mut(&self.seq) {
            if !round.abandoned {
                tracing::warn!(
                    op = self.operation,
                    rank = self.rank,
                    seq = self.seq,
                    "local collective dropped before completion"
                );
            }
            round.abandon();
        }
        settle(&mut rounds, self.seq);
    }
}
