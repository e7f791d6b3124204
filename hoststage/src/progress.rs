//! A minimal cooperative driver for collective states.
//!
//! One owner polls every live state in turn; nothing here blocks on the
//! device or the network, so any number of operations can share one thread.

use crate::collective::CollectiveState;
use crate::config::HostStageConfig;
use crate::device::StreamId;
use crate::error::Result;

pub struct ProgressEngine {
    states: Vec<Box<dyn CollectiveState>>,
    spin_limit: u32,
    completed: u64,
}

impl ProgressEngine {
    pub fn new() -> Self {
        Self::with_config(&HostStageConfig::default())
    }

    pub fn with_config(config: &HostStageConfig) -> Self {
        Self {
            states: Vec::new(),
            spin_limit: config.progress_spin_limit.max(1),
            completed: 0,
        }
    }

    /// Take ownership of a state; it is dropped once it reports completion.
    pub fn enqueue(&mut self, state: impl CollectiveState + 'static) {
        if state.needs_final_barrier() {
            tracing::warn!(
                op = state.name(),
                "state requests a final barrier; this engine runs none"
            );
        }
        tracing::debug!(op = state.name(), stream = %state.bound_stream(), "state enqueued");
        self.states.push(Box::new(state));
    }

    /// Advance every live state once and return how many completed.
    ///
    /// A state whose `advance` fails is dropped and the error returned; the
    /// remaining states are left for the next sweep.
    pub fn poll(&mut self) -> Result<usize> {
        let mut done = 0;
        let mut i = 0;
        while i < self.states.len() {
            match self.states[i].advance() {
                Ok(true) => {
                    let state = self.states.remove(i);
                    tracing::trace!(op = state.name(), stream = %state.bound_stream(), "state complete");
                    done += 1;
                }
                Ok(false) => i += 1,
                Err(e) => {
                    let state = self.states.remove(i);
                    tracing::error!(
                        op = state.name(),
                        stream = %state.bound_stream(),
                        "state aborted: {e}"
                    );
                    self.completed += done as u64;
                    return Err(e);
                }
            }
        }
        self.completed += done as u64;
        Ok(done)
    }

    /// Poll until no state is left, spinning briefly between sweeps and then
    /// yielding the thread.
    pub fn run_to_completion(&mut self) -> Result<()> {
        let mut spins = 0;
        while !self.is_idle() {
            if self.poll()? > 0 {
                spins = 0;
                continue;
            }
            spins += 1;
            if spins >= self.spin_limit {
                std::thread::yield_now();
                spins = 0;
            } else {
                std::hint::spin_loop();
            }
        }
        Ok(())
    }

    /// Like [`run_to_completion`](Self::run_to_completion), but yields to the
    /// tokio scheduler between sweeps instead of spinning the thread.
    pub async fn run_async(&mut self) -> Result<()> {
        while !self.is_idle() {
            self.poll()?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.states.len()
    }

    /// Live states bound to `stream`.
    pub fn pending_on(&self, stream: StreamId) -> usize {
        self.states
            .iter()
            .filter(|s| s.bound_stream() == stream)
            .count()
    }

    pub fn is_idle(&self) -> bool {
        self.states.is_empty()
    }

    /// States that reported completion over the engine's lifetime.
    pub fn completed(&self) -> u64 {
        self.completed
    }
}

impl Default for ProgressEngine {
    fn default() -> Self {
        Self::new()
    }
}
