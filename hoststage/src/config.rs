//! Runtime-configurable tuning parameters for host-staged collectives.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `HOSTSTAGE_`) or by constructing a custom `HostStageConfig`.

use std::time::Duration;

/// Tuning parameters for the staging pool, the progress driver and the
/// simulated device.
#[derive(Debug, Clone)]
pub struct HostStageConfig {
    /// Upper bound on pinned bytes checked out at once. Acquisitions beyond
    /// it fail with `PinnedExhausted`.
    pub pinned_capacity_bytes: usize,

    /// Buffers retained per pool tier after release.
    pub pinned_tier_slots: usize,

    /// Sweeps the progress driver busy-spins before yielding its thread.
    pub progress_spin_limit: u32,

    /// Latency injected before every simulated stream instruction.
    pub sim_copy_latency: Duration,
}

impl Default for HostStageConfig {
    fn default() -> Self {
        Self {
            pinned_capacity_bytes: 1024 * 1024 * 1024, // 1 GiB
            pinned_tier_slots: 16,
            progress_spin_limit: 64,
            sim_copy_latency: Duration::ZERO,
        }
    }
}

impl HostStageConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `HOSTSTAGE_PINNED_CAPACITY_BYTES`
    /// - `HOSTSTAGE_PINNED_TIER_SLOTS`
    /// - `HOSTSTAGE_PROGRESS_SPIN_LIMIT`
    /// - `HOSTSTAGE_SIM_COPY_LATENCY_US`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(n) = parse(&lookup, "HOSTSTAGE_PINNED_CAPACITY_BYTES") {
            cfg.pinned_capacity_bytes = n;
        }
        if let Some(n) = parse(&lookup, "HOSTSTAGE_PINNED_TIER_SLOTS") {
            cfg.pinned_tier_slots = n;
        }
        if let Some(n) = parse(&lookup, "HOSTSTAGE_PROGRESS_SPIN_LIMIT") {
            cfg.progress_spin_limit = n;
        }
        if let Some(us) = parse(&lookup, "HOSTSTAGE_SIM_COPY_LATENCY_US") {
            cfg.sim_copy_latency = Duration::from_micros(us);
        }

        cfg
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
