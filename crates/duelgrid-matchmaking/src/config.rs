//! Matchmaking tuning knobs.

use std::time::Duration;

/// Service-level cadence and limits.
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    /// Period of the leader's background sweep.
    pub sweep_interval: Duration,
    /// How long the oldest entry must have waited before a periodic
    /// sweep considers a rating-based queue. Event-triggered sweeps
    /// (a new enqueue) skip this gate.
    pub sweep_after: Duration,
    /// Entries waiting longer than this are dequeued as stale.
    pub max_wait_time: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            sweep_after: Duration::from_secs(30),
            max_wait_time: Duration::from_secs(300),
        }
    }
}

/// Tuning for the rating-based strategy.
#[derive(Debug, Clone)]
pub struct RatingConfig {
    /// Search window at zero wait.
    pub initial_range: f64,
    /// Window growth per second of waiting.
    pub expansion_per_second: f64,
    /// Hard ceiling on the window; pairs beyond it never match.
    pub max_range: f64,
    /// Wait-time skew beyond this saturates the wait component of the
    /// pair score.
    pub max_wait_diff: Duration,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            initial_range: 100.0,
            expansion_per_second: 10.0,
            max_range: 500.0,
            max_wait_diff: Duration::from_secs(60),
        }
    }
}
