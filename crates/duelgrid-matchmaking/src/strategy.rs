//! The strategy seam: how a queue turns into a pair.

use duelgrid_cluster::MatchmakingEntry;

/// Picks pairs out of a rule set's queue.
///
/// Strategies are pure over the entries they are given; all store
/// access and locking stays in the service. This keeps them trivially
/// testable and lets rule sets swap strategies at registration time.
pub trait MatchingStrategy: Send + Sync {
    /// Strategy name, for logging.
    fn name(&self) -> &'static str;

    /// Whether a periodic sweep should bother running `select_pair`.
    /// Event-triggered sweeps ignore this.
    fn is_ready(&self, entries: &[MatchmakingEntry], now_ms: u64) -> bool;

    /// Picks the best pair as indices into `entries`, or `None` if no
    /// acceptable pair exists yet.
    fn select_pair(&self, entries: &[MatchmakingEntry], now_ms: u64) -> Option<(usize, usize)>;
}
