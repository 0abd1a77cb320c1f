//! Rating-based matching with wait-driven search-range expansion.
//!
//! Each entry's search window starts at `initial_range` and widens as
//! it waits, capped at `max_range`. A pair is eligible when its rating
//! gap fits inside the window of the longer-waiting side. Among
//! eligible pairs the strategy minimizes a composite score weighting
//! rating gap over wait-time skew, so close ratings win but a starving
//! entry eventually pulls in whoever is available.

use duelgrid_cluster::MatchmakingEntry;
use serde_json::Value;

use crate::{MatchingStrategy, RatingConfig};

/// Rating assumed for entries that carry none.
const DEFAULT_RATING: f64 = 1000.0;

/// Weight of the rating-gap component of the pair score.
const RATING_WEIGHT: f64 = 0.8;

/// Weight of the wait-skew component of the pair score.
const WAIT_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Default)]
pub struct RatingStrategy {
    config: RatingConfig,
    /// Periodic sweeps skip the queue until the oldest entry has
    /// waited this long (milliseconds). Set by the service.
    ready_after_ms: u64,
}

impl RatingStrategy {
    pub fn new(config: RatingConfig, ready_after_ms: u64) -> Self {
        Self {
            config,
            ready_after_ms,
        }
    }

    /// The search window for an entry that has waited `wait_ms`.
    fn window(&self, wait_ms: u64) -> f64 {
        let expanded =
            self.config.initial_range + (wait_ms as f64 / 1000.0) * self.config.expansion_per_second;
        expanded.min(self.config.max_range)
    }

    fn score(&self, a: &MatchmakingEntry, b: &MatchmakingEntry, now_ms: u64) -> f64 {
        let gap = (rating_of(a) - rating_of(b)).abs();
        let rating_score = gap / self.config.max_range;

        let wait_skew = a.wait_ms(now_ms).abs_diff(b.wait_ms(now_ms)) as f64;
        let wait_score = (wait_skew / self.config.max_wait_diff.as_millis() as f64).min(1.0);

        rating_score * RATING_WEIGHT + wait_score * WAIT_WEIGHT
    }
}

/// Reads a numeric `rating` out of an entry's player data.
pub(crate) fn rating_of(entry: &MatchmakingEntry) -> f64 {
    match entry.player_data.get("rating") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_RATING),
        _ => DEFAULT_RATING,
    }
}

impl MatchingStrategy for RatingStrategy {
    fn name(&self) -> &'static str {
        "rating"
    }

    fn is_ready(&self, entries: &[MatchmakingEntry], now_ms: u64) -> bool {
        entries.len() >= 2
            && entries
                .iter()
                .any(|e| e.wait_ms(now_ms) >= self.ready_after_ms)
    }

    fn select_pair(&self, entries: &[MatchmakingEntry], now_ms: u64) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, f64)> = None;

        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let (a, b) = (&entries[i], &entries[j]);
                let gap = (rating_of(a) - rating_of(b)).abs();
                if gap > self.config.max_range {
                    continue;
                }
                // The longer-waiting side's window decides eligibility.
                let longest_wait = a.wait_ms(now_ms).max(b.wait_ms(now_ms));
                if gap > self.window(longest_wait) {
                    continue;
                }
                let score = self.score(a, b, now_ms);
                if best.is_none_or(|(_, _, s)| score < s) {
                    best = Some((i, j, score));
                }
            }
        }

        best.map(|(i, j, _)| (i, j))
    }
}
