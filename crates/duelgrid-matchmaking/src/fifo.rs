//! First-in-first-out matching: the two oldest entries pair up.

use duelgrid_cluster::MatchmakingEntry;

use crate::MatchingStrategy;

#[derive(Debug, Clone, Copy, Default)]
pub struct FifoStrategy;

impl MatchingStrategy for FifoStrategy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn is_ready(&self, entries: &[MatchmakingEntry], _now_ms: u64) -> bool {
        entries.len() >= 2
    }

    fn select_pair(&self, entries: &[MatchmakingEntry], _now_ms: u64) -> Option<(usize, usize)> {
        if entries.len() < 2 {
            return None;
        }
        // Queue order is join order, but entries can be re-queued, so
        // sort by join time to find the two oldest.
        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by_key(|&i| entries[i].join_time);
        Some((order[0], order[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duelgrid_protocol::{PlayerId, SessionId};

    fn entry(player: &str, join_time: u64) -> MatchmakingEntry {
        MatchmakingEntry {
            player_id: PlayerId::from(player),
            session_id: SessionId::from("s"),
            rule_set_id: "standard".to_string(),
            join_time,
            player_data: serde_json::json!({}),
            metadata: None,
        }
    }

    #[test]
    fn test_select_pair_needs_two_entries() {
        let strategy = FifoStrategy;
        assert!(!strategy.is_ready(&[entry("p1", 10)], 0));
        assert_eq!(strategy.select_pair(&[entry("p1", 10)], 0), None);
    }

    #[test]
    fn test_select_pair_picks_two_oldest() {
        let strategy = FifoStrategy;
        let entries = vec![entry("p1", 300), entry("p2", 100), entry("p3", 200)];
        let (a, b) = strategy.select_pair(&entries, 0).unwrap();
        assert_eq!(entries[a].player_id.as_str(), "p2");
        assert_eq!(entries[b].player_id.as_str(), "p3");
    }
}
