use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One participant's line in a competition ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub agent_id: String,
    pub rank: u32,
    pub total_roi: f64,
    pub trades: u32,
    pub wins: u32,
}

/// Immutable record of one orchestrated round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competition {
    pub id: String,
    pub cycle: u64,
    pub participants: Vec<String>,
    pub winner_id: Option<String>,
    pub rankings: Vec<RankingEntry>,
    pub eliminated_ids: Vec<String>,
    pub cloned_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Parent-to-clone edge recorded by evolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEdge {
    pub id: String,
    pub ancestor_id: String,
    pub descendant_id: String,
    pub generation_gap: u32,
    pub mutation: String,
    pub created_at: DateTime<Utc>,
}

/// Per-agent accumulator while a competition runs
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tally {
    pub agent_id: String,
    pub total_roi: f64,
    pub trades: u32,
    pub wins: u32,
}

/// Ranking order: total ROI desc, then lower agent id first.
pub fn compare_tallies(a: &Tally, b: &Tally) -> Ordering {
    b.total_roi
        .partial_cmp(&a.total_roi)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.agent_id.cmp(&b.agent_id))
}

/// Sort tallies and assign contiguous ranks 1..=N.
pub fn rank_tallies(mut tallies: Vec<Tally>) -> Vec<RankingEntry> {
    tallies.sort_by(compare_tallies);
    tallies
        .into_iter()
        .enumerate()
        .map(|(i, t)| RankingEntry {
            agent_id: t.agent_id,
            rank: i as u32 + 1,
            total_roi: t.total_roi,
            trades: t.trades,
            wins: t.wins,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(id: &str, roi: f64) -> Tally {
        Tally {
            agent_id: id.to_string(),
            total_roi: roi,
            trades: 5,
            wins: 2,
        }
    }

    #[test]
    fn test_ranks_are_contiguous_and_monotone() {
        let ranking = rank_tallies(vec![
            tally("a3", 1.0),
            tally("a1", 7.5),
            tally("a2", -2.0),
            tally("a4", 3.0),
        ]);
        let ranks: Vec<u32> = ranking.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
        for pair in ranking.windows(2) {
            assert!(pair[0].total_roi >= pair[1].total_roi);
        }
        assert_eq!(ranking[0].agent_id, "a1");
    }

    #[test]
    fn test_equal_roi_breaks_on_lower_id() {
        let ranking = rank_tallies(vec![tally("p-a00007", 2.0), tally("p-a00003", 2.0)]);
        assert_eq!(ranking[0].agent_id, "p-a00003");
        assert_eq!(ranking[1].agent_id, "p-a00007");
    }
}
