use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::agent::Outcome;
use super::market::MarketCondition;

/// Which path produced a decision or reflection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceSource {
    Advisor,
    Fallback,
}

impl AdviceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdviceSource::Advisor => "advisor",
            AdviceSource::Fallback => "fallback",
        }
    }
}

impl fmt::Display for AdviceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for AdviceSource {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "advisor" => Ok(AdviceSource::Advisor),
            "fallback" => Ok(AdviceSource::Fallback),
            _ => Err(format!("Unknown advice source: {}", s)),
        }
    }
}

/// Simulated result of a pending decision, produced by the trade executor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub outcome: Outcome,
    pub roi: f64,
    pub roi_annualized: f64,
}

/// Fields written exactly once when a memory is resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub outcome: Outcome,
    pub roi: f64,
    pub roi_annualized: f64,
    pub reflection: String,
    pub lessons: String,
    pub strategy_adjustment: String,
    pub reflection_source: AdviceSource,
    pub resolved_at: DateTime<Utc>,
}

/// One decision cycle of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub agent_id: String,
    pub cycle: u64,
    pub trade_index: u32,
    pub market: MarketCondition,
    pub considered_patterns: Vec<String>,
    pub selected_patterns: Vec<String>,
    pub rationale: String,
    pub confidence: f64,
    pub decision_source: AdviceSource,
    pub created_at: DateTime<Utc>,
    pub resolution: Option<Resolution>,
}

impl Memory {
    pub fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.resolution.as_ref().map(|r| r.outcome)
    }

    pub fn trade_outcome(&self) -> Option<TradeOutcome> {
        self.resolution.as_ref().map(|r| TradeOutcome {
            outcome: r.outcome,
            roi: r.roi,
            roi_annualized: r.roi_annualized,
        })
    }

    /// Set the resolution. Refuses to overwrite an existing one.
    pub fn resolve(&mut self, resolution: Resolution) -> Result<(), Resolution> {
        if self.resolution.is_some() {
            return Err(resolution);
        }
        self.resolution = Some(resolution);
        Ok(())
    }
}

/// Deterministic memory id for (agent, cycle, trade). A retried unit maps to
/// the same id, so the store can detect the earlier attempt.
pub fn memory_id(agent_id: &str, cycle: u64, trade_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_bytes());
    hasher.update(cycle.to_le_bytes());
    hasher.update(trade_index.to_le_bytes());
    let digest = hasher.finalize();
    format!("mem-{}", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Memory {
        Memory {
            id: memory_id("pop-a00001", 1, 0),
            agent_id: "pop-a00001".to_string(),
            cycle: 1,
            trade_index: 0,
            market: MarketCondition::flat(),
            considered_patterns: vec!["p1".into(), "p2".into()],
            selected_patterns: vec!["p1".into(), "p2".into()],
            rationale: "test".into(),
            confidence: 0.5,
            decision_source: AdviceSource::Fallback,
            created_at: Utc::now(),
            resolution: None,
        }
    }

    fn resolution(roi: f64) -> Resolution {
        Resolution {
            outcome: Outcome::from_roi(roi),
            roi,
            roi_annualized: roi * 365.0 / 24.0,
            reflection: "r".into(),
            lessons: "l".into(),
            strategy_adjustment: "a".into(),
            reflection_source: AdviceSource::Fallback,
            resolved_at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_id_is_deterministic_and_distinct() {
        assert_eq!(memory_id("a", 3, 1), memory_id("a", 3, 1));
        assert_ne!(memory_id("a", 3, 1), memory_id("a", 3, 2));
        assert_ne!(memory_id("a", 3, 1), memory_id("b", 3, 1));
        assert_ne!(memory_id("a", 3, 1), memory_id("a", 4, 1));
        assert_eq!(memory_id("a", 3, 1).len(), 4 + 32);
    }

    #[test]
    fn test_resolve_is_write_once() {
        let mut m = memory();
        assert!(m.is_pending());
        m.resolve(resolution(2.0)).unwrap();
        assert_eq!(m.outcome(), Some(Outcome::Win));

        assert!(m.resolve(resolution(-3.0)).is_err());
        assert_eq!(m.outcome(), Some(Outcome::Win));
        assert_eq!(m.trade_outcome().unwrap().roi, 2.0);
    }
}
