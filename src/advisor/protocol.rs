//! Request/response types exchanged with a strategy advisor
//!
//! The contexts are plain data snapshots; rendering them into a prompt lives
//! here so every advisor implementation sees the same framing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::domain::{
    Agent, AgentStats, FeedbackTag, Knowledge, MarketCondition, Memory, Pattern, Personality,
    TradeOutcome,
};

/// The slice of an agent the advisor is allowed to see
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub personality: Personality,
    pub generation: u32,
    pub stats: AgentStats,
    pub fitness: f64,
}

impl From<&Agent> for AgentProfile {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            name: agent.name.clone(),
            personality: agent.personality,
            generation: agent.generation,
            stats: agent.stats.clone(),
            fitness: agent.fitness,
        }
    }
}

/// Everything the advisor gets when asked to pick patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub agent: AgentProfile,
    pub cycle: u64,
    pub trade_index: u32,
    pub market: MarketCondition,
    /// Top-K candidates, library order
    pub patterns: Vec<Pattern>,
    /// Agent's top-J knowledge rows
    pub knowledge: Vec<Knowledge>,
    /// Agent's most recent winning memories
    pub recent_wins: Vec<Memory>,
}

impl DecisionContext {
    pub fn candidate_ids(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.id.clone()).collect()
    }

    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        let a = &self.agent;
        let _ = writeln!(
            out,
            "You are {} ({}), a {} trader in generation {}: {}.",
            a.name,
            a.id,
            a.personality,
            a.generation,
            a.personality.describe()
        );
        let _ = writeln!(
            out,
            "Record: {} trades, {} wins, {} losses, avg ROI {:.2}%, fitness {:.1}.",
            a.stats.total_trades,
            a.stats.winning_trades,
            a.stats.losing_trades,
            a.stats.avg_roi,
            a.fitness
        );
        let _ = writeln!(
            out,
            "\nMarket: volatility {}, trend {}, volume {}, momentum {:.3}%.",
            self.market.volatility, self.market.trend, self.market.volume, self.market.momentum
        );

        out.push_str("\nCandidate patterns (id | name | votes/runs | h2h):\n");
        for p in &self.patterns {
            let _ = writeln!(
                out,
                "- {} | {} | {}/{} | {}-{}",
                p.id, p.name, p.votes, p.runs, p.h2h_wins, p.h2h_losses
            );
        }

        if !self.knowledge.is_empty() {
            out.push_str("\nYour knowledge (pattern | preference | confidence):\n");
            for k in &self.knowledge {
                let _ = writeln!(
                    out,
                    "- {} | {:+.2} | {:.2}",
                    k.pattern_id, k.preference_strength, k.confidence
                );
            }
        }

        if !self.recent_wins.is_empty() {
            out.push_str("\nRecent wins:\n");
            for m in &self.recent_wins {
                let roi = m.resolution.as_ref().map(|r| r.roi).unwrap_or_default();
                let _ = writeln!(
                    out,
                    "- cycle {} used [{}] for {:+.2}%",
                    m.cycle,
                    m.selected_patterns.join(", "),
                    roi
                );
            }
        }

        out.push_str(
            "\nSelect 2 to 4 candidate pattern ids. Respond with JSON only:\n\
             {\"selected_patterns\": [\"id\", ...], \"rationale\": \"...\", \"confidence\": 0.0-1.0}",
        );
        out
    }
}

/// Advisor's pattern selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionAdvice {
    pub selected_patterns: Vec<String>,
    pub rationale: String,
    pub confidence: f64,
}

/// Everything the advisor gets when asked to reflect on a resolved trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionContext {
    pub agent: AgentProfile,
    pub memory: Memory,
    pub outcome: TradeOutcome,
    /// The selected patterns, resolved from the library
    pub patterns: Vec<Pattern>,
}

impl ReflectionContext {
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "You are {} ({}), a {} trader. Reflect on your last trade.",
            self.agent.name, self.agent.id, self.agent.personality
        );
        let _ = writeln!(
            out,
            "Market then: volatility {}, trend {}, volume {}.",
            self.memory.market.volatility, self.memory.market.trend, self.memory.market.volume
        );
        let _ = writeln!(
            out,
            "Selected [{}] with confidence {:.2} because: {}",
            self.memory.selected_patterns.join(", "),
            self.memory.confidence,
            self.memory.rationale
        );
        let _ = writeln!(
            out,
            "Result: {} with ROI {:+.2}% ({:+.1}% annualized).",
            self.outcome.outcome, self.outcome.roi, self.outcome.roi_annualized
        );
        out.push_str(
            "\nFor every selected pattern give increase_preference, decrease_preference or neutral. \
             Respond with JSON only:\n\
             {\"reflection\": \"...\", \"lessons\": \"...\", \"strategy_adjustment\": \"...\", \
             \"pattern_feedback\": {\"<pattern id>\": \"neutral\"}}",
        );
        out
    }
}

/// Advisor's post-trade reflection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionAdvice {
    pub reflection: String,
    #[serde(default)]
    pub lessons: String,
    #[serde(default)]
    pub strategy_adjustment: String,
    #[serde(default)]
    pub pattern_feedback: HashMap<String, FeedbackTag>,
}
