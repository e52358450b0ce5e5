use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::agent::Outcome;

/// Preference nudge applied per tagged pattern
pub const PREFERENCE_STEP: f64 = 0.1;

/// Advisor feedback about one selected pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackTag {
    IncreasePreference,
    DecreasePreference,
    Neutral,
}

impl FeedbackTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackTag::IncreasePreference => "increase_preference",
            FeedbackTag::DecreasePreference => "decrease_preference",
            FeedbackTag::Neutral => "neutral",
        }
    }

    pub fn preference_delta(&self) -> f64 {
        match self {
            FeedbackTag::IncreasePreference => PREFERENCE_STEP,
            FeedbackTag::DecreasePreference => -PREFERENCE_STEP,
            FeedbackTag::Neutral => 0.0,
        }
    }
}

impl fmt::Display for FeedbackTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Agent-private learned stance toward one pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Knowledge {
    pub agent_id: String,
    pub pattern_id: String,
    /// Always within [-1, 1]
    pub preference_strength: f64,
    /// validated / max(1, validated + contradicted)
    pub confidence: f64,
    pub times_validated: u32,
    pub times_contradicted: u32,
    pub updated_at: DateTime<Utc>,
}

impl Knowledge {
    pub fn new(agent_id: impl Into<String>, pattern_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            pattern_id: pattern_id.into(),
            preference_strength: 0.0,
            confidence: 0.0,
            times_validated: 0,
            times_contradicted: 0,
            updated_at: Utc::now(),
        }
    }

    /// Fold one piece of non-neutral feedback into this row.
    pub fn apply_feedback(&mut self, tag: FeedbackTag, outcome: Outcome, at: DateTime<Utc>) {
        self.preference_strength =
            (self.preference_strength + tag.preference_delta()).clamp(-1.0, 1.0);
        if outcome.is_win() {
            self.times_validated += 1;
        } else {
            self.times_contradicted += 1;
        }
        let seen = (self.times_validated + self.times_contradicted).max(1);
        self.confidence = self.times_validated as f64 / seen as f64;
        self.updated_at = at;
    }

    /// Copy of this row owned by another agent (used when cloning).
    pub fn inherited_by(&self, agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            ..self.clone()
        }
    }
}

/// Knowledge order for the decision context: confidence desc, validations desc.
pub fn compare_knowledge(a: &Knowledge, b: &Knowledge) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.times_validated.cmp(&a.times_validated))
        .then_with(|| a.pattern_id.cmp(&b.pattern_id))
}
