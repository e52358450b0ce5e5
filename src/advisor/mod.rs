//! Strategy advisor: the external oracle that picks patterns and reflects on
//! outcomes, plus the gate (budget, timeout, validation) and the fallback
//! path the engines use whenever the oracle cannot answer.

pub mod budget;
pub mod fallback;
pub mod gate;
pub mod offline;
pub mod protocol;
pub mod remote;

pub use budget::DailyBudget;
pub use fallback::FallbackAdvisor;
pub use gate::AdvisorGate;
pub use offline::OfflineAdvisor;
pub use protocol::{
    AgentProfile, DecisionAdvice, DecisionContext, ReflectionAdvice, ReflectionContext,
};
pub use remote::{extract_json, RemoteAdvisor};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::error::{ArenaError, Result};

/// Minimum and maximum distinct patterns a decision may select
pub const MIN_SELECTED: usize = 2;
pub const MAX_SELECTED: usize = 4;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StrategyAdvisor: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Whether calls should be attempted at all. A disabled advisor is
    /// skipped without consuming budget.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn decide(&self, ctx: &DecisionContext) -> Result<DecisionAdvice>;

    async fn reflect(&self, ctx: &ReflectionContext) -> Result<ReflectionAdvice>;
}

/// Check a raw decision against the candidate set.
///
/// Duplicate ids collapse (first occurrence wins); confidence is clamped to
/// [0, 1]. Unknown ids, a distinct count outside 2..=4 or a non-finite
/// confidence reject the whole answer.
pub fn validate_decision(advice: DecisionAdvice, candidates: &[String]) -> Result<DecisionAdvice> {
    if !advice.confidence.is_finite() {
        return Err(ArenaError::MalformedOracleResponse(format!(
            "non-finite confidence {}",
            advice.confidence
        )));
    }

    let known: HashSet<&str> = candidates.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut selected = Vec::with_capacity(advice.selected_patterns.len());
    for id in advice.selected_patterns {
        if !known.contains(id.as_str()) {
            return Err(ArenaError::MalformedOracleResponse(format!(
                "unknown pattern id {}",
                id
            )));
        }
        if seen.insert(id.clone()) {
            selected.push(id);
        }
    }

    if !(MIN_SELECTED..=MAX_SELECTED).contains(&selected.len()) {
        return Err(ArenaError::MalformedOracleResponse(format!(
            "{} distinct patterns selected, expected {}..={}",
            selected.len(),
            MIN_SELECTED,
            MAX_SELECTED
        )));
    }

    Ok(DecisionAdvice {
        selected_patterns: selected,
        rationale: advice.rationale,
        confidence: advice.confidence.clamp(0.0, 1.0),
    })
}

/// Drop feedback for patterns that were not part of the selection.
pub fn retain_selected_feedback(mut advice: ReflectionAdvice, selected: &[String]) -> ReflectionAdvice {
    let keep: HashSet<&str> = selected.iter().map(String::as_str).collect();
    let feedback: HashMap<_, _> = advice
        .pattern_feedback
        .into_iter()
        .filter(|(id, _)| keep.contains(id.as_str()))
        .collect();
    advice.pattern_feedback = feedback;
    advice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FeedbackTag;

    fn ids(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    fn advice(selected: &[&str], confidence: f64) -> DecisionAdvice {
        DecisionAdvice {
            selected_patterns: ids(selected),
            rationale: "because".into(),
            confidence,
        }
    }

    #[test]
    fn test_valid_decision_passes_and_clamps() {
        let candidates = ids(&["a", "b", "c"]);
        let out = validate_decision(advice(&["b", "a", "b"], 1.7), &candidates).unwrap();
        assert_eq!(out.selected_patterns, ids(&["b", "a"]));
        assert_eq!(out.confidence, 1.0);
    }

    #[test]
    fn test_malformed_decisions_rejected() {
        let candidates = ids(&["a", "b", "c", "d", "e"]);
        for bad in [
            advice(&["a", "zzz"], 0.5),
            advice(&["a"], 0.5),
            advice(&["a", "a"], 0.5),
            advice(&["a", "b", "c", "d", "e"], 0.5),
            advice(&["a", "b"], f64::NAN),
        ] {
            let err = validate_decision(bad, &candidates).unwrap_err();
            assert!(matches!(err, ArenaError::MalformedOracleResponse(_)));
        }
    }

    #[test]
    fn test_feedback_outside_selection_is_ignored() {
        let mut feedback = HashMap::new();
        feedback.insert("a".to_string(), FeedbackTag::IncreasePreference);
        feedback.insert("x".to_string(), FeedbackTag::DecreasePreference);
        let advice = ReflectionAdvice {
            reflection: "r".into(),
            lessons: String::new(),
            strategy_adjustment: String::new(),
            pattern_feedback: feedback,
        };

        let kept = retain_selected_feedback(advice, &ids(&["a", "b"]));
        assert_eq!(kept.pattern_feedback.len(), 1);
        assert!(kept.pattern_feedback.contains_key("a"));
    }
}
