use rand::seq::SliceRandom;
use rand::RngCore;
use std::collections::HashMap;

use super::{DecisionAdvice, DecisionContext, ReflectionAdvice, ReflectionContext};
use crate::domain::FeedbackTag;

pub const FALLBACK_RATIONALE: &str = "Advisor unavailable: random selection from top patterns";
pub const FALLBACK_CONFIDENCE: f64 = 0.5;
pub const FALLBACK_PICKS: usize = 2;

pub const FALLBACK_REFLECTION: &str = "Advisor unavailable: outcome recorded without reflection";
pub const FALLBACK_LESSONS: &str = "No lessons extracted";
pub const FALLBACK_ADJUSTMENT: &str = "No adjustment";

/// Deterministic stand-in for the advisor. All randomness comes from the
/// caller's RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackAdvisor;

impl FallbackAdvisor {
    pub fn name(&self) -> &'static str {
        "fallback"
    }

    /// Two patterns drawn uniformly from the candidates (fewer if there are fewer).
    pub fn decide<R: RngCore + ?Sized>(&self, ctx: &DecisionContext, rng: &mut R) -> DecisionAdvice {
        let picks = ctx.patterns.len().min(FALLBACK_PICKS);
        let selected = ctx
            .patterns
            .choose_multiple(rng, picks)
            .map(|p| p.id.clone())
            .collect();
        DecisionAdvice {
            selected_patterns: selected,
            rationale: FALLBACK_RATIONALE.to_string(),
            confidence: FALLBACK_CONFIDENCE,
        }
    }

    /// Placeholder texts, every selected pattern tagged neutral.
    pub fn reflect(&self, ctx: &ReflectionContext) -> ReflectionAdvice {
        let pattern_feedback: HashMap<String, FeedbackTag> = ctx
            .memory
            .selected_patterns
            .iter()
            .map(|id| (id.clone(), FeedbackTag::Neutral))
            .collect();
        ReflectionAdvice {
            reflection: FALLBACK_REFLECTION.to_string(),
            lessons: FALLBACK_LESSONS.to_string(),
            strategy_adjustment: FALLBACK_ADJUSTMENT.to_string(),
            pattern_feedback,
        }
    }
}
