use rand::Rng;
use std::sync::Arc;
use tracing::debug;

use crate::config::ExecutorPolicy;
use crate::domain::{Memory, Outcome, Pattern, TradeOutcome};
use crate::error::{ArenaError, Result};
use crate::rng::SimRng;
use crate::store::PatternLibrary;

/// Simulates the outcome of a pending decision. Never touches the memory.
pub struct TradeExecutor {
    patterns: Arc<dyn PatternLibrary>,
    policy: ExecutorPolicy,
}

impl TradeExecutor {
    pub fn new(patterns: Arc<dyn PatternLibrary>, policy: ExecutorPolicy) -> Self {
        Self { patterns, policy }
    }

    pub fn policy(&self) -> &ExecutorPolicy {
        &self.policy
    }

    pub async fn execute(&self, memory: &Memory, rng: &mut SimRng) -> Result<TradeOutcome> {
        let selected = self.patterns.patterns_by_ids(&memory.selected_patterns).await?;
        if selected.len() < memory.selected_patterns.len() {
            debug!(
                memory_id = %memory.id,
                wanted = memory.selected_patterns.len(),
                found = selected.len(),
                "skipping unknown selected patterns"
            );
        }
        if selected.is_empty() {
            return Err(ArenaError::PatternNotFound(memory.selected_patterns.join(",")));
        }
        Ok(simulate(&selected, &self.policy, rng))
    }
}

/// Weighted simulated ROI for a set of patterns.
///
/// Each pattern contributes `w = vote_ratio` and an implied ROI of
/// `w*scale - offset`; the combined ROI is the w-weighted mean (plain mean
/// when all weights are zero). Multi-pattern trades draw one `U(0,1)` for a
/// combination adjustment before the `U(-a, a)` noise draw.
pub fn simulate<R: Rng + ?Sized>(
    patterns: &[Pattern],
    policy: &ExecutorPolicy,
    rng: &mut R,
) -> TradeOutcome {
    let weights: Vec<f64> = patterns.iter().map(Pattern::vote_ratio).collect();
    let implied: Vec<f64> = weights
        .iter()
        .map(|w| w * policy.implied_roi_scale - policy.implied_roi_offset)
        .collect();

    let weight_sum: f64 = weights.iter().sum();
    let mut roi = if weight_sum > 0.0 {
        weights.iter().zip(&implied).map(|(w, r)| w * r).sum::<f64>() / weight_sum
    } else {
        implied.iter().sum::<f64>() / implied.len().max(1) as f64
    };

    if patterns.len() > 1 {
        let u: f64 = rng.gen();
        roi += (u - policy.combination_bias) * policy.combination_scale;
    }

    let noise: f64 = rng.gen();
    roi += (noise * 2.0 - 1.0) * policy.noise_amplitude;

    TradeOutcome {
        outcome: Outcome::from_roi(roi),
        roi,
        roi_annualized: roi * 365.0 / policy.holding_period_hours,
    }
}
