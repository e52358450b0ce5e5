use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, warn, Level};

use crate::advisor::{AdvisorGate, AgentProfile, DecisionContext, FallbackAdvisor};
use crate::domain::{
    memory_id, AdviceSource, Agent, MarketCondition, MarketSample, MarketThresholds, Memory,
};
use crate::error::{ArenaError, Result};
use crate::rng::SimRng;
use crate::store::{PatternLibrary, PopulationStore};

/// How much context the decision engine gathers per call
#[derive(Debug, Clone)]
pub struct DecisionSettings {
    pub top_patterns: usize,
    pub top_knowledge: usize,
    pub recent_wins: usize,
    pub thresholds: MarketThresholds,
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            top_patterns: 10,
            top_knowledge: 5,
            recent_wins: 3,
            thresholds: MarketThresholds::default(),
        }
    }
}

/// Turns a market window into a recorded, pending memory
pub struct DecisionEngine {
    store: Arc<dyn PopulationStore>,
    patterns: Arc<dyn PatternLibrary>,
    gate: Arc<AdvisorGate>,
    settings: DecisionSettings,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<dyn PopulationStore>,
        patterns: Arc<dyn PatternLibrary>,
        gate: Arc<AdvisorGate>,
        settings: DecisionSettings,
    ) -> Self {
        Self {
            store,
            patterns,
            gate,
            settings,
        }
    }

    /// Decide one trade for `agent`. A retry for the same (agent, cycle,
    /// trade index) returns the memory recorded by the earlier attempt.
    pub async fn decide(
        &self,
        agent: &Agent,
        cycle: u64,
        trade_index: u32,
        window: &[MarketSample],
        rng: &mut SimRng,
    ) -> Result<Memory> {
        let id = memory_id(&agent.id, cycle, trade_index);
        match self.store.get_memory(&id).await {
            Ok(existing) => {
                debug!(agent_id = %agent.id, cycle, trade_index, "resuming recorded decision");
                return Ok(existing);
            }
            Err(ArenaError::MemoryNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let market = MarketCondition::classify(window, &self.settings.thresholds);

        let patterns = self.patterns.top_patterns(self.settings.top_patterns).await?;
        if patterns.is_empty() {
            return Err(ArenaError::EmptyPatternLibrary);
        }
        let knowledge = self
            .store
            .top_knowledge(&agent.id, self.settings.top_knowledge)
            .await?;
        let recent_wins = self
            .store
            .recent_winning_memories(&agent.id, self.settings.recent_wins)
            .await?;

        let ctx = DecisionContext {
            agent: AgentProfile::from(agent),
            cycle,
            trade_index,
            market,
            patterns,
            knowledge,
            recent_wins,
        };

        let (advice, source) = match self.gate.decide(&ctx).await {
            Ok(advice) => (advice, AdviceSource::Advisor),
            Err(e) => {
                log_advisor_failure(&self.gate, &e, &agent.id, cycle, "decision");
                (FallbackAdvisor.decide(&ctx, rng), AdviceSource::Fallback)
            }
        };

        let memory = Memory {
            id,
            agent_id: agent.id.clone(),
            cycle,
            trade_index,
            market,
            considered_patterns: ctx.candidate_ids(),
            selected_patterns: advice.selected_patterns,
            rationale: advice.rationale,
            confidence: advice.confidence,
            decision_source: source,
            created_at: Utc::now(),
            resolution: None,
        };

        let recorded = self.store.record_decision(&memory).await?;
        Ok(recorded.memory)
    }
}

/// Level for an advisor call that fell back. Disabled or out-of-budget
/// advisors are routine, advisor failures are warnings, and anything the
/// advisor seam should never produce is an error.
pub(crate) fn fallback_log_level(advisor_enabled: bool, error: &ArenaError) -> Level {
    if !error.is_advisor_failure() {
        Level::ERROR
    } else if !advisor_enabled || matches!(error, ArenaError::AdvisorBudgetExhausted { .. }) {
        Level::DEBUG
    } else {
        Level::WARN
    }
}

pub(crate) fn log_advisor_failure(
    gate: &AdvisorGate,
    error: &ArenaError,
    agent_id: &str,
    cycle: u64,
    stage: &str,
) {
    let advisor = gate.name();
    match fallback_log_level(gate.is_enabled(), error) {
        Level::DEBUG => {
            debug!(agent_id, cycle, stage, advisor, error = %error, "advisor skipped, using fallback")
        }
        Level::WARN => {
            warn!(agent_id, cycle, stage, advisor, error = %error, "advisor failed, using fallback")
        }
        _ => error!(
            agent_id,
            cycle,
            stage,
            advisor,
            error = %error,
            "unexpected advisor error, using fallback"
        ),
    }
}
