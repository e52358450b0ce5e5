use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use super::decision::log_advisor_failure;
use crate::advisor::{AdvisorGate, AgentProfile, FallbackAdvisor, ReflectionContext};
use crate::domain::{
    AdviceSource, Agent, FeedbackTag, Knowledge, Memory, Resolution, TradeOutcome,
};
use crate::error::{ArenaError, Result};
use crate::store::{PatternLibrary, PopulationStore, ReflectionCommit};

/// Resolves a memory and folds the advisor's feedback into agent knowledge
pub struct ReflectionEngine {
    store: Arc<dyn PopulationStore>,
    patterns: Arc<dyn PatternLibrary>,
    gate: Arc<AdvisorGate>,
}

impl ReflectionEngine {
    pub fn new(
        store: Arc<dyn PopulationStore>,
        patterns: Arc<dyn PatternLibrary>,
        gate: Arc<AdvisorGate>,
    ) -> Self {
        Self {
            store,
            patterns,
            gate,
        }
    }

    /// Resolve `memory` with `outcome`. Returns the agent with its updated
    /// counters. A memory that is already resolved is rejected untouched.
    pub async fn reflect(
        &self,
        agent: &Agent,
        memory: &Memory,
        outcome: TradeOutcome,
    ) -> Result<Agent> {
        let stored = self.store.get_memory(&memory.id).await?;
        if !stored.is_pending() {
            return Err(ArenaError::MemoryAlreadyResolved(memory.id.clone()));
        }

        let ctx = ReflectionContext {
            agent: AgentProfile::from(agent),
            memory: stored,
            outcome,
            patterns: self.patterns.patterns_by_ids(&memory.selected_patterns).await?,
        };

        let (advice, source) = match self.gate.reflect(&ctx).await {
            Ok(advice) => (advice, AdviceSource::Advisor),
            Err(e) => {
                log_advisor_failure(&self.gate, &e, &agent.id, memory.cycle, "reflection");
                (FallbackAdvisor.reflect(&ctx), AdviceSource::Fallback)
            }
        };

        let now = Utc::now();
        let tagged: Vec<(String, FeedbackTag)> = ctx
            .memory
            .selected_patterns
            .iter()
            .filter_map(|id| {
                advice
                    .pattern_feedback
                    .get(id)
                    .filter(|tag| **tag != FeedbackTag::Neutral)
                    .map(|tag| (id.clone(), *tag))
            })
            .collect();

        let knowledge = if tagged.is_empty() {
            Vec::new()
        } else {
            let ids: Vec<String> = tagged.iter().map(|(id, _)| id.clone()).collect();
            let existing = self.store.knowledge_for(&agent.id, &ids).await?;
            tagged
                .into_iter()
                .map(|(pattern_id, tag)| {
                    let mut row = existing
                        .iter()
                        .find(|k| k.pattern_id == pattern_id)
                        .cloned()
                        .unwrap_or_else(|| Knowledge::new(agent.id.as_str(), pattern_id.as_str()));
                    row.apply_feedback(tag, outcome.outcome, now);
                    row
                })
                .collect()
        };

        let commit = ReflectionCommit {
            agent_id: agent.id.clone(),
            memory_id: memory.id.clone(),
            resolution: Resolution {
                outcome: outcome.outcome,
                roi: outcome.roi,
                roi_annualized: outcome.roi_annualized,
                reflection: advice.reflection,
                lessons: advice.lessons,
                strategy_adjustment: advice.strategy_adjustment,
                reflection_source: source,
                resolved_at: now,
            },
            knowledge,
        };

        let updated = self.store.commit_reflection(&commit).await?;
        debug!(
            agent_id = %agent.id,
            memory_id = %memory.id,
            outcome = %outcome.outcome,
            roi = outcome.roi,
            knowledge_rows = commit.knowledge.len(),
            "reflection committed"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{MockStrategyAdvisor, OfflineAdvisor, ReflectionAdvice, StrategyAdvisor};
    use crate::domain::{memory_id, AgentDraft, MarketCondition, Outcome, Personality};
    use crate::store::{InMemoryPatternLibrary, InMemoryStore};
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        engine: ReflectionEngine,
        agent: Agent,
        memory: Memory,
    }

    async fn fixture(advisor: Arc<dyn StrategyAdvisor>) -> Fixture {
        let store = Arc::new(InMemoryStore::new("ref"));
        let library = InMemoryPatternLibrary::builtin().unwrap();
        let agent = store
            .create_agent(AgentDraft::founder("R", Personality::Conservative))
            .await
            .unwrap();
        let memory = Memory {
            id: memory_id(&agent.id, 1, 0),
            agent_id: agent.id.clone(),
            cycle: 1,
            trade_index: 0,
            market: MarketCondition::flat(),
            considered_patterns: vec!["pat-momentum-12h".into(), "pat-meanrev-z2".into()],
            selected_patterns: vec!["pat-momentum-12h".into(), "pat-meanrev-z2".into()],
            rationale: "test".into(),
            confidence: 0.5,
            decision_source: AdviceSource::Fallback,
            created_at: Utc::now(),
            resolution: None,
        };
        store.record_decision(&memory).await.unwrap();

        let engine = ReflectionEngine::new(
            store.clone(),
            Arc::new(library),
            Arc::new(AdvisorGate::new(advisor, 100, Duration::from_secs(1))),
        );
        Fixture {
            store,
            engine,
            agent,
            memory,
        }
    }

    fn trade(roi: f64) -> TradeOutcome {
        TradeOutcome {
            outcome: Outcome::from_roi(roi),
            roi,
            roi_annualized: roi * 365.0 / 24.0,
        }
    }

    #[tokio::test]
    async fn test_fallback_reflection_updates_counters_only() {
        let f = fixture(Arc::new(OfflineAdvisor)).await;
        let agent = f.engine.reflect(&f.agent, &f.memory, trade(2.5)).await.unwrap();

        assert_eq!(agent.stats.total_trades, 1);
        assert_eq!(agent.stats.winning_trades, 1);
        assert_eq!(agent.reflections_made, 1);
        assert!(f.store.top_knowledge(&agent.id, 10).await.unwrap().is_empty());

        let stored = f.store.get_memory(&f.memory.id).await.unwrap();
        let res = stored.resolution.unwrap();
        assert_eq!(res.reflection_source, AdviceSource::Fallback);
        assert_eq!(res.roi, 2.5);
    }

    #[tokio::test]
    async fn test_advisor_feedback_becomes_knowledge() {
        let mut mock = MockStrategyAdvisor::new();
        mock.expect_name().return_const("mock");
        mock.expect_is_enabled().return_const(true);
        mock.expect_reflect().returning(|_| {
            let mut feedback = HashMap::new();
            feedback.insert("pat-momentum-12h".to_string(), FeedbackTag::IncreasePreference);
            feedback.insert("pat-meanrev-z2".to_string(), FeedbackTag::Neutral);
            feedback.insert("pat-not-selected".to_string(), FeedbackTag::DecreasePreference);
            Ok(ReflectionAdvice {
                reflection: "momentum carried it".into(),
                lessons: "trust trend".into(),
                strategy_adjustment: "lean on momentum".into(),
                pattern_feedback: feedback,
            })
        });
        let f = fixture(Arc::new(mock)).await;

        f.engine.reflect(&f.agent, &f.memory, trade(1.0)).await.unwrap();

        let rows = f.store.top_knowledge(&f.agent.id, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pattern_id, "pat-momentum-12h");
        assert!((rows[0].preference_strength - 0.1).abs() < 1e-12);
        assert_eq!(rows[0].times_validated, 1);
        assert_eq!(rows[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn test_second_reflection_is_rejected() {
        let f = fixture(Arc::new(OfflineAdvisor)).await;
        f.engine.reflect(&f.agent, &f.memory, trade(3.0)).await.unwrap();

        let err = f
            .engine
            .reflect(&f.agent, &f.memory, trade(-3.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::MemoryAlreadyResolved(_)));

        let stored = f.store.get_memory(&f.memory.id).await.unwrap();
        assert_eq!(stored.outcome(), Some(Outcome::Win));
        let agent = f.store.get_agent(&f.agent.id).await.unwrap();
        assert_eq!(agent.stats.total_trades, 1);
    }
}
