use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{DecisionEngine, ReflectionEngine, TradeExecutor};
use crate::domain::{
    rank_tallies, AdviceSource, Agent, Competition, MarketSample, RankingEntry, Tally,
    TradeOutcome,
};
use crate::error::{ArenaError, Result};
use crate::rng::SimRng;
use crate::store::PopulationStore;

/// Ranking of one orchestrated round, before evolution results are attached
#[derive(Debug, Clone)]
pub struct CompetitionResult {
    pub cycle: u64,
    pub participants: Vec<String>,
    pub rankings: Vec<RankingEntry>,
    pub winner_id: Option<String>,
    pub advisor_decisions: u32,
    pub fallback_decisions: u32,
    pub retried_units: u32,
}

impl CompetitionResult {
    /// Immutable record of the ranking. Evolution ids are attached by the
    /// store when the cycle is committed.
    pub fn into_record(self) -> Competition {
        Competition {
            id: Uuid::new_v4().to_string(),
            cycle: self.cycle,
            participants: self.participants,
            winner_id: self.winner_id,
            rankings: self.rankings,
            eliminated_ids: Vec::new(),
            cloned_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

struct UnitResult {
    outcome: TradeOutcome,
    source: AdviceSource,
}

/// Drives agents through decision, execution and reflection, one unit at a
/// time, and ranks them by total ROI.
pub struct CompetitionOrchestrator {
    store: Arc<dyn PopulationStore>,
    decision: DecisionEngine,
    executor: TradeExecutor,
    reflection: ReflectionEngine,
    max_unit_retries: u32,
}

impl CompetitionOrchestrator {
    pub fn new(
        store: Arc<dyn PopulationStore>,
        decision: DecisionEngine,
        executor: TradeExecutor,
        reflection: ReflectionEngine,
        max_unit_retries: u32,
    ) -> Self {
        Self {
            store,
            decision,
            executor,
            reflection,
            max_unit_retries,
        }
    }

    pub async fn run_competition(
        &self,
        agents: &[Agent],
        trades_per_agent: u32,
        cycle: u64,
        window: &[MarketSample],
        rng: &mut SimRng,
    ) -> Result<CompetitionResult> {
        if agents.is_empty() {
            return Err(ArenaError::NoActiveAgents);
        }

        let mut tallies = Vec::with_capacity(agents.len());
        let mut advisor_decisions = 0;
        let mut fallback_decisions = 0;
        let mut retried_units = 0;

        for agent in agents {
            let mut tally = Tally {
                agent_id: agent.id.clone(),
                ..Tally::default()
            };
            for trade_index in 0..trades_per_agent {
                let (unit, retries) = self
                    .run_unit_with_retry(&agent.id, cycle, trade_index, window, rng)
                    .await?;
                retried_units += retries;
                match unit.source {
                    AdviceSource::Advisor => advisor_decisions += 1,
                    AdviceSource::Fallback => fallback_decisions += 1,
                }
                tally.total_roi += unit.outcome.roi;
                tally.trades += 1;
                if unit.outcome.outcome.is_win() {
                    tally.wins += 1;
                }
            }
            tallies.push(tally);
        }

        let rankings = rank_tallies(tallies);
        let winner_id = rankings.first().map(|r| r.agent_id.clone());

        info!(
            cycle,
            participants = agents.len(),
            winner = winner_id.as_deref().unwrap_or("-"),
            advisor_decisions,
            fallback_decisions,
            "competition finished"
        );

        Ok(CompetitionResult {
            cycle,
            participants: agents.iter().map(|a| a.id.clone()).collect(),
            rankings,
            winner_id,
            advisor_decisions,
            fallback_decisions,
            retried_units,
        })
    }

    async fn run_unit_with_retry(
        &self,
        agent_id: &str,
        cycle: u64,
        trade_index: u32,
        window: &[MarketSample],
        rng: &mut SimRng,
    ) -> Result<(UnitResult, u32)> {
        let mut attempt = 0;
        loop {
            match self.run_unit(agent_id, cycle, trade_index, window, rng).await {
                Ok(unit) => return Ok((unit, attempt)),
                Err(e) if e.is_retryable() && attempt < self.max_unit_retries => {
                    attempt += 1;
                    warn!(
                        agent_id,
                        cycle,
                        trade_index,
                        attempt,
                        error = %e,
                        "unit failed, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_unit(
        &self,
        agent_id: &str,
        cycle: u64,
        trade_index: u32,
        window: &[MarketSample],
        rng: &mut SimRng,
    ) -> Result<UnitResult> {
        let agent = self.store.get_agent(agent_id).await?;
        let memory = self
            .decision
            .decide(&agent, cycle, trade_index, window, rng)
            .await?;

        // a retried unit whose reflection already landed is complete
        if let Some(outcome) = memory.trade_outcome() {
            return Ok(UnitResult {
                outcome,
                source: memory.decision_source,
            });
        }

        let outcome = self.executor.execute(&memory, rng).await?;
        match self.reflection.reflect(&agent, &memory, outcome).await {
            Ok(_) => Ok(UnitResult {
                outcome,
                source: memory.decision_source,
            }),
            Err(ArenaError::MemoryAlreadyResolved(_)) => {
                let stored = self.store.get_memory(&memory.id).await?;
                let outcome = stored
                    .trade_outcome()
                    .ok_or_else(|| ArenaError::Internal(format!("memory {} lost its resolution", memory.id)))?;
                Ok(UnitResult {
                    outcome,
                    source: memory.decision_source,
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{AdvisorGate, OfflineAdvisor};
    use crate::config::ExecutorPolicy;
    use crate::engine::DecisionSettings;
    use crate::store::{InMemoryPatternLibrary, InMemoryStore, WriteOp};
    use crate::domain::{AgentDraft, Personality};
    use std::time::Duration;

    fn orchestrator(store: Arc<InMemoryStore>, retries: u32) -> CompetitionOrchestrator {
        let library = Arc::new(InMemoryPatternLibrary::builtin().unwrap());
        let gate = Arc::new(AdvisorGate::new(
            Arc::new(OfflineAdvisor),
            0,
            Duration::from_secs(1),
        ));
        CompetitionOrchestrator::new(
            store.clone(),
            DecisionEngine::new(
                store.clone(),
                library.clone(),
                gate.clone(),
                DecisionSettings::default(),
            ),
            TradeExecutor::new(library.clone(), ExecutorPolicy::default()),
            ReflectionEngine::new(store, library, gate),
            retries,
        )
    }

    async fn agents(store: &InMemoryStore, n: usize) -> Vec<Agent> {
        let mut out = Vec::new();
        for i in 0..n {
            out.push(
                store
                    .create_agent(AgentDraft::founder(format!("A{}", i), Personality::Balanced))
                    .await
                    .unwrap(),
            );
        }
        out
    }

    #[tokio::test]
    async fn test_empty_population_rejected() {
        let store = Arc::new(InMemoryStore::new("c"));
        let err = orchestrator(store, 0)
            .run_competition(&[], 3, 1, &[], &mut SimRng::seeded(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::NoActiveAgents));
    }

    #[tokio::test]
    async fn test_rankings_are_a_permutation() {
        let store = Arc::new(InMemoryStore::new("c"));
        let roster = agents(&store, 4).await;
        let result = orchestrator(store.clone(), 0)
            .run_competition(&roster, 3, 1, &[], &mut SimRng::seeded(9))
            .await
            .unwrap();

        let mut ranks: Vec<u32> = result.rankings.iter().map(|r| r.rank).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
        assert_eq!(result.fallback_decisions, 12);
        assert_eq!(result.winner_id.as_deref(), Some(result.rankings[0].agent_id.as_str()));

        for entry in &result.rankings {
            let agent = store.get_agent(&entry.agent_id).await.unwrap();
            // ranking counters are written when the cycle commits
            assert_eq!(agent.competitions_entered, 0);
            assert_eq!(agent.stats.total_trades, 3);
            assert!((agent.stats.total_roi - entry.total_roi).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_reflection_fault_is_retried_without_duplicates() {
        let store = Arc::new(InMemoryStore::new("c"));
        let roster = agents(&store, 2).await;
        store.inject_failures(WriteOp::CommitReflection, 1).await;

        let result = orchestrator(store.clone(), 2)
            .run_competition(&roster, 2, 1, &[], &mut SimRng::seeded(4))
            .await
            .unwrap();

        assert_eq!(result.retried_units, 1);
        assert_eq!(store.memory_count().await, 4);
        for agent in &roster {
            let stored = store.get_agent(&agent.id).await.unwrap();
            assert_eq!(stored.decisions_made, 2);
            assert_eq!(stored.stats.total_trades, 2);
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_error() {
        let store = Arc::new(InMemoryStore::new("c"));
        let roster = agents(&store, 1).await;
        store.inject_failures(WriteOp::RecordDecision, 5).await;

        let err = orchestrator(store, 2)
            .run_competition(&roster, 1, 1, &[], &mut SimRng::seeded(4))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::Persistence(_)));
    }
}
