//! One population's competition loop: the scheduling entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::advisor::{AdvisorGate, StrategyAdvisor};
use crate::config::AppConfig;
use crate::domain::{Agent, Competition, Personality};
use crate::engine::{
    CompetitionOrchestrator, DecisionEngine, DecisionSettings, EvolutionController,
    EvolutionReport, FitnessEvaluator, PopulationManager, ReflectionEngine, TradeExecutor,
};
use crate::error::{ArenaError, Result};
use crate::market::MarketSource;
use crate::rng::SimRng;
use crate::store::{CycleCommit, PatternLibrary, PopulationStore};

/// Summary of one completed cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub competition: Competition,
    pub evolution: Option<EvolutionReport>,
    pub advisor_decisions: u32,
    pub fallback_decisions: u32,
    pub retried_units: u32,
    /// The cycle number was already recorded; the stored record is returned
    /// and no counters, evolution or record were written this time
    pub replayed: bool,
    /// Active agents after evolution, fitness desc
    pub survivors: Vec<Agent>,
}

impl CycleReport {
    pub fn winner_id(&self) -> Option<&str> {
        self.competition.winner_id.as_deref()
    }
}

/// Clears the running flag on every exit path
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ArenaError::CompetitionInProgress)?;
        Ok(Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct Arena {
    store: Arc<dyn PopulationStore>,
    market: Arc<dyn MarketSource>,
    gate: Arc<AdvisorGate>,
    population: PopulationManager,
    orchestrator: CompetitionOrchestrator,
    fitness: FitnessEvaluator,
    evolution: EvolutionController,
    rng: Mutex<SimRng>,
    running: AtomicBool,
    population_size: usize,
    trades_per_agent: u32,
    evolve_every: u64,
    window_size: usize,
}

impl Arena {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn PopulationStore>,
        patterns: Arc<dyn PatternLibrary>,
        market: Arc<dyn MarketSource>,
        advisor: Arc<dyn StrategyAdvisor>,
    ) -> Self {
        let gate = Arc::new(AdvisorGate::new(
            advisor,
            config.advisor.daily_budget,
            config.advisor.timeout(),
        ));
        let settings = DecisionSettings {
            top_patterns: config.competition.top_patterns,
            top_knowledge: config.competition.top_knowledge,
            recent_wins: config.competition.recent_wins,
            thresholds: config.market.thresholds.clone(),
        };

        let orchestrator = CompetitionOrchestrator::new(
            store.clone(),
            DecisionEngine::new(store.clone(), patterns.clone(), gate.clone(), settings),
            TradeExecutor::new(patterns.clone(), config.executor.clone()),
            ReflectionEngine::new(store.clone(), patterns, gate.clone()),
            config.competition.max_unit_retries,
        );

        let rng = SimRng::from_seed_option(config.population.seed);
        if let Some(seed) = rng.seed() {
            info!(namespace = store.namespace(), seed, "arena rng seeded");
        }

        Self {
            population: PopulationManager::new(store.clone()),
            fitness: FitnessEvaluator::new(store.clone()),
            evolution: EvolutionController::new(store.clone(), config.evolution.clone()),
            orchestrator,
            store,
            market,
            gate,
            rng: Mutex::new(rng),
            running: AtomicBool::new(false),
            population_size: config.population.size,
            trades_per_agent: config.competition.trades_per_agent,
            evolve_every: config.competition.evolve_every,
            window_size: config.market.window_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn PopulationStore> {
        &self.store
    }

    pub fn population(&self) -> &PopulationManager {
        &self.population
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Advisor calls spent today
    pub async fn advisor_budget_used(&self) -> u32 {
        self.gate.budget_used().await
    }

    /// Seed the configured population if nobody is active yet.
    pub async fn bootstrap(&self) -> Result<Vec<Agent>> {
        self.population
            .ensure_population(self.population_size, &Personality::ALL)
            .await
    }

    /// Cycle number following the newest recorded competition
    pub async fn next_cycle(&self) -> Result<u64> {
        let latest = self.store.list_competitions(1).await?;
        Ok(latest.first().map(|c| c.cycle + 1).unwrap_or(1))
    }

    /// Run one full cycle: compete, refresh fitness, maybe evolve, record.
    pub async fn run_competition_cycle(&self, cycle: u64) -> Result<CycleReport> {
        let _guard = RunGuard::acquire(&self.running)?;

        let agents = self.population.list_active().await?;
        if agents.is_empty() {
            return Err(ArenaError::NoActiveAgents);
        }
        let window = self.market.recent_window(self.window_size).await?;
        if window.is_empty() {
            warn!(cycle, "market window empty, classifying as flat");
        }

        let mut rng = self.rng.lock().await;
        let result = self
            .orchestrator
            .run_competition(&agents, self.trades_per_agent, cycle, &window, &mut rng)
            .await?;

        let refreshed = self.fitness.update_all().await?;

        let scheduled = self.evolve_every > 0 && cycle % self.evolve_every == 0;
        let plan = if scheduled {
            self.evolution.plan(&refreshed, &mut rng).await?
        } else {
            None
        };
        drop(rng);

        let advisor_decisions = result.advisor_decisions;
        let fallback_decisions = result.fallback_decisions;
        let retried_units = result.retried_units;

        let committed = self
            .store
            .commit_cycle(&CycleCommit {
                competition: result.into_record(),
                evolution: plan,
            })
            .await?;
        if committed.replayed {
            info!(cycle, competition_id = %committed.competition.id, "cycle already recorded");
        }

        let evolution = match &committed.evolution {
            Some(applied) => Some(EvolutionReport::from(applied)),
            None if scheduled && !committed.replayed => Some(EvolutionReport::skipped()),
            None => None,
        };
        let competition = committed.competition;

        let survivors = self.population.list_active().await?;
        info!(
            namespace = self.store.namespace(),
            cycle,
            competition_id = %competition.id,
            winner = competition.winner_id.as_deref().unwrap_or("-"),
            eliminated = competition.eliminated_ids.len(),
            cloned = competition.cloned_ids.len(),
            population = survivors.len(),
            "cycle complete"
        );

        Ok(CycleReport {
            competition,
            evolution,
            advisor_decisions,
            fallback_decisions,
            retried_units,
            replayed: committed.replayed,
            survivors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::OfflineAdvisor;
    use crate::market::StaticMarket;
    use crate::store::{InMemoryPatternLibrary, InMemoryStore};

    fn arena(config: &AppConfig) -> Arena {
        Arena::new(
            config,
            Arc::new(InMemoryStore::new(config.population.namespace.clone())),
            Arc::new(InMemoryPatternLibrary::builtin().unwrap()),
            Arc::new(StaticMarket::from_prices(&[100.0, 101.0, 102.0], 500_000.0)),
            Arc::new(OfflineAdvisor),
        )
    }

    fn seeded_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.population.seed = Some(42);
        config.competition.trades_per_agent = 2;
        config
    }

    #[tokio::test]
    async fn test_cycle_without_agents_fails_and_releases_guard() {
        let arena = arena(&seeded_config());
        let err = arena.run_competition_cycle(1).await.unwrap_err();
        assert!(matches!(err, ArenaError::NoActiveAgents));
        assert!(!arena.is_running());
    }

    #[tokio::test]
    async fn test_cycle_records_competition() {
        let arena = arena(&seeded_config());
        arena.bootstrap().await.unwrap();

        let report = arena.run_competition_cycle(1).await.unwrap();
        assert_eq!(report.competition.participants.len(), 10);
        assert_eq!(report.competition.eliminated_ids.len(), 2);
        assert_eq!(report.competition.cloned_ids.len(), 2);
        assert_eq!(report.survivors.len(), 10);
        assert_eq!(report.fallback_decisions, 20);

        let stored = arena.store().list_competitions(5).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], report.competition);
        assert_eq!(arena.next_cycle().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cycle_commit_updates_competition_counters() {
        let arena = arena(&seeded_config());
        arena.bootstrap().await.unwrap();
        let report = arena.run_competition_cycle(1).await.unwrap();

        for entry in &report.competition.rankings {
            let agent = arena.store().get_agent(&entry.agent_id).await.unwrap();
            assert_eq!(agent.competitions_entered, 1);
            assert_eq!(agent.last_rank, Some(entry.rank));
            assert_eq!(agent.competitions_won, u32::from(entry.rank == 1));
        }
    }

    #[tokio::test]
    async fn test_evolution_respects_schedule() {
        let mut config = seeded_config();
        config.competition.evolve_every = 2;
        let arena = arena(&config);
        arena.bootstrap().await.unwrap();

        let first = arena.run_competition_cycle(1).await.unwrap();
        assert!(first.evolution.is_none());
        assert!(first.competition.eliminated_ids.is_empty());

        let second = arena.run_competition_cycle(2).await.unwrap();
        assert!(second.evolution.is_some());
        assert_eq!(second.competition.eliminated_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_guard_rejects_overlap() {
        let arena = arena(&seeded_config());
        let held = RunGuard::acquire(&arena.running).unwrap();
        let err = arena.run_competition_cycle(1).await.unwrap_err();
        assert!(matches!(err, ArenaError::CompetitionInProgress));
        drop(held);
        assert!(!arena.is_running());
    }
}
