//! Command-line surface for the arena binary.

pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::advisor::{OfflineAdvisor, RemoteAdvisor, StrategyAdvisor};
use crate::arena::{Arena, CycleReport};
use crate::config::AppConfig;
use crate::domain::Personality;
use crate::market::{MarketSource, PostgresMarket, SyntheticMarket};
use crate::store::{
    InMemoryPatternLibrary, InMemoryStore, PatternLibrary, PopulationStore,
    PostgresPatternLibrary, PostgresStore,
};

use output::{
    print_item, print_items, CompetitionRow, LeaderboardRow, LineageRow, OutputMode,
};

#[derive(Parser)]
#[command(name = "chaos-arena")]
#[command(version)]
#[command(about = "Evolutionary trading-agent competition arena", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and environment overrides
    #[arg(long, default_value = "config", global = true)]
    pub config_dir: PathBuf,

    /// Explicit config file, replaces the layered directory lookup
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print listings as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Seed the population if no agent is active
    Init {
        /// Override population.size
        #[arg(long)]
        size: Option<usize>,
    },
    /// Run a single competition cycle
    Cycle {
        /// Cycle number, defaults to the one after the latest competition
        #[arg(long)]
        cycle: Option<u64>,
    },
    /// Run cycles back to back until the count is reached or Ctrl-C
    Run {
        /// Number of cycles (0 = until interrupted)
        #[arg(long, default_value = "1")]
        cycles: u64,
        /// Pause between cycles
        #[arg(long, default_value = "0")]
        interval_secs: u64,
    },
    /// Active agents ranked by fitness
    Leaderboard {
        /// Include eliminated agents
        #[arg(long)]
        all: bool,
    },
    /// Ancestors and descendants of one agent
    Lineage { agent_id: String },
    /// Most recent competitions
    Competitions {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Load and validate configuration, then exit
    ConfigCheck,
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        OutputMode::from_json_flag(self.json)
    }

    pub fn load_config(&self) -> anyhow::Result<AppConfig> {
        let config = match &self.config {
            Some(path) => AppConfig::load_file(path)?,
            None => AppConfig::load_from(&self.config_dir)?,
        };
        Ok(config)
    }
}

/// Wire stores, pattern library, market source and advisor from config.
///
/// A configured `database.url` selects the Postgres backend; otherwise the
/// arena runs against the in-process store, which lives only as long as the
/// process.
pub async fn build_arena(config: &AppConfig) -> anyhow::Result<Arena> {
    let namespace = config.population.namespace.as_str();

    let (store, patterns, market): (
        Arc<dyn PopulationStore>,
        Arc<dyn PatternLibrary>,
        Arc<dyn MarketSource>,
    ) = match &config.database.url {
        Some(url) => {
            let store = PostgresStore::new(url, config.database.max_connections, namespace).await?;
            store.ensure_schema().await?;
            let pool = store.pool().clone();
            let patterns: Arc<dyn PatternLibrary> = match &config.patterns.file {
                Some(path) => Arc::new(InMemoryPatternLibrary::from_json_file(path)?),
                None => Arc::new(PostgresPatternLibrary::new(pool.clone())),
            };
            info!(namespace, "using postgres backend");
            (
                Arc::new(store),
                patterns,
                Arc::new(PostgresMarket::new(pool, config.market.symbol.clone())),
            )
        }
        None => {
            let patterns = match &config.patterns.file {
                Some(path) => InMemoryPatternLibrary::from_json_file(path)?,
                None => InMemoryPatternLibrary::builtin()?,
            };
            info!(namespace, patterns = patterns.len(), "using in-memory backend");
            (
                Arc::new(InMemoryStore::new(namespace)),
                Arc::new(patterns),
                Arc::new(SyntheticMarket::from_config(&config.market, config.population.seed)),
            )
        }
    };

    let advisor: Arc<dyn StrategyAdvisor> = if config.advisor.is_configured() {
        info!(model = %config.advisor.model, "remote strategy advisor enabled");
        Arc::new(RemoteAdvisor::new(config.advisor.clone())?)
    } else {
        info!("strategy advisor disabled, decisions use the fallback");
        Arc::new(OfflineAdvisor)
    };

    Ok(Arena::new(config, store, patterns, market, advisor))
}

pub async fn run_init(arena: &Arena, size: Option<usize>, mode: OutputMode) -> anyhow::Result<()> {
    let created = match size {
        Some(size) => {
            arena
                .population()
                .ensure_population(size, &Personality::ALL)
                .await?
        }
        None => arena.bootstrap().await?,
    };
    if created.is_empty() {
        println!("population already active, nothing to do");
        return Ok(());
    }
    let rows: Vec<LeaderboardRow> = created
        .iter()
        .enumerate()
        .map(|(i, a)| LeaderboardRow::from_agent(i + 1, a))
        .collect();
    print_items(&rows, mode)
}

pub async fn run_cycle(arena: &Arena, cycle: Option<u64>, mode: OutputMode) -> anyhow::Result<()> {
    arena.bootstrap().await?;
    let cycle = match cycle {
        Some(c) => c,
        None => arena.next_cycle().await?,
    };
    let report = arena.run_competition_cycle(cycle).await?;
    print_cycle(&report, mode)
}

pub async fn run_loop(
    arena: &Arena,
    cycles: u64,
    interval: Duration,
    mode: OutputMode,
) -> anyhow::Result<()> {
    arena.bootstrap().await?;
    let mut completed = 0u64;

    loop {
        if cycles > 0 && completed >= cycles {
            break;
        }
        let cycle = arena.next_cycle().await?;
        let report = tokio::select! {
            result = arena.run_competition_cycle(cycle) => result?,
            _ = tokio::signal::ctrl_c() => {
                warn!(cycle, "interrupted, stopping");
                break;
            }
        };
        print_cycle(&report, mode)?;
        completed += 1;

        // evolution can leave nobody only if the population was tiny
        if report.survivors.is_empty() {
            arena.bootstrap().await?;
        }

        if !interval.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
    }

    info!(completed, "run finished");
    Ok(())
}

pub async fn show_leaderboard(arena: &Arena, all: bool, mode: OutputMode) -> anyhow::Result<()> {
    let agents = if all {
        let mut agents = arena.store().list_agents().await?;
        crate::engine::sort_by_fitness(&mut agents);
        agents
    } else {
        arena.population().list_active().await?
    };
    let rows: Vec<LeaderboardRow> = agents
        .iter()
        .enumerate()
        .map(|(i, a)| LeaderboardRow::from_agent(i + 1, a))
        .collect();
    print_items(&rows, mode)
}

pub async fn show_lineage(arena: &Arena, agent_id: &str, mode: OutputMode) -> anyhow::Result<()> {
    let edges = arena.store().lineage_of(agent_id).await?;
    let rows: Vec<LineageRow> = edges.iter().map(LineageRow::from).collect();
    print_items(&rows, mode)
}

pub async fn show_competitions(arena: &Arena, limit: usize, mode: OutputMode) -> anyhow::Result<()> {
    let competitions = arena.store().list_competitions(limit).await?;
    let rows: Vec<CompetitionRow> = competitions.iter().map(CompetitionRow::from).collect();
    print_items(&rows, mode)
}

fn print_cycle(report: &CycleReport, mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => print_item(&report.competition, mode),
        OutputMode::Table => {
            if report.replayed {
                println!("cycle {} was already recorded", report.competition.cycle);
            }
            println!(
                "cycle {}: winner {} | advisor {} / fallback {} decisions | eliminated {} | cloned {}",
                report.competition.cycle,
                report.winner_id().unwrap_or("-"),
                report.advisor_decisions,
                report.fallback_decisions,
                report.competition.eliminated_ids.len(),
                report.competition.cloned_ids.len(),
            );
            let rows: Vec<LeaderboardRow> = report
                .survivors
                .iter()
                .enumerate()
                .map(|(i, a)| LeaderboardRow::from_agent(i + 1, a))
                .collect();
            print_items(&rows, mode)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_cycle_with_global_json() {
        let cli = Cli::try_parse_from(["chaos-arena", "cycle", "--cycle", "7", "--json"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.output_mode(), OutputMode::Json);
        match cli.command {
            Commands::Cycle { cycle } => assert_eq!(cycle, Some(7)),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parses_run_defaults() {
        let cli = Cli::try_parse_from(["chaos-arena", "run"]).unwrap();
        match cli.command {
            Commands::Run {
                cycles,
                interval_secs,
            } => {
                assert_eq!(cycles, 1);
                assert_eq!(interval_secs, 0);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn test_parses_config_check() {
        let cli = Cli::try_parse_from(["chaos-arena", "config-check"]).unwrap();
        assert!(matches!(cli.command, Commands::ConfigCheck));
    }

    #[tokio::test]
    async fn test_build_arena_defaults_to_in_memory() {
        let mut config = AppConfig::default();
        config.population.seed = Some(5);
        config.population.size = 6;
        let arena = build_arena(&config).await.unwrap();
        let created = arena.bootstrap().await.unwrap();
        assert_eq!(created.len(), 6);
        assert!(created.iter().all(|a| a.id.starts_with("arena-a")));
    }
}
