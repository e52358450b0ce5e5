use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::MarketThresholds;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub population: PopulationConfig,
    #[serde(default)]
    pub competition: CompetitionConfig,
    #[serde(default)]
    pub advisor: AdvisorConfig,
    #[serde(default)]
    pub executor: ExecutorPolicy,
    #[serde(default)]
    pub evolution: EvolutionPolicy,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub patterns: PatternSourceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PopulationConfig {
    /// Identifier namespace isolating this population from others
    pub namespace: String,
    /// Agents created by `init` / re-seeding
    pub size: usize,
    /// RNG seed; unset means entropy
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            namespace: "arena".to_string(),
            size: 10,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompetitionConfig {
    /// Decision/execution/reflection cycles per agent per competition
    pub trades_per_agent: u32,
    /// Run evolution on every cycle divisible by this (0 disables)
    pub evolve_every: u64,
    /// K: candidate patterns offered to the advisor
    pub top_patterns: usize,
    /// J: knowledge rows offered to the advisor
    pub top_knowledge: usize,
    /// Recent winning memories offered to the advisor
    pub recent_wins: usize,
    /// Retries of one unit after a persistence failure
    pub max_unit_retries: u32,
}

impl Default for CompetitionConfig {
    fn default() -> Self {
        Self {
            trades_per_agent: 5,
            evolve_every: 1,
            top_patterns: 10,
            top_knowledge: 5,
            recent_wins: 3,
            max_unit_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    /// Use the remote advisor; when false every call takes the fallback path
    pub enabled: bool,
    /// OpenAI-compatible chat completions base URL
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Advisor calls allowed per UTC day
    pub daily_budget: u32,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
            daily_budget: 500,
            temperature: 0.7,
            max_tokens: 800,
        }
    }
}

impl AdvisorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_configured(&self) -> bool {
        self.enabled && !self.api_key.is_empty()
    }
}

/// Trade simulation constants. Empirical values with no derivation, kept as
/// policy rather than hard-coded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecutorPolicy {
    /// implied ROI = vote_ratio * scale - offset
    pub implied_roi_scale: f64,
    pub implied_roi_offset: f64,
    /// combination adjustment = (U(0,1) - bias) * scale, multi-pattern trades only
    pub combination_bias: f64,
    pub combination_scale: f64,
    /// noise ~ U(-amplitude, amplitude)
    pub noise_amplitude: f64,
    /// Assumed holding period for annualisation
    pub holding_period_hours: f64,
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self {
            implied_roi_scale: 10.0,
            implied_roi_offset: 2.0,
            combination_bias: 0.3,
            combination_scale: 5.0,
            noise_amplitude: 1.0,
            holding_period_hours: 24.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EvolutionPolicy {
    /// Below this many active agents evolution is skipped
    pub min_population: usize,
    /// Share of the population eliminated (and cloned) per evolution
    pub selection_fraction: f64,
    /// Probability a clone's personality is re-drawn
    pub mutation_rate: f64,
    /// Clones start with a copy of the parent's knowledge
    pub inherit_knowledge: bool,
}

impl Default for EvolutionPolicy {
    fn default() -> Self {
        Self {
            min_population: 5,
            selection_fraction: 0.2,
            mutation_rate: 0.3,
            inherit_knowledge: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Samples per classification window
    pub window_size: usize,
    /// Symbol read from the database market source
    pub symbol: String,
    /// Starting price of the synthetic random walk
    pub synthetic_start_price: f64,
    /// Per-step relative stddev of the synthetic walk
    pub synthetic_step_pct: f64,
    pub synthetic_base_volume: f64,
    #[serde(default)]
    pub thresholds: MarketThresholds,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            window_size: 24,
            symbol: "BTCUSDT".to_string(),
            synthetic_start_price: 100.0,
            synthetic_step_pct: 1.0,
            synthetic_base_volume: 250_000.0,
            thresholds: MarketThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PatternSourceConfig {
    /// JSON file with an array of patterns; used when no database is configured
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; unset runs on the in-memory store
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("ARENA_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (ARENA__ADVISOR__API_KEY, etc.)
            .add_source(
                Environment::with_prefix("ARENA")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load a single explicit file on top of the defaults
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(
                Environment::with_prefix("ARENA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.population.namespace.trim().is_empty() {
            errors.push("population.namespace must not be empty".to_string());
        }
        if self.population.size < 1 {
            errors.push("population.size must be at least 1".to_string());
        }

        if self.competition.trades_per_agent == 0 {
            errors.push("competition.trades_per_agent must be positive".to_string());
        }
        if self.competition.top_patterns < 2 {
            errors.push("competition.top_patterns must be at least 2".to_string());
        }

        if self.advisor.enabled && self.advisor.api_key.is_empty() {
            errors.push("advisor.enabled requires advisor.api_key".to_string());
        }
        if self.advisor.timeout_secs == 0 {
            errors.push("advisor.timeout_secs must be positive".to_string());
        }

        if self.executor.holding_period_hours <= 0.0 {
            errors.push("executor.holding_period_hours must be positive".to_string());
        }
        if self.executor.noise_amplitude < 0.0 {
            errors.push("executor.noise_amplitude must not be negative".to_string());
        }

        if !(0.0..=0.5).contains(&self.evolution.selection_fraction) {
            errors.push(
                "evolution.selection_fraction must be within [0, 0.5] so culled and cloned sets stay disjoint"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.evolution.mutation_rate) {
            errors.push("evolution.mutation_rate must be within [0, 1]".to_string());
        }
        if self.evolution.min_population < 2 {
            errors.push("evolution.min_population must be at least 2".to_string());
        }

        if self.market.window_size < 2 {
            errors.push("market.window_size must be at least 2".to_string());
        }
        let t = &self.market.thresholds;
        if t.volatility_medium_pct > t.volatility_high_pct {
            errors.push("market.thresholds: volatility medium above high".to_string());
        }
        if t.trend_weak_pct > t.trend_strong_pct {
            errors.push("market.thresholds: trend weak above strong".to_string());
        }
        if t.volume_medium > t.volume_high {
            errors.push("market.thresholds: volume medium above high".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(!cfg.advisor.is_configured());
        assert_eq!(cfg.executor.combination_bias, 0.3);
        assert_eq!(cfg.evolution.min_population, 5);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut cfg = AppConfig::default();
        cfg.population.size = 0;
        cfg.advisor.enabled = true;
        cfg.evolution.mutation_rate = 1.5;

        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[population]\nnamespace = \"lab\"\nsize = 12\nseed = 99\n\n[executor]\ncombination_bias = 0.25\n"
        )
        .unwrap();

        let cfg = AppConfig::load_file(file.path()).unwrap();
        assert_eq!(cfg.population.namespace, "lab");
        assert_eq!(cfg.population.seed, Some(99));
        assert_eq!(cfg.executor.combination_bias, 0.25);
        assert_eq!(cfg.executor.implied_roi_scale, 10.0);
    }

    #[test]
    fn test_shipped_defaults_match_code_defaults() {
        let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
        let cfg = AppConfig::load_file(dir.join("default.toml")).unwrap();
        let code = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.executor, code.executor);
        assert_eq!(cfg.evolution, code.evolution);
        assert_eq!(cfg.market.thresholds, code.market.thresholds);
        assert_eq!(cfg.competition.trades_per_agent, code.competition.trades_per_agent);
        assert_eq!(cfg.competition.trades_per_agent, 5);
    }
}
