pub mod advisor;
pub mod arena;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod market;
pub mod rng;
pub mod store;

pub use advisor::{AdvisorGate, FallbackAdvisor, OfflineAdvisor, RemoteAdvisor, StrategyAdvisor};
pub use arena::{Arena, CycleReport};
pub use config::AppConfig;
pub use error::{ArenaError, Result};
pub use market::{MarketSource, StaticMarket, SyntheticMarket};
pub use rng::SimRng;
pub use store::{InMemoryPatternLibrary, InMemoryStore, PatternLibrary, PopulationStore};
