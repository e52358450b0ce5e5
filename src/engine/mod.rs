//! Competition machinery: decide, execute, reflect, rank, evolve.

pub mod competition;
pub mod decision;
pub mod evolution;
pub mod executor;
pub mod fitness;
pub mod population;
pub mod reflection;

pub use competition::{CompetitionOrchestrator, CompetitionResult};
pub use decision::{DecisionEngine, DecisionSettings};
pub use evolution::{EvolutionController, EvolutionReport};
pub use executor::{simulate, TradeExecutor};
pub use fitness::{fitness, sort_by_fitness, FitnessEvaluator};
pub use population::{founder_name, PopulationManager};
pub use reflection::ReflectionEngine;
