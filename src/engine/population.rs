use std::sync::Arc;
use tracing::info;

use crate::domain::{Agent, AgentDraft, Personality};
use crate::error::{ArenaError, Result};
use crate::store::PopulationStore;

/// Display name for a founder, e.g. "Momentum Chaser Trader #3"
pub fn founder_name(personality: Personality, index: usize) -> String {
    let title: Vec<String> = personality
        .as_str()
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    format!("{} Trader #{}", title.join(" "), index)
}

pub struct PopulationManager {
    store: Arc<dyn PopulationStore>,
}

impl PopulationManager {
    pub fn new(store: Arc<dyn PopulationStore>) -> Self {
        Self { store }
    }

    /// Create `size` generation-1 agents, personalities assigned round-robin
    /// over `vocabulary`.
    pub async fn initialize_population(
        &self,
        size: usize,
        vocabulary: &[Personality],
    ) -> Result<Vec<Agent>> {
        if size < 1 {
            return Err(ArenaError::InvalidPopulationSize(size));
        }
        if vocabulary.is_empty() {
            return Err(ArenaError::Validation(
                "personality vocabulary is empty".to_string(),
            ));
        }

        let mut agents = Vec::with_capacity(size);
        for i in 0..size {
            let personality = vocabulary[i % vocabulary.len()];
            let draft = AgentDraft::founder(founder_name(personality, i + 1), personality);
            agents.push(self.store.create_agent(draft).await?);
        }

        info!(
            namespace = self.store.namespace(),
            size,
            "population initialized"
        );
        Ok(agents)
    }

    /// Active agents, fitness desc, ties by id asc
    pub async fn list_active(&self) -> Result<Vec<Agent>> {
        self.store.list_active().await
    }

    /// Seed a fresh population only if nobody is left active. Returns the
    /// agents created (empty when the population was still alive).
    pub async fn ensure_population(
        &self,
        size: usize,
        vocabulary: &[Personality],
    ) -> Result<Vec<Agent>> {
        if !self.store.list_active().await?.is_empty() {
            return Ok(Vec::new());
        }
        info!(namespace = self.store.namespace(), "no active agents, re-seeding");
        self.initialize_population(size, vocabulary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_founder_name() {
        assert_eq!(
            founder_name(Personality::MomentumChaser, 3),
            "Momentum Chaser Trader #3"
        );
        assert_eq!(founder_name(Personality::Aggressive, 1), "Aggressive Trader #1");
    }

    #[tokio::test]
    async fn test_initialize_round_robin() {
        let manager = PopulationManager::new(Arc::new(InMemoryStore::new("pm")));
        let vocab = [Personality::Aggressive, Personality::Conservative];
        let agents = manager.initialize_population(5, &vocab).await.unwrap();

        assert_eq!(agents.len(), 5);
        let personalities: Vec<Personality> = agents.iter().map(|a| a.personality).collect();
        assert_eq!(
            personalities,
            vec![
                Personality::Aggressive,
                Personality::Conservative,
                Personality::Aggressive,
                Personality::Conservative,
                Personality::Aggressive,
            ]
        );
        assert!(agents.iter().all(|a| a.generation == 1 && a.is_active()));
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_input() {
        let manager = PopulationManager::new(Arc::new(InMemoryStore::new("pm")));
        assert!(matches!(
            manager.initialize_population(0, &Personality::ALL).await,
            Err(ArenaError::InvalidPopulationSize(0))
        ));
        assert!(matches!(
            manager.initialize_population(3, &[]).await,
            Err(ArenaError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_population_only_seeds_empty() {
        let manager = PopulationManager::new(Arc::new(InMemoryStore::new("pm")));
        assert_eq!(manager.ensure_population(3, &Personality::ALL).await.unwrap().len(), 3);
        assert!(manager.ensure_population(3, &Personality::ALL).await.unwrap().is_empty());
        assert_eq!(manager.list_active().await.unwrap().len(), 3);
    }
}
