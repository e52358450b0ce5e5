use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tracing::info;

use super::fitness::{fitness, sort_by_fitness};
use crate::config::EvolutionPolicy;
use crate::domain::{Agent, AgentDraft, LineageEdge, Personality};
use crate::error::{ArenaError, Result};
use crate::rng::SimRng;
use crate::store::{AppliedEvolution, PlannedClone, EvolutionPlan, PopulationStore};

/// What one evolution pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvolutionReport {
    /// Set when the population was too small to evolve
    pub skipped: bool,
    pub eliminated: Vec<String>,
    pub cloned: Vec<String>,
    pub lineage: Vec<LineageEdge>,
}

impl EvolutionReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

impl From<&AppliedEvolution> for EvolutionReport {
    fn from(applied: &AppliedEvolution) -> Self {
        Self {
            skipped: false,
            eliminated: applied.eliminated.clone(),
            cloned: applied.cloned.iter().map(|a| a.id.clone()).collect(),
            lineage: applied.lineage.clone(),
        }
    }
}

/// Culls the weakest agents and clones the strongest
pub struct EvolutionController {
    store: Arc<dyn PopulationStore>,
    policy: EvolutionPolicy,
}

impl EvolutionController {
    pub fn new(store: Arc<dyn PopulationStore>, policy: EvolutionPolicy) -> Self {
        Self { store, policy }
    }

    /// Agents eliminated (and cloned) for a population of `n`
    pub fn selection_size(&self, n: usize) -> usize {
        ((n as f64 * self.policy.selection_fraction).floor() as usize).max(1)
    }

    /// Rank the population and decide who is culled and who is cloned.
    /// Only fitness is written here; the plan itself is applied by the store
    /// in one step. `None` when the population is too small.
    pub async fn plan(&self, active: &[Agent], rng: &mut SimRng) -> Result<Option<EvolutionPlan>> {
        let n = active.len();
        if n < self.policy.min_population {
            let reason = ArenaError::InsufficientPopulation {
                active: n,
                required: self.policy.min_population,
            };
            info!(reason = %reason, "evolution skipped");
            return Ok(None);
        }

        let mut ranked: Vec<Agent> = active.to_vec();
        for agent in ranked.iter_mut() {
            let score = fitness(agent);
            if score != agent.fitness {
                self.store.update_fitness(&agent.id, score).await?;
                agent.fitness = score;
            }
        }
        sort_by_fitness(&mut ranked);

        let k = self.selection_size(n);
        let eliminate = ranked.iter().rev().take(k).map(|a| a.id.clone()).collect();
        let clones = ranked
            .iter()
            .take(k)
            .map(|parent| {
                let (personality, mutation) = self.mutate(parent.personality, rng);
                PlannedClone {
                    draft: AgentDraft::clone_of(parent, personality),
                    mutation,
                }
            })
            .collect();

        Ok(Some(EvolutionPlan {
            eliminate,
            clones,
            inherit_knowledge: self.policy.inherit_knowledge,
            at: Utc::now(),
        }))
    }

    /// Plan and apply one evolution pass. A failed write leaves the
    /// population exactly as it was.
    pub async fn evolve(&self, active: &[Agent], rng: &mut SimRng) -> Result<EvolutionReport> {
        let Some(plan) = self.plan(active, rng).await? else {
            return Ok(EvolutionReport::skipped());
        };
        let report = EvolutionReport::from(&self.store.apply_evolution(&plan).await?);
        info!(
            population = active.len(),
            eliminated = ?report.eliminated,
            cloned = ?report.cloned,
            "evolution complete"
        );
        Ok(report)
    }

    /// One coin flip against the mutation rate; on heads the personality is
    /// re-drawn uniformly from the full vocabulary.
    fn mutate(&self, inherited: Personality, rng: &mut SimRng) -> (Personality, String) {
        let roll: f64 = rng.gen();
        if roll >= self.policy.mutation_rate {
            return (inherited, format!("inherited personality {}", inherited));
        }
        let drawn = Personality::ALL
            .choose(rng)
            .copied()
            .unwrap_or(inherited);
        let note = if drawn == inherited {
            format!("personality re-drawn, kept {}", drawn)
        } else {
            format!("personality mutated {} -> {}", inherited, drawn)
        };
        (drawn, note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{agent_id, AgentStatus, FeedbackTag, Knowledge, Outcome};
    use crate::store::{InMemoryStore, WriteOp};

    async fn population(store: &InMemoryStore, n: usize) -> Vec<Agent> {
        let mut out = Vec::new();
        for i in 0..n {
            let mut agent = Agent::from_draft(
                agent_id("evo", i as u64 + 1),
                AgentDraft::founder(format!("E{}", i), Personality::ALL[i % 6]),
                Utc::now(),
            );
            // distinct fitness: agent i wins i of 10 trades
            for t in 0..10 {
                if t < i {
                    agent.apply_trade(Outcome::Win, 1.0);
                } else {
                    agent.apply_trade(Outcome::Loss, -0.5);
                }
            }
            agent.fitness = fitness(&agent);
            store.put_agent(agent.clone()).await;
            out.push(agent);
        }
        out
    }

    #[tokio::test]
    async fn test_small_population_is_untouched() {
        let store = Arc::new(InMemoryStore::new("evo"));
        let roster = population(&store, 4).await;
        let controller = EvolutionController::new(store.clone(), EvolutionPolicy::default());

        let report = controller.evolve(&roster, &mut SimRng::seeded(1)).await.unwrap();
        assert!(report.skipped);
        assert!(report.lineage.is_empty());
        assert_eq!(store.list_active().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_culls_bottom_and_clones_top() {
        let store = Arc::new(InMemoryStore::new("evo"));
        let roster = population(&store, 10).await;
        let controller = EvolutionController::new(store.clone(), EvolutionPolicy::default());

        let report = controller.evolve(&roster, &mut SimRng::seeded(8)).await.unwrap();
        assert_eq!(report.eliminated, vec!["evo-a00001", "evo-a00002"]);
        assert_eq!(report.cloned.len(), 2);
        assert_eq!(store.list_active().await.unwrap().len(), 10);

        let parents: Vec<&str> = report.lineage.iter().map(|e| e.ancestor_id.as_str()).collect();
        assert_eq!(parents, vec!["evo-a00010", "evo-a00009"]);
        for edge in &report.lineage {
            assert_eq!(edge.generation_gap, 1);
            let child = store.get_agent(&edge.descendant_id).await.unwrap();
            assert_eq!(child.generation, 2);
            assert_eq!(child.parent_id.as_deref(), Some(edge.ancestor_id.as_str()));
            assert_eq!(child.status, AgentStatus::Active);
        }
    }

    #[tokio::test]
    async fn test_clone_inherits_knowledge() {
        let store = Arc::new(InMemoryStore::new("evo"));
        let roster = population(&store, 5).await;
        let mut k = Knowledge::new("evo-a00005", "pat-x");
        k.apply_feedback(FeedbackTag::IncreasePreference, Outcome::Win, Utc::now());
        store.upsert_knowledge(&[k]).await.unwrap();

        let controller = EvolutionController::new(store.clone(), EvolutionPolicy::default());
        let report = controller.evolve(&roster, &mut SimRng::seeded(2)).await.unwrap();

        let child = &report.cloned[0];
        let rows = store.top_knowledge(child, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pattern_id, "pat-x");
        assert_eq!(rows[0].times_validated, 1);
    }

    #[tokio::test]
    async fn test_failed_clone_write_keeps_population() {
        let store = Arc::new(InMemoryStore::new("evo"));
        let roster = population(&store, 10).await;
        store.inject_failures(WriteOp::CreateAgent, 1).await;
        let controller = EvolutionController::new(store.clone(), EvolutionPolicy::default());

        let err = controller
            .evolve(&roster, &mut SimRng::seeded(8))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.list_active().await.unwrap().len(), 10);
        assert_eq!(store.list_agents().await.unwrap().len(), 10);
        for agent in &roster {
            assert!(store.lineage_of(&agent.id).await.unwrap().is_empty());
        }

        // the retry culls exactly one selection's worth
        let report = controller.evolve(&roster, &mut SimRng::seeded(8)).await.unwrap();
        assert_eq!(report.eliminated, vec!["evo-a00001", "evo-a00002"]);
        assert_eq!(store.list_active().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_plan_does_not_touch_population() {
        let store = Arc::new(InMemoryStore::new("evo"));
        let roster = population(&store, 6).await;
        let controller = EvolutionController::new(store.clone(), EvolutionPolicy::default());

        let plan = controller
            .plan(&roster, &mut SimRng::seeded(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.eliminate, vec!["evo-a00001"]);
        assert_eq!(plan.clones.len(), 1);
        assert_eq!(plan.clones[0].draft.parent_id.as_deref(), Some("evo-a00006"));
        assert_eq!(store.list_active().await.unwrap().len(), 6);
        assert_eq!(store.list_agents().await.unwrap().len(), 6);
    }

    #[test]
    fn test_selection_size() {
        let controller = EvolutionController::new(
            Arc::new(InMemoryStore::new("evo")),
            EvolutionPolicy::default(),
        );
        assert_eq!(controller.selection_size(5), 1);
        assert_eq!(controller.selection_size(10), 2);
        assert_eq!(controller.selection_size(14), 2);
        assert_eq!(controller.selection_size(15), 3);
    }
}
