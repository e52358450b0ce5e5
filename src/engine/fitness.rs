use std::sync::Arc;
use tracing::debug;

use crate::domain::Agent;
use crate::error::Result;
use crate::store::PopulationStore;

/// Trades at which the experience term saturates
const EXPERIENCE_TRADES: f64 = 50.0;

/// Composite fitness score, never negative.
///
/// `win_rate*50 + avg_roi*10 + min(1, trades/50)*20 + sharpe_like*10` where
/// `sharpe_like = avg_roi / max(1, |avg_roi|*0.1)`. An agent without trades
/// scores exactly 0.
pub fn fitness(agent: &Agent) -> f64 {
    let stats = &agent.stats;
    let win_rate = match stats.win_rate() {
        Some(rate) => rate,
        None => return 0.0,
    };
    let avg_roi = stats.avg_roi;
    let experience = (stats.total_trades as f64 / EXPERIENCE_TRADES).min(1.0);
    let sharpe_like = avg_roi / (avg_roi.abs() * 0.1).max(1.0);

    let score = win_rate * 50.0 + avg_roi * 10.0 + experience * 20.0 + sharpe_like * 10.0;
    if score.is_finite() {
        score.max(0.0)
    } else {
        0.0
    }
}

pub struct FitnessEvaluator {
    store: Arc<dyn PopulationStore>,
}

impl FitnessEvaluator {
    pub fn new(store: Arc<dyn PopulationStore>) -> Self {
        Self { store }
    }

    /// Recompute and persist fitness for every active agent. Returns the
    /// refreshed agents in list order (fitness desc, id asc).
    pub async fn update_all(&self) -> Result<Vec<Agent>> {
        let mut agents = self.store.list_active().await?;
        for agent in agents.iter_mut() {
            let score = fitness(agent);
            if score != agent.fitness {
                self.store.update_fitness(&agent.id, score).await?;
                agent.fitness = score;
            }
        }
        sort_by_fitness(&mut agents);
        debug!(agents = agents.len(), "fitness updated");
        Ok(agents)
    }
}

/// Fitness desc, lower id first on ties
pub fn sort_by_fitness(agents: &mut [Agent]) {
    agents.sort_by(|a, b| {
        b.fitness
            .partial_cmp(&a.fitness)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{agent_id, AgentDraft, Outcome, Personality};
    use crate::store::InMemoryStore;
    use chrono::Utc;

    fn agent() -> Agent {
        Agent::from_draft(
            agent_id("fit", 1),
            AgentDraft::founder("F", Personality::Balanced),
            Utc::now(),
        )
    }

    #[test]
    fn test_no_trades_scores_zero() {
        assert_eq!(fitness(&agent()), 0.0);
    }

    #[test]
    fn test_formula() {
        let mut a = agent();
        a.apply_trade(Outcome::Win, 4.0);
        a.apply_trade(Outcome::Loss, -2.0);
        // win_rate 0.5, avg 1.0, experience 2/50, sharpe 1.0
        let expected = 0.5 * 50.0 + 1.0 * 10.0 + (2.0 / 50.0) * 20.0 + 1.0 * 10.0;
        assert!((fitness(&a) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_large_roi_sharpe_saturates() {
        let mut a = agent();
        a.apply_trade(Outcome::Win, 50.0);
        // sharpe_like = 50 / 5 = 10
        let expected = 50.0 + 500.0 + (1.0 / 50.0) * 20.0 + 100.0;
        assert!((fitness(&a) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_losing_agent_floors_at_zero() {
        let mut a = agent();
        for _ in 0..5 {
            a.apply_trade(Outcome::Loss, -8.0);
        }
        assert_eq!(fitness(&a), 0.0);
    }

    #[tokio::test]
    async fn test_update_all_persists() {
        let store = Arc::new(InMemoryStore::new("fit"));
        let mut a = agent();
        a.apply_trade(Outcome::Win, 3.0);
        store.put_agent(a.clone()).await;

        let evaluator = FitnessEvaluator::new(store.clone());
        let updated = evaluator.update_all().await.unwrap();
        assert_eq!(updated.len(), 1);
        let stored = store.get_agent(&a.id).await.unwrap();
        assert_eq!(stored.fitness, fitness(&a));
        assert!(stored.fitness > 0.0);
    }
}
