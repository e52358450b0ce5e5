use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    retain_selected_feedback, validate_decision, DailyBudget, DecisionAdvice, DecisionContext,
    ReflectionAdvice, ReflectionContext, StrategyAdvisor,
};
use crate::error::{ArenaError, Result};

/// Wraps an advisor with the daily call budget, a per-call timeout and
/// response validation. Every error it returns is an advisor failure the
/// engines answer with the fallback path.
pub struct AdvisorGate {
    advisor: Arc<dyn StrategyAdvisor>,
    budget: Mutex<DailyBudget>,
    timeout: Duration,
}

impl AdvisorGate {
    pub fn new(advisor: Arc<dyn StrategyAdvisor>, daily_budget: u32, timeout: Duration) -> Self {
        Self {
            advisor,
            budget: Mutex::new(DailyBudget::new(daily_budget)),
            timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.advisor.name()
    }

    pub fn is_enabled(&self) -> bool {
        self.advisor.is_enabled()
    }

    /// Calls consumed so far today
    pub async fn budget_used(&self) -> u32 {
        self.budget.lock().await.used()
    }

    async fn admit(&self) -> Result<()> {
        if !self.advisor.is_enabled() {
            return Err(ArenaError::OracleUnavailable(format!(
                "{} advisor disabled",
                self.advisor.name()
            )));
        }
        let mut budget = self.budget.lock().await;
        budget
            .try_acquire(Utc::now().date_naive())
            .map_err(|(used, limit)| ArenaError::AdvisorBudgetExhausted { used, limit })
    }

    pub async fn decide(&self, ctx: &DecisionContext) -> Result<DecisionAdvice> {
        self.admit().await?;
        let advice = tokio::time::timeout(self.timeout, self.advisor.decide(ctx))
            .await
            .map_err(|_| {
                ArenaError::OracleUnavailable(format!("decide timed out after {:?}", self.timeout))
            })??;
        debug!(
            agent_id = %ctx.agent.id,
            advisor = self.advisor.name(),
            selected = ?advice.selected_patterns,
            "advisor decision received"
        );
        validate_decision(advice, &ctx.candidate_ids())
    }

    pub async fn reflect(&self, ctx: &ReflectionContext) -> Result<ReflectionAdvice> {
        self.admit().await?;
        let advice = tokio::time::timeout(self.timeout, self.advisor.reflect(ctx))
            .await
            .map_err(|_| {
                ArenaError::OracleUnavailable(format!("reflect timed out after {:?}", self.timeout))
            })??;
        Ok(retain_selected_feedback(
            advice,
            &ctx.memory.selected_patterns,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{AgentProfile, MockStrategyAdvisor};
    use crate::domain::{
        agent_id, Agent, AgentDraft, MarketCondition, Pattern, PatternConditions, Personality,
    };
    use async_trait::async_trait;

    fn pattern(id: &str) -> Pattern {
        Pattern {
            id: id.into(),
            name: id.into(),
            votes: 5,
            runs: 10,
            h2h_wins: 0,
            h2h_losses: 0,
            origin: "test".into(),
            conditions: PatternConditions::default(),
        }
    }

    fn context() -> DecisionContext {
        let agent = Agent::from_draft(
            agent_id("gate", 1),
            AgentDraft::founder("Gate Trader", Personality::Balanced),
            Utc::now(),
        );
        DecisionContext {
            agent: AgentProfile::from(&agent),
            cycle: 1,
            trade_index: 0,
            market: MarketCondition::flat(),
            patterns: vec![pattern("p1"), pattern("p2"), pattern("p3")],
            knowledge: vec![],
            recent_wins: vec![],
        }
    }

    fn mock_returning(selected: Vec<&'static str>) -> MockStrategyAdvisor {
        let mut mock = MockStrategyAdvisor::new();
        mock.expect_name().return_const("mock");
        mock.expect_is_enabled().return_const(true);
        mock.expect_decide().returning(move |_| {
            Ok(DecisionAdvice {
                selected_patterns: selected.iter().map(|s| s.to_string()).collect(),
                rationale: "mocked".into(),
                confidence: 0.8,
            })
        });
        mock
    }

    #[tokio::test]
    async fn test_valid_advice_passes_through() {
        let gate = AdvisorGate::new(
            Arc::new(mock_returning(vec!["p1", "p3"])),
            10,
            Duration::from_secs(1),
        );
        let advice = gate.decide(&context()).await.unwrap();
        assert_eq!(advice.selected_patterns, vec!["p1", "p3"]);
        assert_eq!(gate.budget_used().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_pattern_is_malformed() {
        let gate = AdvisorGate::new(
            Arc::new(mock_returning(vec!["p1", "nope"])),
            10,
            Duration::from_secs(1),
        );
        let err = gate.decide(&context()).await.unwrap_err();
        assert!(matches!(err, ArenaError::MalformedOracleResponse(_)));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_skips_advisor() {
        let mut mock = MockStrategyAdvisor::new();
        mock.expect_name().return_const("mock");
        mock.expect_is_enabled().return_const(true);
        mock.expect_decide().times(1).returning(|_| {
            Ok(DecisionAdvice {
                selected_patterns: vec!["p1".into(), "p2".into()],
                rationale: String::new(),
                confidence: 0.5,
            })
        });
        let gate = AdvisorGate::new(Arc::new(mock), 1, Duration::from_secs(1));

        assert!(gate.decide(&context()).await.is_ok());
        let err = gate.decide(&context()).await.unwrap_err();
        assert!(matches!(
            err,
            ArenaError::AdvisorBudgetExhausted { used: 1, limit: 1 }
        ));
    }

    #[tokio::test]
    async fn test_disabled_advisor_does_not_spend_budget() {
        let mut mock = MockStrategyAdvisor::new();
        mock.expect_name().return_const("mock");
        mock.expect_is_enabled().return_const(false);
        mock.expect_decide().never();
        let gate = AdvisorGate::new(Arc::new(mock), 5, Duration::from_secs(1));

        let err = gate.decide(&context()).await.unwrap_err();
        assert!(matches!(err, ArenaError::OracleUnavailable(_)));
        assert_eq!(gate.budget_used().await, 0);
    }

    struct SlowAdvisor;

    #[async_trait]
    impl StrategyAdvisor for SlowAdvisor {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn decide(&self, _ctx: &DecisionContext) -> Result<DecisionAdvice> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(ArenaError::Internal("unreachable".into()))
        }

        async fn reflect(&self, _ctx: &ReflectionContext) -> Result<ReflectionAdvice> {
            Err(ArenaError::Internal("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_unavailable() {
        let gate = AdvisorGate::new(Arc::new(SlowAdvisor), 5, Duration::from_millis(20));
        let err = gate.decide(&context()).await.unwrap_err();
        assert!(matches!(err, ArenaError::OracleUnavailable(msg) if msg.contains("timed out")));
    }
}
