use async_trait::async_trait;

use super::{DecisionAdvice, DecisionContext, ReflectionAdvice, ReflectionContext, StrategyAdvisor};
use crate::error::{ArenaError, Result};

/// Advisor used when no remote endpoint is configured. Always unavailable, so
/// every decision and reflection takes the fallback path.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineAdvisor;

#[async_trait]
impl StrategyAdvisor for OfflineAdvisor {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn decide(&self, _ctx: &DecisionContext) -> Result<DecisionAdvice> {
        Err(ArenaError::OracleUnavailable("offline advisor".to_string()))
    }

    async fn reflect(&self, _ctx: &ReflectionContext) -> Result<ReflectionAdvice> {
        Err(ArenaError::OracleUnavailable("offline advisor".to_string()))
    }
}
