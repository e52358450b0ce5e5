use thiserror::Error;

/// Main error type for the arena
#[derive(Error, Debug)]
pub enum ArenaError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Advisor errors (non-fatal, the engines fall back)
    #[error("Strategy advisor unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Malformed advisor response: {0}")]
    MalformedOracleResponse(String),

    #[error("Advisor daily budget exhausted ({used}/{limit})")]
    AdvisorBudgetExhausted { used: u32, limit: u32 },

    // Population errors
    #[error("Invalid population size: {0}")]
    InvalidPopulationSize(usize),

    #[error("Insufficient population: {active} active, {required} required")]
    InsufficientPopulation { active: usize, required: usize },

    #[error("No active agents")]
    NoActiveAgents,

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // Memory errors
    #[error("Memory not found: {0}")]
    MemoryNotFound(String),

    #[error("Memory already resolved: {0}")]
    MemoryAlreadyResolved(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Pattern library errors
    #[error("Pattern library is empty")]
    EmptyPatternLibrary,

    #[error("Pattern not found: {0}")]
    PatternNotFound(String),

    #[error("Competition already in progress")]
    CompetitionInProgress,

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ArenaError {
    /// Store failures that leave no committed state behind; the whole
    /// decision/execution/reflection unit can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArenaError::Persistence(_) | ArenaError::Database(_))
    }

    /// Advisor-side failures that the engines absorb with the fallback path.
    pub fn is_advisor_failure(&self) -> bool {
        matches!(
            self,
            ArenaError::OracleUnavailable(_)
                | ArenaError::MalformedOracleResponse(_)
                | ArenaError::AdvisorBudgetExhausted { .. }
                | ArenaError::Http(_)
                | ArenaError::Json(_)
        )
    }
}

/// Result type alias for ArenaError
pub type Result<T> = std::result::Result<T, ArenaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ArenaError::Persistence("disk full".into()).is_retryable());
        assert!(!ArenaError::NoActiveAgents.is_retryable());
        assert!(!ArenaError::MemoryAlreadyResolved("m".into()).is_retryable());
    }

    #[test]
    fn test_advisor_failure_classification() {
        assert!(ArenaError::OracleUnavailable("timeout".into()).is_advisor_failure());
        assert!(ArenaError::AdvisorBudgetExhausted { used: 5, limit: 5 }.is_advisor_failure());
        assert!(!ArenaError::EmptyPatternLibrary.is_advisor_failure());
    }

    #[test]
    fn test_error_display() {
        let err = ArenaError::InvalidStateTransition {
            from: "eliminated".into(),
            to: "eliminated".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: from eliminated to eliminated"
        );
    }
}
