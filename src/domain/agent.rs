use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trading temperament. Closed vocabulary; the advisor prompt and the
/// mutation step both draw from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Personality {
    Aggressive,
    Conservative,
    Balanced,
    Contrarian,
    MomentumChaser,
    Analytical,
}

impl Personality {
    pub const ALL: [Personality; 6] = [
        Personality::Aggressive,
        Personality::Conservative,
        Personality::Balanced,
        Personality::Contrarian,
        Personality::MomentumChaser,
        Personality::Analytical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Personality::Aggressive => "aggressive",
            Personality::Conservative => "conservative",
            Personality::Balanced => "balanced",
            Personality::Contrarian => "contrarian",
            Personality::MomentumChaser => "momentum_chaser",
            Personality::Analytical => "analytical",
        }
    }

    /// Short description fed to the advisor
    pub fn describe(&self) -> &'static str {
        match self {
            Personality::Aggressive => "takes concentrated bets on high-conviction patterns",
            Personality::Conservative => "prefers well-tested patterns with long track records",
            Personality::Balanced => "weighs track record and recent performance evenly",
            Personality::Contrarian => "looks for patterns the crowd undervalues",
            Personality::MomentumChaser => "favours patterns that align with the current trend",
            Personality::Analytical => "leans on its own accumulated knowledge before votes",
        }
    }
}

impl fmt::Display for Personality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Personality {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Personality::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown personality: {}", s))
    }
}

/// Agent lifecycle status. `Active -> Eliminated` is the only transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Eliminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Eliminated => "eliminated",
        }
    }

    pub fn can_transition_to(&self, target: AgentStatus) -> bool {
        matches!((self, target), (AgentStatus::Active, AgentStatus::Eliminated))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Eliminated)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for AgentStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "active" => Ok(AgentStatus::Active),
            "eliminated" => Ok(AgentStatus::Eliminated),
            _ => Err(format!("Unknown agent status: {}", s)),
        }
    }
}

/// Win/loss classification of a simulated trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Win,
    Loss,
}

impl Outcome {
    pub fn from_roi(roi: f64) -> Self {
        if roi > 0.0 {
            Outcome::Win
        } else {
            Outcome::Loss
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Win => "win",
            Outcome::Loss => "loss",
        }
    }

    pub fn is_win(&self) -> bool {
        matches!(self, Outcome::Win)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Outcome {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "win" => Ok(Outcome::Win),
            "loss" => Ok(Outcome::Loss),
            _ => Err(format!("Unknown outcome: {}", s)),
        }
    }
}

/// Performance counters accumulated by reflection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub total_roi: f64,
    pub avg_roi: f64,
}

impl AgentStats {
    /// Fold one resolved trade into the counters.
    pub fn record(&mut self, outcome: Outcome, roi: f64) {
        self.total_trades += 1;
        match outcome {
            Outcome::Win => self.winning_trades += 1,
            Outcome::Loss => self.losing_trades += 1,
        }
        self.total_roi += roi;
        self.avg_roi = self.total_roi / self.total_trades as f64;
    }

    pub fn win_rate(&self) -> Option<f64> {
        if self.total_trades == 0 {
            None
        } else {
            Some(self.winning_trades as f64 / self.total_trades as f64)
        }
    }
}

/// A simulated trading participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub generation: u32,
    pub parent_id: Option<String>,
    pub personality: Personality,
    pub stats: AgentStats,
    pub fitness: f64,
    pub competitions_entered: u32,
    pub competitions_won: u32,
    pub last_rank: Option<u32>,
    pub decisions_made: u32,
    pub reflections_made: u32,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub eliminated_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// Materialize a draft under a store-assigned id.
    pub fn from_draft(id: String, draft: AgentDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: draft.name,
            generation: draft.generation,
            parent_id: draft.parent_id,
            personality: draft.personality,
            stats: AgentStats::default(),
            fitness: 0.0,
            competitions_entered: 0,
            competitions_won: 0,
            last_rank: None,
            decisions_made: 0,
            reflections_made: 0,
            status: AgentStatus::Active,
            created_at,
            eliminated_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    /// Counters written by the reflection commit.
    pub fn apply_trade(&mut self, outcome: Outcome, roi: f64) {
        self.stats.record(outcome, roi);
        self.reflections_made += 1;
    }

    pub fn record_competition(&mut self, rank: u32) {
        self.competitions_entered += 1;
        if rank == 1 {
            self.competitions_won += 1;
        }
        self.last_rank = Some(rank);
    }

    pub fn eliminate(&mut self, at: DateTime<Utc>) -> Result<(), (AgentStatus, AgentStatus)> {
        if !self.status.can_transition_to(AgentStatus::Eliminated) {
            return Err((self.status, AgentStatus::Eliminated));
        }
        self.status = AgentStatus::Eliminated;
        self.eliminated_at = Some(at);
        Ok(())
    }
}

/// Everything needed to create an agent except its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDraft {
    pub name: String,
    pub generation: u32,
    pub parent_id: Option<String>,
    pub personality: Personality,
}

impl AgentDraft {
    pub fn founder(name: impl Into<String>, personality: Personality) -> Self {
        Self {
            name: name.into(),
            generation: 1,
            parent_id: None,
            personality,
        }
    }

    pub fn clone_of(parent: &Agent, personality: Personality) -> Self {
        let generation = parent.generation + 1;
        Self {
            name: format!("{} g{}", base_name(&parent.name), generation),
            generation,
            parent_id: Some(parent.id.clone()),
            personality,
        }
    }
}

/// Strip a trailing generation suffix so clone names don't accumulate them.
fn base_name(name: &str) -> &str {
    match name.rsplit_once(" g") {
        Some((base, suffix)) if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) => {
            base
        }
        _ => name,
    }
}

/// Agent id within a population namespace. Zero padding keeps lexicographic
/// order equal to creation order, which the ranking tie-break relies on.
pub fn agent_id(namespace: &str, seq: u64) -> String {
    format!("{}-a{:05}", namespace, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::from_draft(
            agent_id("test", 1),
            AgentDraft::founder("Balanced Trader #1", Personality::Balanced),
            Utc::now(),
        )
    }

    #[test]
    fn test_status_transitions() {
        assert!(AgentStatus::Active.can_transition_to(AgentStatus::Eliminated));
        assert!(!AgentStatus::Eliminated.can_transition_to(AgentStatus::Active));
        assert!(!AgentStatus::Eliminated.can_transition_to(AgentStatus::Eliminated));
        assert!(AgentStatus::Eliminated.is_terminal());
    }

    #[test]
    fn test_eliminate_is_terminal() {
        let mut a = agent();
        assert!(a.eliminate(Utc::now()).is_ok());
        assert!(a.eliminated_at.is_some());
        assert!(a.eliminate(Utc::now()).is_err());
    }

    #[test]
    fn test_apply_trade_keeps_counters_consistent() {
        let mut a = agent();
        a.apply_trade(Outcome::Win, 4.0);
        a.apply_trade(Outcome::Loss, -1.0);
        a.apply_trade(Outcome::Win, 0.5);

        assert_eq!(a.stats.total_trades, 3);
        assert_eq!(
            a.stats.total_trades,
            a.stats.winning_trades + a.stats.losing_trades
        );
        assert!((a.stats.total_roi - 3.5).abs() < 1e-12);
        assert!((a.stats.avg_roi - 3.5 / 3.0).abs() < 1e-12);
        assert_eq!(a.reflections_made, 3);
    }

    #[test]
    fn test_record_competition() {
        let mut a = agent();
        a.record_competition(1);
        a.record_competition(3);
        assert_eq!(a.competitions_entered, 2);
        assert_eq!(a.competitions_won, 1);
        assert_eq!(a.last_rank, Some(3));
    }

    #[test]
    fn test_outcome_from_roi() {
        assert_eq!(Outcome::from_roi(0.01), Outcome::Win);
        assert_eq!(Outcome::from_roi(0.0), Outcome::Loss);
        assert_eq!(Outcome::from_roi(-2.0), Outcome::Loss);
    }

    #[test]
    fn test_agent_ids_sort_by_sequence() {
        assert!(agent_id("pop", 9) < agent_id("pop", 10));
        assert_eq!(agent_id("pop", 42), "pop-a00042");
    }

    #[test]
    fn test_clone_name_does_not_stack_suffixes() {
        let mut parent = agent();
        parent.name = "Balanced Trader #1 g3".to_string();
        parent.generation = 3;
        let draft = AgentDraft::clone_of(&parent, Personality::Balanced);
        assert_eq!(draft.name, "Balanced Trader #1 g4");
        assert_eq!(draft.generation, 4);
    }

    #[test]
    fn test_personality_round_trip() {
        for p in Personality::ALL {
            assert_eq!(Personality::try_from(p.as_str()).unwrap(), p);
        }
        assert!(Personality::try_from("reckless").is_err());
    }
}
