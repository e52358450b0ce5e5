//! Persistence seams: the population store (agents, memories, knowledge,
//! competitions, lineage) and the read-only pattern library.

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryPatternLibrary, InMemoryStore, WriteOp};
pub use postgres::{PostgresPatternLibrary, PostgresStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Agent, AgentDraft, Competition, Knowledge, LineageEdge, Memory, Pattern, Resolution,
};
use crate::error::Result;

/// Everything a reflection writes, applied as one atomic unit
#[derive(Debug, Clone)]
pub struct ReflectionCommit {
    pub agent_id: String,
    pub memory_id: String,
    pub resolution: Resolution,
    /// Fully computed rows, replacing any existing (agent, pattern) row
    pub knowledge: Vec<Knowledge>,
}

/// One clone to create during evolution
#[derive(Debug, Clone)]
pub struct PlannedClone {
    pub draft: AgentDraft,
    /// Lineage note for the parent -> clone edge
    pub mutation: String,
}

/// Culls and clones of one evolution pass, validated and written together
#[derive(Debug, Clone)]
pub struct EvolutionPlan {
    pub eliminate: Vec<String>,
    pub clones: Vec<PlannedClone>,
    /// Copy each parent's knowledge rows onto its clone
    pub inherit_knowledge: bool,
    pub at: DateTime<Utc>,
}

/// What the store wrote for an evolution plan
#[derive(Debug, Clone, Default)]
pub struct AppliedEvolution {
    pub eliminated: Vec<String>,
    pub cloned: Vec<Agent>,
    pub lineage: Vec<LineageEdge>,
}

/// The closing write of a cycle: ranking counters, optional evolution and the
/// competition record. `eliminated_ids` and `cloned_ids` on the record are
/// filled in by the store from the applied evolution.
#[derive(Debug, Clone)]
pub struct CycleCommit {
    pub competition: Competition,
    pub evolution: Option<EvolutionPlan>,
}

#[derive(Debug, Clone)]
pub struct CommittedCycle {
    pub competition: Competition,
    pub evolution: Option<AppliedEvolution>,
    /// True when the cycle number was already recorded and nothing was written
    pub replayed: bool,
}

/// Result of recording a pending decision
#[derive(Debug, Clone)]
pub struct RecordedDecision {
    pub memory: Memory,
    /// False when a memory with the same id already existed and was returned as-is
    pub created: bool,
}

#[async_trait]
pub trait PopulationStore: Send + Sync {
    /// Identifier namespace this store is bound to
    fn namespace(&self) -> &str;

    // ---- agents ----

    /// Assign the next namespaced id and insert an active agent.
    async fn create_agent(&self, draft: AgentDraft) -> Result<Agent>;

    async fn get_agent(&self, id: &str) -> Result<Agent>;

    /// Active agents, fitness desc then id asc
    async fn list_active(&self) -> Result<Vec<Agent>>;

    /// All agents including eliminated ones, id asc
    async fn list_agents(&self) -> Result<Vec<Agent>>;

    async fn update_fitness(&self, id: &str, fitness: f64) -> Result<()>;

    /// Eliminate, create clones, copy knowledge and insert lineage edges in
    /// one atomic step. Eliminating a non-active agent is
    /// `InvalidStateTransition` and fails the whole plan unwritten.
    async fn apply_evolution(&self, plan: &EvolutionPlan) -> Result<AppliedEvolution>;

    // ---- memories ----

    /// Insert a pending memory and bump the agent's decision counter together.
    /// An existing memory with the same id is returned unchanged.
    async fn record_decision(&self, memory: &Memory) -> Result<RecordedDecision>;

    async fn get_memory(&self, id: &str) -> Result<Memory>;

    /// Resolved winning memories of one agent, newest first
    async fn recent_winning_memories(&self, agent_id: &str, limit: usize) -> Result<Vec<Memory>>;

    /// All memories of one agent, oldest first
    async fn memories_of(&self, agent_id: &str) -> Result<Vec<Memory>>;

    /// Resolve the memory, upsert knowledge and update agent counters in one
    /// atomic step. Fails with `MemoryAlreadyResolved` without writing anything
    /// if the memory already carries a resolution.
    async fn commit_reflection(&self, commit: &ReflectionCommit) -> Result<Agent>;

    // ---- knowledge ----

    /// Existing rows of one agent for the given patterns
    async fn knowledge_for(&self, agent_id: &str, pattern_ids: &[String]) -> Result<Vec<Knowledge>>;

    /// Confidence desc, times validated desc
    async fn top_knowledge(&self, agent_id: &str, limit: usize) -> Result<Vec<Knowledge>>;

    async fn upsert_knowledge(&self, rows: &[Knowledge]) -> Result<()>;

    // ---- history ----

    /// Close a cycle atomically: per-agent competition counters (entered+1,
    /// won+1 iff rank 1, last rank), the evolution plan and the record.
    /// A cycle number that already has a record is returned as a replay
    /// without writing anything.
    async fn commit_cycle(&self, commit: &CycleCommit) -> Result<CommittedCycle>;

    /// Record of one cycle number, if it was committed
    async fn competition_for_cycle(&self, cycle: u64) -> Result<Option<Competition>>;

    /// Newest first
    async fn list_competitions(&self, limit: usize) -> Result<Vec<Competition>>;

    /// Edges where the agent is ancestor or descendant
    async fn lineage_of(&self, agent_id: &str) -> Result<Vec<LineageEdge>>;
}

/// Read-only view of the shared pattern library
#[async_trait]
pub trait PatternLibrary: Send + Sync {
    /// Best patterns first: vote ratio desc, h2h wins desc, id asc
    async fn top_patterns(&self, limit: usize) -> Result<Vec<Pattern>>;

    /// Patterns for the given ids; unknown ids are omitted
    async fn patterns_by_ids(&self, ids: &[String]) -> Result<Vec<Pattern>>;
}
