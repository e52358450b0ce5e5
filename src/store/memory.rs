//! In-process store and pattern library backing tests and offline runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    AppliedEvolution, CommittedCycle, CycleCommit, EvolutionPlan, PatternLibrary,
    PopulationStore, RecordedDecision, ReflectionCommit,
};
use crate::domain::{
    agent_id, compare_knowledge, rank_patterns, Agent, AgentDraft, AgentStatus, Competition,
    Knowledge, LineageEdge, Memory, Pattern,
};
use crate::error::{ArenaError, Result};

const BUILTIN_PATTERNS: &str = include_str!("../../config/patterns.sample.json");

/// Store operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    CreateAgent,
    RecordDecision,
    CommitReflection,
    UpdateAgent,
    Knowledge,
    History,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    agents: BTreeMap<String, Agent>,
    memories: BTreeMap<String, Memory>,
    knowledge: BTreeMap<(String, String), Knowledge>,
    competitions: Vec<Competition>,
    lineage: Vec<LineageEdge>,
    faults: HashMap<WriteOp, u32>,
}

impl State {
    fn check_fault(&mut self, op: WriteOp) -> Result<()> {
        if let Some(remaining) = self.faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ArenaError::Persistence(format!("injected {:?} failure", op)));
            }
        }
        Ok(())
    }

    fn agent_mut(&mut self, id: &str) -> Result<&mut Agent> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| ArenaError::AgentNotFound(id.to_string()))
    }

    /// Next free namespaced id; ids already taken by fixtures are skipped.
    fn next_agent_id(&mut self, namespace: &str) -> String {
        loop {
            self.next_seq += 1;
            let candidate = agent_id(namespace, self.next_seq);
            if !self.agents.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn eliminate(&mut self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.agent_mut(id)?
            .eliminate(at)
            .map_err(|(from, to)| ArenaError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
    }

    fn validate_evolution(&self, plan: &EvolutionPlan) -> Result<()> {
        let mut seen = HashSet::new();
        for id in &plan.eliminate {
            let agent = self
                .agents
                .get(id)
                .ok_or_else(|| ArenaError::AgentNotFound(id.clone()))?;
            // a repeated id would be eliminated by the time it is reached again
            let from = if seen.insert(id.as_str()) {
                agent.status
            } else {
                AgentStatus::Eliminated
            };
            if !from.can_transition_to(AgentStatus::Eliminated) {
                return Err(ArenaError::InvalidStateTransition {
                    from: from.to_string(),
                    to: AgentStatus::Eliminated.to_string(),
                });
            }
        }
        for planned in &plan.clones {
            let parent = planned.draft.parent_id.as_deref().ok_or_else(|| {
                ArenaError::Validation(format!("clone {} has no parent", planned.draft.name))
            })?;
            if !self.agents.contains_key(parent) {
                return Err(ArenaError::AgentNotFound(parent.to_string()));
            }
        }
        Ok(())
    }

    /// Apply a plan that already passed `validate_evolution`.
    fn write_evolution(&mut self, namespace: &str, plan: &EvolutionPlan) -> Result<AppliedEvolution> {
        let mut applied = AppliedEvolution::default();
        for id in &plan.eliminate {
            self.eliminate(id, plan.at)?;
            applied.eliminated.push(id.clone());
        }

        for planned in &plan.clones {
            let parent_id = planned.draft.parent_id.clone().unwrap_or_default();
            let parent_generation = self
                .agents
                .get(&parent_id)
                .map(|p| p.generation)
                .ok_or_else(|| ArenaError::AgentNotFound(parent_id.clone()))?;

            let id = self.next_agent_id(namespace);
            let child = Agent::from_draft(id.clone(), planned.draft.clone(), plan.at);

            if plan.inherit_knowledge {
                let rows: Vec<Knowledge> = self
                    .knowledge
                    .values()
                    .filter(|k| k.agent_id == parent_id)
                    .map(|k| k.inherited_by(&id))
                    .collect();
                for row in rows {
                    self.knowledge
                        .insert((row.agent_id.clone(), row.pattern_id.clone()), row);
                }
            }

            let edge = LineageEdge {
                id: Uuid::new_v4().to_string(),
                ancestor_id: parent_id,
                descendant_id: id.clone(),
                generation_gap: child.generation.saturating_sub(parent_generation),
                mutation: planned.mutation.clone(),
                created_at: plan.at,
            };
            self.lineage.push(edge.clone());
            self.agents.insert(id, child.clone());
            applied.cloned.push(child);
            applied.lineage.push(edge);
        }
        Ok(applied)
    }
}

/// Population store held entirely in memory behind a tokio `RwLock`.
/// Every write takes the lock once, so multi-row operations are atomic.
pub struct InMemoryStore {
    namespace: String,
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: RwLock::new(State::default()),
        }
    }

    /// Make the next `count` calls of `op` fail with a persistence error.
    pub async fn inject_failures(&self, op: WriteOp, count: u32) {
        self.state.write().await.faults.insert(op, count);
    }

    /// Insert a fully formed agent, bypassing id assignment. Test fixtures use
    /// this to set up precomputed stats and fitness.
    pub async fn put_agent(&self, agent: Agent) {
        let mut state = self.state.write().await;
        state.agents.insert(agent.id.clone(), agent);
    }

    pub async fn memory_count(&self) -> usize {
        self.state.read().await.memories.len()
    }
}

#[async_trait]
impl PopulationStore for InMemoryStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_agent(&self, draft: AgentDraft) -> Result<Agent> {
        let mut state = self.state.write().await;
        state.check_fault(WriteOp::CreateAgent)?;
        let id = state.next_agent_id(&self.namespace);
        let agent = Agent::from_draft(id.clone(), draft, Utc::now());
        state.agents.insert(id, agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: &str) -> Result<Agent> {
        self.state
            .read()
            .await
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| ArenaError::AgentNotFound(id.to_string()))
    }

    async fn list_active(&self) -> Result<Vec<Agent>> {
        let state = self.state.read().await;
        let mut active: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| a.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.fitness
                .partial_cmp(&a.fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(active)
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.state.read().await.agents.values().cloned().collect())
    }

    async fn update_fitness(&self, id: &str, fitness: f64) -> Result<()> {
        let mut state = self.state.write().await;
        state.check_fault(WriteOp::UpdateAgent)?;
        state.agent_mut(id)?.fitness = fitness;
        Ok(())
    }

    async fn apply_evolution(&self, plan: &EvolutionPlan) -> Result<AppliedEvolution> {
        let mut state = self.state.write().await;
        state.check_fault(WriteOp::UpdateAgent)?;
        state.check_fault(WriteOp::CreateAgent)?;
        state.check_fault(WriteOp::History)?;
        state.validate_evolution(plan)?;
        state.write_evolution(&self.namespace, plan)
    }

    async fn record_decision(&self, memory: &Memory) -> Result<RecordedDecision> {
        let mut state = self.state.write().await;
        state.check_fault(WriteOp::RecordDecision)?;

        if let Some(existing) = state.memories.get(&memory.id) {
            debug!(memory_id = %memory.id, "decision already recorded");
            return Ok(RecordedDecision {
                memory: existing.clone(),
                created: false,
            });
        }

        state.agent_mut(&memory.agent_id)?.decisions_made += 1;
        state.memories.insert(memory.id.clone(), memory.clone());
        Ok(RecordedDecision {
            memory: memory.clone(),
            created: true,
        })
    }

    async fn get_memory(&self, id: &str) -> Result<Memory> {
        self.state
            .read()
            .await
            .memories
            .get(id)
            .cloned()
            .ok_or_else(|| ArenaError::MemoryNotFound(id.to_string()))
    }

    async fn recent_winning_memories(&self, agent_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let state = self.state.read().await;
        let mut wins: Vec<Memory> = state
            .memories
            .values()
            .filter(|m| m.agent_id == agent_id && m.outcome().map(|o| o.is_win()).unwrap_or(false))
            .cloned()
            .collect();
        wins.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.cycle.cmp(&a.cycle))
                .then_with(|| b.trade_index.cmp(&a.trade_index))
        });
        wins.truncate(limit);
        Ok(wins)
    }

    async fn memories_of(&self, agent_id: &str) -> Result<Vec<Memory>> {
        let state = self.state.read().await;
        let mut out: Vec<Memory> = state
            .memories
            .values()
            .filter(|m| m.agent_id == agent_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.cycle.cmp(&b.cycle).then_with(|| a.trade_index.cmp(&b.trade_index)));
        Ok(out)
    }

    async fn commit_reflection(&self, commit: &ReflectionCommit) -> Result<Agent> {
        let mut state = self.state.write().await;
        state.check_fault(WriteOp::CommitReflection)?;

        // validate everything before the first mutation
        let memory = state
            .memories
            .get(&commit.memory_id)
            .ok_or_else(|| ArenaError::MemoryNotFound(commit.memory_id.clone()))?;
        if !memory.is_pending() {
            return Err(ArenaError::MemoryAlreadyResolved(commit.memory_id.clone()));
        }
        if memory.agent_id != commit.agent_id {
            return Err(ArenaError::Validation(format!(
                "memory {} belongs to {}, not {}",
                commit.memory_id, memory.agent_id, commit.agent_id
            )));
        }
        if !state.agents.contains_key(&commit.agent_id) {
            return Err(ArenaError::AgentNotFound(commit.agent_id.clone()));
        }

        if let Some(memory) = state.memories.get_mut(&commit.memory_id) {
            memory.resolution = Some(commit.resolution.clone());
        }
        for row in &commit.knowledge {
            state
                .knowledge
                .insert((row.agent_id.clone(), row.pattern_id.clone()), row.clone());
        }
        let agent = state.agent_mut(&commit.agent_id)?;
        agent.apply_trade(commit.resolution.outcome, commit.resolution.roi);
        Ok(agent.clone())
    }

    async fn knowledge_for(&self, agent_id: &str, pattern_ids: &[String]) -> Result<Vec<Knowledge>> {
        let state = self.state.read().await;
        Ok(pattern_ids
            .iter()
            .filter_map(|pid| {
                state
                    .knowledge
                    .get(&(agent_id.to_string(), pid.clone()))
                    .cloned()
            })
            .collect())
    }

    async fn top_knowledge(&self, agent_id: &str, limit: usize) -> Result<Vec<Knowledge>> {
        let state = self.state.read().await;
        let mut rows: Vec<Knowledge> = state
            .knowledge
            .values()
            .filter(|k| k.agent_id == agent_id)
            .cloned()
            .collect();
        rows.sort_by(compare_knowledge);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn upsert_knowledge(&self, rows: &[Knowledge]) -> Result<()> {
        let mut state = self.state.write().await;
        state.check_fault(WriteOp::Knowledge)?;
        for row in rows {
            state
                .knowledge
                .insert((row.agent_id.clone(), row.pattern_id.clone()), row.clone());
        }
        Ok(())
    }

    async fn commit_cycle(&self, commit: &CycleCommit) -> Result<CommittedCycle> {
        let mut state = self.state.write().await;
        let cycle = commit.competition.cycle;
        if let Some(existing) = state.competitions.iter().find(|c| c.cycle == cycle) {
            debug!(cycle, competition_id = %existing.id, "cycle already recorded");
            return Ok(CommittedCycle {
                competition: existing.clone(),
                evolution: None,
                replayed: true,
            });
        }

        state.check_fault(WriteOp::History)?;
        state.check_fault(WriteOp::UpdateAgent)?;
        for entry in &commit.competition.rankings {
            if !state.agents.contains_key(&entry.agent_id) {
                return Err(ArenaError::AgentNotFound(entry.agent_id.clone()));
            }
        }
        if let Some(plan) = &commit.evolution {
            state.check_fault(WriteOp::CreateAgent)?;
            state.validate_evolution(plan)?;
        }

        for entry in &commit.competition.rankings {
            state.agent_mut(&entry.agent_id)?.record_competition(entry.rank);
        }
        let evolution = match &commit.evolution {
            Some(plan) => Some(state.write_evolution(&self.namespace, plan)?),
            None => None,
        };

        let mut competition = commit.competition.clone();
        if let Some(applied) = &evolution {
            competition.eliminated_ids = applied.eliminated.clone();
            competition.cloned_ids = applied.cloned.iter().map(|a| a.id.clone()).collect();
        }
        state.competitions.push(competition.clone());
        Ok(CommittedCycle {
            competition,
            evolution,
            replayed: false,
        })
    }

    async fn competition_for_cycle(&self, cycle: u64) -> Result<Option<Competition>> {
        let state = self.state.read().await;
        Ok(state.competitions.iter().find(|c| c.cycle == cycle).cloned())
    }

    async fn list_competitions(&self, limit: usize) -> Result<Vec<Competition>> {
        let state = self.state.read().await;
        Ok(state.competitions.iter().rev().take(limit).cloned().collect())
    }

    async fn lineage_of(&self, agent_id: &str) -> Result<Vec<LineageEdge>> {
        let state = self.state.read().await;
        Ok(state
            .lineage
            .iter()
            .filter(|e| e.ancestor_id == agent_id || e.descendant_id == agent_id)
            .cloned()
            .collect())
    }
}

/// Pattern library held in memory, pre-sorted in library order
#[derive(Debug, Clone)]
pub struct InMemoryPatternLibrary {
    patterns: Vec<Pattern>,
}

impl InMemoryPatternLibrary {
    pub fn new(mut patterns: Vec<Pattern>) -> Self {
        rank_patterns(&mut patterns);
        Self { patterns }
    }

    /// Parse a JSON array of patterns
    pub fn from_json_str(json: &str) -> Result<Self> {
        let patterns: Vec<Pattern> = serde_json::from_str(json)?;
        Ok(Self::new(patterns))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let library = Self::from_json_str(&raw)?;
        info!(path = %path.display(), patterns = library.len(), "loaded pattern library");
        Ok(library)
    }

    /// The sample library shipped with the crate
    pub fn builtin() -> Result<Self> {
        Self::from_json_str(BUILTIN_PATTERNS)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[async_trait]
impl PatternLibrary for InMemoryPatternLibrary {
    async fn top_patterns(&self, limit: usize) -> Result<Vec<Pattern>> {
        Ok(self.patterns.iter().take(limit).cloned().collect())
    }

    async fn patterns_by_ids(&self, ids: &[String]) -> Result<Vec<Pattern>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.patterns.iter().find(|p| &p.id == id).cloned())
            .collect())
    }
}
