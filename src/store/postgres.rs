use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    AppliedEvolution, CommittedCycle, CycleCommit, EvolutionPlan, PatternLibrary,
    PopulationStore, RecordedDecision, ReflectionCommit,
};
use crate::domain::{
    agent_id, AdviceSource, Agent, AgentDraft, AgentStats, AgentStatus, Competition, Knowledge,
    LineageEdge, MarketCondition, Memory, Outcome, Pattern, PatternConditions, Personality,
    RankingEntry, Resolution,
};
use crate::error::{ArenaError, Result};

const AGENT_COLUMNS: &str = "id, name, generation, parent_id, personality, total_trades, \
    winning_trades, losing_trades, total_roi, avg_roi, fitness, competitions_entered, \
    competitions_won, last_rank, decisions_made, reflections_made, status, created_at, eliminated_at";

const MEMORY_COLUMNS: &str = "id, agent_id, cycle, trade_index, market, considered_patterns, \
    selected_patterns, rationale, confidence, decision_source, created_at, outcome, roi, \
    roi_annualized, reflection, lessons, strategy_adjustment, reflection_source, resolved_at";

const KNOWLEDGE_COLUMNS: &str = "agent_id, pattern_id, preference_strength, confidence, \
    times_validated, times_contradicted, updated_at";

/// PostgreSQL population store. Every row carries the namespace and every
/// query filters on it.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    namespace: String,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32, namespace: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!(namespace, "Connected to PostgreSQL");
        Ok(Self::from_pool(pool, namespace))
    }

    pub fn from_pool(pool: PgPool, namespace: &str) -> Self {
        Self {
            pool,
            namespace: namespace.to_string(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the arena tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS arena_namespaces (
                namespace TEXT PRIMARY KEY,
                next_seq BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS arena_agents (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                generation INTEGER NOT NULL CHECK (generation >= 1),
                parent_id TEXT,
                personality TEXT NOT NULL,
                total_trades INTEGER NOT NULL DEFAULT 0,
                winning_trades INTEGER NOT NULL DEFAULT 0,
                losing_trades INTEGER NOT NULL DEFAULT 0,
                total_roi DOUBLE PRECISION NOT NULL DEFAULT 0,
                avg_roi DOUBLE PRECISION NOT NULL DEFAULT 0,
                fitness DOUBLE PRECISION NOT NULL DEFAULT 0 CHECK (fitness >= 0),
                competitions_entered INTEGER NOT NULL DEFAULT 0,
                competitions_won INTEGER NOT NULL DEFAULT 0,
                last_rank INTEGER,
                decisions_made INTEGER NOT NULL DEFAULT 0,
                reflections_made INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                eliminated_at TIMESTAMPTZ,
                CHECK (total_trades = winning_trades + losing_trades)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_arena_agents_ns_status ON arena_agents(namespace, status)",
            r#"
            CREATE TABLE IF NOT EXISTS arena_memories (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                agent_id TEXT NOT NULL REFERENCES arena_agents(id),
                cycle BIGINT NOT NULL,
                trade_index INTEGER NOT NULL,
                market JSONB NOT NULL,
                considered_patterns TEXT[] NOT NULL,
                selected_patterns TEXT[] NOT NULL,
                rationale TEXT NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                decision_source TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                outcome TEXT,
                roi DOUBLE PRECISION,
                roi_annualized DOUBLE PRECISION,
                reflection TEXT,
                lessons TEXT,
                strategy_adjustment TEXT,
                reflection_source TEXT,
                resolved_at TIMESTAMPTZ
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_arena_memories_agent ON arena_memories(agent_id, created_at DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS arena_knowledge (
                namespace TEXT NOT NULL,
                agent_id TEXT NOT NULL REFERENCES arena_agents(id),
                pattern_id TEXT NOT NULL,
                preference_strength DOUBLE PRECISION NOT NULL
                    CHECK (preference_strength BETWEEN -1 AND 1),
                confidence DOUBLE PRECISION NOT NULL,
                times_validated INTEGER NOT NULL,
                times_contradicted INTEGER NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (agent_id, pattern_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS arena_competitions (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                cycle BIGINT NOT NULL,
                participants TEXT[] NOT NULL,
                winner_id TEXT,
                rankings JSONB NOT NULL,
                eliminated_ids TEXT[] NOT NULL,
                cloned_ids TEXT[] NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_arena_competitions_cycle ON arena_competitions(namespace, cycle)",
            r#"
            CREATE TABLE IF NOT EXISTS arena_lineage (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                ancestor_id TEXT NOT NULL,
                descendant_id TEXT NOT NULL,
                generation_gap INTEGER NOT NULL,
                mutation TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("arena schema ready");
        Ok(())
    }
}

/// LIMIT value for a usize bound; `usize::MAX` means no limit.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn agent_from_row(r: &PgRow) -> Result<Agent> {
    let personality: String = r.get("personality");
    let status: String = r.get("status");
    Ok(Agent {
        id: r.get("id"),
        name: r.get("name"),
        generation: r.get::<i32, _>("generation") as u32,
        parent_id: r.get("parent_id"),
        personality: Personality::try_from(personality.as_str()).map_err(ArenaError::Persistence)?,
        stats: AgentStats {
            total_trades: r.get::<i32, _>("total_trades") as u32,
            winning_trades: r.get::<i32, _>("winning_trades") as u32,
            losing_trades: r.get::<i32, _>("losing_trades") as u32,
            total_roi: r.get("total_roi"),
            avg_roi: r.get("avg_roi"),
        },
        fitness: r.get("fitness"),
        competitions_entered: r.get::<i32, _>("competitions_entered") as u32,
        competitions_won: r.get::<i32, _>("competitions_won") as u32,
        last_rank: r.get::<Option<i32>, _>("last_rank").map(|v| v as u32),
        decisions_made: r.get::<i32, _>("decisions_made") as u32,
        reflections_made: r.get::<i32, _>("reflections_made") as u32,
        status: AgentStatus::try_from(status.as_str()).map_err(ArenaError::Persistence)?,
        created_at: r.get("created_at"),
        eliminated_at: r.get("eliminated_at"),
    })
}

fn memory_from_row(r: &PgRow) -> Result<Memory> {
    let source: String = r.get("decision_source");
    let market: Json<MarketCondition> = r.get("market");

    let resolution = match r.get::<Option<String>, _>("outcome") {
        Some(outcome) => {
            let reflection_source: Option<String> = r.get("reflection_source");
            Some(Resolution {
                outcome: Outcome::try_from(outcome.as_str()).map_err(ArenaError::Persistence)?,
                roi: r.get::<Option<f64>, _>("roi").unwrap_or_default(),
                roi_annualized: r.get::<Option<f64>, _>("roi_annualized").unwrap_or_default(),
                reflection: r.get::<Option<String>, _>("reflection").unwrap_or_default(),
                lessons: r.get::<Option<String>, _>("lessons").unwrap_or_default(),
                strategy_adjustment: r
                    .get::<Option<String>, _>("strategy_adjustment")
                    .unwrap_or_default(),
                reflection_source: AdviceSource::try_from(reflection_source.as_deref().unwrap_or("fallback"))
                    .map_err(ArenaError::Persistence)?,
                resolved_at: r
                    .get::<Option<DateTime<Utc>>, _>("resolved_at")
                    .unwrap_or_else(Utc::now),
            })
        }
        None => None,
    };

    Ok(Memory {
        id: r.get("id"),
        agent_id: r.get("agent_id"),
        cycle: r.get::<i64, _>("cycle") as u64,
        trade_index: r.get::<i32, _>("trade_index") as u32,
        market: market.0,
        considered_patterns: r.get("considered_patterns"),
        selected_patterns: r.get("selected_patterns"),
        rationale: r.get("rationale"),
        confidence: r.get("confidence"),
        decision_source: AdviceSource::try_from(source.as_str()).map_err(ArenaError::Persistence)?,
        created_at: r.get("created_at"),
        resolution,
    })
}

fn knowledge_from_row(r: &PgRow) -> Knowledge {
    Knowledge {
        agent_id: r.get("agent_id"),
        pattern_id: r.get("pattern_id"),
        preference_strength: r.get("preference_strength"),
        confidence: r.get("confidence"),
        times_validated: r.get::<i32, _>("times_validated") as u32,
        times_contradicted: r.get::<i32, _>("times_contradicted") as u32,
        updated_at: r.get("updated_at"),
    }
}

fn competition_from_row(r: &PgRow) -> Competition {
    let rankings: Json<Vec<RankingEntry>> = r.get("rankings");
    Competition {
        id: r.get("id"),
        cycle: r.get::<i64, _>("cycle") as u64,
        participants: r.get("participants"),
        winner_id: r.get("winner_id"),
        rankings: rankings.0,
        eliminated_ids: r.get("eliminated_ids"),
        cloned_ids: r.get("cloned_ids"),
        created_at: r.get("created_at"),
    }
}

/// Allocate the next namespaced id and insert an active agent.
async fn insert_agent(
    conn: &mut PgConnection,
    namespace: &str,
    draft: AgentDraft,
    at: DateTime<Utc>,
) -> Result<Agent> {
    let seq: i64 = sqlx::query(
        r#"
        INSERT INTO arena_namespaces (namespace, next_seq) VALUES ($1, 1)
        ON CONFLICT (namespace) DO UPDATE SET next_seq = arena_namespaces.next_seq + 1
        RETURNING next_seq
        "#,
    )
    .bind(namespace)
    .fetch_one(&mut *conn)
    .await?
    .get("next_seq");

    let agent = Agent::from_draft(agent_id(namespace, seq as u64), draft, at);
    sqlx::query(
        r#"
        INSERT INTO arena_agents (id, namespace, name, generation, parent_id, personality,
                                  status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&agent.id)
    .bind(namespace)
    .bind(&agent.name)
    .bind(agent.generation as i32)
    .bind(&agent.parent_id)
    .bind(agent.personality.as_str())
    .bind(agent.status.as_str())
    .bind(agent.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(agent)
}

async fn apply_evolution_in(
    conn: &mut PgConnection,
    namespace: &str,
    plan: &EvolutionPlan,
) -> Result<AppliedEvolution> {
    let mut applied = AppliedEvolution::default();

    for id in &plan.eliminate {
        let updated = sqlx::query(
            "UPDATE arena_agents SET status = 'eliminated', eliminated_at = $1 \
             WHERE id = $2 AND namespace = $3 AND status = 'active'",
        )
        .bind(plan.at)
        .bind(id)
        .bind(namespace)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if updated == 0 {
            let status: Option<String> =
                sqlx::query("SELECT status FROM arena_agents WHERE id = $1 AND namespace = $2")
                    .bind(id)
                    .bind(namespace)
                    .fetch_optional(&mut *conn)
                    .await?
                    .map(|r| r.get::<String, _>("status"));
            return Err(match status {
                Some(from) => ArenaError::InvalidStateTransition {
                    from,
                    to: AgentStatus::Eliminated.to_string(),
                },
                None => ArenaError::AgentNotFound(id.clone()),
            });
        }
        applied.eliminated.push(id.clone());
    }

    for planned in &plan.clones {
        let parent_id = planned.draft.parent_id.clone().ok_or_else(|| {
            ArenaError::Validation(format!("clone {} has no parent", planned.draft.name))
        })?;
        let parent_generation: i32 =
            sqlx::query("SELECT generation FROM arena_agents WHERE id = $1 AND namespace = $2")
                .bind(&parent_id)
                .bind(namespace)
                .fetch_optional(&mut *conn)
                .await?
                .map(|r| r.get::<i32, _>("generation"))
                .ok_or_else(|| ArenaError::AgentNotFound(parent_id.clone()))?;

        let child = insert_agent(&mut *conn, namespace, planned.draft.clone(), plan.at).await?;

        if plan.inherit_knowledge {
            sqlx::query(
                r#"
                INSERT INTO arena_knowledge (namespace, agent_id, pattern_id, preference_strength,
                                             confidence, times_validated, times_contradicted,
                                             updated_at)
                SELECT namespace, $1, pattern_id, preference_strength, confidence,
                       times_validated, times_contradicted, updated_at
                FROM arena_knowledge WHERE agent_id = $2 AND namespace = $3
                "#,
            )
            .bind(&child.id)
            .bind(&parent_id)
            .bind(namespace)
            .execute(&mut *conn)
            .await?;
        }

        let edge = LineageEdge {
            id: Uuid::new_v4().to_string(),
            ancestor_id: parent_id,
            descendant_id: child.id.clone(),
            generation_gap: child.generation.saturating_sub(parent_generation.max(0) as u32),
            mutation: planned.mutation.clone(),
            created_at: plan.at,
        };
        sqlx::query(
            r#"
            INSERT INTO arena_lineage (id, namespace, ancestor_id, descendant_id, generation_gap,
                                       mutation, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&edge.id)
        .bind(namespace)
        .bind(&edge.ancestor_id)
        .bind(&edge.descendant_id)
        .bind(edge.generation_gap as i32)
        .bind(&edge.mutation)
        .bind(edge.created_at)
        .execute(&mut *conn)
        .await?;

        applied.cloned.push(child);
        applied.lineage.push(edge);
    }
    Ok(applied)
}

const COMPETITION_COLUMNS: &str =
    "id, cycle, participants, winner_id, rankings, eliminated_ids, cloned_ids, created_at";

const UPSERT_KNOWLEDGE: &str = r#"
    INSERT INTO arena_knowledge (namespace, agent_id, pattern_id, preference_strength, confidence,
                                 times_validated, times_contradicted, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (agent_id, pattern_id) DO UPDATE SET
        preference_strength = EXCLUDED.preference_strength,
        confidence = EXCLUDED.confidence,
        times_validated = EXCLUDED.times_validated,
        times_contradicted = EXCLUDED.times_contradicted,
        updated_at = EXCLUDED.updated_at
"#;

#[async_trait]
impl PopulationStore for PostgresStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    #[instrument(skip(self, draft), fields(namespace = %self.namespace))]
    async fn create_agent(&self, draft: AgentDraft) -> Result<Agent> {
        let mut tx = self.pool.begin().await?;
        let agent = insert_agent(&mut tx, &self.namespace, draft, Utc::now()).await?;
        tx.commit().await?;
        debug!(agent_id = %agent.id, "agent created");
        Ok(agent)
    }

    async fn get_agent(&self, id: &str) -> Result<Agent> {
        let sql = format!(
            "SELECT {} FROM arena_agents WHERE id = $1 AND namespace = $2",
            AGENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&self.namespace)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ArenaError::AgentNotFound(id.to_string()))?;
        agent_from_row(&row)
    }

    async fn list_active(&self) -> Result<Vec<Agent>> {
        let sql = format!(
            "SELECT {} FROM arena_agents WHERE namespace = $1 AND status = 'active' \
             ORDER BY fitness DESC, id ASC",
            AGENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&self.namespace)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let sql = format!(
            "SELECT {} FROM arena_agents WHERE namespace = $1 ORDER BY id ASC",
            AGENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&self.namespace)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn update_fitness(&self, id: &str, fitness: f64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE arena_agents SET fitness = $1 WHERE id = $2 AND namespace = $3",
        )
        .bind(fitness)
        .bind(id)
        .bind(&self.namespace)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ArenaError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, plan), fields(namespace = %self.namespace))]
    async fn apply_evolution(&self, plan: &EvolutionPlan) -> Result<AppliedEvolution> {
        let mut tx = self.pool.begin().await?;
        let applied = apply_evolution_in(&mut tx, &self.namespace, plan).await?;
        tx.commit().await?;
        Ok(applied)
    }

    #[instrument(skip(self, memory), fields(memory_id = %memory.id, agent_id = %memory.agent_id))]
    async fn record_decision(&self, memory: &Memory) -> Result<RecordedDecision> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO arena_memories (id, namespace, agent_id, cycle, trade_index, market,
                                        considered_patterns, selected_patterns, rationale,
                                        confidence, decision_source, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&memory.id)
        .bind(&self.namespace)
        .bind(&memory.agent_id)
        .bind(memory.cycle as i64)
        .bind(memory.trade_index as i32)
        .bind(Json(&memory.market))
        .bind(&memory.considered_patterns)
        .bind(&memory.selected_patterns)
        .bind(&memory.rationale)
        .bind(memory.confidence)
        .bind(memory.decision_source.as_str())
        .bind(memory.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let sql = format!(
                "SELECT {} FROM arena_memories WHERE id = $1 AND namespace = $2",
                MEMORY_COLUMNS
            );
            let row = sqlx::query(&sql)
                .bind(&memory.id)
                .bind(&self.namespace)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!("decision already recorded");
            return Ok(RecordedDecision {
                memory: memory_from_row(&row)?,
                created: false,
            });
        }

        let updated = sqlx::query(
            "UPDATE arena_agents SET decisions_made = decisions_made + 1 WHERE id = $1 AND namespace = $2",
        )
        .bind(&memory.agent_id)
        .bind(&self.namespace)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            // dropping tx rolls the memory insert back
            return Err(ArenaError::AgentNotFound(memory.agent_id.clone()));
        }

        tx.commit().await?;
        Ok(RecordedDecision {
            memory: memory.clone(),
            created: true,
        })
    }

    async fn get_memory(&self, id: &str) -> Result<Memory> {
        let sql = format!(
            "SELECT {} FROM arena_memories WHERE id = $1 AND namespace = $2",
            MEMORY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&self.namespace)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ArenaError::MemoryNotFound(id.to_string()))?;
        memory_from_row(&row)
    }

    async fn recent_winning_memories(&self, agent_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let sql = format!(
            "SELECT {} FROM arena_memories WHERE agent_id = $1 AND namespace = $2 AND outcome = 'win' \
             ORDER BY created_at DESC, cycle DESC, trade_index DESC LIMIT $3",
            MEMORY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(agent_id)
            .bind(&self.namespace)
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(memory_from_row).collect()
    }

    async fn memories_of(&self, agent_id: &str) -> Result<Vec<Memory>> {
        let sql = format!(
            "SELECT {} FROM arena_memories WHERE agent_id = $1 AND namespace = $2 \
             ORDER BY cycle ASC, trade_index ASC",
            MEMORY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(agent_id)
            .bind(&self.namespace)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(memory_from_row).collect()
    }

    #[instrument(skip(self, commit), fields(memory_id = %commit.memory_id, agent_id = %commit.agent_id))]
    async fn commit_reflection(&self, commit: &ReflectionCommit) -> Result<Agent> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT agent_id, outcome FROM arena_memories WHERE id = $1 AND namespace = $2 FOR UPDATE",
        )
        .bind(&commit.memory_id)
        .bind(&self.namespace)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ArenaError::MemoryNotFound(commit.memory_id.clone()))?;

        if row.get::<Option<String>, _>("outcome").is_some() {
            return Err(ArenaError::MemoryAlreadyResolved(commit.memory_id.clone()));
        }
        let owner: String = row.get("agent_id");
        if owner != commit.agent_id {
            return Err(ArenaError::Validation(format!(
                "memory {} belongs to {}, not {}",
                commit.memory_id, owner, commit.agent_id
            )));
        }

        let res = &commit.resolution;
        sqlx::query(
            r#"
            UPDATE arena_memories SET
                outcome = $1, roi = $2, roi_annualized = $3, reflection = $4, lessons = $5,
                strategy_adjustment = $6, reflection_source = $7, resolved_at = $8
            WHERE id = $9 AND outcome IS NULL
            "#,
        )
        .bind(res.outcome.as_str())
        .bind(res.roi)
        .bind(res.roi_annualized)
        .bind(&res.reflection)
        .bind(&res.lessons)
        .bind(&res.strategy_adjustment)
        .bind(res.reflection_source.as_str())
        .bind(res.resolved_at)
        .bind(&commit.memory_id)
        .execute(&mut *tx)
        .await?;

        for k in &commit.knowledge {
            sqlx::query(UPSERT_KNOWLEDGE)
                .bind(&self.namespace)
                .bind(&k.agent_id)
                .bind(&k.pattern_id)
                .bind(k.preference_strength)
                .bind(k.confidence)
                .bind(k.times_validated as i32)
                .bind(k.times_contradicted as i32)
                .bind(k.updated_at)
                .execute(&mut *tx)
                .await?;
        }

        let (wins, losses) = if res.outcome.is_win() { (1, 0) } else { (0, 1) };
        let sql = format!(
            r#"
            UPDATE arena_agents SET
                total_trades = total_trades + 1,
                winning_trades = winning_trades + $1,
                losing_trades = losing_trades + $2,
                total_roi = total_roi + $3,
                avg_roi = (total_roi + $3) / (total_trades + 1),
                reflections_made = reflections_made + 1
            WHERE id = $4 AND namespace = $5
            RETURNING {}
            "#,
            AGENT_COLUMNS
        );
        let agent_row = sqlx::query(&sql)
            .bind(wins as i32)
            .bind(losses as i32)
            .bind(res.roi)
            .bind(&commit.agent_id)
            .bind(&self.namespace)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ArenaError::AgentNotFound(commit.agent_id.clone()))?;
        let agent = agent_from_row(&agent_row)?;

        tx.commit().await?;
        Ok(agent)
    }

    async fn knowledge_for(&self, agent_id: &str, pattern_ids: &[String]) -> Result<Vec<Knowledge>> {
        let sql = format!(
            "SELECT {} FROM arena_knowledge WHERE agent_id = $1 AND namespace = $2 AND pattern_id = ANY($3)",
            KNOWLEDGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(agent_id)
            .bind(&self.namespace)
            .bind(pattern_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(knowledge_from_row).collect())
    }

    async fn top_knowledge(&self, agent_id: &str, limit: usize) -> Result<Vec<Knowledge>> {
        let sql = format!(
            "SELECT {} FROM arena_knowledge WHERE agent_id = $1 AND namespace = $2 \
             ORDER BY confidence DESC, times_validated DESC, pattern_id ASC LIMIT $3",
            KNOWLEDGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(agent_id)
            .bind(&self.namespace)
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(knowledge_from_row).collect())
    }

    async fn upsert_knowledge(&self, rows: &[Knowledge]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for k in rows {
            sqlx::query(UPSERT_KNOWLEDGE)
                .bind(&self.namespace)
                .bind(&k.agent_id)
                .bind(&k.pattern_id)
                .bind(k.preference_strength)
                .bind(k.confidence)
                .bind(k.times_validated as i32)
                .bind(k.times_contradicted as i32)
                .bind(k.updated_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, commit), fields(namespace = %self.namespace, cycle = commit.competition.cycle))]
    async fn commit_cycle(&self, commit: &CycleCommit) -> Result<CommittedCycle> {
        let mut tx = self.pool.begin().await?;
        // serialise cycle commits of one namespace
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.namespace)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "SELECT {} FROM arena_competitions WHERE namespace = $1 AND cycle = $2",
            COMPETITION_COLUMNS
        );
        let existing = sqlx::query(&sql)
            .bind(&self.namespace)
            .bind(commit.competition.cycle as i64)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = existing {
            tx.commit().await?;
            debug!("cycle already recorded");
            return Ok(CommittedCycle {
                competition: competition_from_row(&row),
                evolution: None,
                replayed: true,
            });
        }

        for entry in &commit.competition.rankings {
            let updated = sqlx::query(
                r#"
                UPDATE arena_agents SET
                    competitions_entered = competitions_entered + 1,
                    competitions_won = competitions_won + CASE WHEN $1 = 1 THEN 1 ELSE 0 END,
                    last_rank = $1
                WHERE id = $2 AND namespace = $3
                "#,
            )
            .bind(entry.rank as i32)
            .bind(&entry.agent_id)
            .bind(&self.namespace)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                return Err(ArenaError::AgentNotFound(entry.agent_id.clone()));
            }
        }

        let evolution = match &commit.evolution {
            Some(plan) => Some(apply_evolution_in(&mut tx, &self.namespace, plan).await?),
            None => None,
        };

        let mut competition = commit.competition.clone();
        if let Some(applied) = &evolution {
            competition.eliminated_ids = applied.eliminated.clone();
            competition.cloned_ids = applied.cloned.iter().map(|a| a.id.clone()).collect();
        }

        sqlx::query(
            r#"
            INSERT INTO arena_competitions (id, namespace, cycle, participants, winner_id, rankings,
                                            eliminated_ids, cloned_ids, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&competition.id)
        .bind(&self.namespace)
        .bind(competition.cycle as i64)
        .bind(&competition.participants)
        .bind(&competition.winner_id)
        .bind(Json(&competition.rankings))
        .bind(&competition.eliminated_ids)
        .bind(&competition.cloned_ids)
        .bind(competition.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CommittedCycle {
            competition,
            evolution,
            replayed: false,
        })
    }

    async fn competition_for_cycle(&self, cycle: u64) -> Result<Option<Competition>> {
        let sql = format!(
            "SELECT {} FROM arena_competitions WHERE namespace = $1 AND cycle = $2",
            COMPETITION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&self.namespace)
            .bind(cycle as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(competition_from_row))
    }

    async fn list_competitions(&self, limit: usize) -> Result<Vec<Competition>> {
        let sql = format!(
            "SELECT {} FROM arena_competitions WHERE namespace = $1 \
             ORDER BY created_at DESC LIMIT $2",
            COMPETITION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&self.namespace)
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(competition_from_row).collect())
    }

    async fn lineage_of(&self, agent_id: &str) -> Result<Vec<LineageEdge>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ancestor_id, descendant_id, generation_gap, mutation, created_at
            FROM arena_lineage
            WHERE namespace = $1 AND (ancestor_id = $2 OR descendant_id = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(&self.namespace)
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| LineageEdge {
                id: r.get("id"),
                ancestor_id: r.get("ancestor_id"),
                descendant_id: r.get("descendant_id"),
                generation_gap: r.get::<i32, _>("generation_gap") as u32,
                mutation: r.get("mutation"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}

/// Read-only pattern library over the `arena_patterns` table maintained by
/// the pattern discovery pipeline.
#[derive(Clone)]
pub struct PostgresPatternLibrary {
    pool: PgPool,
}

impl PostgresPatternLibrary {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn pattern_from_row(r: &PgRow) -> Pattern {
    let conditions: Option<Json<PatternConditions>> = r.get("conditions");
    Pattern {
        id: r.get("id"),
        name: r.get("name"),
        votes: r.get::<i32, _>("votes").max(0) as u32,
        runs: r.get::<i32, _>("runs").max(0) as u32,
        h2h_wins: r.get::<i32, _>("h2h_wins").max(0) as u32,
        h2h_losses: r.get::<i32, _>("h2h_losses").max(0) as u32,
        origin: r.get::<Option<String>, _>("origin").unwrap_or_default(),
        conditions: conditions.map(|c| c.0).unwrap_or_default(),
    }
}

#[async_trait]
impl PatternLibrary for PostgresPatternLibrary {
    async fn top_patterns(&self, limit: usize) -> Result<Vec<Pattern>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, votes, runs, h2h_wins, h2h_losses, origin, conditions
            FROM arena_patterns
            ORDER BY votes::DOUBLE PRECISION / GREATEST(runs, 1) DESC, h2h_wins DESC, id ASC
            LIMIT $1
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(pattern_from_row).collect())
    }

    async fn patterns_by_ids(&self, ids: &[String]) -> Result<Vec<Pattern>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, votes, runs, h2h_wins, h2h_losses, origin, conditions
            FROM arena_patterns WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        let found: Vec<Pattern> = rows.iter().map(pattern_from_row).collect();
        // keep the caller's order
        Ok(ids
            .iter()
            .filter_map(|id| found.iter().find(|p| &p.id == id).cloned())
            .collect())
    }
}
