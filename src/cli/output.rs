//! Output formatting for listing commands.
//!
//! Supports two modes: human-readable tables (default) and JSON (--json).

use serde::Serialize;
use tabled::{Table, Tabled};

use crate::domain::{Agent, Competition, LineageEdge};

/// Output mode for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print a vec of Tabled + Serialize items in the chosen mode.
pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                println!("{}", Table::new(items));
            }
        }
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(items)?);
        }
    }
    Ok(())
}

/// Print a single Serialize item. Table mode uses pretty JSON too.
pub fn print_item<T: Serialize>(item: &T, _mode: OutputMode) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(item)?);
    Ok(())
}

#[derive(Debug, Clone, Serialize, Tabled)]
pub struct LeaderboardRow {
    #[tabled(rename = "#")]
    pub position: usize,
    pub id: String,
    pub name: String,
    #[tabled(rename = "gen")]
    pub generation: u32,
    pub personality: String,
    pub fitness: String,
    pub trades: u32,
    #[tabled(rename = "win rate")]
    pub win_rate: String,
    #[tabled(rename = "avg roi")]
    pub avg_roi: String,
    pub wins: u32,
    #[tabled(rename = "last rank")]
    pub last_rank: String,
}

impl LeaderboardRow {
    pub fn from_agent(position: usize, agent: &Agent) -> Self {
        Self {
            position,
            id: agent.id.clone(),
            name: agent.name.clone(),
            generation: agent.generation,
            personality: agent.personality.to_string(),
            fitness: format!("{:.2}", agent.fitness),
            trades: agent.stats.total_trades,
            win_rate: agent
                .stats
                .win_rate()
                .map(|r| format!("{:.0}%", r * 100.0))
                .unwrap_or_else(|| "-".to_string()),
            avg_roi: format!("{:+.2}%", agent.stats.avg_roi),
            wins: agent.competitions_won,
            last_rank: agent
                .last_rank
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
pub struct LineageRow {
    pub ancestor: String,
    pub descendant: String,
    pub gap: u32,
    pub mutation: String,
    pub at: String,
}

impl From<&LineageEdge> for LineageRow {
    fn from(edge: &LineageEdge) -> Self {
        Self {
            ancestor: edge.ancestor_id.clone(),
            descendant: edge.descendant_id.clone(),
            gap: edge.generation_gap,
            mutation: edge.mutation.clone(),
            at: edge.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
pub struct CompetitionRow {
    pub cycle: u64,
    pub id: String,
    pub participants: usize,
    pub winner: String,
    #[tabled(rename = "winner roi")]
    pub winner_roi: String,
    pub eliminated: usize,
    pub cloned: usize,
    pub at: String,
}

impl From<&Competition> for CompetitionRow {
    fn from(c: &Competition) -> Self {
        Self {
            cycle: c.cycle,
            id: c.id.clone(),
            participants: c.participants.len(),
            winner: c.winner_id.clone().unwrap_or_else(|| "-".to_string()),
            winner_roi: c
                .rankings
                .first()
                .map(|r| format!("{:+.2}%", r.total_roi))
                .unwrap_or_else(|| "-".to_string()),
            eliminated: c.eliminated_ids.len(),
            cloned: c.cloned_ids.len(),
            at: c.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}
