//! Statistics Output
//!
//! Per-iteration tallies of what happened to the pools and the agents,
//! written as one JSON summary at the end of a run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, TurnRecord};

use crate::error::RecorderError;
use crate::Points;

/// What happened during one iteration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub elimination_threshold: Points,
    pub turns: u32,
    pub teams: usize,
    /// Teams per adopted policy
    pub policies: BTreeMap<String, usize>,
    pub contributions: Points,
    pub withdrawals: Points,
    pub audit_costs: Points,
    pub formal_audits: usize,
    pub lies_caught: usize,
    pub punishments: Points,
    pub expelled: Vec<AgentId>,
    pub eliminated: Vec<AgentId>,
    pub survivors: usize,
}

/// Whole-run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub seed: u64,
    pub iterations: Vec<IterationSummary>,
    pub total_eliminated: usize,
    pub total_expelled: usize,
    pub survivors: usize,
    pub final_scores: BTreeMap<AgentId, Points>,
}

/// Resource: accumulates statistics as the run progresses
#[derive(Resource, Debug, Default)]
pub struct StatsCollector {
    current: Option<IterationSummary>,
    finished: Vec<IterationSummary>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_iteration(&mut self, iteration: u32, elimination_threshold: Points) {
        if let Some(open) = self.current.take() {
            self.finished.push(open);
        }
        self.current = Some(IterationSummary {
            iteration,
            elimination_threshold,
            ..IterationSummary::default()
        });
    }

    fn current(&mut self) -> &mut IterationSummary {
        self.current.get_or_insert_with(IterationSummary::default)
    }

    pub fn record_policy(&mut self, policy_id: &str) {
        let current = self.current();
        current.teams += 1;
        *current.policies.entry(policy_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_turn(&mut self, turn: &TurnRecord) {
        let current = self.current();
        current.turns += 1;
        for team in &turn.teams {
            current.contributions += team.flows.contributions;
            current.withdrawals += team.flows.withdrawals;
            current.audit_costs += team.flows.audit_costs;
        }
        current.survivors = turn.living_agents();
    }

    pub fn record_audit(&mut self, lied: bool, penalty: Points) {
        let current = self.current();
        current.formal_audits += 1;
        if lied {
            current.lies_caught += 1;
            current.punishments += penalty;
        }
    }

    pub fn record_expulsion(&mut self, agent: AgentId) {
        self.current().expelled.push(agent);
    }

    pub fn record_elimination(&mut self, agent: AgentId) {
        self.current().eliminated.push(agent);
    }

    /// Completed and in-progress iterations
    pub fn iterations(&self) -> Vec<IterationSummary> {
        self.finished.iter().chain(self.current.iter()).cloned().collect()
    }

    pub fn summary(&self, seed: u64, final_scores: BTreeMap<AgentId, Points>, survivors: usize) -> SimulationSummary {
        let iterations = self.iterations();
        SimulationSummary {
            seed,
            total_eliminated: iterations.iter().map(|i| i.eliminated.len()).sum(),
            total_expelled: iterations.iter().map(|i| i.expelled.len()).sum(),
            iterations,
            survivors,
            final_scores,
        }
    }
}

/// Write `summary` as pretty JSON, creating parent directories.
pub fn write_summary(summary: &SimulationSummary, path: impl AsRef<Path>) -> Result<(), RecorderError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json)?;
    Ok(())
}
