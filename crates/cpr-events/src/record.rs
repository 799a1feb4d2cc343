//! Turn Records
//!
//! Read-only snapshots handed to the recording collaborator exactly once
//! per completed turn: one `AgentRecord` per known agent and one
//! `TeamRecord` per team.

use serde::{Deserialize, Serialize};

use crate::{AgentId, TeamId};

/// Which pool movement an audit examines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Contribution,
    Withdrawal,
}

/// The decision point a ballot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BallotKind {
    ContributionAudit,
    WithdrawalAudit,
    Leadership,
    PolicyChoice,
}

impl From<AuditKind> for BallotKind {
    fn from(kind: AuditKind) -> Self {
        match kind {
            AuditKind::Contribution => BallotKind::ContributionAudit,
            AuditKind::Withdrawal => BallotKind::WithdrawalAudit,
        }
    }
}

/// Per-agent state at the end of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    #[serde(default)]
    pub team_id: Option<TeamId>,
    pub score: i64,
    #[serde(default)]
    pub turn_score: i64,
    #[serde(default)]
    pub stated_contribution: i64,
    #[serde(default)]
    pub actual_contribution: i64,
    #[serde(default)]
    pub stated_withdrawal: i64,
    #[serde(default)]
    pub actual_withdrawal: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u8>,
    #[serde(default)]
    pub offences: u32,
    pub alive: bool,
}

/// Pool movements accepted during one turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolFlows {
    pub opening: i64,
    pub contributions: i64,
    pub withdrawals: i64,
    pub audit_costs: i64,
    pub closing: i64,
}

impl PoolFlows {
    /// `closing == opening + contributions - withdrawals - audit_costs`
    pub fn is_conserved(&self) -> bool {
        self.closing == self.opening + self.contributions - self.withdrawals - self.audit_costs
    }
}

/// Per-team state at the end of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRecord {
    pub team_id: TeamId,
    pub common_pool: i64,
    pub policy_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_boundaries: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<AgentId>,
    pub member_count: usize,
    #[serde(default)]
    pub flows: PoolFlows,
}

/// Everything recorded for one completed turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub iteration: u32,
    pub turn: u32,
    pub agents: Vec<AgentRecord>,
    pub teams: Vec<TeamRecord>,
}

impl TurnRecord {
    pub fn new(iteration: u32, turn: u32) -> Self {
        Self {
            iteration,
            turn,
            agents: Vec::new(),
            teams: Vec::new(),
        }
    }

    /// Parse one line of a JSONL recording.
    pub fn from_jsonl(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn agent(&self, id: AgentId) -> Option<&AgentRecord> {
        self.agents.iter().find(|a| a.agent_id == id)
    }

    pub fn team(&self, id: TeamId) -> Option<&TeamRecord> {
        self.teams.iter().find(|t| t.team_id == id)
    }

    pub fn living_agents(&self) -> usize {
        self.agents.iter().filter(|a| a.alive).count()
    }
}
