//! Score share: contributions scale with turn score and team size,
//! withdrawals are a fixed allowance by score tier, and the members vote on
//! how long lies are remembered and how hard they are punished.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, AuditKind};

use super::{honest_first, invalid, percent_of, ArticlesOfAssociation, Assembly, GovernanceRules};
use crate::components::audit::{AuditBook, AuditOutcome};
use crate::components::history::WindowCounter;
use crate::context::SimulationContext;
use crate::error::GovernanceError;
use crate::governance::tally::{instant_runoff, tally, Ballot, QuorumRule};
use crate::Points;

/// How long lies are remembered and how much they cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    Lenient,
    Moderate,
    Resolute,
}

impl Strictness {
    pub const ALL: [Strictness; 3] = [Strictness::Lenient, Strictness::Moderate, Strictness::Resolute];

    /// Turns a lie stays on record
    pub fn memory(self) -> usize {
        match self {
            Strictness::Lenient => 1,
            Strictness::Moderate => 3,
            Strictness::Resolute => 7,
        }
    }

    pub fn multiplier(self) -> f64 {
        match self {
            Strictness::Lenient => 0.0,
            Strictness::Moderate => 0.4,
            Strictness::Resolute => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreShareParams {
    pub audit_cost: Points,
    /// Share of the other members whose ballots one candidate must exceed
    pub vote_fraction: f64,
    pub initial_strictness: Strictness,
}

impl Default for ScoreShareParams {
    fn default() -> Self {
        Self {
            audit_cost: 1,
            vote_fraction: 0.6,
            initial_strictness: Strictness::Moderate,
        }
    }
}

impl ScoreShareParams {
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if self.audit_cost < 0 {
            return Err(invalid("score_share audit_cost must not be negative"));
        }
        if !(0.0..1.0).contains(&self.vote_fraction) {
            return Err(invalid("score_share vote_fraction must be within [0, 1)"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ScoreShare {
    params: ScoreShareParams,
    team_size: usize,
    strictness: Strictness,
    audits: AuditBook,
    /// Lies caught by formal audit within the strictness memory
    caught: BTreeMap<AgentId, WindowCounter>,
}

impl ScoreShare {
    pub const ID: &'static str = "score_share";

    pub fn new(params: ScoreShareParams, team_size: usize, rules: &GovernanceRules) -> Result<Self, GovernanceError> {
        let strictness = params.initial_strictness;
        Ok(Self {
            audits: AuditBook::new(strictness.memory(), rules.offence_threshold, u32::MAX)?,
            params,
            team_size,
            strictness,
            caught: BTreeMap::new(),
        })
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    fn contribution_percent(&self) -> Points {
        match self.team_size {
            0..=4 => 100,
            5..=9 => 75,
            _ => 50,
        }
    }

    fn adopt(&mut self, strictness: Strictness) {
        self.strictness = strictness;
        let memory = strictness.memory();
        if let Err(e) = self.audits.set_window(memory) {
            tracing::warn!(error = %e, "could not resize audit window");
        }
        for window in self.caught.values_mut() {
            if let Err(e) = window.set_capacity(memory) {
                tracing::warn!(error = %e, "could not resize lie history");
            }
        }
    }

    /// Ballots a candidate must exceed; members cannot vote for themselves.
    fn vote_threshold(&self) -> f64 {
        self.params.vote_fraction * self.team_size.saturating_sub(1) as f64
    }

    fn caught_count(&self, agent: AgentId) -> i64 {
        self.caught.get(&agent).map_or(0, WindowCounter::sum)
    }
}

impl ArticlesOfAssociation for ScoreShare {
    fn policy_id(&self) -> &'static str {
        Self::ID
    }

    fn enroll(&mut self, members: &[AgentId]) {
        self.team_size = members.len();
        self.audits.enroll(members);
    }

    fn begin_turn(&mut self) {
        self.audits.begin_round();
    }

    fn expected_contribution(&self, _agent: AgentId, turn_score: Points) -> Points {
        percent_of(turn_score.max(0), self.contribution_percent())
    }

    fn expected_withdrawal(&self, _agent: AgentId, score: Points, _pool: Points) -> Points {
        match score {
            s if s < 6 => 6,
            s if s <= 12 => 2,
            _ => 0,
        }
    }

    fn record_contribution_audit(&mut self, agent: AgentId, turn_score: Points, actual: Points, stated: Points) {
        let expected = self.expected_contribution(agent, turn_score);
        let outcome = if stated != actual {
            AuditOutcome::lied_by(stated - actual)
        } else if actual < expected {
            AuditOutcome::lied_by(expected - actual)
        } else {
            AuditOutcome::honest()
        };
        self.audits.record(agent, AuditKind::Contribution, outcome);
    }

    fn record_withdrawal_audit(&mut self, agent: AgentId, score: Points, actual: Points, stated: Points, pool: Points) {
        // `score` already includes the withdrawal
        let expected = self.expected_withdrawal(agent, score - actual, pool);
        let outcome = if stated != actual {
            AuditOutcome::lied_by(actual - stated)
        } else if actual > expected {
            AuditOutcome::lied_by(actual - expected)
        } else {
            AuditOutcome::honest()
        };
        self.audits.record(agent, AuditKind::Withdrawal, outcome);
    }

    fn contribution_audit_result(&self, agent: AgentId) -> bool {
        self.audits.lied(agent, AuditKind::Contribution)
    }

    fn withdrawal_audit_result(&self, agent: AgentId) -> bool {
        self.audits.lied(agent, AuditKind::Withdrawal)
    }

    fn audit_cost(&self, _pool: Points) -> Points {
        self.params.audit_cost
    }

    /// First candidate whose running total passes the threshold wins, so the
    /// result depends on ballot order.
    fn vote_result(&self, ballots: &[Ballot], ctx: &mut SimulationContext) -> Option<AgentId> {
        tally(ballots, |_| 1.0, QuorumRule::FirstPast(self.vote_threshold()), ctx).winner()
    }

    fn punishment(&self, score: Points, agent: AgentId) -> Points {
        let lied_by = [AuditKind::Contribution, AuditKind::Withdrawal]
            .into_iter()
            .filter_map(|kind| self.audits.last(agent, kind))
            .filter(|o| o.lied)
            .map(|o| o.discrepancy.abs())
            .max()
            .unwrap_or(0);
        let times = self.caught_count(agent) + 1;
        let penalty = (times * lied_by) as f64 * self.strictness.multiplier();
        (penalty.round() as Points).clamp(0, score.max(0))
    }

    fn withdrawal_order(&self, agents: &[AgentId], ctx: &mut SimulationContext) -> Vec<AgentId> {
        honest_first(
            agents,
            |id| self.audits.lied(id, AuditKind::Contribution) || self.audits.lied(id, AuditKind::Withdrawal),
            ctx,
        )
    }

    fn run_pre_iteration(&mut self, assembly: &mut Assembly<'_>) {
        let ballots = assembly.council.strictness_votes(assembly.members);
        match instant_runoff(&ballots, &Strictness::ALL, assembly.ctx) {
            Some(choice) => {
                tracing::debug!(team = %assembly.team, ?choice, "strictness adopted");
                self.adopt(choice);
            }
            None => tracing::debug!(team = %assembly.team, strictness = ?self.strictness, "no strictness ballots; keeping current"),
        }
    }

    fn audit_concluded(&mut self, agent: AgentId, _kind: AuditKind, lied: bool) {
        let memory = NonZeroUsize::new(self.strictness.memory()).unwrap_or(NonZeroUsize::MIN);
        self.caught
            .entry(agent)
            .or_insert_with(|| WindowCounter::with_capacity(memory))
            .push_flag(lied);
    }

    fn forget(&mut self, agent: AgentId) {
        self.team_size = self.team_size.saturating_sub(1);
        self.audits.forget(agent);
        self.caught.remove(&agent);
    }

    fn offences(&self, agent: AgentId) -> u32 {
        self.audits.offences(agent)
    }
}
