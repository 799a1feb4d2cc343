//! Articles of Association
//!
//! A team's rulebook: what members are expected to put in and take out,
//! how audits are judged and priced, how ballots resolve, who withdraws
//! first, and what the team does before an iteration and after each
//! contribution phase. Variants are chosen by [`PolicyKind`] and built
//! behind the [`ArticlesOfAssociation`] trait object.

mod flat_quota;
mod leader;
mod monitoring;
mod rank_weighted;
mod score_share;

pub use flat_quota::{FlatQuota, FlatQuotaParams};
pub use leader::{LeaderParams, LeaderPrivileged};
pub use monitoring::{Monitoring, MonitoringParams};
pub use rank_weighted::{RankWeighted, RankWeightedParams};
pub use score_share::{ScoreShare, ScoreShareParams, Strictness};

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, AuditKind, TeamId};

use super::chair::ChairAgreement;
use super::rank::RankBoundaries;
use super::tally::Ballot;
use crate::context::SimulationContext;
use crate::error::GovernanceError;
use crate::Points;

/// Access to the members during pre-iteration and post-contribution logic.
///
/// Implemented by the orchestrator over the live agents; every method may
/// come back empty when agents fail to answer.
pub trait Council {
    fn propose_rank_boundaries(&self, chair: AgentId, current: &RankBoundaries) -> Option<RankBoundaries>;
    /// A chair's version of the team's next ranks, given the recomputed ones.
    fn propose_ranks(&self, chair: AgentId, recomputed: &BTreeMap<AgentId, u8>) -> Option<BTreeMap<AgentId, u8>>;
    fn leadership_votes(&self, members: &[AgentId]) -> Vec<Ballot>;
    fn strictness_votes(&self, members: &[AgentId]) -> Vec<Vec<Strictness>>;
}

/// What a policy hook gets to work with
pub struct Assembly<'a> {
    pub team: TeamId,
    pub members: &'a [AgentId],
    pub ctx: &'a mut SimulationContext,
    pub council: &'a dyn Council,
}

/// Team rulebook. One instance per team, owned by the team.
pub trait ArticlesOfAssociation: Send + Sync + fmt::Debug {
    /// Stable identifier written to turn records.
    fn policy_id(&self) -> &'static str;

    /// Called once with the founding members.
    fn enroll(&mut self, members: &[AgentId]);

    /// A new turn begins; audit records may be written once per kind.
    fn begin_turn(&mut self);

    fn expected_contribution(&self, agent: AgentId, turn_score: Points) -> Points;

    fn expected_withdrawal(&self, agent: AgentId, score: Points, pool: Points) -> Points;

    fn record_contribution_audit(&mut self, agent: AgentId, turn_score: Points, actual: Points, stated: Points);

    /// `score` is the agent's score after the withdrawal was paid out and
    /// `pool` the balance the withdrawal phase opened with.
    fn record_withdrawal_audit(&mut self, agent: AgentId, score: Points, actual: Points, stated: Points, pool: Points);

    fn contribution_audit_result(&self, agent: AgentId) -> bool;

    fn withdrawal_audit_result(&self, agent: AgentId) -> bool;

    fn audit_cost(&self, pool: Points) -> Points;

    fn vote_result(&self, ballots: &[Ballot], ctx: &mut SimulationContext) -> Option<AgentId>;

    fn punishment(&self, score: Points, agent: AgentId) -> Points;

    fn withdrawal_order(&self, agents: &[AgentId], ctx: &mut SimulationContext) -> Vec<AgentId>;

    fn run_pre_iteration(&mut self, _assembly: &mut Assembly<'_>) {}

    fn run_post_contribution(&mut self, _assembly: &mut Assembly<'_>) {}

    /// Chance that `agent` is audited this phase without a vote.
    fn audit_probability(&self, _agent: AgentId) -> f64 {
        0.0
    }

    /// A formal audit of `agent` has been carried out.
    fn audit_concluded(&mut self, _agent: AgentId, _kind: AuditKind, _lied: bool) {}

    /// Members the policy has decided to expel; drained by the caller.
    fn take_expulsions(&mut self) -> Vec<AgentId> {
        Vec::new()
    }

    /// `agent` left the team.
    fn forget(&mut self, agent: AgentId);

    fn offences(&self, agent: AgentId) -> u32;

    fn rank(&self, _agent: AgentId) -> Option<u8> {
        None
    }

    fn rank_boundaries(&self) -> Option<RankBoundaries> {
        None
    }

    fn leader(&self) -> Option<AgentId> {
        None
    }
}

/// Selectable policy and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyKind {
    FlatQuota(FlatQuotaParams),
    ScoreShare(ScoreShareParams),
    RankWeighted(RankWeightedParams),
    LeaderPrivileged(LeaderParams),
    Monitoring(MonitoringParams),
}

impl PolicyKind {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyKind::FlatQuota(_) => FlatQuota::ID,
            PolicyKind::ScoreShare(_) => ScoreShare::ID,
            PolicyKind::RankWeighted(_) => RankWeighted::ID,
            PolicyKind::LeaderPrivileged(_) => LeaderPrivileged::ID,
            PolicyKind::Monitoring(_) => Monitoring::ID,
        }
    }

    pub fn validate(&self) -> Result<(), GovernanceError> {
        match self {
            PolicyKind::FlatQuota(p) => p.validate(),
            PolicyKind::ScoreShare(p) => p.validate(),
            PolicyKind::RankWeighted(p) => p.validate(),
            PolicyKind::LeaderPrivileged(p) => p.validate(),
            PolicyKind::Monitoring(p) => p.validate(),
        }
    }

    /// Build the rulebook for a team with the given founding members.
    pub fn build(
        &self,
        members: &[AgentId],
        rules: &GovernanceRules,
        ctx: &mut SimulationContext,
    ) -> Result<Box<dyn ArticlesOfAssociation>, GovernanceError> {
        self.validate()?;
        let mut policy: Box<dyn ArticlesOfAssociation> = match self {
            PolicyKind::FlatQuota(p) => Box::new(FlatQuota::new(p.clone(), rules)?),
            PolicyKind::ScoreShare(p) => Box::new(ScoreShare::new(p.clone(), members.len(), rules)?),
            PolicyKind::RankWeighted(p) => Box::new(RankWeighted::new(p.clone(), rules)?),
            PolicyKind::LeaderPrivileged(p) => {
                Box::new(LeaderPrivileged::new(p.clone(), rules, ctx.choose(members))?)
            }
            PolicyKind::Monitoring(p) => Box::new(Monitoring::new(p.clone(), rules)?),
        };
        policy.enroll(members);
        Ok(policy)
    }
}

impl Default for PolicyKind {
    fn default() -> Self {
        PolicyKind::FlatQuota(FlatQuotaParams::default())
    }
}

/// Team-independent rule settings shared by every policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernanceRules {
    /// Warnings that add up to one offence
    pub offence_threshold: u32,
    pub agreement: ChairAgreement,
}

impl Default for GovernanceRules {
    fn default() -> Self {
        Self {
            offence_threshold: 2,
            agreement: ChairAgreement::default(),
        }
    }
}

/// `percent` of `score`, scaled up by one step per prior offence.
pub(crate) fn escalating_penalty(score: Points, percent: Points, offences: u32) -> Points {
    if score <= 0 {
        return 0;
    }
    let steps = Points::from(offences).saturating_add(1);
    let effective = percent.saturating_mul(steps).clamp(0, 100);
    score * effective / 100
}

/// `amount * percent / 100`, rounded half up.
pub(crate) fn percent_of(amount: Points, percent: Points) -> Points {
    (amount * percent + 50).div_euclid(100)
}

/// Members with no recorded lie first (shuffled), then the rest in order.
pub(crate) fn honest_first(
    agents: &[AgentId],
    lied: impl Fn(AgentId) -> bool,
    ctx: &mut SimulationContext,
) -> Vec<AgentId> {
    let (mut honest, liars): (Vec<AgentId>, Vec<AgentId>) = agents.iter().partition(|id| !lied(**id));
    ctx.shuffle(&mut honest);
    honest.extend(liars);
    honest
}

pub(crate) fn invalid(message: impl Into<String>) -> GovernanceError {
    GovernanceError::InvalidPolicy(message.into())
}
