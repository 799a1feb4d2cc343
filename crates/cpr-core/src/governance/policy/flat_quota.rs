//! Flat quota: everyone owes the same contribution and may take the same
//! capped withdrawal, less whatever they came up short.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, AuditKind};

use super::{escalating_penalty, invalid, ArticlesOfAssociation, GovernanceRules};
use crate::components::audit::{AuditBook, AuditOutcome};
use crate::context::SimulationContext;
use crate::error::GovernanceError;
use crate::governance::tally::{tally, Ballot, QuorumRule};
use crate::Points;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatQuotaParams {
    pub contribution: Points,
    /// Upper bound on any single withdrawal
    pub withdrawal: Points,
    pub audit_cost: Points,
    pub punishment_percent: Points,
    pub audit_window: usize,
}

impl Default for FlatQuotaParams {
    fn default() -> Self {
        Self {
            contribution: 10,
            withdrawal: 10,
            audit_cost: 2,
            punishment_percent: 10,
            audit_window: 5,
        }
    }
}

impl FlatQuotaParams {
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if self.contribution < 0 || self.withdrawal < 0 || self.audit_cost < 0 {
            return Err(invalid("flat quota amounts must be non-negative"));
        }
        if !(0..=100).contains(&self.punishment_percent) {
            return Err(invalid("flat quota punishment_percent must be within 0..=100"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FlatQuota {
    params: FlatQuotaParams,
    audits: AuditBook,
    members: Vec<AgentId>,
    /// Contribution shortfall from the current turn
    shortfall: BTreeMap<AgentId, Points>,
}

impl FlatQuota {
    pub const ID: &'static str = "flat_quota";

    pub fn new(params: FlatQuotaParams, rules: &GovernanceRules) -> Result<Self, GovernanceError> {
        Ok(Self {
            audits: AuditBook::new(params.audit_window, rules.offence_threshold, u32::MAX)?,
            params,
            members: Vec::new(),
            shortfall: BTreeMap::new(),
        })
    }
}

impl ArticlesOfAssociation for FlatQuota {
    fn policy_id(&self) -> &'static str {
        Self::ID
    }

    fn enroll(&mut self, members: &[AgentId]) {
        self.members = members.to_vec();
        self.audits.enroll(members);
    }

    fn begin_turn(&mut self) {
        self.audits.begin_round();
        self.shortfall.clear();
    }

    fn expected_contribution(&self, _agent: AgentId, _turn_score: Points) -> Points {
        self.params.contribution
    }

    fn expected_withdrawal(&self, agent: AgentId, _score: Points, pool: Points) -> Points {
        let equal_share = match self.members.len() {
            0 => 0,
            n => pool.max(0) / n as Points,
        };
        let owed = self.shortfall.get(&agent).copied().unwrap_or(0);
        (self.params.withdrawal.min(equal_share) - owed).max(0)
    }

    fn record_contribution_audit(&mut self, agent: AgentId, _turn_score: Points, actual: Points, stated: Points) {
        let expected = self.params.contribution;
        let short = (expected - actual).max(0);
        let outcome = if short > 0 {
            AuditOutcome::lied_by(short)
        } else if stated != actual {
            AuditOutcome::lied_by(stated - actual)
        } else {
            AuditOutcome::honest()
        };
        if self.audits.record(agent, AuditKind::Contribution, outcome) {
            self.shortfall.insert(agent, short);
        }
    }

    fn record_withdrawal_audit(&mut self, agent: AgentId, score: Points, actual: Points, stated: Points, pool: Points) {
        let expected = self.expected_withdrawal(agent, score, pool);
        let outcome = if actual > expected {
            AuditOutcome::lied_by(actual - expected)
        } else if stated != actual {
            AuditOutcome::lied_by(actual - stated)
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

    fn vote_result(&self, ballots: &[Ballot], ctx: &mut SimulationContext) -> Option<AgentId> {
        tally(ballots, |_| 1.0, QuorumRule::Plurality, ctx).winner()
    }

    fn punishment(&self, score: Points, agent: AgentId) -> Points {
        escalating_penalty(score, self.params.punishment_percent, self.audits.offences(agent))
    }

    fn withdrawal_order(&self, agents: &[AgentId], ctx: &mut SimulationContext) -> Vec<AgentId> {
        let mut order = agents.to_vec();
        ctx.shuffle(&mut order);
        order
    }

    fn forget(&mut self, agent: AgentId) {
        self.members.retain(|m| *m != agent);
        self.audits.forget(agent);
        self.shortfall.remove(&agent);
    }

    fn offences(&self, agent: AgentId) -> u32 {
        self.audits.offences(agent)
    }
}
