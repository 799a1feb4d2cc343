//! Monitoring: voting power follows contribution history, and each member
//! sits on a surveillance ladder. Getting caught climbs the ladder (more
//! random audits, a smaller share, a heavier penalty); clean audits step
//! back down. Falling off the top of the ladder means expulsion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, AuditKind};

use super::{honest_first, invalid, percent_of, ArticlesOfAssociation, GovernanceRules};
use crate::components::audit::{AuditBook, AuditOutcome};
use crate::components::history::DecayAccumulator;
use crate::context::SimulationContext;
use crate::error::GovernanceError;
use crate::governance::tally::{tally, Ballot, QuorumRule};
use crate::Points;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringParams {
    /// Decay applied to the cumulative contribution history
    pub decay: f64,
    /// Weight of the latest contribution against the history
    pub current_weight: f64,
    /// Share of total voting power a decision must exceed
    pub vote_quorum: f64,
    pub contribution_percent: Points,
    /// Audit probability per surveillance stage
    pub stage_probabilities: Vec<f64>,
    /// Consecutive clean audits before stepping down a stage
    pub clean_to_step_down: u32,
    pub punishment_percent: Points,
}

impl Default for MonitoringParams {
    fn default() -> Self {
        Self {
            decay: 0.9,
            current_weight: 0.5,
            vote_quorum: 0.5,
            contribution_percent: 30,
            stage_probabilities: vec![0.1, 0.3, 0.6, 1.0],
            clean_to_step_down: 2,
            punishment_percent: 10,
        }
    }
}

impl MonitoringParams {
    pub fn validate(&self) -> Result<(), GovernanceError> {
        DecayAccumulator::new(self.decay)?;
        if !(0.0..=1.0).contains(&self.current_weight) || !(0.0..1.0).contains(&self.vote_quorum) {
            return Err(invalid("monitoring weights must be within [0, 1]"));
        }
        if self.stage_probabilities.is_empty() {
            return Err(invalid("monitoring needs at least one surveillance stage"));
        }
        if self.stage_probabilities.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(invalid("monitoring stage probabilities must be within [0, 1]"));
        }
        if !(0..=100).contains(&self.contribution_percent) || !(0..=100).contains(&self.punishment_percent) {
            return Err(invalid("monitoring percentages must be within 0..=100"));
        }
        Ok(())
    }

    fn top_stage(&self) -> u8 {
        self.stage_probabilities.len().saturating_sub(1).min(u8::MAX as usize) as u8
    }
}

#[derive(Debug, Clone, Default)]
struct Watch {
    stage: u8,
    clean_streak: u32,
    last_contribution: Points,
}

#[derive(Debug, Clone)]
pub struct Monitoring {
    params: MonitoringParams,
    audits: AuditBook,
    history: BTreeMap<AgentId, DecayAccumulator>,
    watch: BTreeMap<AgentId, Watch>,
    pending_expulsions: Vec<AgentId>,
}

impl Monitoring {
    pub const ID: &'static str = "monitoring";

    pub fn new(params: MonitoringParams, rules: &GovernanceRules) -> Result<Self, GovernanceError> {
        DecayAccumulator::new(params.decay)?;
        Ok(Self {
            audits: AuditBook::new(5, rules.offence_threshold, u32::MAX)?,
            params,
            history: BTreeMap::new(),
            watch: BTreeMap::new(),
            pending_expulsions: Vec::new(),
        })
    }

    pub fn stage(&self, agent: AgentId) -> u8 {
        self.watch.get(&agent).map_or(0, |w| w.stage)
    }

    fn raw_power(&self, agent: AgentId) -> f64 {
        let current = self.watch.get(&agent).map_or(0, |w| w.last_contribution) as f64;
        let cumulative = self.history.get(&agent).map_or(0.0, DecayAccumulator::value);
        (self.params.current_weight * current + (1.0 - self.params.current_weight) * cumulative).max(0.0)
    }

    /// Normalised voting power; everyone is equal until someone contributes.
    pub fn voting_power(&self, agent: AgentId) -> f64 {
        if !self.watch.contains_key(&agent) {
            return 0.0;
        }
        let total: f64 = self.watch.keys().map(|id| self.raw_power(*id)).sum();
        if total <= 0.0 {
            return 1.0 / self.watch.len() as f64;
        }
        self.raw_power(agent) / total
    }
}

impl ArticlesOfAssociation for Monitoring {
    fn policy_id(&self) -> &'static str {
        Self::ID
    }

    fn enroll(&mut self, members: &[AgentId]) {
        self.audits.enroll(members);
        for id in members {
            self.watch.entry(*id).or_default();
            if let Ok(acc) = DecayAccumulator::new(self.params.decay) {
                self.history.entry(*id).or_insert(acc);
            }
        }
    }

    fn begin_turn(&mut self) {
        self.audits.begin_round();
    }

    fn expected_contribution(&self, _agent: AgentId, turn_score: Points) -> Points {
        turn_score.max(0) * self.params.contribution_percent / 100
    }

    /// Equal share of the pool, halved for every surveillance stage.
    fn expected_withdrawal(&self, agent: AgentId, _score: Points, pool: Points) -> Points {
        let members = self.watch.len().max(1) as Points;
        let share = pool.max(0) / members;
        share >> u32::from(self.stage(agent)).min(62)
    }

    fn record_contribution_audit(&mut self, agent: AgentId, turn_score: Points, actual: Points, stated: Points) {
        let expected = self.expected_contribution(agent, turn_score);
        let outcome = if actual < expected {
            AuditOutcome::lied_by(expected - actual)
        } else if stated != actual {
            AuditOutcome::lied_by(stated - actual)
        } else {
            AuditOutcome::honest()
        };
        if !self.audits.record(agent, AuditKind::Contribution, outcome) {
            return;
        }
        self.watch.entry(agent).or_default().last_contribution = actual;
        if let Some(acc) = self.history.get_mut(&agent) {
            acc.push(actual as f64);
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

    fn audit_cost(&self, pool: Points) -> Points {
        match pool {
            p if p < 20 => 1,
            p if p < 50 => 2,
            p if p < 100 => 4,
            _ => 6,
        }
    }

    fn vote_result(&self, ballots: &[Ballot], ctx: &mut SimulationContext) -> Option<AgentId> {
        tally(
            ballots,
            |id| self.voting_power(id),
            QuorumRule::Threshold(self.params.vote_quorum),
            ctx,
        )
        .winner()
    }

    fn punishment(&self, score: Points, agent: AgentId) -> Points {
        let percent = self.params.punishment_percent * (Points::from(self.stage(agent)) + 1);
        percent_of(score.max(0), percent.min(100)).min(score.max(0))
    }

    fn withdrawal_order(&self, agents: &[AgentId], ctx: &mut SimulationContext) -> Vec<AgentId> {
        let mut order = honest_first(agents, |id| self.stage(id) > 0, ctx);
        order.sort_by_key(|id| self.stage(*id));
        order
    }

    fn audit_probability(&self, agent: AgentId) -> f64 {
        let stage = usize::from(self.stage(agent));
        self.params.stage_probabilities.get(stage).copied().unwrap_or(1.0)
    }

    fn audit_concluded(&mut self, agent: AgentId, _kind: AuditKind, lied: bool) {
        let top = self.params.top_stage();
        let step_down_after = self.params.clean_to_step_down.max(1);
        let watch = self.watch.entry(agent).or_default();
        if lied {
            watch.clean_streak = 0;
            if watch.stage >= top {
                if !self.pending_expulsions.contains(&agent) {
                    tracing::info!(%agent, stage = watch.stage, "caught at top surveillance stage; expelling");
                    self.pending_expulsions.push(agent);
                }
            } else {
                watch.stage += 1;
                tracing::debug!(%agent, stage = watch.stage, "surveillance escalated");
            }
            self.audits.ledger_mut(agent).add_offence(u32::MAX);
        } else {
            watch.clean_streak += 1;
            if watch.clean_streak >= step_down_after && watch.stage > 0 {
                watch.stage -= 1;
                watch.clean_streak = 0;
                tracing::debug!(%agent, stage = watch.stage, "surveillance relaxed");
            }
        }
    }

    fn take_expulsions(&mut self) -> Vec<AgentId> {
        std::mem::take(&mut self.pending_expulsions)
    }

    fn forget(&mut self, agent: AgentId) {
        self.audits.forget(agent);
        self.history.remove(&agent);
        self.watch.remove(&agent);
    }

    fn offences(&self, agent: AgentId) -> u32 {
        self.audits.offences(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpr_events::BallotKind;

    fn build(n: usize) -> (Monitoring, Vec<AgentId>, SimulationContext) {
        let mut ctx = SimulationContext::seeded(41);
        let members: Vec<AgentId> = (0..n).map(|_| ctx.next_agent_id()).collect();
        let mut policy = Monitoring::new(MonitoringParams::default(), &GovernanceRules::default()).unwrap();
        policy.enroll(&members);
        policy.begin_turn();
        (policy, members, ctx)
    }

    #[test]
    fn test_equal_power_before_any_contribution() {
        let (policy, m, _) = build(4);
        assert!((policy.voting_power(m[0]) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_contributors_dominate_votes() {
        let (mut policy, m, mut ctx) = build(3);
        policy.record_contribution_audit(m[0], 10, 10, 10);
        policy.record_contribution_audit(m[1], 10, 0, 0);
        policy.record_contribution_audit(m[2], 10, 0, 0);
        let ballots = vec![
            Ballot::new(BallotKind::WithdrawalAudit, m[0], Some(m[2])),
            Ballot::new(BallotKind::WithdrawalAudit, m[1], Some(m[0])),
            Ballot::new(BallotKind::WithdrawalAudit, m[2], Some(m[0])),
        ];
        assert_eq!(policy.vote_result(&ballots, &mut ctx), Some(m[2]));
    }

    #[test]
    fn test_repeat_contribution_audit_leaves_history_alone() {
        let (mut policy, m, _) = build(2);
        policy.record_contribution_audit(m[0], 10, 10, 10);
        policy.record_contribution_audit(m[1], 10, 10, 10);
        policy.record_contribution_audit(m[0], 10, 10, 10);
        assert!((policy.voting_power(m[0]) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_caught_agent_climbs_and_steps_down() {
        let (mut policy, m, _) = build(2);
        assert!((policy.audit_probability(m[0]) - 0.1).abs() < 1e-9);
        policy.audit_concluded(m[0], AuditKind::Contribution, true);
        assert_eq!(policy.stage(m[0]), 1);
        assert!((policy.audit_probability(m[0]) - 0.3).abs() < 1e-9);
        assert_eq!(policy.expected_withdrawal(m[0], 0, 40), 10);
        assert_eq!(policy.expected_withdrawal(m[1], 0, 40), 20);

        policy.audit_concluded(m[0], AuditKind::Withdrawal, false);
        assert_eq!(policy.stage(m[0]), 1);
        policy.audit_concluded(m[0], AuditKind::Withdrawal, false);
        assert_eq!(policy.stage(m[0]), 0);
    }

    #[test]
    fn test_caught_at_top_stage_is_expelled() {
        let (mut policy, m, _) = build(2);
        for _ in 0..4 {
            policy.audit_concluded(m[1], AuditKind::Contribution, true);
        }
        assert_eq!(policy.stage(m[1]), 3);
        assert_eq!(policy.take_expulsions(), vec![m[1]]);
        assert_eq!(policy.offences(m[1]), 4);
    }

    #[test]
    fn test_punishment_grows_with_stage() {
        let (mut policy, m, _) = build(2);
        assert_eq!(policy.punishment(100, m[0]), 10);
        policy.audit_concluded(m[0], AuditKind::Contribution, true);
        assert_eq!(policy.punishment(100, m[0]), 20);
    }

    #[test]
    fn test_watched_members_withdraw_last() {
        let (mut policy, m, mut ctx) = build(3);
        policy.audit_concluded(m[1], AuditKind::Contribution, true);
        let order = policy.withdrawal_order(&m, &mut ctx);
        assert_eq!(order[2], m[1]);
    }
}
