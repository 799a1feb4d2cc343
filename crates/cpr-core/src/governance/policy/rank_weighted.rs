//! Rank weighted: nothing is owed up front, stated contributions earn rank,
//! and the pool above a reserve is split by rank weight. Rank boundaries
//! are renegotiated by chair agreement before every iteration, and every
//! rank update after a contribution phase needs the chairs to agree too.

use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, AuditKind};

use super::{escalating_penalty, invalid, ArticlesOfAssociation, Assembly, GovernanceRules};
use crate::components::audit::{AuditBook, AuditOutcome};
use crate::context::SimulationContext;
use crate::error::GovernanceError;
use crate::governance::chair::{AgreementOutcome, ChairAgreement};
use crate::governance::rank::{RankBoundaries, RankTable, DEFAULT_BOUNDARIES};
use crate::governance::tally::{tally, Ballot, QuorumRule};
use crate::Points;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankWeightedParams {
    /// Turns of stated contributions counted toward rank
    pub contribution_window: usize,
    /// Pool kept back from distribution
    pub reserve: Points,
    pub boundaries: RankBoundaries,
    pub audit_cost: Points,
    pub punishment_percent: Points,
}

impl Default for RankWeightedParams {
    fn default() -> Self {
        Self {
            contribution_window: 5,
            reserve: 5,
            boundaries: DEFAULT_BOUNDARIES,
            audit_cost: 5,
            punishment_percent: 25,
        }
    }
}

impl RankWeightedParams {
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if self.contribution_window == 0 {
            return Err(invalid("rank weighted contribution_window must be positive"));
        }
        if self.reserve < 0 || self.audit_cost < 0 {
            return Err(invalid("rank weighted amounts must be non-negative"));
        }
        if !(0..=100).contains(&self.punishment_percent) {
            return Err(invalid("rank weighted punishment_percent must be within 0..=100"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RankWeighted {
    params: RankWeightedParams,
    agreement: ChairAgreement,
    audits: AuditBook,
    ranks: RankTable,
}

impl RankWeighted {
    pub const ID: &'static str = "rank_weighted";

    pub fn new(params: RankWeightedParams, rules: &GovernanceRules) -> Result<Self, GovernanceError> {
        Ok(Self {
            agreement: rules.agreement,
            audits: AuditBook::new(params.contribution_window, rules.offence_threshold, u32::MAX)?,
            ranks: RankTable::new(params.contribution_window, params.boundaries)?,
            params,
        })
    }

    pub fn ranks(&self) -> &RankTable {
        &self.ranks
    }

    pub fn ranks_mut(&mut self) -> &mut RankTable {
        &mut self.ranks
    }

    fn distributable(&self, pool: Points) -> Points {
        (pool - self.params.reserve).max(0)
    }
}

impl ArticlesOfAssociation for RankWeighted {
    fn policy_id(&self) -> &'static str {
        Self::ID
    }

    fn enroll(&mut self, members: &[AgentId]) {
        self.audits.enroll(members);
        self.ranks.enroll(members);
    }

    fn begin_turn(&mut self) {
        self.audits.begin_round();
    }

    fn expected_contribution(&self, _agent: AgentId, _turn_score: Points) -> Points {
        0
    }

    fn expected_withdrawal(&self, agent: AgentId, _score: Points, pool: Points) -> Points {
        self.ranks.share_of(agent, self.distributable(pool))
    }

    fn record_contribution_audit(&mut self, agent: AgentId, _turn_score: Points, actual: Points, stated: Points) {
        let outcome = if stated > actual {
            AuditOutcome::lied_by(stated - actual)
        } else {
            AuditOutcome::honest()
        };
        if self.audits.record(agent, AuditKind::Contribution, outcome) {
            self.ranks.record_contribution(agent, stated);
        }
    }

    fn record_withdrawal_audit(&mut self, agent: AgentId, score: Points, actual: Points, stated: Points, pool: Points) {
        let expected = self.expected_withdrawal(agent, score, pool);
        let outcome = if actual > expected {
            AuditOutcome::lied_by(actual - expected)
        } else if actual > stated {
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

    /// Highest rank first; equal ranks keep their given order.
    fn withdrawal_order(&self, agents: &[AgentId], _ctx: &mut SimulationContext) -> Vec<AgentId> {
        let mut order = agents.to_vec();
        order.sort_by_key(|id| std::cmp::Reverse(self.ranks.rank(*id)));
        order
    }

    fn run_pre_iteration(&mut self, assembly: &mut Assembly<'_>) {
        let current = self.ranks.boundaries();
        let council = assembly.council;
        let outcome = self.agreement.run(assembly.members, self.ranks.ranks_mut(), assembly.ctx, |chair| {
            council.propose_rank_boundaries(chair, &current)
        });
        match outcome {
            Ok(AgreementOutcome::Agreed { value, attempts, .. }) => {
                tracing::info!(team = %assembly.team, attempts, boundaries = ?value, "rank boundaries agreed");
                self.ranks.set_boundaries(value);
            }
            Ok(AgreementOutcome::Unilateral { value, chair }) => {
                tracing::info!(team = %assembly.team, %chair, boundaries = ?value, "rank boundaries set by sole member");
                self.ranks.set_boundaries(value);
            }
            Ok(AgreementOutcome::NoAgreement { attempts }) => {
                tracing::info!(team = %assembly.team, attempts, "no agreement on rank boundaries; keeping current");
            }
            Err(e) => {
                tracing::warn!(team = %assembly.team, error = %e, "rank boundary agreement skipped");
            }
        }
    }

    fn run_post_contribution(&mut self, assembly: &mut Assembly<'_>) {
        if assembly.members.is_empty() {
            return;
        }
        let recomputed = self.ranks.proposed_ranks(assembly.members);
        let council = assembly.council;
        let outcome = self.agreement.run(assembly.members, self.ranks.ranks_mut(), assembly.ctx, |chair| {
            council.propose_ranks(chair, &recomputed)
        });
        match outcome {
            Ok(AgreementOutcome::Agreed { value, attempts, .. }) => {
                tracing::debug!(team = %assembly.team, attempts, "rank update agreed");
                self.ranks.commit(assembly.members, &value);
            }
            Ok(AgreementOutcome::Unilateral { value, chair }) => {
                tracing::debug!(team = %assembly.team, %chair, "rank update set by sole member");
                self.ranks.commit(assembly.members, &value);
            }
            Ok(AgreementOutcome::NoAgreement { attempts }) => {
                tracing::info!(team = %assembly.team, attempts, "no agreement on rank update; keeping current ranks");
            }
            Err(e) => {
                tracing::warn!(team = %assembly.team, error = %e, "rank update agreement skipped");
            }
        }
    }

    fn forget(&mut self, agent: AgentId) {
        self.audits.forget(agent);
        self.ranks.forget(agent);
    }

    fn offences(&self, agent: AgentId) -> u32 {
        self.audits.offences(agent)
    }

    fn rank(&self, agent: AgentId) -> Option<u8> {
        Some(self.ranks.rank(agent))
    }

    fn rank_boundaries(&self) -> Option<RankBoundaries> {
        Some(self.ranks.boundaries())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::governance::policy::{Council, Strictness};
    use cpr_events::TeamId;

    struct Chairs {
        proposal: Option<RankBoundaries>,
        silent_on_ranks: bool,
    }

    impl Chairs {
        fn new(proposal: Option<RankBoundaries>) -> Self {
            Self { proposal, silent_on_ranks: false }
        }
    }

    impl Council for Chairs {
        fn propose_rank_boundaries(&self, _: AgentId, _: &RankBoundaries) -> Option<RankBoundaries> {
            self.proposal
        }
        fn propose_ranks(&self, _: AgentId, recomputed: &BTreeMap<AgentId, u8>) -> Option<BTreeMap<AgentId, u8>> {
            (!self.silent_on_ranks).then(|| recomputed.clone())
        }
        fn leadership_votes(&self, _: &[AgentId]) -> Vec<Ballot> {
            Vec::new()
        }
        fn strictness_votes(&self, _: &[AgentId]) -> Vec<Vec<Strictness>> {
            Vec::new()
        }
    }

    fn build() -> (RankWeighted, Vec<AgentId>, SimulationContext) {
        let mut ctx = SimulationContext::seeded(21);
        let members: Vec<AgentId> = (0..3).map(|_| ctx.next_agent_id()).collect();
        let mut policy = RankWeighted::new(RankWeightedParams::default(), &GovernanceRules::default()).unwrap();
        policy.enroll(&members);
        policy.begin_turn();
        (policy, members, ctx)
    }

    #[test]
    fn test_all_rank_zero_withdraws_nothing() {
        let (policy, m, _) = build();
        assert_eq!(policy.expected_contribution(m[0], 18), 0);
        assert_eq!(policy.expected_withdrawal(m[0], 50, 100), 0);
    }

    #[test]
    fn test_stated_contributions_raise_rank_one_step() {
        let (mut policy, m, mut ctx) = build();
        policy.record_contribution_audit(m[0], 18, 40, 40);
        policy.record_contribution_audit(m[1], 18, 0, 0);
        let council = Chairs::new(None);
        let mut assembly = Assembly { team: TeamId::generate(), members: &m, ctx: &mut ctx, council: &council };
        policy.run_post_contribution(&mut assembly);
        assert_eq!(policy.rank(m[0]), Some(1));
        assert_eq!(policy.rank(m[1]), Some(0));
        // Only rank-weighted members share the pool above the reserve
        assert_eq!(policy.expected_withdrawal(m[0], 0, 25), 20);
        assert_eq!(policy.expected_withdrawal(m[1], 0, 25), 0);
    }

    #[test]
    fn test_rank_update_waits_for_chairs() {
        let (mut policy, m, mut ctx) = build();
        policy.ranks_mut().ranks_mut().insert(m[1], 4);
        policy.ranks_mut().ranks_mut().insert(m[2], 4);
        policy.record_contribution_audit(m[0], 18, 40, 40);
        let council = Chairs { proposal: None, silent_on_ranks: true };

        // m[0] is not a chair here, so only the two feuding chairs lose rank
        let chairs = &m[1..];
        let mut assembly = Assembly { team: TeamId::generate(), members: chairs, ctx: &mut ctx, council: &council };
        policy.run_post_contribution(&mut assembly);
        assert_eq!(policy.rank(m[1]), Some(1));
        assert_eq!(policy.rank(m[2]), Some(1));

        let mut assembly = Assembly { team: TeamId::generate(), members: &m, ctx: &mut ctx, council: &council };
        policy.run_post_contribution(&mut assembly);
        assert_eq!(policy.rank(m[0]), Some(0));
    }

    #[test]
    fn test_repeat_contribution_audit_leaves_rank_window_alone() {
        let (mut policy, m, _) = build();
        policy.record_contribution_audit(m[0], 18, 12, 12);
        policy.record_contribution_audit(m[0], 18, 12, 12);
        assert_eq!(policy.ranks().contribution_total(m[0]), 12);
    }

    #[test]
    fn test_overstated_contribution_is_a_lie() {
        let (mut policy, m, _) = build();
        policy.record_contribution_audit(m[0], 18, 2, 9);
        assert!(policy.contribution_audit_result(m[0]));
        policy.record_contribution_audit(m[1], 18, 9, 2);
        assert!(!policy.contribution_audit_result(m[1]));
    }

    #[test]
    fn test_agreed_boundaries_are_adopted() {
        let (mut policy, m, mut ctx) = build();
        let proposal = [5, 15, 25, 35, 45];
        let council = Chairs::new(Some(proposal));
        let mut assembly = Assembly { team: TeamId::generate(), members: &m, ctx: &mut ctx, council: &council };
        policy.run_pre_iteration(&mut assembly);
        assert_eq!(policy.rank_boundaries(), Some(proposal));
    }

    #[test]
    fn test_silent_chairs_keep_boundaries() {
        let (mut policy, m, mut ctx) = build();
        let council = Chairs::new(None);
        let mut assembly = Assembly { team: TeamId::generate(), members: &m, ctx: &mut ctx, council: &council };
        policy.run_pre_iteration(&mut assembly);
        assert_eq!(policy.rank_boundaries(), Some(DEFAULT_BOUNDARIES));
    }

    #[test]
    fn test_highest_rank_withdraws_first() {
        let (mut policy, m, mut ctx) = build();
        policy.ranks_mut().ranks_mut().insert(m[2], 4);
        policy.ranks_mut().ranks_mut().insert(m[1], 2);
        assert_eq!(policy.withdrawal_order(&m, &mut ctx), vec![m[2], m[1], m[0]]);
    }
}
