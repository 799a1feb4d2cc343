//! Leader privileged: a leader withdraws first and takes a larger share,
//! and casts a double ballot. A leader caught lying is deposed and the
//! team elects a new one. Repeat offenders are watched over a longer
//! window and expelled at the offence cap.

use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, AuditKind};

use super::{escalating_penalty, invalid, percent_of, ArticlesOfAssociation, Assembly, GovernanceRules};
use crate::components::audit::{AuditBook, AuditOutcome};
use crate::context::SimulationContext;
use crate::error::GovernanceError;
use crate::governance::tally::{tally, Ballot, QuorumRule};
use crate::Points;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderParams {
    pub leader_share_percent: Points,
    pub member_share_percent: Points,
    pub leader_vote_weight: f64,
    /// Fraction of the team's total voting weight a decision must exceed
    pub quorum_fraction: f64,
    pub punishment_percent: Points,
    /// Offences at which a member is expelled
    pub offence_cap: u32,
}

impl Default for LeaderParams {
    fn default() -> Self {
        Self {
            leader_share_percent: 25,
            member_share_percent: 20,
            leader_vote_weight: 2.0,
            quorum_fraction: 0.5,
            punishment_percent: 10,
            offence_cap: 3,
        }
    }
}

impl LeaderParams {
    pub fn validate(&self) -> Result<(), GovernanceError> {
        for pct in [self.leader_share_percent, self.member_share_percent, self.punishment_percent] {
            if !(0..=100).contains(&pct) {
                return Err(invalid("leader percentages must be within 0..=100"));
            }
        }
        if !(0.0..1.0).contains(&self.quorum_fraction) {
            return Err(invalid("leader quorum_fraction must be within [0, 1)"));
        }
        if self.leader_vote_weight <= 0.0 {
            return Err(invalid("leader_vote_weight must be positive"));
        }
        if self.offence_cap == 0 {
            return Err(invalid("leader offence_cap must be positive"));
        }
        Ok(())
    }
}

/// Audit window as offences accumulate
fn watch_window(offences: u32) -> usize {
    match offences {
        0 => 4,
        1 => 6,
        _ => 8,
    }
}

#[derive(Debug, Clone)]
pub struct LeaderPrivileged {
    params: LeaderParams,
    audits: AuditBook,
    members: Vec<AgentId>,
    leader: Option<AgentId>,
    expelled: Vec<AgentId>,
    pending_expulsions: Vec<AgentId>,
}

impl LeaderPrivileged {
    pub const ID: &'static str = "leader_privileged";

    pub fn new(params: LeaderParams, rules: &GovernanceRules, leader: Option<AgentId>) -> Result<Self, GovernanceError> {
        Ok(Self {
            audits: AuditBook::new(watch_window(0), rules.offence_threshold, params.offence_cap)?,
            params,
            members: Vec::new(),
            leader,
            expelled: Vec::new(),
            pending_expulsions: Vec::new(),
        })
    }

    fn vote_weight(&self, agent: AgentId) -> f64 {
        if Some(agent) == self.leader {
            self.params.leader_vote_weight
        } else {
            1.0
        }
    }

    fn quorum(&self) -> f64 {
        let total: f64 = self.members.iter().map(|m| self.vote_weight(*m)).sum();
        total * self.params.quorum_fraction
    }

    fn elect(&mut self, assembly: &mut Assembly<'_>) {
        let ballots = assembly.council.leadership_votes(assembly.members);
        let elected = tally(&ballots, |_| 1.0, QuorumRule::Plurality, assembly.ctx)
            .winner()
            .filter(|id| assembly.members.contains(id))
            .or_else(|| assembly.ctx.choose(assembly.members));
        if let Some(leader) = elected {
            tracing::info!(team = %assembly.team, %leader, "leader elected");
        }
        self.leader = elected;
    }
}

impl ArticlesOfAssociation for LeaderPrivileged {
    fn policy_id(&self) -> &'static str {
        Self::ID
    }

    fn enroll(&mut self, members: &[AgentId]) {
        self.members = members.to_vec();
        self.audits.enroll(members);
        if self.leader.map_or(true, |l| !members.contains(&l)) {
            self.leader = members.first().copied();
        }
    }

    fn begin_turn(&mut self) {
        self.audits.begin_round();
    }

    fn expected_contribution(&self, _agent: AgentId, turn_score: Points) -> Points {
        turn_score.max(0)
    }

    fn expected_withdrawal(&self, agent: AgentId, _score: Points, pool: Points) -> Points {
        let percent = if Some(agent) == self.leader {
            self.params.leader_share_percent
        } else {
            self.params.member_share_percent
        };
        percent_of(pool.max(0), percent)
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
        self.audits.record(agent, AuditKind::Contribution, outcome);
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
        if pool < 5 {
            2
        } else {
            2 + pool / 5
        }
    }

    fn vote_result(&self, ballots: &[Ballot], ctx: &mut SimulationContext) -> Option<AgentId> {
        tally(ballots, |id| self.vote_weight(id), QuorumRule::Threshold(self.quorum()), ctx).winner()
    }

    fn punishment(&self, score: Points, agent: AgentId) -> Points {
        escalating_penalty(score, self.params.punishment_percent, self.audits.offences(agent))
    }

    /// Leader first, everyone else shuffled.
    fn withdrawal_order(&self, agents: &[AgentId], ctx: &mut SimulationContext) -> Vec<AgentId> {
        let mut rest: Vec<AgentId> = agents.iter().copied().filter(|id| Some(*id) != self.leader).collect();
        ctx.shuffle(&mut rest);
        match self.leader.filter(|l| agents.contains(l)) {
            Some(leader) => std::iter::once(leader).chain(rest).collect(),
            None => rest,
        }
    }

    fn run_pre_iteration(&mut self, assembly: &mut Assembly<'_>) {
        if self.leader.map_or(true, |l| !assembly.members.contains(&l)) {
            self.elect(assembly);
        }
    }

    fn run_post_contribution(&mut self, assembly: &mut Assembly<'_>) {
        for member in assembly.members {
            let offences = self.audits.offences(*member);
            if offences >= self.params.offence_cap {
                if !self.expelled.contains(member) {
                    tracing::info!(team = %assembly.team, agent = %member, offences, "offence cap reached; expelling");
                    self.expelled.push(*member);
                    self.pending_expulsions.push(*member);
                }
                continue;
            }
            let window = watch_window(offences);
            if let Some(ledger) = self.audits.ledger(*member) {
                if ledger.window() < window {
                    if let Err(e) = self.audits.ledger_mut(*member).set_window(window) {
                        tracing::warn!(agent = %member, error = %e, "could not widen audit window");
                    }
                }
            }
        }
        if self.leader.is_none() {
            self.elect(assembly);
        }
    }

    fn audit_concluded(&mut self, agent: AgentId, _kind: AuditKind, lied: bool) {
        if !lied {
            return;
        }
        let cap = self.params.offence_cap;
        if self.audits.ledger_mut(agent).formalize_if_due(1, cap) {
            tracing::debug!(%agent, offences = self.audits.offences(agent), "audit formalised warnings");
        }
        if Some(agent) == self.leader {
            tracing::info!(leader = %agent, "leader caught lying; deposed");
            self.leader = None;
        }
    }

    fn take_expulsions(&mut self) -> Vec<AgentId> {
        std::mem::take(&mut self.pending_expulsions)
    }

    fn forget(&mut self, agent: AgentId) {
        self.members.retain(|m| *m != agent);
        self.audits.forget(agent);
        if self.leader == Some(agent) {
            self.leader = None;
        }
    }

    fn offences(&self, agent: AgentId) -> u32 {
        self.audits.offences(agent)
    }

    fn leader(&self) -> Option<AgentId> {
        self.leader
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::governance::policy::{Council, Strictness};
    use crate::governance::rank::RankBoundaries;
    use cpr_events::{BallotKind, TeamId};

    struct Electorate {
        choice: Option<AgentId>,
    }

    impl Council for Electorate {
        fn propose_rank_boundaries(&self, _: AgentId, _: &RankBoundaries) -> Option<RankBoundaries> {
            None
        }
        fn propose_ranks(&self, _: AgentId, _: &BTreeMap<AgentId, u8>) -> Option<BTreeMap<AgentId, u8>> {
            None
        }
        fn leadership_votes(&self, members: &[AgentId]) -> Vec<Ballot> {
            members
                .iter()
                .map(|m| Ballot::new(BallotKind::Leadership, *m, self.choice))
                .collect()
        }
        fn strictness_votes(&self, _: &[AgentId]) -> Vec<Vec<Strictness>> {
            Vec::new()
        }
    }

    fn build(n: usize) -> (LeaderPrivileged, Vec<AgentId>, SimulationContext) {
        let mut ctx = SimulationContext::seeded(31);
        let members: Vec<AgentId> = (0..n).map(|_| ctx.next_agent_id()).collect();
        let mut policy =
            LeaderPrivileged::new(LeaderParams::default(), &GovernanceRules::default(), Some(members[0])).unwrap();
        policy.enroll(&members);
        policy.begin_turn();
        (policy, members, ctx)
    }

    #[test]
    fn test_leader_takes_larger_share_and_goes_first() {
        let (policy, m, mut ctx) = build(4);
        assert_eq!(policy.expected_withdrawal(m[0], 0, 100), 25);
        assert_eq!(policy.expected_withdrawal(m[1], 0, 100), 20);
        let order = policy.withdrawal_order(&m, &mut ctx);
        assert_eq!(order[0], m[0]);
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_audit_cost_scales_with_pool() {
        let (policy, _, _) = build(3);
        assert_eq!(policy.audit_cost(4), 2);
        assert_eq!(policy.audit_cost(50), 12);
    }

    #[test]
    fn test_leader_ballot_counts_double() {
        let (policy, m, mut ctx) = build(4);
        // total weight 5, quorum 2.5: the leader plus one member carries it
        let ballots = vec![
            Ballot::new(BallotKind::ContributionAudit, m[0], Some(m[3])),
            Ballot::new(BallotKind::ContributionAudit, m[1], Some(m[3])),
        ];
        assert_eq!(policy.vote_result(&ballots, &mut ctx), Some(m[3]));
        let ballots = vec![
            Ballot::new(BallotKind::ContributionAudit, m[1], Some(m[3])),
            Ballot::new(BallotKind::ContributionAudit, m[2], Some(m[3])),
        ];
        assert_eq!(policy.vote_result(&ballots, &mut ctx), None);
    }

    #[test]
    fn test_caught_leader_is_deposed_and_replaced() {
        let (mut policy, m, mut ctx) = build(3);
        policy.record_contribution_audit(m[0], 10, 0, 10);
        assert!(policy.contribution_audit_result(m[0]));
        policy.audit_concluded(m[0], AuditKind::Contribution, true);
        assert_eq!(policy.leader(), None);
        assert_eq!(policy.offences(m[0]), 1);

        let council = Electorate { choice: Some(m[2]) };
        let mut assembly = Assembly { team: TeamId::generate(), members: &m, ctx: &mut ctx, council: &council };
        policy.run_post_contribution(&mut assembly);
        assert_eq!(policy.leader(), Some(m[2]));
    }

    #[test]
    fn test_offence_cap_expels_once() {
        let (mut policy, m, mut ctx) = build(3);
        for _ in 0..3 {
            policy.begin_turn();
            policy.record_contribution_audit(m[1], 10, 0, 0);
            policy.audit_concluded(m[1], AuditKind::Contribution, true);
        }
        assert_eq!(policy.offences(m[1]), 3);
        let council = Electorate { choice: None };
        let mut assembly = Assembly { team: TeamId::generate(), members: &m, ctx: &mut ctx, council: &council };
        policy.run_post_contribution(&mut assembly);
        assert_eq!(policy.take_expulsions(), vec![m[1]]);
        policy.run_post_contribution(&mut assembly);
        assert!(policy.take_expulsions().is_empty());
    }

    #[test]
    fn test_window_widens_with_offences() {
        let (mut policy, m, mut ctx) = build(3);
        policy.record_contribution_audit(m[1], 10, 0, 0);
        policy.audit_concluded(m[1], AuditKind::Contribution, true);
        let council = Electorate { choice: None };
        let mut assembly = Assembly { team: TeamId::generate(), members: &m, ctx: &mut ctx, council: &council };
        policy.run_post_contribution(&mut assembly);
        assert_eq!(policy.audits.ledger(m[1]).map(|l| l.window()), Some(6));
    }
}
