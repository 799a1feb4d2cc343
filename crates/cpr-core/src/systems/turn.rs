//! Turn Systems
//!
//! One game turn as a chain of systems: roll, contribute, audit, withdraw,
//! audit, update ranks, eliminate, record. Every pool change happens here,
//! serially and through the pool's own lock.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use bevy_ecs::prelude::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use cpr_events::{AgentId, AgentRecord, AuditKind, TeamId, TurnRecord};

use crate::components::agent::{AgentRoster, ContributionView, Declaration, MemberClaim, PhaseReport, WithdrawalView};
use crate::components::team::{Team, TeamRegistry};
use crate::context::SimulationContext;
use crate::governance::policy::{Assembly, GovernanceRules, PolicyKind};
use crate::governance::tally::Ballot;
use crate::output::recorder::Recording;
use crate::output::stats::StatsCollector;
use crate::Points;

use super::council::RosterCouncil;
use super::dice::{play_turn, DiceTurn};
use super::phase::PhaseRunner;

/// Where the orchestrator is within an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    #[default]
    TeamForming,
    Rolling,
    Contributing,
    ContributionAudit,
    Withdrawing,
    WithdrawalAudit,
    RankUpdate,
    EliminationCheck,
    NextIteration,
}

#[derive(Resource, Debug, Default)]
pub struct CurrentPhase(pub Phase);

/// Resource: the policy menu and the rules every policy is built with
#[derive(Resource, Debug, Clone)]
pub struct GovernanceSettings {
    pub menu: Vec<PolicyKind>,
    pub rules: GovernanceRules,
}

/// One agent's movements during the current turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentTurn {
    pub turn_score: Points,
    pub stated_contribution: Points,
    pub actual_contribution: Points,
    pub stated_withdrawal: Points,
    pub actual_withdrawal: Points,
    pub contributed: bool,
    pub withdrew: bool,
}

/// Resource: per-turn scratch state, cleared at the start of each turn
#[derive(Resource, Debug, Default)]
pub struct TurnLedger {
    agents: BTreeMap<AgentId, AgentTurn>,
    withdrawal_pool: BTreeMap<TeamId, Points>,
}

impl TurnLedger {
    pub fn clear(&mut self) {
        self.agents.clear();
        self.withdrawal_pool.clear();
    }

    pub fn get(&self, agent: AgentId) -> AgentTurn {
        self.agents.get(&agent).copied().unwrap_or_default()
    }

    fn entry(&mut self, agent: AgentId) -> &mut AgentTurn {
        self.agents.entry(agent).or_default()
    }

    /// Pool balance the team's withdrawal phase opened with
    pub fn withdrawal_pool(&self, team: TeamId) -> Option<Points> {
        self.withdrawal_pool.get(&team).copied()
    }
}

/// Living members of `team`, in team order
fn living_members(team: &Team, roster: &AgentRoster) -> Vec<AgentId> {
    team.members().iter().copied().filter(|id| roster.is_alive(*id)).collect()
}

pub fn begin_turn(
    mut ctx: ResMut<SimulationContext>,
    mut teams: ResMut<TeamRegistry>,
    mut ledger: ResMut<TurnLedger>,
    mut phase: ResMut<CurrentPhase>,
) {
    ctx.turn += 1;
    ledger.clear();
    for id in teams.ids() {
        if let Some(team) = teams.get_mut(id) {
            team.pool().open_turn();
            team.policy_mut().begin_turn();
        }
    }
    phase.0 = Phase::Rolling;
    tracing::debug!(iteration = ctx.iteration, turn = ctx.turn, "turn started");
}

/// Every living agent plays its dice turn on its own seeded stream.
pub fn roll_dice(
    mut ctx: ResMut<SimulationContext>,
    mut roster: ResMut<AgentRoster>,
    runner: Res<PhaseRunner>,
    mut ledger: ResMut<TurnLedger>,
) {
    let alive = roster.alive();
    let jobs: Vec<_> = roster
        .handles(&alive)
        .into_iter()
        .map(|(id, handle)| (id, handle, ctx.fork_seed()))
        .collect();
    let turns = runner.poll("rolling", jobs, |agent, seed| {
        play_turn(agent, &mut SmallRng::seed_from_u64(seed))
    });

    for id in alive {
        let turn = turns.get(&id).copied().unwrap_or(DiceTurn { score: 0, rolls: 0, bust: false });
        if let Some(state) = roster.state_mut(id) {
            state.score += turn.score;
        }
        ledger.entry(id).turn_score = turn.score;
        tracing::trace!(agent = %id, score = turn.score, rolls = turn.rolls, bust = turn.bust, "dice turn");
    }
}

/// Ask for contributions in parallel, then pay them in serially.
pub fn collect_contributions(
    mut roster: ResMut<AgentRoster>,
    teams: Res<TeamRegistry>,
    runner: Res<PhaseRunner>,
    mut ledger: ResMut<TurnLedger>,
    mut phase: ResMut<CurrentPhase>,
) {
    phase.0 = Phase::Contributing;

    let mut participants: Vec<(AgentId, TeamId)> = Vec::new();
    let mut jobs = Vec::new();
    for id in roster.alive() {
        let Some(team_id) = roster.state(id).and_then(|s| s.team) else {
            tracing::debug!(agent = %id, "agent has no team; contribution defaults to zero");
            continue;
        };
        let Some(team) = teams.get(team_id) else {
            tracing::warn!(agent = %id, team = %team_id, "agent's team is missing; contribution defaults to zero");
            continue;
        };
        let Some(handle) = roster.handle(id) else {
            continue;
        };
        let turn_score = ledger.get(id).turn_score;
        let view = ContributionView {
            agent: id,
            score: roster.score(id),
            turn_score,
            expected: team.policy().expected_contribution(id, turn_score),
            common_pool: team.pool().balance(),
            team_size: team.members().len(),
            rank: team.policy().rank(id),
        };
        participants.push((id, team_id));
        jobs.push((id, handle, view));
    }

    let answers = runner.poll("contribution", jobs, |agent, view| agent.decide_contribution(&view));

    for (id, team_id) in participants {
        let Some(team) = teams.get(team_id) else {
            continue;
        };
        let declaration = answers.get(&id).copied().unwrap_or_else(Declaration::zero);
        let score = roster.score(id);
        let affordable = declaration.actual.clamp(0, score.max(0));
        if affordable != declaration.actual {
            tracing::debug!(agent = %id, requested = declaration.actual, affordable, "contribution clamped");
        }
        let accepted = team.pool().deposit(id, affordable);
        if let Some(state) = roster.state_mut(id) {
            state.score -= accepted;
        }
        let entry = ledger.entry(id);
        entry.stated_contribution = declaration.stated.max(0);
        entry.actual_contribution = accepted;
        entry.contributed = true;
    }
}

/// What the team saw of one phase: each participant's claim against the
/// policy's expectation, and the net pool movement.
fn phase_report<E>(kind: AuditKind, members: &[AgentId], ledger: &TurnLedger, expected: E) -> PhaseReport
where
    E: Fn(AgentId, &AgentTurn) -> Points,
{
    let mut claims = Vec::new();
    let mut pool_change = 0;
    for id in members {
        let turn = ledger.get(*id);
        let (took_part, stated, actual) = match kind {
            AuditKind::Contribution => (turn.contributed, turn.stated_contribution, turn.actual_contribution),
            AuditKind::Withdrawal => (turn.withdrew, turn.stated_withdrawal, -turn.actual_withdrawal),
        };
        if !took_part {
            continue;
        }
        claims.push(MemberClaim { agent: *id, stated, expected: expected(*id, &turn) });
        pool_change += actual;
    }
    PhaseReport { kind, claims, pool_change }
}

/// Share the phase report, then run the audit vote and every formal audit
/// for one team and one kind.
fn run_formal_audits(
    report: PhaseReport,
    deadline: Option<Instant>,
    team: &mut Team,
    roster: &mut AgentRoster,
    runner: &PhaseRunner,
    ctx: &mut SimulationContext,
    stats: &mut StatsCollector,
) {
    let kind = report.kind;
    let members = living_members(team, roster);
    if members.is_empty() {
        return;
    }

    runner.notify_until("phase_report", deadline, roster.handles(&members), move |agent| {
        agent.observe_phase(&report)
    });

    let jobs = roster
        .handles(&members)
        .into_iter()
        .map(|(id, handle)| (id, handle, members.clone()))
        .collect();
    let answers = runner.poll_until("audit_vote", deadline, jobs, move |agent, members: Vec<AgentId>| {
        agent.audit_vote(kind, &members)
    });
    let ballots: Vec<Ballot> = members
        .iter()
        .map(|id| Ballot::new(kind.into(), *id, answers.get(id).copied().flatten()))
        .collect();

    let mut targets = BTreeSet::new();
    if let Some(voted) = team.policy().vote_result(&ballots, ctx) {
        if members.contains(&voted) {
            targets.insert(voted);
        } else {
            tracing::debug!(team = %team.id, target = %voted, "vote picked a non-member; ignored");
        }
    }
    for id in &members {
        let probability = team.policy().audit_probability(*id);
        if probability > 0.0 && ctx.chance(probability) {
            targets.insert(*id);
        }
    }

    for target in targets {
        let cost = team.policy().audit_cost(team.pool().balance());
        let charged = team.pool().charge_audit(cost);
        let lied = match kind {
            AuditKind::Contribution => team.policy().contribution_audit_result(target),
            AuditKind::Withdrawal => team.policy().withdrawal_audit_result(target),
        };

        let mut penalty = 0;
        if lied {
            let score = roster.score(target);
            penalty = team.policy().punishment(score, target).clamp(0, score.max(0));
            if let Some(state) = roster.state_mut(target) {
                state.score -= penalty;
            }
        }
        team.policy_mut().audit_concluded(target, kind, lied);
        stats.record_audit(lied, penalty);
        tracing::debug!(team = %team.id, agent = %target, ?kind, lied, cost = charged, penalty, "formal audit");

        runner.notify_until("audit_result", deadline, roster.handles(&members), move |agent| {
            agent.on_audit_result(target, kind, lied)
        });
    }
}

pub fn audit_contributions(
    mut ctx: ResMut<SimulationContext>,
    mut roster: ResMut<AgentRoster>,
    mut teams: ResMut<TeamRegistry>,
    runner: Res<PhaseRunner>,
    ledger: Res<TurnLedger>,
    mut stats: ResMut<StatsCollector>,
    mut phase: ResMut<CurrentPhase>,
) {
    phase.0 = Phase::ContributionAudit;
    let deadline = runner.phase_deadline();
    for team_id in teams.ids() {
        let Some(team) = teams.get_mut(team_id) else {
            continue;
        };
        let members = living_members(team, &roster);
        for id in &members {
            let turn = ledger.get(*id);
            if !turn.contributed {
                continue;
            }
            team.policy_mut().record_contribution_audit(
                *id,
                turn.turn_score,
                turn.actual_contribution,
                turn.stated_contribution,
            );
        }
        let policy = team.policy();
        let report = phase_report(AuditKind::Contribution, &members, &ledger, |id, turn| {
            policy.expected_contribution(id, turn.turn_score)
        });
        run_formal_audits(report, deadline, team, &mut roster, &runner, &mut ctx, &mut stats);
    }
}

/// Serve withdrawals one agent at a time in the policy's order.
pub fn collect_withdrawals(
    mut ctx: ResMut<SimulationContext>,
    mut roster: ResMut<AgentRoster>,
    teams: Res<TeamRegistry>,
    runner: Res<PhaseRunner>,
    mut ledger: ResMut<TurnLedger>,
    mut phase: ResMut<CurrentPhase>,
) {
    phase.0 = Phase::Withdrawing;
    let deadline = runner.phase_deadline();

    for id in roster.alive() {
        if roster.state(id).and_then(|s| s.team).is_none() {
            tracing::debug!(agent = %id, "agent has no team; withdrawal defaults to zero");
        }
    }

    for team in teams.iter() {
        let opening = team.pool().balance();
        ledger.withdrawal_pool.insert(team.id, opening);
        let members = living_members(team, &roster);
        let order = team.policy().withdrawal_order(&members, &mut ctx);

        for id in order {
            if !members.contains(&id) {
                tracing::warn!(team = %team.id, agent = %id, "withdrawal order named a non-member; skipped");
                continue;
            }
            let Some(handle) = roster.handle(id) else {
                continue;
            };
            let score = roster.score(id);
            let view = WithdrawalView {
                agent: id,
                score,
                expected: team.policy().expected_withdrawal(id, score, opening),
                common_pool: team.pool().balance(),
                team_size: members.len(),
                rank: team.policy().rank(id),
            };
            let declaration = runner
                .ask_until("withdrawal", deadline, id, handle, view, |agent, view| agent.decide_withdrawal(&view))
                .unwrap_or_else(Declaration::zero);
            let accepted = team.pool().withdraw(id, declaration.actual);
            if let Some(state) = roster.state_mut(id) {
                state.score += accepted;
            }
            let entry = ledger.entry(id);
            entry.stated_withdrawal = declaration.stated.max(0);
            entry.actual_withdrawal = accepted;
            entry.withdrew = true;
        }
        tracing::debug!(team = %team.id, opening, closing = team.pool().balance(), "withdrawals served");
    }
}

pub fn audit_withdrawals(
    mut ctx: ResMut<SimulationContext>,
    mut roster: ResMut<AgentRoster>,
    mut teams: ResMut<TeamRegistry>,
    runner: Res<PhaseRunner>,
    ledger: Res<TurnLedger>,
    mut stats: ResMut<StatsCollector>,
    mut phase: ResMut<CurrentPhase>,
) {
    phase.0 = Phase::WithdrawalAudit;
    let deadline = runner.phase_deadline();
    for team_id in teams.ids() {
        let Some(team) = teams.get_mut(team_id) else {
            continue;
        };
        let opening = ledger.withdrawal_pool(team_id).unwrap_or_else(|| team.pool().balance());
        let members = living_members(team, &roster);
        for id in &members {
            let turn = ledger.get(*id);
            if !turn.withdrew {
                continue;
            }
            team.policy_mut().record_withdrawal_audit(
                *id,
                roster.score(*id),
                turn.actual_withdrawal,
                turn.stated_withdrawal,
                opening,
            );
        }
        let policy = team.policy();
        let report = phase_report(AuditKind::Withdrawal, &members, &ledger, |id, turn| {
            policy.expected_withdrawal(id, roster.score(id) - turn.actual_withdrawal, opening)
        });
        run_formal_audits(report, deadline, team, &mut roster, &runner, &mut ctx, &mut stats);
    }
}

/// Post-contribution policy logic, then apply any expulsions.
pub fn update_ranks(
    mut ctx: ResMut<SimulationContext>,
    mut roster: ResMut<AgentRoster>,
    mut teams: ResMut<TeamRegistry>,
    runner: Res<PhaseRunner>,
    mut stats: ResMut<StatsCollector>,
    mut phase: ResMut<CurrentPhase>,
) {
    phase.0 = Phase::RankUpdate;

    let mut expelled: Vec<(TeamId, AgentId)> = Vec::new();
    {
        let council = RosterCouncil::new(&roster, &runner);
        for team_id in teams.ids() {
            let Some(team) = teams.get_mut(team_id) else {
                continue;
            };
            let members = living_members(team, &roster);
            let mut assembly = Assembly {
                team: team_id,
                members: &members,
                ctx: &mut ctx,
                council: &council,
            };
            team.policy_mut().run_post_contribution(&mut assembly);
            expelled.extend(team.policy_mut().take_expulsions().into_iter().map(|a| (team_id, a)));
        }
    }

    for (team_id, agent) in expelled {
        if teams.team_of(agent) != Some(team_id) {
            continue;
        }
        teams.remove_member(agent);
        if let Some(state) = roster.state_mut(agent) {
            state.team = None;
        }
        stats.record_expulsion(agent);
        tracing::info!(team = %team_id, %agent, "agent expelled");
    }
}

/// Agents whose score fell below the iteration's threshold are eliminated.
pub fn check_eliminations(
    ctx: Res<SimulationContext>,
    mut roster: ResMut<AgentRoster>,
    mut teams: ResMut<TeamRegistry>,
    runner: Res<PhaseRunner>,
    mut stats: ResMut<StatsCollector>,
    mut phase: ResMut<CurrentPhase>,
) {
    phase.0 = Phase::EliminationCheck;
    let threshold = ctx.elimination_threshold;

    let doomed: Vec<AgentId> = roster
        .states()
        .filter(|s| s.alive && s.score < threshold)
        .map(|s| s.id)
        .collect();
    if doomed.is_empty() {
        return;
    }

    let handles = roster.handles(&doomed);
    for id in &doomed {
        teams.remove_member(*id);
        if let Some(state) = roster.state_mut(*id) {
            tracing::info!(agent = %id, score = state.score, threshold, "agent eliminated");
            state.alive = false;
            state.team = None;
        }
        stats.record_elimination(*id);
    }
    runner.notify("eliminated", handles, |agent| agent.on_eliminated());
}

/// Snapshot the turn, hand it to the recorder, dissolve empty teams.
pub fn record_turn(
    ctx: Res<SimulationContext>,
    roster: Res<AgentRoster>,
    mut teams: ResMut<TeamRegistry>,
    ledger: Res<TurnLedger>,
    mut recording: ResMut<Recording>,
    mut stats: ResMut<StatsCollector>,
) {
    let mut record = TurnRecord::new(ctx.iteration, ctx.turn);
    for state in roster.states() {
        let turn = ledger.get(state.id);
        let policy = state.team.and_then(|t| teams.get(t)).map(Team::policy);
        record.agents.push(AgentRecord {
            agent_id: state.id,
            team_id: state.team,
            score: state.score,
            turn_score: turn.turn_score,
            stated_contribution: turn.stated_contribution,
            actual_contribution: turn.actual_contribution,
            stated_withdrawal: turn.stated_withdrawal,
            actual_withdrawal: turn.actual_withdrawal,
            rank: policy.and_then(|p| p.rank(state.id)),
            offences: policy.map_or(0, |p| p.offences(state.id)),
            alive: state.alive,
        });
    }
    for team in teams.iter() {
        let team_record = team.record();
        if !team_record.flows.is_conserved() {
            tracing::error!(team = %team.id, flows = ?team_record.flows, "pool flows do not balance");
        }
        record.teams.push(team_record);
    }

    if let Err(e) = recording.0.record(&record) {
        tracing::error!(iteration = record.iteration, turn = record.turn, error = %e, "failed to record turn");
    }
    stats.record_turn(&record);
    teams.prune_empty();
}
