//! Orchestrator integration tests
//!
//! Full turns through the schedule with hand-built agents.

use std::thread;
use std::time::Duration;

use cpr_core::components::agent::{ContributionView, CprAgent, Declaration, WithdrawalView};
use cpr_core::config::SimConfig;
use cpr_core::context::SimulationContext;
use cpr_core::governance::policy::{FlatQuotaParams, PolicyKind};
use cpr_core::output::MemoryRecorder;
use cpr_core::systems::{Phase, RoundOrchestrator, SingleTeam, TeamFormer};
use cpr_core::{Points, SimError};
use cpr_events::{AgentId, AgentRecord, AuditKind, TurnRecord};

/// Sticks on the first roll, pays a fixed amount, withdraws what it is
/// allowed unless told otherwise, and may call for a contribution audit.
struct Fixed {
    id: AgentId,
    contribution: Points,
    withdrawal: Option<Points>,
    stall: Option<Duration>,
    accuse: Option<AgentId>,
}

impl Fixed {
    fn new(id: AgentId, contribution: Points) -> Self {
        Self { id, contribution, withdrawal: None, stall: None, accuse: None }
    }
}

impl CprAgent for Fixed {
    fn id(&self) -> AgentId {
        self.id
    }

    fn stick_or_again(&mut self, _accumulated: Points, _previous_roll: Points) -> bool {
        true
    }

    fn decide_contribution(&mut self, _view: &ContributionView) -> Declaration {
        if let Some(stall) = self.stall {
            thread::sleep(stall);
        }
        Declaration::honest(self.contribution)
    }

    fn decide_withdrawal(&mut self, view: &WithdrawalView) -> Declaration {
        Declaration::honest(self.withdrawal.unwrap_or(view.expected))
    }

    fn audit_vote(&mut self, kind: AuditKind, _members: &[AgentId]) -> Option<AgentId> {
        (kind == AuditKind::Contribution).then_some(self.accuse).flatten()
    }
}

/// Leaves the last agent out of every team.
struct LeaveOneOut;

impl TeamFormer for LeaveOneOut {
    fn form_teams(&mut self, agents: &[AgentId], _ctx: &mut SimulationContext) -> Vec<Vec<AgentId>> {
        match agents.split_last() {
            Some((_, rest)) if !rest.is_empty() => vec![rest.to_vec()],
            _ => Vec::new(),
        }
    }
}

fn ids(n: usize) -> Vec<AgentId> {
    let mut ctx = SimulationContext::seeded(7);
    (0..n).map(|_| ctx.next_agent_id()).collect()
}

fn config(menu: Vec<PolicyKind>) -> SimConfig {
    let mut config = SimConfig::default();
    config.simulation.iterations = 1;
    config.simulation.turns_per_iteration = 1;
    config.simulation.threshold_min = 0;
    config.simulation.threshold_max = 0;
    config.simulation.phase_timeout_ms = None;
    config.governance.policy_menu = menu;
    config
}

fn flat_quota(contribution: Points, withdrawal: Points) -> PolicyKind {
    PolicyKind::FlatQuota(FlatQuotaParams {
        contribution,
        withdrawal,
        audit_cost: 0,
        ..Default::default()
    })
}

fn agent_record(turn: &TurnRecord, id: AgentId) -> &AgentRecord {
    turn.agents
        .iter()
        .find(|a| a.agent_id == id)
        .expect("agent missing from turn record")
}

#[test]
fn test_short_contributor_reaches_an_offence() {
    let ids = ids(3);
    let agents: Vec<Box<dyn CprAgent>> = vec![
        Box::new(Fixed::new(ids[0], 10)),
        Box::new(Fixed::new(ids[1], 10)),
        Box::new(Fixed { withdrawal: Some(8), ..Fixed::new(ids[2], 5) }),
    ];
    let recorder = MemoryRecorder::new();
    let mut orchestrator = RoundOrchestrator::new(&config(vec![flat_quota(10, 10)]), agents)
        .unwrap()
        .with_team_former(SingleTeam)
        .with_recorder(recorder.clone());

    orchestrator.run();

    let records = recorder.records();
    assert_eq!(records.len(), 1);
    let turn = &records[0];
    assert_eq!(turn.teams.len(), 1);

    let flows = turn.teams[0].flows;
    assert_eq!(flows.opening, 0);
    assert_eq!(flows.contributions, 25);
    assert_eq!(flows.withdrawals, 24);
    assert_eq!(flows.audit_costs, 0);
    assert_eq!(flows.closing, 1);
    assert!(flows.is_conserved());

    for id in &ids {
        assert_eq!(agent_record(turn, *id).actual_withdrawal, 8);
    }
    assert_eq!(agent_record(turn, ids[0]).offences, 0);
    assert_eq!(agent_record(turn, ids[1]).offences, 0);
    assert_eq!(agent_record(turn, ids[2]).offences, 1);
}

#[test]
fn test_voted_audit_is_paid_from_the_pool_and_punishes() {
    let ids = ids(3);
    let agents: Vec<Box<dyn CprAgent>> = vec![
        Box::new(Fixed { accuse: Some(ids[2]), ..Fixed::new(ids[0], 10) }),
        Box::new(Fixed { accuse: Some(ids[2]), ..Fixed::new(ids[1], 10) }),
        Box::new(Fixed::new(ids[2], 5)),
    ];
    let policy = PolicyKind::FlatQuota(FlatQuotaParams {
        contribution: 10,
        withdrawal: 10,
        audit_cost: 4,
        punishment_percent: 20,
        ..Default::default()
    });
    let config = config(vec![policy]);
    let initial = config.simulation.initial_score;
    let recorder = MemoryRecorder::new();
    let mut orchestrator = RoundOrchestrator::new(&config, agents)
        .unwrap()
        .with_team_former(SingleTeam)
        .with_recorder(recorder.clone());

    let summary = orchestrator.run();

    let turn = &recorder.records()[0];
    let flows = turn.teams[0].flows;
    assert_eq!(flows.contributions, 25);
    assert_eq!(flows.audit_costs, 4);
    // 21 left after the audit: 7 each, less the short contributor's 5 owed
    assert_eq!(flows.withdrawals, 16);
    assert_eq!(flows.closing, flows.opening + flows.contributions - flows.withdrawals - flows.audit_costs);
    assert_eq!(flows.closing, 5);
    assert!(flows.is_conserved());

    let iteration = &summary.iterations[0];
    assert_eq!(iteration.formal_audits, 1);
    assert_eq!(iteration.lies_caught, 1);
    assert!(iteration.punishments > 0);

    let penalty_of = |id: AgentId| {
        let record = agent_record(turn, id);
        initial + record.turn_score - record.actual_contribution + record.actual_withdrawal - record.score
    };
    assert_eq!(penalty_of(ids[2]), iteration.punishments);
    assert_eq!(penalty_of(ids[0]), 0);
    assert_eq!(penalty_of(ids[1]), 0);
}

#[test]
fn test_withdrawals_never_overdraw_the_pool() {
    let ids = ids(3);
    let agents: Vec<Box<dyn CprAgent>> = ids
        .iter()
        .map(|id| Box::new(Fixed { withdrawal: Some(1_000), ..Fixed::new(*id, 4) }) as Box<dyn CprAgent>)
        .collect();
    let recorder = MemoryRecorder::new();
    let mut orchestrator = RoundOrchestrator::new(&config(vec![flat_quota(4, 10)]), agents)
        .unwrap()
        .with_team_former(SingleTeam)
        .with_recorder(recorder.clone());

    orchestrator.run();

    let turn = &recorder.records()[0];
    let flows = turn.teams[0].flows;
    assert_eq!(flows.contributions, 12);
    assert_eq!(flows.withdrawals, 12);
    assert_eq!(flows.closing, 0);
    let taken: Points = turn.agents.iter().map(|a| a.actual_withdrawal).sum();
    assert_eq!(taken, 12);
}

#[test]
fn test_teamless_agent_moves_nothing() {
    let ids = ids(3);
    let agents: Vec<Box<dyn CprAgent>> = ids.iter().map(|id| Box::new(Fixed::new(*id, 5)) as Box<dyn CprAgent>).collect();
    let recorder = MemoryRecorder::new();
    let mut orchestrator = RoundOrchestrator::new(&config(vec![flat_quota(5, 5)]), agents)
        .unwrap()
        .with_team_former(LeaveOneOut)
        .with_recorder(recorder.clone());

    orchestrator.start_iteration();
    let outsider = ids
        .iter()
        .copied()
        .find(|id| orchestrator.team_of(*id).is_none())
        .expect("one agent should be left out");
    orchestrator.run_turn();

    let turn = &recorder.records()[0];
    let record = agent_record(turn, outsider);
    assert_eq!(record.team_id, None);
    assert_eq!(record.actual_contribution, 0);
    assert_eq!(record.actual_withdrawal, 0);
    assert!(record.alive);
    assert_eq!(turn.teams[0].member_count, 2);
}

#[test]
fn test_stalled_agent_defaults_to_zero() {
    let ids = ids(3);
    let agents: Vec<Box<dyn CprAgent>> = vec![
        Box::new(Fixed::new(ids[0], 6)),
        Box::new(Fixed::new(ids[1], 6)),
        Box::new(Fixed { stall: Some(Duration::from_millis(400)), ..Fixed::new(ids[2], 6) }),
    ];
    let mut config = config(vec![flat_quota(6, 0)]);
    config.simulation.phase_timeout_ms = Some(50);
    let recorder = MemoryRecorder::new();
    let mut orchestrator = RoundOrchestrator::new(&config, agents)
        .unwrap()
        .with_team_former(SingleTeam)
        .with_recorder(recorder.clone());

    orchestrator.run();

    let turn = &recorder.records()[0];
    assert_eq!(agent_record(turn, ids[0]).actual_contribution, 6);
    assert_eq!(agent_record(turn, ids[2]).actual_contribution, 0);
    assert_eq!(turn.teams[0].flows.contributions, 12);
    assert!(turn.teams[0].flows.is_conserved());
}

#[test]
fn test_everyone_below_threshold_ends_the_run() {
    let ids = ids(4);
    let agents: Vec<Box<dyn CprAgent>> = ids.iter().map(|id| Box::new(Fixed::new(*id, 0)) as Box<dyn CprAgent>).collect();
    let mut config = config(vec![flat_quota(0, 0)]);
    config.simulation.iterations = 3;
    config.simulation.turns_per_iteration = 4;
    config.simulation.threshold_min = 1_000;
    config.simulation.threshold_max = 1_001;
    let recorder = MemoryRecorder::new();
    let mut orchestrator = RoundOrchestrator::new(&config, agents)
        .unwrap()
        .with_recorder(recorder.clone());

    let summary = orchestrator.run();

    assert_eq!(recorder.len(), 1);
    assert_eq!(summary.survivors, 0);
    assert_eq!(summary.total_eliminated, 4);
    assert_eq!(summary.iterations.len(), 1);
    assert_eq!(orchestrator.phase(), Phase::NextIteration);
    for id in &ids {
        let state = orchestrator.agent(*id).unwrap();
        assert!(!state.alive);
        assert_eq!(state.team, None);
    }
    assert!(orchestrator.teams().is_empty());
}

#[test]
fn test_empty_population_is_rejected() {
    let result = RoundOrchestrator::new(&SimConfig::default(), Vec::new());
    assert!(matches!(result, Err(SimError::NoAgents)));
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = SimConfig::default();
    config.governance.policy_menu.clear();
    let agents: Vec<Box<dyn CprAgent>> = vec![Box::new(Fixed::new(ids(1)[0], 0))];
    assert!(matches!(RoundOrchestrator::new(&config, agents), Err(SimError::Config(_))));
}
