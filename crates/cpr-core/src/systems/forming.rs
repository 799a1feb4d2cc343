//! Team Formation
//!
//! Partitions the living agents into teams at the start of every
//! iteration. Formation strategies are pluggable.

use std::collections::BTreeSet;

use bevy_ecs::prelude::*;

use cpr_events::AgentId;

use crate::components::agent::AgentRoster;
use crate::components::team::{Team, TeamRegistry};
use crate::context::SimulationContext;
use crate::governance::policy::{Assembly, PolicyKind};
use crate::governance::tally::instant_runoff;
use crate::output::stats::StatsCollector;

use super::council::RosterCouncil;
use super::phase::PhaseRunner;
use super::turn::{CurrentPhase, GovernanceSettings, Phase};

/// Strategy that groups agents into teams
pub trait TeamFormer: Send + Sync {
    /// Each inner list becomes one team. Agents may be left out.
    fn form_teams(&mut self, agents: &[AgentId], ctx: &mut SimulationContext) -> Vec<Vec<AgentId>>;
}

/// Shuffle, then cut into teams of `team_size`.
///
/// A remainder too small to form a team of two joins the last team.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffledTeams {
    pub team_size: usize,
}

impl ShuffledTeams {
    pub fn new(team_size: usize) -> Self {
        Self { team_size: team_size.max(1) }
    }
}

impl TeamFormer for ShuffledTeams {
    fn form_teams(&mut self, agents: &[AgentId], ctx: &mut SimulationContext) -> Vec<Vec<AgentId>> {
        let mut pool = agents.to_vec();
        ctx.shuffle(&mut pool);

        let mut teams: Vec<Vec<AgentId>> = pool.chunks(self.team_size.max(1)).map(<[AgentId]>::to_vec).collect();
        if teams.len() > 1 && teams.last().map_or(false, |t| t.len() < 2) {
            if let Some(leftover) = teams.pop() {
                if let Some(last) = teams.last_mut() {
                    last.extend(leftover);
                }
            }
        }
        teams
    }
}

/// Every agent in one team.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTeam;

impl TeamFormer for SingleTeam {
    fn form_teams(&mut self, agents: &[AgentId], _ctx: &mut SimulationContext) -> Vec<Vec<AgentId>> {
        if agents.is_empty() {
            Vec::new()
        } else {
            vec![agents.to_vec()]
        }
    }
}

/// Resource: the active formation strategy
#[derive(Resource)]
pub struct Formation(pub Box<dyn TeamFormer>);

impl Formation {
    pub fn new(former: impl TeamFormer + 'static) -> Self {
        Self(Box::new(former))
    }
}

/// Dissolve last iteration's teams and form new ones from the living agents.
///
/// Every new team starts under the first menu entry until it votes.
pub fn form_teams(
    mut ctx: ResMut<SimulationContext>,
    mut roster: ResMut<AgentRoster>,
    mut teams: ResMut<TeamRegistry>,
    mut formation: ResMut<Formation>,
    settings: Res<GovernanceSettings>,
    mut phase: ResMut<CurrentPhase>,
) {
    phase.0 = Phase::TeamForming;
    teams.clear();
    for state in roster.states_mut() {
        state.team = None;
    }

    let alive = roster.alive();
    let groups = formation.0.form_teams(&alive, &mut ctx);
    let Some(founding_policy) = settings.menu.first() else {
        tracing::error!("policy menu is empty; no teams formed");
        return;
    };

    let mut assigned = BTreeSet::new();
    for group in groups {
        let members: Vec<AgentId> = group
            .into_iter()
            .filter(|id| {
                let eligible = roster.is_alive(*id) && assigned.insert(*id);
                if !eligible {
                    tracing::warn!(agent = %id, "formation placed an unknown, dead or duplicate agent; skipped");
                }
                eligible
            })
            .collect();
        if members.is_empty() {
            continue;
        }
        let policy = match founding_policy.build(&members, &settings.rules, &mut ctx) {
            Ok(policy) => policy,
            Err(e) => {
                tracing::error!(error = %e, "could not build founding policy; members left without a team");
                continue;
            }
        };
        let team = Team::new(ctx.next_team_id(), members.clone(), policy);
        for id in &members {
            if let Some(state) = roster.state_mut(*id) {
                state.team = Some(team.id);
            }
        }
        tracing::debug!(team = %team.id, size = members.len(), "team formed");
        teams.insert(team);
    }

    for id in alive.iter().filter(|id| !assigned.contains(*id)) {
        tracing::debug!(agent = %id, "agent has no team this iteration");
    }
    tracing::info!(iteration = ctx.iteration, teams = teams.len(), agents = assigned.len(), "teams formed");
}

/// Each team ranks the menu; instant-runoff picks its policy.
pub fn choose_policies(
    mut ctx: ResMut<SimulationContext>,
    roster: Res<AgentRoster>,
    mut teams: ResMut<TeamRegistry>,
    runner: Res<PhaseRunner>,
    settings: Res<GovernanceSettings>,
    mut stats: ResMut<StatsCollector>,
) {
    let menu: Vec<PolicyKind> = settings.menu.clone();
    let choices: Vec<usize> = (0..menu.len()).collect();

    for team_id in teams.ids() {
        let Some(team) = teams.get_mut(team_id) else {
            continue;
        };
        let members = team.members().to_vec();
        let jobs = roster
            .handles(&members)
            .into_iter()
            .map(|(id, handle)| (id, handle, menu.clone()))
            .collect();
        let ballots: Vec<Vec<usize>> = runner
            .poll("policy_vote", jobs, |agent, menu: Vec<PolicyKind>| agent.policy_vote(&menu))
            .into_values()
            .collect();

        let chosen = instant_runoff(&ballots, &choices, &mut ctx).unwrap_or(0);
        if let Some(kind) = menu.get(chosen).filter(|_| chosen != 0) {
            match kind.build(&members, &settings.rules, &mut ctx) {
                Ok(policy) => team.adopt(policy),
                Err(e) => tracing::error!(team = %team_id, error = %e, "could not build chosen policy; keeping founding policy"),
            }
        }
        tracing::debug!(team = %team_id, policy = team.policy().policy_id(), ballots = ballots.len(), "policy chosen");
        stats.record_policy(team.policy().policy_id());
    }
}

/// Pre-iteration policy logic (rank boundaries, strictness, elections).
pub fn run_pre_iteration(
    mut ctx: ResMut<SimulationContext>,
    roster: Res<AgentRoster>,
    mut teams: ResMut<TeamRegistry>,
    runner: Res<PhaseRunner>,
) {
    let council = RosterCouncil::new(&roster, &runner);
    for team_id in teams.ids() {
        let Some(team) = teams.get_mut(team_id) else {
            continue;
        };
        let members = team.members().to_vec();
        let mut assembly = Assembly {
            team: team_id,
            members: &members,
            ctx: &mut ctx,
            council: &council,
        };
        team.policy_mut().run_pre_iteration(&mut assembly);
    }
}
