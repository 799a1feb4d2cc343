//! Round Orchestrator
//!
//! Owns the ECS world and drives iterations: turn 0 forms teams, votes on
//! policies and runs pre-iteration logic; turns 1..=T run the game turn
//! schedule. A run ends after the configured iterations or when nobody is
//! left alive.

use std::collections::BTreeMap;

use bevy_ecs::prelude::*;

use cpr_events::{AgentId, TeamId};

use crate::components::agent::{AgentRoster, AgentState, CprAgent};
use crate::components::team::TeamRegistry;
use crate::config::SimConfig;
use crate::context::SimulationContext;
use crate::error::SimError;
use crate::output::recorder::{Recording, TurnRecorder};
use crate::output::stats::{SimulationSummary, StatsCollector};
use crate::Points;

use super::forming::{choose_policies, form_teams, run_pre_iteration, Formation, ShuffledTeams, TeamFormer};
use super::phase::PhaseRunner;
use super::turn::{
    audit_contributions, audit_withdrawals, begin_turn, check_eliminations, collect_contributions,
    collect_withdrawals, record_turn, roll_dice, update_ranks, CurrentPhase, GovernanceSettings, Phase, TurnLedger,
};

pub struct RoundOrchestrator {
    world: World,
    forming: Schedule,
    turn: Schedule,
    iterations: u32,
    turns_per_iteration: u32,
    threshold_range: (Points, Points),
}

impl RoundOrchestrator {
    /// Validate `config` and set up a world holding `agents`.
    pub fn new(config: &SimConfig, agents: Vec<Box<dyn CprAgent>>) -> Result<Self, SimError> {
        config.validate()?;
        if agents.is_empty() {
            return Err(SimError::NoAgents);
        }

        let sim = &config.simulation;
        let mut roster = AgentRoster::new();
        for agent in agents {
            let id = agent.id();
            if !roster.insert(agent, sim.initial_score) {
                tracing::warn!(agent = %id, "duplicate agent id ignored");
            }
        }

        let mut world = World::new();
        world.insert_resource(SimulationContext::seeded(sim.seed));
        world.insert_resource(roster);
        world.insert_resource(TeamRegistry::new());
        world.insert_resource(PhaseRunner::new(sim.phase_timeout()));
        world.insert_resource(GovernanceSettings {
            menu: config.governance.policy_menu.clone(),
            rules: config.governance.rules(),
        });
        world.insert_resource(Formation::new(ShuffledTeams::new(sim.team_size)));
        world.insert_resource(Recording::default());
        world.insert_resource(StatsCollector::new());
        world.insert_resource(TurnLedger::default());
        world.insert_resource(CurrentPhase::default());

        let mut forming = Schedule::default();
        forming.add_systems((form_teams, choose_policies, run_pre_iteration).chain());

        let mut turn = Schedule::default();
        turn.add_systems(
            (
                begin_turn,
                roll_dice,
                collect_contributions,
                audit_contributions,
                collect_withdrawals,
                audit_withdrawals,
                update_ranks,
                check_eliminations,
                record_turn,
            )
                .chain(),
        );

        Ok(Self {
            world,
            forming,
            turn,
            iterations: config.simulation.iterations,
            turns_per_iteration: config.simulation.turns_per_iteration,
            threshold_range: (sim.threshold_min, sim.threshold_max),
        })
    }

    pub fn with_team_former(mut self, former: impl TeamFormer + 'static) -> Self {
        self.world.insert_resource(Formation::new(former));
        self
    }

    pub fn with_recorder(mut self, recorder: impl TurnRecorder + 'static) -> Self {
        self.world.insert_resource(Recording(Box::new(recorder)));
        self
    }

    /// Turn 0: draw the threshold, form teams, vote policies, run pre-iteration logic.
    pub fn start_iteration(&mut self) -> u32 {
        let (min, max) = self.threshold_range;
        let (iteration, threshold) = {
            let mut ctx = self.world.resource_mut::<SimulationContext>();
            ctx.iteration += 1;
            ctx.turn = 0;
            let threshold = ctx.draw_threshold(min, max);
            (ctx.iteration, threshold)
        };
        self.world
            .resource_mut::<StatsCollector>()
            .begin_iteration(iteration, threshold);
        tracing::info!(iteration, threshold, "iteration started");
        self.forming.run(&mut self.world);
        iteration
    }

    /// One game turn.
    pub fn run_turn(&mut self) {
        self.turn.run(&mut self.world);
    }

    pub fn run_iteration(&mut self) {
        let iteration = self.start_iteration();
        for _ in 0..self.turns_per_iteration {
            if self.living_agents() == 0 {
                break;
            }
            self.run_turn();
        }
        self.world.resource_mut::<CurrentPhase>().0 = Phase::NextIteration;
        tracing::info!(iteration, survivors = self.living_agents(), "iteration finished");
    }

    /// Run every configured iteration and return the summary.
    pub fn run(&mut self) -> SimulationSummary {
        for _ in 0..self.iterations {
            if self.living_agents() == 0 {
                tracing::info!("no agents left alive; stopping early");
                break;
            }
            self.run_iteration();
        }
        if let Err(e) = self.world.resource_mut::<Recording>().0.flush() {
            tracing::warn!(error = %e, "failed to flush turn recorder");
        }
        self.summary()
    }

    pub fn summary(&self) -> SimulationSummary {
        let roster = self.world.resource::<AgentRoster>();
        let final_scores: BTreeMap<AgentId, Points> = roster.states().map(|s| (s.id, s.score)).collect();
        let survivors = roster.alive().len();
        let seed = self.context().seed();
        self.world
            .resource::<StatsCollector>()
            .summary(seed, final_scores, survivors)
    }

    pub fn phase(&self) -> Phase {
        self.world.resource::<CurrentPhase>().0
    }

    pub fn context(&self) -> &SimulationContext {
        self.world.resource::<SimulationContext>()
    }

    pub fn teams(&self) -> &TeamRegistry {
        self.world.resource::<TeamRegistry>()
    }

    pub fn team_of(&self, agent: AgentId) -> Option<TeamId> {
        self.teams().team_of(agent)
    }

    pub fn agent(&self, agent: AgentId) -> Option<AgentState> {
        self.world.resource::<AgentRoster>().state(agent).cloned()
    }

    pub fn living_agents(&self) -> usize {
        self.world.resource::<AgentRoster>().alive().len()
    }

    pub fn world(&self) -> &World {
        &self.world
    }
}
