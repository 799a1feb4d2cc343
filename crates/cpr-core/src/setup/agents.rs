//! Scripted Agents
//!
//! Simple rule-following agents with a fixed temperament. They grow
//! suspicious of members whose public claims break the rules or do not add
//! up to what the pool shows, remember who was caught lying, and vote
//! accordingly. That is enough to exercise every governance path without a
//! learned strategy.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};

use cpr_events::{AgentId, AuditKind};

use crate::components::agent::{ContributionView, CprAgent, Declaration, PhaseReport, WithdrawalView};
use crate::config::SimConfig;
use crate::context::SimulationContext;
use crate::governance::policy::{PolicyKind, Strictness};
use crate::governance::rank::{RankBoundaries, MAX_RANK};
use crate::systems::dice::expected_gain;
use crate::Points;

/// Below this score an opportunist starts cheating
const DESPERATION_SCORE: Points = 20;

/// How much a cheat lowers each rank boundary it proposes
const BOUNDARY_DISCOUNT: Points = 5;

/// Suspicion added to every other member when the pool does not match the claims
const UNEXPLAINED_GAP: u32 = 1;
/// Suspicion added for a claim that openly breaks the rules
const OPEN_BREACH: u32 = 2;
/// Suspicion added for a lie proven by a formal audit
const PROVEN_LIE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Temperament {
    /// Pays what is expected and takes what is allowed
    Honest,
    /// Claims to pay but keeps the money
    Freeloader,
    /// Pays honestly but takes more than its share
    Skimmer,
    /// Honest until its score runs low
    Opportunist,
}

impl Temperament {
    pub const ALL: [Temperament; 4] = [
        Temperament::Honest,
        Temperament::Freeloader,
        Temperament::Skimmer,
        Temperament::Opportunist,
    ];

    /// Score at which the agent stops pushing its luck
    fn stick_at(self) -> Points {
        match self {
            Temperament::Honest => 12,
            Temperament::Freeloader | Temperament::Skimmer => 20,
            Temperament::Opportunist => 16,
        }
    }
}

#[derive(Debug)]
pub struct ScriptedAgent {
    id: AgentId,
    temperament: Temperament,
    /// Weighted count of suspected and proven lies per agent
    suspicion: BTreeMap<AgentId, u32>,
    eliminated: bool,
}

impl ScriptedAgent {
    pub fn new(id: AgentId, temperament: Temperament) -> Self {
        Self {
            id,
            temperament,
            suspicion: BTreeMap::new(),
            eliminated: false,
        }
    }

    pub fn temperament(&self) -> Temperament {
        self.temperament
    }

    pub fn suspicion_of(&self, agent: AgentId) -> u32 {
        self.suspicion.get(&agent).copied().unwrap_or(0)
    }

    pub fn is_eliminated(&self) -> bool {
        self.eliminated
    }

    fn cheating(&self, score: Points) -> bool {
        match self.temperament {
            Temperament::Honest => false,
            Temperament::Freeloader | Temperament::Skimmer => true,
            Temperament::Opportunist => score < DESPERATION_SCORE,
        }
    }

    fn suspect(&mut self, agent: AgentId, amount: u32) {
        if agent != self.id {
            *self.suspicion.entry(agent).or_insert(0) += amount;
        }
    }

    fn prefers_strict_rules(&self) -> bool {
        self.temperament == Temperament::Honest
    }

    fn appeal(&self, kind: &PolicyKind) -> Points {
        if self.prefers_strict_rules() {
            match kind {
                PolicyKind::FlatQuota(p) => p.punishment_percent,
                PolicyKind::ScoreShare(_) => 40,
                PolicyKind::RankWeighted(p) => p.punishment_percent,
                PolicyKind::LeaderPrivileged(p) => p.punishment_percent + 10,
                PolicyKind::Monitoring(_) => 60,
            }
        } else {
            match kind {
                PolicyKind::FlatQuota(p) => p.withdrawal - p.punishment_percent,
                PolicyKind::ScoreShare(_) => 0,
                PolicyKind::RankWeighted(p) => -p.punishment_percent,
                PolicyKind::LeaderPrivileged(p) => p.member_share_percent - p.punishment_percent,
                PolicyKind::Monitoring(_) => -50,
            }
        }
    }
}

impl CprAgent for ScriptedAgent {
    fn id(&self) -> AgentId {
        self.id
    }

    fn stick_or_again(&mut self, accumulated: Points, previous_roll: Points) -> bool {
        accumulated >= self.temperament.stick_at() || expected_gain(accumulated, previous_roll) <= 0.0
    }

    fn decide_contribution(&mut self, view: &ContributionView) -> Declaration {
        let mut owed = view.expected.max(0);
        // Rank-weighted teams expect nothing and reward what is stated
        if view.rank.is_some() && owed == 0 {
            owed = view.turn_score / 2;
        }
        let owed = owed.min(view.score.max(0));
        match self.temperament {
            Temperament::Freeloader => Declaration::new(0, owed),
            Temperament::Opportunist if self.cheating(view.score) => Declaration::new(owed / 2, owed),
            _ => Declaration::honest(owed),
        }
    }

    fn decide_withdrawal(&mut self, view: &WithdrawalView) -> Declaration {
        let allowed = view.expected.clamp(0, view.common_pool.max(0));
        let skim = (allowed + (view.common_pool / 10).max(1)).min(view.common_pool.max(0));
        match self.temperament {
            Temperament::Skimmer => Declaration::new(skim, allowed),
            Temperament::Opportunist if self.cheating(view.score) => Declaration::new(skim, allowed),
            _ => Declaration::honest(allowed),
        }
    }

    fn policy_vote(&mut self, menu: &[PolicyKind]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..menu.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.appeal(&menu[i])));
        order
    }

    fn audit_vote(&mut self, _kind: AuditKind, members: &[AgentId]) -> Option<AgentId> {
        members
            .iter()
            .filter(|m| **m != self.id)
            .map(|m| (self.suspicion_of(*m), *m))
            .filter(|(lies, _)| *lies > 0)
            .max()
            .map(|(_, m)| m)
    }

    fn leadership_vote(&mut self, candidates: &[AgentId]) -> Option<AgentId> {
        candidates
            .iter()
            .filter(|c| **c != self.id)
            .min_by_key(|c| self.suspicion_of(**c))
            .copied()
    }

    fn strictness_vote(&mut self) -> Vec<Strictness> {
        match self.temperament {
            Temperament::Honest => vec![Strictness::Resolute, Strictness::Moderate, Strictness::Lenient],
            Temperament::Opportunist => vec![Strictness::Moderate, Strictness::Lenient, Strictness::Resolute],
            Temperament::Freeloader | Temperament::Skimmer => {
                vec![Strictness::Lenient, Strictness::Moderate, Strictness::Resolute]
            }
        }
    }

    fn propose_rank_boundaries(&mut self, current: &RankBoundaries) -> RankBoundaries {
        if self.prefers_strict_rules() {
            return *current;
        }
        current.map(|b| (b - BOUNDARY_DISCOUNT).max(0))
    }

    /// Cheats quietly promote themselves when chairing.
    fn propose_ranks(&mut self, recomputed: &BTreeMap<AgentId, u8>) -> BTreeMap<AgentId, u8> {
        let mut ranks = recomputed.clone();
        if !self.prefers_strict_rules() {
            if let Some(own) = ranks.get_mut(&self.id) {
                *own = own.saturating_add(1).min(MAX_RANK);
            }
        }
        ranks
    }

    fn observe_phase(&mut self, report: &PhaseReport) {
        for agent in report.open_breaches() {
            self.suspect(agent, OPEN_BREACH);
        }
        if report.unexplained() > 0 {
            for claim in &report.claims {
                self.suspect(claim.agent, UNEXPLAINED_GAP);
            }
        }
    }

    /// A cleared member starts over; a caught one is remembered.
    fn on_audit_result(&mut self, target: AgentId, _kind: AuditKind, lied: bool) {
        if lied {
            self.suspect(target, PROVEN_LIE);
        } else {
            self.suspicion.remove(&target);
        }
    }

    fn on_eliminated(&mut self) {
        self.eliminated = true;
    }
}

/// Build `agent_count` scripted agents drawn from the configured mix.
pub fn spawn_agents(config: &SimConfig, ctx: &mut SimulationContext) -> Vec<Box<dyn CprAgent>> {
    let count = config.simulation.agent_count;
    let mix = WeightedIndex::new(config.agents.weights()).ok();
    if mix.is_none() {
        tracing::warn!("agent mix has no usable weights; spawning honest agents only");
    }

    let mut agents: Vec<Box<dyn CprAgent>> = Vec::with_capacity(count);
    let mut tally: BTreeMap<&'static str, usize> = BTreeMap::new();
    for _ in 0..count {
        let temperament = match &mix {
            Some(dist) => Temperament::ALL[dist.sample(ctx.rng())],
            None => Temperament::Honest,
        };
        *tally.entry(temperament_name(temperament)).or_insert(0) += 1;
        let id = ctx.next_agent_id();
        agents.push(Box::new(ScriptedAgent::new(id, temperament)));
    }
    tracing::info!(agents = count, mix = ?tally, "spawned scripted agents");
    agents
}

fn temperament_name(temperament: Temperament) -> &'static str {
    match temperament {
        Temperament::Honest => "honest",
        Temperament::Freeloader => "freeloader",
        Temperament::Skimmer => "skimmer",
        Temperament::Opportunist => "opportunist",
    }
}
