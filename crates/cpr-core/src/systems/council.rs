//! Council
//!
//! Bridges policy hooks to the live agents: questions go out through the
//! phase runner and unanswered ones come back empty. Every question asked
//! through one council shares the deadline taken when it was convened.

use std::collections::BTreeMap;
use std::time::Instant;

use cpr_events::{AgentId, BallotKind};

use crate::components::agent::AgentRoster;
use crate::governance::policy::{Council, Strictness};
use crate::governance::rank::RankBoundaries;
use crate::governance::tally::Ballot;

use super::phase::PhaseRunner;

pub struct RosterCouncil<'a> {
    roster: &'a AgentRoster,
    runner: &'a PhaseRunner,
    deadline: Option<Instant>,
}

impl<'a> RosterCouncil<'a> {
    pub fn new(roster: &'a AgentRoster, runner: &'a PhaseRunner) -> Self {
        Self {
            roster,
            runner,
            deadline: runner.phase_deadline(),
        }
    }
}

impl Council for RosterCouncil<'_> {
    fn propose_rank_boundaries(&self, chair: AgentId, current: &RankBoundaries) -> Option<RankBoundaries> {
        if !self.roster.is_alive(chair) {
            return None;
        }
        let handle = self.roster.handle(chair)?;
        self.runner.ask_until("rank_boundaries", self.deadline, chair, handle, *current, |agent, current| {
            agent.propose_rank_boundaries(&current)
        })
    }

    fn propose_ranks(&self, chair: AgentId, recomputed: &BTreeMap<AgentId, u8>) -> Option<BTreeMap<AgentId, u8>> {
        if !self.roster.is_alive(chair) {
            return None;
        }
        let handle = self.roster.handle(chair)?;
        self.runner.ask_until("rank_update", self.deadline, chair, handle, recomputed.clone(), |agent, recomputed| {
            agent.propose_ranks(&recomputed)
        })
    }

    fn leadership_votes(&self, members: &[AgentId]) -> Vec<Ballot> {
        let candidates = members.to_vec();
        let jobs = self
            .roster
            .handles(members)
            .into_iter()
            .map(|(id, handle)| (id, handle, candidates.clone()))
            .collect();
        let answers = self.runner.poll_until("leadership_vote", self.deadline, jobs, |agent, candidates: Vec<AgentId>| {
            agent.leadership_vote(&candidates)
        });
        members
            .iter()
            .map(|id| Ballot::new(BallotKind::Leadership, *id, answers.get(id).copied().flatten()))
            .collect()
    }

    fn strictness_votes(&self, members: &[AgentId]) -> Vec<Vec<Strictness>> {
        let jobs = self
            .roster
            .handles(members)
            .into_iter()
            .map(|(id, handle)| (id, handle, ()))
            .collect();
        self.runner
            .poll_until("strictness_vote", self.deadline, jobs, |agent, ()| agent.strictness_vote())
            .into_values()
            .collect()
    }
}
