//! Vote Tally
//!
//! Resolves weighted ballots into a winner. Every ballot is tallied before
//! the totals are compared, so the result does not depend on ballot order,
//! except under [`QuorumRule::FirstPast`], which deliberately models the
//! "first to cross the line wins" protocol and is order-dependent.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, BallotKind};

use crate::context::SimulationContext;

const EPSILON: f64 = 1e-9;

/// One voter's choice at one decision point. `target: None` abstains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub kind: BallotKind,
    pub voter: AgentId,
    pub target: Option<AgentId>,
}

impl Ballot {
    pub fn new(kind: BallotKind, voter: AgentId, target: Option<AgentId>) -> Self {
        Self { kind, voter, target }
    }
}

/// How the leading total is turned into a decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuorumRule {
    /// Highest total wins outright.
    Plurality,
    /// Highest total wins only if it exceeds this fraction of all weight cast.
    Share(f64),
    /// Highest total wins only if it exceeds this absolute weight.
    Threshold(f64),
    /// Scan ballots in list order; the first candidate whose running total
    /// exceeds the threshold wins immediately. Falls back to no winner.
    FirstPast(f64),
}

/// Result of a tally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TallyOutcome {
    Winner(AgentId),
    /// Several candidates shared the top total; one was drawn uniformly.
    TieBroken { winner: AgentId, tied: Vec<AgentId> },
    NoWinner,
}

impl TallyOutcome {
    pub fn winner(&self) -> Option<AgentId> {
        match self {
            TallyOutcome::Winner(id) => Some(*id),
            TallyOutcome::TieBroken { winner, .. } => Some(*winner),
            TallyOutcome::NoWinner => None,
        }
    }
}

/// Keep the first ballot per voter; drop abstentions and self-votes.
fn counted_ballots(ballots: &[Ballot]) -> Vec<(AgentId, AgentId)> {
    let mut seen = BTreeSet::new();
    let mut counted = Vec::with_capacity(ballots.len());
    for ballot in ballots {
        if !seen.insert(ballot.voter) {
            tracing::debug!(voter = %ballot.voter, kind = ?ballot.kind, "duplicate ballot ignored");
            continue;
        }
        match ballot.target {
            Some(target) if target != ballot.voter => counted.push((ballot.voter, target)),
            _ => {}
        }
    }
    counted
}

/// Tally `ballots`, weighting each voter with `weight`.
pub fn tally<W>(ballots: &[Ballot], weight: W, rule: QuorumRule, ctx: &mut SimulationContext) -> TallyOutcome
where
    W: Fn(AgentId) -> f64,
{
    let counted = counted_ballots(ballots);

    if let QuorumRule::FirstPast(threshold) = rule {
        let mut running: BTreeMap<AgentId, f64> = BTreeMap::new();
        for (voter, target) in &counted {
            let w = weight(*voter);
            if w <= 0.0 {
                continue;
            }
            let total = running.entry(*target).or_insert(0.0);
            *total += w;
            if *total > threshold {
                return TallyOutcome::Winner(*target);
            }
        }
        return TallyOutcome::NoWinner;
    }

    let mut totals: BTreeMap<AgentId, f64> = BTreeMap::new();
    let mut cast = 0.0;
    for (voter, target) in &counted {
        let w = weight(*voter);
        if w <= 0.0 {
            continue;
        }
        *totals.entry(*target).or_insert(0.0) += w;
        cast += w;
    }

    let Some(best) = totals.values().copied().fold(None, |acc: Option<f64>, v| {
        Some(acc.map_or(v, |a| a.max(v)))
    }) else {
        return TallyOutcome::NoWinner;
    };

    let meets_quorum = match rule {
        QuorumRule::Plurality => true,
        QuorumRule::Share(fraction) => best > fraction * cast + EPSILON,
        QuorumRule::Threshold(threshold) => best > threshold + EPSILON,
        QuorumRule::FirstPast(threshold) => best > threshold + EPSILON,
    };
    if !meets_quorum {
        return TallyOutcome::NoWinner;
    }

    let tied: Vec<AgentId> = totals
        .iter()
        .filter(|(_, v)| (best - **v).abs() <= EPSILON)
        .map(|(id, _)| *id)
        .collect();

    match tied.as_slice() {
        [single] => TallyOutcome::Winner(*single),
        _ => match ctx.choose(&tied) {
            Some(winner) => TallyOutcome::TieBroken { winner, tied },
            None => TallyOutcome::NoWinner,
        },
    }
}

/// Instant-runoff over ranked preferences.
///
/// Each ballot lists candidates best first; entries that are not in
/// `candidates` are skipped. The candidate with the fewest first
/// preferences is eliminated each round (ties drawn at random) until one
/// holds a strict majority of the live ballots. `None` when no ballot
/// names any candidate.
pub fn instant_runoff<T>(ballots: &[Vec<T>], candidates: &[T], ctx: &mut SimulationContext) -> Option<T>
where
    T: Copy + Ord,
{
    let mut remaining: BTreeSet<T> = candidates.iter().copied().collect();

    loop {
        let mut counts: BTreeMap<T, usize> = remaining.iter().map(|c| (*c, 0)).collect();
        let mut live = 0usize;
        for ballot in ballots {
            if let Some(choice) = ballot.iter().find(|c| remaining.contains(c)) {
                if let Some(count) = counts.get_mut(choice) {
                    *count += 1;
                    live += 1;
                }
            }
        }

        if live == 0 {
            return None;
        }
        if let Some((winner, _)) = counts.iter().find(|(_, n)| **n * 2 > live) {
            return Some(*winner);
        }
        if remaining.len() == 1 {
            return remaining.iter().next().copied();
        }

        let fewest = counts.values().copied().min().unwrap_or(0);
        let lowest: Vec<T> = counts
            .iter()
            .filter(|(_, n)| **n == fewest)
            .map(|(c, _)| *c)
            .collect();
        let eliminated = ctx.choose(&lowest)?;
        remaining.remove(&eliminated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(n: u8) -> AgentId {
        AgentId::from_random_bytes([n; 16])
    }

    fn vote(voter: u8, target: Option<u8>) -> Ballot {
        Ballot::new(BallotKind::ContributionAudit, agent(voter), target.map(agent))
    }

    #[test]
    fn test_plurality_winner_is_deterministic() {
        let ballots = vec![vote(1, Some(3)), vote(2, Some(3)), vote(3, Some(1)), vote(4, None)];
        let mut first = SimulationContext::seeded(1);
        let mut second = SimulationContext::seeded(99);
        let a = tally(&ballots, |_| 1.0, QuorumRule::Plurality, &mut first);
        let b = tally(&ballots, |_| 1.0, QuorumRule::Plurality, &mut second);
        assert_eq!(a, TallyOutcome::Winner(agent(3)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_abstain_and_self_votes_never_count() {
        let mut ctx = SimulationContext::seeded(1);
        let ballots = vec![vote(1, None), vote(2, Some(2))];
        assert_eq!(tally(&ballots, |_| 1.0, QuorumRule::Plurality, &mut ctx), TallyOutcome::NoWinner);
        assert_eq!(tally(&[], |_| 1.0, QuorumRule::Plurality, &mut ctx), TallyOutcome::NoWinner);
    }

    #[test]
    fn test_one_ballot_per_voter() {
        let mut ctx = SimulationContext::seeded(1);
        // Voter 1 tries to vote twice for agent 5; only the first counts
        let ballots = vec![vote(1, Some(5)), vote(1, Some(5)), vote(2, Some(6)), vote(3, Some(6))];
        assert_eq!(
            tally(&ballots, |_| 1.0, QuorumRule::Plurality, &mut ctx),
            TallyOutcome::Winner(agent(6))
        );
    }

    #[test]
    fn test_leader_weight_counts_double() {
        let mut ctx = SimulationContext::seeded(1);
        let leader = agent(1);
        let ballots = vec![vote(1, Some(4)), vote(2, Some(5))];
        let weight = |id: AgentId| if id == leader { 2.0 } else { 1.0 };
        assert_eq!(tally(&ballots, weight, QuorumRule::Plurality, &mut ctx), TallyOutcome::Winner(agent(4)));
    }

    #[test]
    fn test_tie_breaks_among_leaders_only() {
        let ballots = vec![vote(1, Some(5)), vote(2, Some(6)), vote(3, Some(7)), vote(4, Some(7)), vote(8, Some(5))];
        for seed in 0..20 {
            let mut ctx = SimulationContext::seeded(seed);
            match tally(&ballots, |_| 1.0, QuorumRule::Plurality, &mut ctx) {
                TallyOutcome::TieBroken { winner, tied } => {
                    assert_eq!(tied, {
                        let mut t = vec![agent(5), agent(7)];
                        t.sort();
                        t
                    });
                    assert!(winner == agent(5) || winner == agent(7));
                }
                other => panic!("expected a broken tie, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_share_and_threshold_quorums() {
        let mut ctx = SimulationContext::seeded(1);
        let ballots = vec![vote(1, Some(5)), vote(2, Some(5)), vote(3, Some(6)), vote(4, Some(6))];
        // 2 of 4 is not more than half
        assert_eq!(tally(&ballots, |_| 1.0, QuorumRule::Share(0.5), &mut ctx), TallyOutcome::NoWinner);

        let ballots = vec![vote(1, Some(5)), vote(2, Some(5)), vote(3, Some(6))];
        assert_eq!(
            tally(&ballots, |_| 1.0, QuorumRule::Share(0.5), &mut ctx),
            TallyOutcome::Winner(agent(5))
        );
        assert_eq!(tally(&ballots, |_| 1.0, QuorumRule::Threshold(2.0), &mut ctx), TallyOutcome::NoWinner);
        assert_eq!(
            tally(&ballots, |_| 1.0, QuorumRule::Threshold(1.5), &mut ctx),
            TallyOutcome::Winner(agent(5))
        );
    }

    #[test]
    fn test_first_past_is_order_dependent() {
        let mut ctx = SimulationContext::seeded(1);
        let a = vec![vote(1, Some(5)), vote(2, Some(5)), vote(3, Some(6)), vote(4, Some(6)), vote(7, Some(6))];
        let mut b = a.clone();
        b.reverse();
        // Both candidates can reach 2; whoever gets there first in list order wins
        assert_eq!(tally(&a, |_| 1.0, QuorumRule::FirstPast(1.0), &mut ctx), TallyOutcome::Winner(agent(5)));
        assert_eq!(tally(&b, |_| 1.0, QuorumRule::FirstPast(1.0), &mut ctx), TallyOutcome::Winner(agent(6)));
        assert_eq!(tally(&a, |_| 1.0, QuorumRule::FirstPast(4.0), &mut ctx), TallyOutcome::NoWinner);
    }

    #[test]
    fn test_instant_runoff_majority_after_elimination() {
        let mut ctx = SimulationContext::seeded(3);
        // 0: two first prefs, 1: two first prefs, 2: one first pref transferring to 1
        let ballots = vec![vec![0, 1], vec![0, 2], vec![1, 0], vec![1, 2], vec![2, 1]];
        assert_eq!(instant_runoff(&ballots, &[0, 1, 2], &mut ctx), Some(1));
    }

    #[test]
    fn test_instant_runoff_empty_and_unknown_candidates() {
        let mut ctx = SimulationContext::seeded(3);
        let none: Vec<Vec<usize>> = vec![];
        assert_eq!(instant_runoff(&none, &[0, 1], &mut ctx), None);
        let unknown = vec![vec![7usize], vec![9]];
        assert_eq!(instant_runoff(&unknown, &[0, 1], &mut ctx), None);
        let single = vec![vec![9usize, 1]];
        assert_eq!(instant_runoff(&single, &[0, 1], &mut ctx), Some(1));
    }
}
