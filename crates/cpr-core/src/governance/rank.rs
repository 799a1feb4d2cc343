//! Rank Engine
//!
//! Ranks run from 0 to [`MAX_RANK`]. Reaching `boundaries[i]` with the
//! windowed contribution total makes an agent eligible for rank `i + 1`,
//! but a rank moves by at most one step per update.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use cpr_events::AgentId;

use crate::components::history::WindowCounter;
use crate::error::HistoryError;
use crate::Points;

pub const MAX_RANK: u8 = 5;

/// Contribution totals needed for ranks 1 through 5
pub type RankBoundaries = [Points; MAX_RANK as usize];

pub const DEFAULT_BOUNDARIES: RankBoundaries = [10, 20, 30, 40, 50];

/// Highest rank whose boundary `total` reaches.
pub fn eligible_rank(total: Points, boundaries: &RankBoundaries) -> u8 {
    boundaries
        .iter()
        .enumerate()
        .rev()
        .find(|(_, boundary)| total >= **boundary)
        .map_or(0, |(i, _)| i as u8 + 1)
}

/// Move one step from `current` toward `target`.
pub fn step_toward(current: u8, target: u8) -> u8 {
    let next = match current.cmp(&target) {
        std::cmp::Ordering::Less => current.saturating_add(1),
        std::cmp::Ordering::Greater => current.saturating_sub(1),
        std::cmp::Ordering::Equal => current,
    };
    next.min(MAX_RANK)
}

pub fn next_rank(current: u8, total: Points, boundaries: &RankBoundaries) -> u8 {
    step_toward(current.min(MAX_RANK), eligible_rank(total, boundaries))
}

/// Withdrawal weight of a rank.
pub fn rank_weight(rank: u8) -> f64 {
    f64::from(rank) / 2.0
}

/// Per-team ranks plus the contribution windows they are computed from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankTable {
    ranks: BTreeMap<AgentId, u8>,
    contributions: BTreeMap<AgentId, WindowCounter>,
    boundaries: RankBoundaries,
    window: NonZeroUsize,
}

impl RankTable {
    pub fn new(window: usize, boundaries: RankBoundaries) -> Result<Self, HistoryError> {
        Ok(Self {
            ranks: BTreeMap::new(),
            contributions: BTreeMap::new(),
            boundaries,
            window: NonZeroUsize::new(window).ok_or(HistoryError::ZeroCapacity)?,
        })
    }

    pub fn enroll(&mut self, members: &[AgentId]) {
        for id in members {
            self.ranks.entry(*id).or_insert(0);
        }
    }

    /// Rank of `agent`; unknown agents are rank 0.
    pub fn rank(&self, agent: AgentId) -> u8 {
        self.ranks.get(&agent).copied().unwrap_or(0)
    }

    pub fn ranks(&self) -> &BTreeMap<AgentId, u8> {
        &self.ranks
    }

    pub fn ranks_mut(&mut self) -> &mut BTreeMap<AgentId, u8> {
        &mut self.ranks
    }

    pub fn boundaries(&self) -> RankBoundaries {
        self.boundaries
    }

    pub fn set_boundaries(&mut self, boundaries: RankBoundaries) {
        self.boundaries = boundaries;
    }

    pub fn record_contribution(&mut self, agent: AgentId, stated: Points) {
        let window = self.window;
        self.contributions
            .entry(agent)
            .or_insert_with(|| WindowCounter::with_capacity(window))
            .push(stated);
    }

    pub fn contribution_total(&self, agent: AgentId) -> Points {
        self.contributions.get(&agent).map_or(0, WindowCounter::sum)
    }

    /// One speed-limited update for every listed member, without applying it.
    pub fn proposed_ranks(&mut self, members: &[AgentId]) -> BTreeMap<AgentId, u8> {
        let mut proposed = BTreeMap::new();
        for id in members {
            let total = match self.contributions.get_mut(id) {
                Some(window) => {
                    window.reconcile();
                    window.sum()
                }
                None => 0,
            };
            proposed.insert(*id, next_rank(self.rank(*id), total, &self.boundaries));
        }
        proposed
    }

    /// Move each listed member one step toward its entry in `ranks`.
    ///
    /// Members missing from `ranks` keep their rank.
    pub fn commit(&mut self, members: &[AgentId], ranks: &BTreeMap<AgentId, u8>) {
        for id in members {
            let Some(target) = ranks.get(id) else {
                continue;
            };
            let current = self.rank(*id);
            let next = step_toward(current, *target);
            if next != current {
                tracing::debug!(agent = %id, from = current, to = next, "rank changed");
            }
            self.ranks.insert(*id, next);
        }
    }

    /// Share of `distributable` for `agent`, weighted by rank.
    ///
    /// Zero when nobody in the team carries any weight.
    pub fn share_of(&self, agent: AgentId, distributable: Points) -> Points {
        if distributable <= 0 {
            return 0;
        }
        let total: f64 = self.ranks.values().copied().map(rank_weight).sum();
        if total <= 0.0 {
            return 0;
        }
        let share = rank_weight(self.rank(agent)) / total * distributable as f64;
        share.floor() as Points
    }

    pub fn forget(&mut self, agent: AgentId) {
        self.ranks.remove(&agent);
        self.contributions.remove(&agent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn agent(n: u8) -> AgentId {
        AgentId::from_random_bytes([n; 16])
    }

    #[test]
    fn test_eligible_rank() {
        assert_eq!(eligible_rank(0, &DEFAULT_BOUNDARIES), 0);
        assert_eq!(eligible_rank(9, &DEFAULT_BOUNDARIES), 0);
        assert_eq!(eligible_rank(10, &DEFAULT_BOUNDARIES), 1);
        assert_eq!(eligible_rank(35, &DEFAULT_BOUNDARIES), 3);
        assert_eq!(eligible_rank(500, &DEFAULT_BOUNDARIES), 5);
    }

    #[test]
    fn test_big_contribution_climbs_one_step() {
        let mut table = RankTable::new(5, DEFAULT_BOUNDARIES).unwrap();
        let id = agent(1);
        table.enroll(&[id]);
        table.record_contribution(id, 1000);
        assert_eq!(table.contribution_total(id), 1000);
        for expected in 1..=2 {
            let proposed = table.proposed_ranks(&[id]);
            table.commit(&[id], &proposed);
            assert_eq!(table.rank(id), expected);
        }
    }

    #[test]
    fn test_proposal_is_applied_only_on_commit() {
        let mut table = RankTable::new(5, DEFAULT_BOUNDARIES).unwrap();
        let id = agent(1);
        table.enroll(&[id]);
        table.record_contribution(id, 25);
        let proposed = table.proposed_ranks(&[id]);
        assert_eq!(proposed[&id], 1);
        assert_eq!(table.rank(id), 0);
        table.commit(&[id], &proposed);
        assert_eq!(table.rank(id), 1);

        // A proposal further away still moves one step, and outsiders are ignored
        let outsider = agent(2);
        let jump = BTreeMap::from([(id, MAX_RANK), (outsider, 3)]);
        table.commit(&[id], &jump);
        assert_eq!(table.rank(id), 2);
        assert!(!table.ranks().contains_key(&outsider));
    }

    #[test]
    fn test_share_is_zero_without_weight() {
        let mut table = RankTable::new(5, DEFAULT_BOUNDARIES).unwrap();
        table.enroll(&[agent(1), agent(2)]);
        assert_eq!(table.share_of(agent(1), 100), 0);
    }

    #[test]
    fn test_share_follows_rank_weight() {
        let mut table = RankTable::new(5, DEFAULT_BOUNDARIES).unwrap();
        table.enroll(&[agent(1), agent(2)]);
        table.ranks_mut().insert(agent(1), 3);
        table.ranks_mut().insert(agent(2), 1);
        assert_eq!(table.share_of(agent(1), 100), 75);
        assert_eq!(table.share_of(agent(2), 100), 25);
        assert_eq!(table.share_of(agent(3), 100), 0);
    }

    proptest! {
        #[test]
        fn property_rank_moves_at_most_one_step(
            current in 0u8..=MAX_RANK,
            total in -100i64..200,
            mut boundaries in proptest::array::uniform5(0i64..80),
        ) {
            boundaries.sort_unstable();
            let next = next_rank(current, total, &boundaries);
            prop_assert!(next <= MAX_RANK);
            prop_assert!((i16::from(next) - i16::from(current)).abs() <= 1);
        }
    }
}
