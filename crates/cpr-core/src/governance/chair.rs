//! Chair Agreement
//!
//! Randomly selected chairs, weighted toward higher rank, each propose a
//! value. Identical proposals are adopted. Disagreement costs every chair
//! above rank 1 one rank, and a fresh set of chairs is drawn, up to a fixed
//! number of attempts.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};

use cpr_events::AgentId;

use crate::context::SimulationContext;
use crate::error::GovernanceError;

/// Chair selection weight; rank 0 still gets a chance.
pub fn chair_weight(rank: u8) -> u32 {
    u32::from(rank) + 1
}

/// Draw `count` distinct chairs, weighted by rank.
pub fn select_chairs(
    candidates: &[AgentId],
    count: usize,
    ranks: &BTreeMap<AgentId, u8>,
    ctx: &mut SimulationContext,
) -> Result<Vec<AgentId>, GovernanceError> {
    if candidates.is_empty() {
        return Err(GovernanceError::EmptyCandidates);
    }
    if candidates.len() < count {
        return Err(GovernanceError::NotEnoughCandidates {
            wanted: count,
            available: candidates.len(),
        });
    }

    let mut pool: Vec<AgentId> = candidates.to_vec();
    let mut chairs = Vec::with_capacity(count);
    while chairs.len() < count {
        let weights: Vec<u32> = pool
            .iter()
            .map(|id| chair_weight(ranks.get(id).copied().unwrap_or(0)))
            .collect();
        let index = WeightedIndex::new(&weights)
            .map_err(|_| GovernanceError::EmptyCandidates)?
            .sample(ctx.rng());
        chairs.push(pool.swap_remove(index));
    }
    Ok(chairs)
}

/// How an agreement round ended
#[derive(Debug, Clone, PartialEq)]
pub enum AgreementOutcome<P> {
    Agreed { value: P, chairs: Vec<AgentId>, attempts: u32 },
    /// Fewer than two members; the remaining one decided alone.
    Unilateral { value: P, chair: AgentId },
    NoAgreement { attempts: u32 },
}

impl<P> AgreementOutcome<P> {
    pub fn value(self) -> Option<P> {
        match self {
            AgreementOutcome::Agreed { value, .. } | AgreementOutcome::Unilateral { value, .. } => Some(value),
            AgreementOutcome::NoAgreement { .. } => None,
        }
    }
}

/// Parameters of the agreement protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChairAgreement {
    pub attempts: u32,
    pub chairs: usize,
}

impl Default for ChairAgreement {
    fn default() -> Self {
        Self { attempts: 10, chairs: 2 }
    }
}

impl ChairAgreement {
    pub fn new(attempts: u32, chairs: usize) -> Self {
        Self { attempts, chairs }
    }

    /// Run the protocol over `members`.
    ///
    /// `propose` asks one chair for its proposal; `None` means the chair
    /// did not answer and counts as disagreement. Ranks of disagreeing
    /// chairs are lowered in `ranks`.
    pub fn run<P, F>(
        &self,
        members: &[AgentId],
        ranks: &mut BTreeMap<AgentId, u8>,
        ctx: &mut SimulationContext,
        mut propose: F,
    ) -> Result<AgreementOutcome<P>, GovernanceError>
    where
        P: PartialEq,
        F: FnMut(AgentId) -> Option<P>,
    {
        match members {
            [] => return Err(GovernanceError::EmptyCandidates),
            [only] => {
                return Ok(match propose(*only) {
                    Some(value) => AgreementOutcome::Unilateral { value, chair: *only },
                    None => AgreementOutcome::NoAgreement { attempts: 0 },
                });
            }
            _ => {}
        }

        let count = self.chairs.clamp(2, members.len());
        for attempt in 1..=self.attempts {
            let chairs = select_chairs(members, count, ranks, ctx)?;
            let proposals: Vec<Option<P>> = chairs.iter().map(|c| propose(*c)).collect();

            let agreed = match proposals.split_first() {
                Some((Some(first), rest)) => rest.iter().all(|p| p.as_ref() == Some(first)),
                _ => false,
            };
            if agreed {
                if let Some(Some(value)) = proposals.into_iter().next() {
                    tracing::debug!(attempt, chairs = chairs.len(), "chairs agreed");
                    return Ok(AgreementOutcome::Agreed { value, chairs, attempts: attempt });
                }
            }

            for chair in &chairs {
                if let Some(rank) = ranks.get_mut(chair) {
                    if *rank > 1 {
                        *rank -= 1;
                    }
                }
            }
            tracing::trace!(attempt, "chairs disagreed");
        }

        tracing::debug!(attempts = self.attempts, "chairs failed to agree");
        Ok(AgreementOutcome::NoAgreement { attempts: self.attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn agent(n: u8) -> AgentId {
        AgentId::from_random_bytes([n; 16])
    }

    fn members(n: u8) -> Vec<AgentId> {
        (1..=n).map(agent).collect()
    }

    #[test]
    fn test_empty_candidates_is_error() {
        let mut ctx = SimulationContext::seeded(1);
        let mut ranks = BTreeMap::new();
        assert_eq!(
            select_chairs(&[], 2, &ranks, &mut ctx),
            Err(GovernanceError::EmptyCandidates)
        );
        let result = ChairAgreement::default().run(&[], &mut ranks, &mut ctx, |_| Some(1));
        assert_eq!(result, Err(GovernanceError::EmptyCandidates));
    }

    #[test]
    fn test_not_enough_candidates() {
        let mut ctx = SimulationContext::seeded(1);
        let err = select_chairs(&members(1), 2, &BTreeMap::new(), &mut ctx).unwrap_err();
        assert_eq!(err, GovernanceError::NotEnoughCandidates { wanted: 2, available: 1 });
    }

    #[test]
    fn test_chairs_are_distinct() {
        let mut ctx = SimulationContext::seeded(5);
        let all = members(4);
        for _ in 0..50 {
            let chairs = select_chairs(&all, 3, &BTreeMap::new(), &mut ctx).unwrap();
            let mut sorted = chairs.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), 3);
        }
    }

    #[test]
    fn test_single_member_decides_alone() {
        let mut ctx = SimulationContext::seeded(1);
        let mut ranks = BTreeMap::new();
        let outcome = ChairAgreement::default()
            .run(&members(1), &mut ranks, &mut ctx, |_| Some(7))
            .unwrap();
        assert_eq!(outcome, AgreementOutcome::Unilateral { value: 7, chair: agent(1) });
    }

    #[test]
    fn test_disagreement_demotes_but_not_below_one() {
        let mut ctx = SimulationContext::seeded(2);
        let all = members(2);
        let mut ranks: BTreeMap<AgentId, u8> = all.iter().map(|id| (*id, 4)).collect();
        ranks.insert(agent(2), 1);

        let outcome = ChairAgreement::new(10, 2)
            .run(&all, &mut ranks, &mut ctx, |chair| Some(chair))
            .unwrap();

        assert_eq!(outcome, AgreementOutcome::NoAgreement { attempts: 10 });
        assert_eq!(ranks[&agent(1)], 1);
        assert_eq!(ranks[&agent(2)], 1);
    }

    #[test]
    fn test_each_failed_attempt_costs_one_rank() {
        let mut ctx = SimulationContext::seeded(3);
        let all = members(2);
        let mut ranks: BTreeMap<AgentId, u8> = all.iter().map(|id| (*id, 5)).collect();

        let outcome = ChairAgreement::new(3, 2)
            .run(&all, &mut ranks, &mut ctx, |chair| Some(chair))
            .unwrap();

        assert_eq!(outcome, AgreementOutcome::NoAgreement { attempts: 3 });
        assert_eq!(ranks[&agent(1)], 2);
        assert_eq!(ranks[&agent(2)], 2);
    }

    #[test]
    fn test_silent_chair_blocks_agreement() {
        let mut ctx = SimulationContext::seeded(2);
        let mut ranks = BTreeMap::new();
        let silent = agent(1);
        let outcome = ChairAgreement::new(3, 2)
            .run(&members(2), &mut ranks, &mut ctx, |chair| (chair != silent).then_some(5))
            .unwrap();
        assert_eq!(outcome, AgreementOutcome::NoAgreement { attempts: 3 });
    }

    proptest! {
        #[test]
        fn property_identical_proposals_agree_first_time(seed in any::<u64>(), n in 2u8..8, value in any::<i64>()) {
            let mut ctx = SimulationContext::seeded(seed);
            let all = members(n);
            let mut ranks: BTreeMap<AgentId, u8> = all.iter().map(|id| (*id, 3)).collect();
            let before = ranks.clone();
            let outcome = ChairAgreement::default().run(&all, &mut ranks, &mut ctx, |_| Some(value)).unwrap();
            match outcome {
                AgreementOutcome::Agreed { value: v, attempts, .. } => {
                    prop_assert_eq!(v, value);
                    prop_assert_eq!(attempts, 1);
                }
                other => prop_assert!(false, "unexpected outcome {:?}", other),
            }
            prop_assert_eq!(ranks, before);
        }
    }
}
