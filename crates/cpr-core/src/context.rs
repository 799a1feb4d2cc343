//! Simulation Context
//!
//! The one explicit holder of shared randomness and the iteration/turn
//! clock. Orchestrator systems, policies and tally functions take it by
//! reference; nothing in the crate reaches for a process-wide RNG.

use bevy_ecs::prelude::*;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use cpr_events::{AgentId, TeamId};

/// Seeded random source plus the current position in the run
#[derive(Resource, Debug)]
pub struct SimulationContext {
    rng: SmallRng,
    seed: u64,
    pub iteration: u32,
    pub turn: u32,
    /// Score below which an agent is eliminated; redrawn every iteration
    pub elimination_threshold: i64,
}

impl SimulationContext {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            seed,
            iteration: 0,
            turn: 0,
            elimination_threshold: 0,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Seed for an independent stream (one per agent per phase).
    pub fn fork_seed(&mut self) -> u64 {
        self.rng.gen()
    }

    pub fn next_agent_id(&mut self) -> AgentId {
        AgentId::from_random_bytes(self.rng.gen())
    }

    pub fn next_team_id(&mut self) -> TeamId {
        TeamId::from_random_bytes(self.rng.gen())
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// Uniform pick, `None` for an empty slice.
    pub fn choose<T: Copy>(&mut self, items: &[T]) -> Option<T> {
        items.choose(&mut self.rng).copied()
    }

    /// Bernoulli trial; probabilities are clamped into `[0, 1]`.
    pub fn chance(&mut self, probability: f64) -> bool {
        self.rng.gen_bool(probability.clamp(0.0, 1.0))
    }

    /// Draw the iteration's elimination threshold from `[min, max)`.
    pub fn draw_threshold(&mut self, min: i64, max: i64) -> i64 {
        let threshold = if max > min { self.rng.gen_range(min..max) } else { min };
        self.elimination_threshold = threshold;
        threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_ids() {
        let mut a = SimulationContext::seeded(42);
        let mut b = SimulationContext::seeded(42);
        assert_eq!(a.next_agent_id(), b.next_agent_id());
        assert_eq!(a.fork_seed(), b.fork_seed());
    }

    #[test]
    fn test_threshold_range() {
        let mut ctx = SimulationContext::seeded(7);
        for _ in 0..100 {
            let t = ctx.draw_threshold(10, 20);
            assert!((10..20).contains(&t));
        }
        assert_eq!(ctx.draw_threshold(15, 15), 15);
        assert_eq!(ctx.elimination_threshold, 15);
    }

    #[test]
    fn test_chance_clamps() {
        let mut ctx = SimulationContext::seeded(1);
        assert!(ctx.chance(2.0));
        assert!(!ctx.chance(-1.0));
    }
}
