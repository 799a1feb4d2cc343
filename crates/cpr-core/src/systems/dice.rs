//! Dice Game
//!
//! Each turn an agent rolls three six-sided dice and keeps rolling while
//! it likes. Every new roll must beat the previous one; failing to do so
//! busts the turn to zero.

use rand::Rng;

use crate::components::agent::CprAgent;
use crate::Points;

pub const DICE_PER_ROLL: u32 = 3;
pub const DIE_FACES: Points = 6;

/// Result of one agent's rolling phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiceTurn {
    pub score: Points,
    pub rolls: u32,
    pub bust: bool,
}

pub fn roll<R: Rng>(rng: &mut R) -> Points {
    (0..DICE_PER_ROLL).map(|_| rng.gen_range(1..=DIE_FACES)).sum()
}

/// Play out one turn for `agent`.
pub fn play_turn<R: Rng>(agent: &mut dyn CprAgent, rng: &mut R) -> DiceTurn {
    let mut accumulated = 0;
    let mut previous: Option<Points> = None;
    let mut rolls = 0;
    loop {
        let value = roll(rng);
        rolls += 1;
        if previous.is_some_and(|p| value <= p) {
            return DiceTurn { score: 0, rolls, bust: true };
        }
        accumulated += value;
        previous = Some(value);
        if agent.stick_or_again(accumulated, value) {
            return DiceTurn { score: accumulated, rolls, bust: false };
        }
    }
}

/// Probability that a fresh 3d6 roll beats `previous`.
pub fn beat_probability(previous: Points) -> f64 {
    let mut beating = 0u32;
    for a in 1..=DIE_FACES {
        for b in 1..=DIE_FACES {
            for c in 1..=DIE_FACES {
                if a + b + c > previous {
                    beating += 1;
                }
            }
        }
    }
    f64::from(beating) / 216.0
}

/// Expected change in score from rolling once more.
///
/// Positive means another roll is worth the risk of losing `accumulated`.
pub fn expected_gain(accumulated: Points, previous: Points) -> f64 {
    let mut gain = 0.0;
    for a in 1..=DIE_FACES {
        for b in 1..=DIE_FACES {
            for c in 1..=DIE_FACES {
                let value = a + b + c;
                if value > previous {
                    gain += value as f64;
                }
            }
        }
    }
    let p_bust = 1.0 - beat_probability(previous);
    gain / 216.0 - p_bust * accumulated as f64
}
