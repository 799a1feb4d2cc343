//! Systems
//!
//! The dice game, agent dispatch, team formation and the turn schedule.

pub mod council;
pub mod dice;
pub mod forming;
pub mod orchestrator;
pub mod phase;
pub mod turn;

pub use dice::{expected_gain, play_turn, roll, DiceTurn};
pub use forming::{Formation, ShuffledTeams, SingleTeam, TeamFormer};
pub use orchestrator::RoundOrchestrator;
pub use phase::PhaseRunner;
pub use turn::{AgentTurn, CurrentPhase, GovernanceSettings, Phase, TurnLedger};
