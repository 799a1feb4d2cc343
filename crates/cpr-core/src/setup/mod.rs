//! Population Setup
//!
//! Built-in agents for the binary and the integration tests.

pub mod agents;

pub use agents::{spawn_agents, ScriptedAgent, Temperament};
