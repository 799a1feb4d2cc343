//! Output
//!
//! Turn recording and run statistics.

pub mod recorder;
pub mod stats;

pub use recorder::{JsonlRecorder, MemoryRecorder, Recording, TurnRecorder};
pub use stats::{write_summary, IterationSummary, SimulationSummary, StatsCollector};
