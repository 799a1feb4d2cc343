//! Turn Recorder
//!
//! Receives one read-only `TurnRecord` per completed turn. The JSONL
//! recorder appends one line per turn; the memory recorder keeps records
//! for inspection in tests and embedding code.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use bevy_ecs::prelude::*;
use parking_lot::Mutex;

use cpr_events::TurnRecord;

use crate::error::RecorderError;

/// Sink for completed turns
pub trait TurnRecorder: Send + Sync {
    fn record(&mut self, turn: &TurnRecord) -> Result<(), RecorderError>;

    fn flush(&mut self) -> Result<(), RecorderError> {
        Ok(())
    }
}

/// Append-only JSONL recording
pub struct JsonlRecorder {
    writer: Option<BufWriter<File>>,
    record_count: u64,
}

impl JsonlRecorder {
    /// Create (or truncate) the file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            writer: Some(BufWriter::new(file)),
            record_count: 0,
        })
    }

    /// Recorder that counts turns but writes nothing
    pub fn null() -> Self {
        Self {
            writer: None,
            record_count: 0,
        }
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }
}

impl TurnRecorder for JsonlRecorder {
    fn record(&mut self, turn: &TurnRecord) -> Result<(), RecorderError> {
        self.record_count += 1;
        if let Some(ref mut writer) = self.writer {
            let json = turn.to_jsonl()?;
            writeln!(writer, "{}", json)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RecorderError> {
        if let Some(ref mut writer) = self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for JsonlRecorder {
    fn drop(&mut self) {
        if let Err(e) = TurnRecorder::flush(self) {
            tracing::warn!(error = %e, "failed to flush turn recorder");
        }
    }
}

/// Keeps every record in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    records: Arc<Mutex<Vec<TurnRecord>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TurnRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TurnRecorder for MemoryRecorder {
    fn record(&mut self, turn: &TurnRecord) -> Result<(), RecorderError> {
        self.records.lock().push(turn.clone());
        Ok(())
    }
}

/// Resource: where completed turns go
#[derive(Resource)]
pub struct Recording(pub Box<dyn TurnRecorder>);

impl Default for Recording {
    fn default() -> Self {
        Self(Box::new(JsonlRecorder::null()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use tempfile::tempdir;

    #[test]
    fn test_jsonl_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("turns.jsonl");
        let first = TurnRecord::new(1, 1);
        let second = TurnRecord::new(1, 2);

        {
            let mut recorder = JsonlRecorder::new(&path).unwrap();
            recorder.record(&first).unwrap();
            recorder.record(&second).unwrap();
            assert_eq!(recorder.record_count(), 2);
        }

        let file = File::open(&path).unwrap();
        let lines: Vec<String> = BufReader::new(file).lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(TurnRecord::from_jsonl(&lines[1]).unwrap(), second);
    }

    #[test]
    fn test_memory_recorder_shares_buffer() {
        let recorder = MemoryRecorder::new();
        let mut boxed: Box<dyn TurnRecorder> = Box::new(recorder.clone());
        boxed.record(&TurnRecord::new(2, 3)).unwrap();
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.records()[0].turn, 3);
    }

    #[test]
    fn test_null_recorder_counts_only() {
        let mut recorder = JsonlRecorder::null();
        recorder.record(&TurnRecord::new(1, 1)).unwrap();
        assert_eq!(recorder.record_count(), 1);
    }
}
