//! Bounded History
//!
//! Fixed-capacity running aggregates over an agent's recent behaviour.
//! `WindowCounter` keeps the last N samples in a ring buffer with a
//! running sum; `DecayAccumulator` forgets exponentially instead.

use std::collections::VecDeque;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::error::HistoryError;

/// Last-N window of integer samples with an O(1) running sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    samples: VecDeque<i64>,
    capacity: NonZeroUsize,
    sum: i64,
}

impl WindowCounter {
    /// Create a window holding at most `capacity` samples.
    ///
    /// A zero capacity is a programming error and is rejected here rather
    /// than clamped.
    pub fn new(capacity: usize) -> Result<Self, HistoryError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(HistoryError::ZeroCapacity)?;
        Ok(Self::with_capacity(capacity))
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.get()),
            capacity,
            sum: 0,
        }
    }

    /// Push a sample, evicting the oldest one when full.
    pub fn push(&mut self, sample: i64) {
        if self.samples.len() >= self.capacity.get() {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    /// Push a boolean outcome as 1/0.
    pub fn push_flag(&mut self, flag: bool) {
        self.push(i64::from(flag));
    }

    pub fn sum(&self) -> i64 {
        self.sum
    }

    /// Mean of the retained samples, 0.0 when empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum as f64 / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Most recent sample, if any.
    pub fn last(&self) -> Option<i64> {
        self.samples.back().copied()
    }

    /// Change the window length. Shrinking drops the oldest excess samples.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), HistoryError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(HistoryError::ZeroCapacity)?;
        self.capacity = capacity;
        while self.samples.len() > capacity.get() {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        Ok(())
    }

    /// Clear all samples and the aggregate.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum = 0;
    }

    /// Recompute the aggregate from the samples.
    ///
    /// Returns true if the stored aggregate had drifted and was corrected.
    pub fn reconcile(&mut self) -> bool {
        let recomputed: i64 = self.samples.iter().sum();
        if recomputed != self.sum {
            tracing::warn!(stored = self.sum, recomputed, "window aggregate drifted; recomputed from samples");
            self.sum = recomputed;
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.samples.iter().copied()
    }
}

/// `value <- value * decay + sample`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayAccumulator {
    value: f64,
    decay: f64,
}

impl DecayAccumulator {
    /// `decay` must lie in `[0, 1]`.
    pub fn new(decay: f64) -> Result<Self, HistoryError> {
        if !(0.0..=1.0).contains(&decay) {
            return Err(HistoryError::InvalidDecay(decay));
        }
        Ok(Self { value: 0.0, decay })
    }

    pub fn push(&mut self, sample: f64) {
        self.value = self.value * self.decay + sample;
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}
