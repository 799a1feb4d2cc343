//! Phase Runner
//!
//! Agents answer each phase on their own worker thread. Answers that do
//! not arrive before the phase deadline are dropped and the caller falls
//! back to a default, so one slow or stuck agent cannot stall the turn.
//!
//! A phase that questions agents several times takes one deadline from
//! [`PhaseRunner::phase_deadline`] and passes it to every call, so the
//! whole phase stays within one timeout.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bevy_ecs::prelude::*;

use cpr_events::AgentId;

use crate::components::agent::{AgentHandle, CprAgent};

/// Resource: dispatches agent decisions with a per-phase timeout
#[derive(Resource, Debug, Clone)]
pub struct PhaseRunner {
    timeout: Option<Duration>,
}

impl Default for PhaseRunner {
    fn default() -> Self {
        Self::new(Some(Duration::from_millis(500)))
    }
}

impl PhaseRunner {
    /// `None` waits for every agent indefinitely.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Deadline of a phase starting now; `None` waits indefinitely.
    pub fn phase_deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    /// Ask every agent in `jobs` in parallel and collect the answers that
    /// arrive in time, keyed by agent.
    pub fn poll<I, R, F>(&self, phase: &'static str, jobs: Vec<(AgentId, AgentHandle, I)>, task: F) -> BTreeMap<AgentId, R>
    where
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(&mut dyn CprAgent, I) -> R + Send + Sync + 'static,
    {
        self.poll_until(phase, self.phase_deadline(), jobs, task)
    }

    /// [`poll`](Self::poll) against a deadline shared with other calls of
    /// the same phase.
    pub fn poll_until<I, R, F>(
        &self,
        phase: &'static str,
        deadline: Option<Instant>,
        jobs: Vec<(AgentId, AgentHandle, I)>,
        task: F,
    ) -> BTreeMap<AgentId, R>
    where
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(&mut dyn CprAgent, I) -> R + Send + Sync + 'static,
    {
        let expected = jobs.len();
        if expected == 0 {
            return BTreeMap::new();
        }

        let task = Arc::new(task);
        let (tx, rx) = mpsc::channel();

        for (id, handle, input) in jobs {
            let tx = tx.clone();
            let task = Arc::clone(&task);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", phase, id.short()))
                .spawn(move || {
                    let guard = match deadline {
                        Some(deadline) => handle.try_lock_until(deadline),
                        None => Some(handle.lock()),
                    };
                    let Some(mut agent) = guard else {
                        return;
                    };
                    let answer = task(&mut **agent, input);
                    // The receiver is gone once the deadline has passed
                    let _ = tx.send((id, answer));
                });
            if let Err(e) = spawned {
                tracing::error!(phase, agent = %id, error = %e, "could not spawn agent worker");
            }
        }
        drop(tx);

        let mut answers = BTreeMap::new();
        while answers.len() < expected {
            let received = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    rx.recv_timeout(remaining).map_err(|_| ())
                }
                None => rx.recv().map_err(|_| ()),
            };
            match received {
                Ok((id, answer)) => {
                    answers.insert(id, answer);
                }
                Err(()) => break,
            }
        }

        if answers.len() < expected {
            tracing::warn!(
                phase,
                answered = answers.len(),
                expected,
                "agents missed the phase deadline; defaults applied"
            );
        }
        answers
    }

    /// Ask a single agent before `deadline`.
    pub fn ask_until<I, R, F>(
        &self,
        phase: &'static str,
        deadline: Option<Instant>,
        id: AgentId,
        handle: AgentHandle,
        input: I,
        task: F,
    ) -> Option<R>
    where
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(&mut dyn CprAgent, I) -> R + Send + Sync + 'static,
    {
        self.poll_until(phase, deadline, vec![(id, handle, input)], task).remove(&id)
    }

    /// Deliver a notification to every agent; answers are not awaited
    /// beyond the phase deadline.
    pub fn notify<F>(&self, phase: &'static str, agents: Vec<(AgentId, AgentHandle)>, task: F)
    where
        F: Fn(&mut dyn CprAgent) + Send + Sync + 'static,
    {
        self.notify_until(phase, self.phase_deadline(), agents, task);
    }

    pub fn notify_until<F>(&self, phase: &'static str, deadline: Option<Instant>, agents: Vec<(AgentId, AgentHandle)>, task: F)
    where
        F: Fn(&mut dyn CprAgent) + Send + Sync + 'static,
    {
        let jobs = agents.into_iter().map(|(id, h)| (id, h, ())).collect();
        self.poll_until(phase, deadline, jobs, move |agent, ()| task(agent));
    }
}
