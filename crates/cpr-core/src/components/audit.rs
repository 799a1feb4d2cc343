//! Audit Bookkeeping
//!
//! Per-agent audit history shared by every policy variant. Each recorded
//! discrepancy is a *warning* in a bounded window; once enough warnings
//! pile up they are cashed in as one *offence* and the window is cleared so
//! the same warnings are never counted twice.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, AuditKind};

use super::history::WindowCounter;
use crate::error::HistoryError;

/// Outcome of comparing stated against actual behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOutcome {
    pub lied: bool,
    /// Signed amount by which the agent deviated (0 when honest)
    pub discrepancy: i64,
}

impl AuditOutcome {
    pub fn honest() -> Self {
        Self { lied: false, discrepancy: 0 }
    }

    pub fn lied_by(discrepancy: i64) -> Self {
        Self { lied: true, discrepancy }
    }
}

/// Audit history of a single agent within one team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLedger {
    warnings: WindowCounter,
    offences: u32,
    last_contribution: Option<AuditOutcome>,
    last_withdrawal: Option<AuditOutcome>,
    contribution_recorded: bool,
    withdrawal_recorded: bool,
}

impl AuditLedger {
    pub fn new(window: NonZeroUsize) -> Self {
        Self {
            warnings: WindowCounter::with_capacity(window),
            offences: 0,
            last_contribution: None,
            last_withdrawal: None,
            contribution_recorded: false,
            withdrawal_recorded: false,
        }
    }

    /// Open a new decision round; each kind may be recorded once per round.
    pub fn begin_round(&mut self) {
        self.contribution_recorded = false;
        self.withdrawal_recorded = false;
    }

    /// Record an outcome. Returns false (and changes nothing) if this kind
    /// was already recorded in the current round.
    pub fn record(&mut self, kind: AuditKind, outcome: AuditOutcome) -> bool {
        let (slot, recorded) = match kind {
            AuditKind::Contribution => (&mut self.last_contribution, &mut self.contribution_recorded),
            AuditKind::Withdrawal => (&mut self.last_withdrawal, &mut self.withdrawal_recorded),
        };
        if *recorded {
            return false;
        }
        *recorded = true;
        *slot = Some(outcome);
        self.warnings.push_flag(outcome.lied);
        true
    }

    pub fn last(&self, kind: AuditKind) -> Option<AuditOutcome> {
        match kind {
            AuditKind::Contribution => self.last_contribution,
            AuditKind::Withdrawal => self.last_withdrawal,
        }
    }

    /// Whether the most recent outcome of `kind` was a lie.
    pub fn lied(&self, kind: AuditKind) -> bool {
        self.last(kind).map_or(false, |o| o.lied)
    }

    pub fn warnings(&self) -> i64 {
        self.warnings.sum()
    }

    pub fn window(&self) -> usize {
        self.warnings.capacity()
    }

    pub fn set_window(&mut self, length: usize) -> Result<(), HistoryError> {
        self.warnings.set_capacity(length)
    }

    pub fn offences(&self) -> u32 {
        self.offences
    }

    pub fn add_offence(&mut self, cap: u32) {
        self.offences = (self.offences + 1).min(cap);
    }

    /// Convert warnings into one offence once `threshold` is reached.
    pub fn formalize_if_due(&mut self, threshold: u32, cap: u32) -> bool {
        if self.warnings.sum() >= i64::from(threshold.max(1)) {
            self.add_offence(cap);
            self.warnings.reset();
            true
        } else {
            false
        }
    }
}

/// All audit ledgers of a team, created lazily with a neutral default
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditBook {
    ledgers: BTreeMap<AgentId, AuditLedger>,
    window: NonZeroUsize,
    offence_threshold: u32,
    offence_cap: u32,
}

impl AuditBook {
    pub fn new(window: usize, offence_threshold: u32, offence_cap: u32) -> Result<Self, HistoryError> {
        let window = NonZeroUsize::new(window).ok_or(HistoryError::ZeroCapacity)?;
        Ok(Self {
            ledgers: BTreeMap::new(),
            window,
            offence_threshold,
            offence_cap,
        })
    }

    pub fn enroll(&mut self, members: &[AgentId]) {
        for id in members {
            self.ledger_mut(*id);
        }
    }

    pub fn ledger(&self, agent: AgentId) -> Option<&AuditLedger> {
        self.ledgers.get(&agent)
    }

    pub fn ledger_mut(&mut self, agent: AgentId) -> &mut AuditLedger {
        let window = self.window;
        self.ledgers.entry(agent).or_insert_with(|| AuditLedger::new(window))
    }

    pub fn begin_round(&mut self) {
        for ledger in self.ledgers.values_mut() {
            ledger.begin_round();
        }
    }

    /// Record and, if due, formalise. Duplicate records in one round are
    /// ignored and logged.
    ///
    /// Returns false for a duplicate; callers keep any side tables untouched
    /// in that case.
    pub fn record(&mut self, agent: AgentId, kind: AuditKind, outcome: AuditOutcome) -> bool {
        let threshold = self.offence_threshold;
        let cap = self.offence_cap;
        let ledger = self.ledger_mut(agent);
        if !ledger.record(kind, outcome) {
            tracing::warn!(agent = %agent, ?kind, "audit already recorded this round; ignoring");
            return false;
        }
        if ledger.formalize_if_due(threshold, cap) {
            tracing::debug!(agent = %agent, offences = ledger.offences(), "warnings formalised into an offence");
        }
        true
    }

    pub fn lied(&self, agent: AgentId, kind: AuditKind) -> bool {
        self.ledgers.get(&agent).map_or(false, |l| l.lied(kind))
    }

    pub fn last(&self, agent: AgentId, kind: AuditKind) -> Option<AuditOutcome> {
        self.ledgers.get(&agent).and_then(|l| l.last(kind))
    }

    pub fn offences(&self, agent: AgentId) -> u32 {
        self.ledgers.get(&agent).map_or(0, |l| l.offences())
    }

    pub fn offence_cap(&self) -> u32 {
        self.offence_cap
    }

    pub fn window(&self) -> usize {
        self.window.get()
    }

    /// Change the default window and every existing ledger's window.
    pub fn set_window(&mut self, length: usize) -> Result<(), HistoryError> {
        let window = NonZeroUsize::new(length).ok_or(HistoryError::ZeroCapacity)?;
        self.window = window;
        for ledger in self.ledgers.values_mut() {
            ledger.set_window(length)?;
        }
        Ok(())
    }

    pub fn forget(&mut self, agent: AgentId) {
        self.ledgers.remove(&agent);
    }

    pub fn agents(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.ledgers.keys().copied()
    }
}
