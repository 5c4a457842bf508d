//! Expected post-recovery state.
//!
//! Each driver keeps a [`SessionLedger`] of the effects it saw acknowledged.
//! After the drivers join, the ledgers are absorbed into one
//! [`ExpectedState`] that the verifier turns into row-count checks.
//!
//! Sessions insert and delete only ids from their own range, so ledgers
//! never interact and counts add up per session. A statement whose response
//! never arrived (a COMMIT or an autocommit write in flight at the fault)
//! may or may not be durable; its effects are kept as the session's
//! uncertain tail and widen the expected count into a range.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::statement::Effect;

/// Inclusive range of acceptable row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountRange {
    pub min: u64,
    pub max: u64,
}

impl CountRange {
    pub fn exact(n: u64) -> Self {
        Self { min: n, max: n }
    }

    pub fn is_exact(&self) -> bool {
        self.min == self.max
    }

    pub fn contains(&self, n: u64) -> bool {
        (self.min..=self.max).contains(&n)
    }

    fn shift(self, by: u64) -> Self {
        Self {
            min: self.min + by,
            max: self.max + by,
        }
    }
}

impl std::fmt::Display for CountRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_exact() {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}..={}", self.min, self.max)
        }
    }
}

type IdSets = BTreeMap<String, BTreeSet<u64>>;

fn apply(sets: &mut IdSets, effect: &Effect) {
    match effect {
        Effect::Insert { table, ids } => {
            sets.entry(table.clone()).or_default().extend(ids.iter().copied());
        }
        Effect::Delete { table, lo, hi } => {
            if lo > hi {
                return;
            }
            if let Some(set) = sets.get_mut(table) {
                let doomed: Vec<u64> = set.range(*lo..=*hi).copied().collect();
                for id in doomed {
                    set.remove(&id);
                }
            }
        }
    }
}

/// Effects one session observed.
#[derive(Debug, Clone, Default)]
pub struct SessionLedger {
    committed: IdSets,
    pending: Vec<Effect>,
    uncertain: Vec<Effect>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a write acknowledged inside an open transaction.
    pub fn stage(&mut self, effect: Effect) {
        self.pending.push(effect);
    }

    /// The open transaction committed.
    pub fn commit(&mut self) {
        for effect in std::mem::take(&mut self.pending) {
            apply(&mut self.committed, &effect);
        }
    }

    /// The open transaction rolled back, aborted, or was cut by the fault.
    pub fn discard(&mut self) {
        self.pending.clear();
    }

    /// Records an acknowledged autocommit write.
    pub fn apply(&mut self, effect: Effect) {
        apply(&mut self.committed, &effect);
    }

    /// The open transaction's COMMIT was in flight when the connection died.
    pub fn commit_in_flight(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.uncertain.extend(pending);
    }

    /// An autocommit write was in flight when the connection died.
    pub fn write_in_flight(&mut self, effect: Effect) {
        self.uncertain.push(effect);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_uncertain(&self) -> bool {
        !self.uncertain.is_empty()
    }

    /// Owned rows of `table` present after this session, as a range.
    pub fn owned_rows(&self, table: &str) -> CountRange {
        let definite = self.committed.get(table).map_or(0, BTreeSet::len) as u64;
        if self.uncertain.is_empty() {
            return CountRange::exact(definite);
        }

        let mut maybe = self.committed.clone();
        for effect in &self.uncertain {
            apply(&mut maybe, effect);
        }
        let alternative = maybe.get(table).map_or(0, BTreeSet::len) as u64;
        CountRange {
            min: definite.min(alternative),
            max: definite.max(alternative),
        }
    }

    fn tables(&self) -> impl Iterator<Item = &str> {
        self.committed
            .keys()
            .map(String::as_str)
            .chain(self.uncertain.iter().map(Effect::table))
    }
}

/// Expected row counts for every table a workload touched.
#[derive(Debug, Clone, Default)]
pub struct ExpectedState {
    base: BTreeMap<String, u64>,
    sessions: Vec<SessionLedger>,
}

impl ExpectedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records rows bulk loaded before the workload.
    pub fn add_base(&mut self, table: impl Into<String>, rows: u64) {
        *self.base.entry(table.into()).or_default() += rows;
    }

    /// Merges a finished session's ledger.
    pub fn absorb(&mut self, ledger: SessionLedger) {
        self.sessions.push(ledger);
    }

    /// Expected `COUNT(*)` of `table`.
    pub fn count(&self, table: &str) -> CountRange {
        let base = self.base.get(table).copied().unwrap_or(0);
        self.sessions
            .iter()
            .map(|s| s.owned_rows(table))
            .fold(CountRange::exact(0), |acc, r| CountRange {
                min: acc.min + r.min,
                max: acc.max + r.max,
            })
            .shift(base)
    }

    /// Every table with base rows or session effects, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: BTreeSet<&str> = self.base.keys().map(String::as_str).collect();
        for session in &self.sessions {
            tables.extend(session.tables());
        }
        tables.into_iter().map(str::to_string).collect()
    }
}
