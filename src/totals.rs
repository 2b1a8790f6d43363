use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Insert,
    Update,
    Delete,
    Export,
    Failure,
}

impl Action {
    fn index(self) -> usize {
        match self {
            Action::Insert => 0,
            Action::Update => 1,
            Action::Delete => 2,
            Action::Export => 3,
            Action::Failure => 4,
        }
    }

    pub fn is_failure(self) -> bool {
        self == Action::Failure
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Insert => "INSERT",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
            Action::Export => "EXPORT",
            Action::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

/// Outcome counters for one run. Shared by reference between workers; never global.
#[derive(Debug, Default)]
pub struct ActionTotals {
    counts: [AtomicUsize; 5],
}

impl ActionTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, action: Action) {
        self.counts[action.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, action: Action) -> usize {
        self.counts[action.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            inserted: self.get(Action::Insert),
            updated: self.get(Action::Update),
            deleted: self.get(Action::Delete),
            exported: self.get(Action::Export),
            failed: self.get(Action::Failure),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TotalsSnapshot {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub exported: usize,
    pub failed: usize,
}

impl TotalsSnapshot {
    pub fn processed(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.exported + self.failed
    }

    pub fn succeeded(&self) -> usize {
        self.processed() - self.failed
    }

    /// Adds another run's counts, for the cross-file summary.
    pub fn merge(&mut self, other: &TotalsSnapshot) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.exported += other.exported;
        self.failed += other.failed;
    }
}

impl fmt::Display for TotalsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} inserted={} updated={} deleted={} exported={} failed={}",
            self.processed(),
            self.inserted,
            self.updated,
            self.deleted,
            self.exported,
            self.failed
        )
    }
}
