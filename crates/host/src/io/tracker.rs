//! In-flight read/write accounting.
//!
//! Every network read and write holds a guard for its whole lifetime, so the
//! counters are balanced on every exit path, including a cancelled future
//! being dropped mid-operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counts reads and writes currently in progress.
#[derive(Debug, Default)]
pub struct Tracker {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Tracker {
    /// Creates a tracker with both counters at zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks a read as started until the returned guard is dropped.
    pub fn read_guard(self: &Arc<Self>) -> ActionGuard {
        self.reads.fetch_add(1, Ordering::SeqCst);
        ActionGuard {
            tracker: Arc::clone(self),
            kind: ActionKind::Read,
        }
    }

    /// Marks a write as started until the returned guard is dropped.
    pub fn write_guard(self: &Arc<Self>) -> ActionGuard {
        self.writes.fetch_add(1, Ordering::SeqCst);
        ActionGuard {
            tracker: Arc::clone(self),
            kind: ActionKind::Write,
        }
    }

    /// Reads currently in progress.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Writes currently in progress.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns whether any read or write is in progress.
    pub fn any_action_in_progress(&self) -> bool {
        self.reads() > 0 || self.writes() > 0
    }
}

#[derive(Debug, Clone, Copy)]
enum ActionKind {
    Read,
    Write,
}

/// Decrements its counter when dropped.
#[derive(Debug)]
#[must_use = "the action is only tracked while the guard is alive"]
pub struct ActionGuard {
    tracker: Arc<Tracker>,
    kind: ActionKind,
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        let counter = match self.kind {
            ActionKind::Read => &self.tracker.reads,
            ActionKind::Write => &self.tracker.writes,
        };
        counter.fetch_sub(1, Ordering::SeqCst);
    }
}
