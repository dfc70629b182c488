//! Current-shot state store.
//!
//! Holds exactly the most recent canonical record. No queueing: `update`
//! replaces, `get` snapshots. Hit records additionally land in a bounded
//! history ring for the (out-of-scope) dashboard surface.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::model::{ResultKind, ShotRecord};

/// Most recent Hit records retained for history queries.
const MAX_HISTORY: usize = 100;

/// Thread-safe single-slot store for the current shot.
///
/// Records are handed out as `Arc` snapshots and never mutated in place,
/// so readers racing an update see either the old or the new value,
/// never a torn one. The internal lock is never held across an await.
#[derive(Debug)]
pub struct ShotStore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    current: Arc<ShotRecord>,
    history: VecDeque<Arc<ShotRecord>>,
}

impl ShotStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: Arc::new(ShotRecord::initial()),
                history: VecDeque::new(),
            }),
        }
    }

    /// Snapshot of the current record.
    pub fn get(&self) -> Arc<ShotRecord> {
        self.inner.lock().unwrap().current.clone()
    }

    /// Atomically replace the current record, returning the stored snapshot.
    pub fn update(&self, record: ShotRecord) -> Arc<ShotRecord> {
        let record = Arc::new(record);
        let mut inner = self.inner.lock().unwrap();
        inner.current = record.clone();
        if record.result == ResultKind::Hit {
            if inner.history.len() == MAX_HISTORY {
                inner.history.pop_front();
            }
            inner.history.push_back(record.clone());
        }
        record
    }

    /// Restore the zero-valued initial record and return it.
    pub fn reset(&self) -> Arc<ShotRecord> {
        let record = Arc::new(ShotRecord::initial());
        self.inner.lock().unwrap().current = record.clone();
        record
    }

    /// The most recent `limit` Hit records, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Arc<ShotRecord>> {
        let inner = self.inner.lock().unwrap();
        let skip = inner.history.len().saturating_sub(limit);
        inner.history.iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.inner.lock().unwrap().history.clear();
    }
}

impl Default for ShotStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
