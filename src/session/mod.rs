//! Decode and encode sessions bridging the host to one hardware codec.
//!
//! Lock order, where more than one is taken: stop, then codec, then drain.
//! No lock is held across a blocking codec call or a main-context dispatch.

pub mod decoder;
pub mod encoder;

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

pub use decoder::DecoderSession;
pub use encoder::EncoderSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Configured,
    Running,
    Draining,
    Resetting,
    ShuttingDown,
}

/// Frame durations by presentation timestamp.
///
/// The hardware does not carry durations through, so they are parked here on
/// submission and picked up again when the matching output appears.
#[derive(Debug, Default, Clone)]
pub struct DurationCache {
    entries: BTreeMap<i64, u64>,
}

impl DurationCache {
    /// Duplicate timestamps overwrite the earlier duration.
    pub fn insert(&mut self, timestamp: i64, duration: u64) {
        self.entries.insert(timestamp, duration);
    }

    pub fn take(&mut self, timestamp: i64) -> Option<u64> {
        self.entries.remove(&timestamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
