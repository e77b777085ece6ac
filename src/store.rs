//! Process-wide bookkeeping of open request traces.
//!
//! Every traced request or message owns one entry, keyed by its
//! [`ResponseId`]. Callers never hold a reference to an entry; they only pass
//! the id around and go through [`TraceStore`], which does its own locking.
//! Entries live in a sharded map, so work on one id does not wait on work on
//! another id unless both hash to the same shard.

use std::{
    fmt,
    num::ParseIntError,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};

/// Opaque key of one open trace.
///
/// Derived from the wall clock in nanoseconds at trace start, and rendered as
/// a decimal number in logs and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(u64);

impl ResponseId {
    pub const fn from_raw(raw: u64) -> Self {
        ResponseId(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ResponseId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(ResponseId)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("no open trace for response id {0}")]
    NotFound(ResponseId),
}

/// Timing of one stage of a trace, as it is logged and audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub step: u32,
    /// Time since the previous checkpoint (or since the start for the first one).
    pub since_last: Duration,
    /// Time since the trace began.
    pub total: Duration,
}

impl Checkpoint {
    /// Used when a stage runs against an id that is no longer open.
    pub const UNKNOWN: Checkpoint = Checkpoint {
        step: 0,
        since_last: Duration::ZERO,
        total: Duration::ZERO,
    };

    pub fn duration_ms(&self) -> String {
        format_millis(self.since_last)
    }

    pub fn total_ms(&self) -> String {
        format_millis(self.total)
    }
}

/// Renders a duration the way trace fields carry it, e.g. `"1.25 ms"`.
pub fn format_millis(duration: Duration) -> String {
    format!("{} ms", duration.as_secs_f64() * 1_000.0)
}

/// What was left of an entry when it was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedTrace {
    pub id: ResponseId,
    pub step: u32,
    pub total: Duration,
    pub correlation_id: String,
}

#[derive(Debug)]
struct TraceEntry {
    started: Instant,
    last_checkpoint: Instant,
    step: u32,
    correlation_id: String,
}

impl TraceEntry {
    fn new(now: Instant) -> Self {
        TraceEntry {
            started: now,
            last_checkpoint: now,
            step: 1,
            correlation_id: String::new(),
        }
    }

    fn checkpoint(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_checkpoint);
        self.last_checkpoint = now;
        elapsed
    }
}

/// Table of open traces.
///
/// Use [`TraceStore::global`] for the process-wide instance; separate
/// instances are useful for embedding and tests.
#[derive(Debug, Default)]
pub struct TraceStore {
    entries: DashMap<ResponseId, TraceEntry>,
    last_issued: AtomicU64,
}

static GLOBAL: OnceLock<Arc<TraceStore>> = OnceLock::new();

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static Arc<TraceStore> {
        GLOBAL.get_or_init(|| Arc::new(TraceStore::new()))
    }

    /// Opens a new trace at step 1.
    pub fn begin(&self) -> ResponseId {
        loop {
            let id = ResponseId(self.next_raw_id());
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                slot.insert(TraceEntry::new(Instant::now()));
                return id;
            }
        }
    }

    // Clock reading in nanoseconds, bumped past the last issued id so two
    // traces started within the clock resolution still get distinct keys.
    fn next_raw_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        let previous = self
            .last_issued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.wrapping_add(1)))
            })
            .unwrap_or_else(|last| last);

        now.max(previous.wrapping_add(1))
    }

    /// Increments the step counter and returns the new step.
    pub fn advance(&self, id: ResponseId) -> Result<u32, TraceError> {
        self.with_entry(id, |entry| {
            entry.step += 1;
            entry.step
        })
    }

    pub fn step(&self, id: ResponseId) -> Result<u32, TraceError> {
        self.with_entry(id, |entry| entry.step)
    }

    /// Time since the last checkpoint. Resets the checkpoint as a side effect.
    pub fn checkpoint_duration(&self, id: ResponseId) -> Result<Duration, TraceError> {
        self.with_entry(id, TraceEntry::checkpoint)
    }

    /// Time since the trace began. Does not touch the checkpoint.
    pub fn total_duration(&self, id: ResponseId) -> Result<Duration, TraceError> {
        self.with_entry(id, |entry| entry.started.elapsed())
    }

    /// Advances the step and takes a checkpoint in one go.
    pub fn next_stage(&self, id: ResponseId) -> Result<Checkpoint, TraceError> {
        self.with_entry(id, |entry| {
            entry.step += 1;
            let since_last = entry.checkpoint();
            Checkpoint {
                step: entry.step,
                since_last,
                total: entry.started.elapsed(),
            }
        })
    }

    /// Takes a checkpoint for the current step without advancing it.
    pub fn current_stage(&self, id: ResponseId) -> Result<Checkpoint, TraceError> {
        self.with_entry(id, |entry| {
            let since_last = entry.checkpoint();
            Checkpoint {
                step: entry.step,
                since_last,
                total: entry.started.elapsed(),
            }
        })
    }

    /// Reads the current step and durations without taking a checkpoint.
    pub fn peek_stage(&self, id: ResponseId) -> Result<Checkpoint, TraceError> {
        self.entries
            .get(&id)
            .map(|entry| Checkpoint {
                step: entry.step,
                since_last: entry.last_checkpoint.elapsed(),
                total: entry.started.elapsed(),
            })
            .ok_or(TraceError::NotFound(id))
    }

    pub fn set_correlation_id(
        &self,
        id: ResponseId,
        value: impl Into<String>,
    ) -> Result<(), TraceError> {
        let value = value.into();
        self.with_entry(id, move |entry| entry.correlation_id = value)
    }

    pub fn correlation_id(&self, id: ResponseId) -> Result<String, TraceError> {
        self.with_entry(id, |entry| entry.correlation_id.clone())
    }

    /// Removes the entry. Returns `None` if it was already gone.
    pub fn finalize(&self, id: ResponseId) -> Option<FinalizedTrace> {
        self.entries.remove(&id).map(|(id, entry)| FinalizedTrace {
            id,
            step: entry.step,
            total: entry.started.elapsed(),
            correlation_id: entry.correlation_id,
        })
    }

    pub fn contains(&self, id: ResponseId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn with_entry<T>(
        &self,
        id: ResponseId,
        f: impl FnOnce(&mut TraceEntry) -> T,
    ) -> Result<T, TraceError> {
        self.entries
            .get_mut(&id)
            .map(|mut entry| f(entry.value_mut()))
            .ok_or(TraceError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use super::*;

    #[test]
    fn begin_starts_at_step_one() {
        let store = TraceStore::new();
        let id = store.begin();

        assert_eq!(store.step(id), Ok(1));
        assert_eq!(store.correlation_id(id), Ok(String::new()));
    }

    #[test]
    fn advance_is_strictly_increasing() {
        let store = TraceStore::new();
        let id = store.begin();

        let steps: Vec<u32> = (0..5).map(|_| store.advance(id).unwrap()).collect();
        assert_eq!(steps, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn checkpoint_resets_reference_point() {
        let store = TraceStore::new();
        let id = store.begin();

        thread::sleep(Duration::from_millis(20));
        let first = store.checkpoint_duration(id).unwrap();
        let second = store.checkpoint_duration(id).unwrap();

        assert!(first >= Duration::from_millis(20));
        assert!(second <= first);
    }

    #[test]
    fn total_duration_does_not_checkpoint() {
        let store = TraceStore::new();
        let id = store.begin();

        thread::sleep(Duration::from_millis(10));
        let total = store.total_duration(id).unwrap();
        let since_start = store.checkpoint_duration(id).unwrap();

        assert!(since_start >= total);
    }

    #[test]
    fn peek_stage_leaves_checkpoint_alone() {
        let store = TraceStore::new();
        let id = store.begin();

        thread::sleep(Duration::from_millis(20));
        let peeked = store.peek_stage(id).unwrap();
        let stage = store.next_stage(id).unwrap();

        assert_eq!(peeked.step, 1);
        assert!(peeked.since_last >= Duration::from_millis(20));
        assert!(stage.since_last >= peeked.since_last);
        assert_eq!(
            store.peek_stage(ResponseId::from_raw(7)),
            Err(TraceError::NotFound(ResponseId::from_raw(7)))
        );
    }

    #[test]
    fn next_stage_combines_advance_and_checkpoint() {
        let store = TraceStore::new();
        let id = store.begin();

        let entry = store.current_stage(id).unwrap();
        assert_eq!(entry.step, 1);

        let stage = store.next_stage(id).unwrap();
        assert_eq!(stage.step, 2);
        assert!(stage.total >= stage.since_last);
        assert_eq!(store.step(id), Ok(2));
    }

    #[test]
    fn finalize_is_idempotent() {
        let store = TraceStore::new();
        let kept = store.begin();
        let id = store.begin();
        store.set_correlation_id(id, "R-9").unwrap();
        store.advance(kept).unwrap();

        let finalized = store.finalize(id).unwrap();
        assert_eq!(finalized.step, 1);
        assert_eq!(finalized.correlation_id, "R-9");

        assert!(store.finalize(id).is_none());
        assert!(store.finalize(ResponseId::from_raw(7)).is_none());
        assert_eq!(store.step(kept), Ok(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unknown_id_reports_not_found() {
        let store = TraceStore::new();
        let id = ResponseId::from_raw(42);

        assert_eq!(store.advance(id), Err(TraceError::NotFound(id)));
        assert_eq!(store.checkpoint_duration(id), Err(TraceError::NotFound(id)));
        assert_eq!(store.total_duration(id), Err(TraceError::NotFound(id)));
        assert_eq!(store.set_correlation_id(id, "x"), Err(TraceError::NotFound(id)));
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_begin_yields_distinct_ids() {
        let store = Arc::new(TraceStore::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || (0..250).map(|_| store.begin()).collect::<Vec<_>>())
            })
            .collect();

        let ids: Vec<ResponseId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let distinct: HashSet<_> = ids.iter().copied().collect();

        assert_eq!(distinct.len(), 2_000);
        assert_eq!(store.len(), 2_000);

        for id in ids {
            assert_eq!(store.advance(id), Ok(2));
            assert!(store.finalize(id).is_some());
        }
        assert!(store.is_empty());
    }

    #[test]
    fn response_id_round_trips_through_decimal() {
        let id = ResponseId::from_raw(1_700_000_000_123_456_789);
        assert_eq!(id.to_string(), "1700000000123456789");
        assert_eq!("1700000000123456789".parse::<ResponseId>(), Ok(id));
    }
}
