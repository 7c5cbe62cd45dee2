//! In-Memory Journal
//!
//! Keeps every stream in process memory. The backing store is shared by
//! clones, so a "restarted" actor handed the same journal recovers the
//! state its predecessor persisted, which is exactly what crash-recovery
//! tests need. `fail_next_appends` injects persistence failures.

use super::{Journal, JournalError, SequenceNr};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Stream {
    events: Vec<Vec<u8>>,
    snapshot: Option<(SequenceNr, Vec<u8>)>,
}

/// In-process journal for tests and embedded single-node use.
#[derive(Clone, Default)]
pub struct MemoryJournal {
    streams: Arc<Mutex<HashMap<String, Stream>>>,
    fail_appends: Arc<AtomicUsize>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail with a backend error.
    pub fn fail_next_appends(&self, count: usize) {
        self.fail_appends.store(count, Ordering::SeqCst);
    }

    /// Number of events stored for a persistence id.
    pub fn event_count(&self, persistence_id: &str) -> usize {
        self.streams
            .lock()
            .expect("journal lock poisoned")
            .get(persistence_id)
            .map(|s| s.events.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(
        &self,
        persistence_id: &str,
        event: &[u8],
    ) -> Result<SequenceNr, JournalError> {
        let pending = self.fail_appends.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_appends
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(JournalError::Backend("injected append failure".to_string()));
        }

        let mut streams = self.streams.lock().expect("journal lock poisoned");
        let stream = streams.entry(persistence_id.to_string()).or_default();
        stream.events.push(event.to_vec());
        Ok(stream.events.len() as SequenceNr)
    }

    async fn replay(
        &self,
        persistence_id: &str,
        from: SequenceNr,
    ) -> Result<Vec<(SequenceNr, Vec<u8>)>, JournalError> {
        let streams = self.streams.lock().expect("journal lock poisoned");
        let events = streams
            .get(persistence_id)
            .map(|s| {
                s.events
                    .iter()
                    .enumerate()
                    .map(|(i, bytes)| (i as SequenceNr + 1, bytes.clone()))
                    .filter(|(seq, _)| *seq > from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }

    async fn save_snapshot(
        &self,
        persistence_id: &str,
        sequence_nr: SequenceNr,
        snapshot: &[u8],
    ) -> Result<(), JournalError> {
        let mut streams = self.streams.lock().expect("journal lock poisoned");
        let stream = streams.entry(persistence_id.to_string()).or_default();
        stream.snapshot = Some((sequence_nr, snapshot.to_vec()));
        Ok(())
    }

    async fn load_snapshot(
        &self,
        persistence_id: &str,
    ) -> Result<Option<(SequenceNr, Vec<u8>)>, JournalError> {
        let streams = self.streams.lock().expect("journal lock poisoned");
        Ok(streams
            .get(persistence_id)
            .and_then(|s| s.snapshot.clone()))
    }
}
