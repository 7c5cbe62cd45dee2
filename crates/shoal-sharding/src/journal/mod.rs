//! Event Journal
//!
//! Append-only event log and snapshot store keyed by persistence id, the
//! durability collaborator behind the coordinator and remember-entries
//! shards. Events are opaque bytes at this layer; callers serialize with
//! serde_json.
//!
//! Implementations:
//! - [`MemoryJournal`]: in-process, with fault injection for tests
//! - [`FileJournal`]: JSON-lines files per persistence id

mod file;
mod memory;

pub use file::FileJournal;
pub use memory::MemoryJournal;

use async_trait::async_trait;

/// Sequence number of a journaled event, starting at 1 per persistence id.
pub type SequenceNr = u64;

/// Errors surfaced by journal operations.
///
/// A failed append leaves it unknown whether the event reached the log;
/// callers must either retry the exact same event (shards) or restart and
/// recover from the log (coordinator).
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt journal entry for {persistence_id} at {sequence_nr}: {reason}")]
    Corrupt {
        persistence_id: String,
        sequence_nr: SequenceNr,
        reason: String,
    },

    #[error("journal failure: {0}")]
    Backend(String),
}

/// Append-only log with snapshots, keyed by persistence id.
#[async_trait]
pub trait Journal: Send + Sync + 'static {
    /// Append one event, returning its sequence number.
    async fn append(&self, persistence_id: &str, event: &[u8])
        -> Result<SequenceNr, JournalError>;

    /// Replay events with sequence numbers strictly greater than `from`,
    /// in sequence order.
    async fn replay(
        &self,
        persistence_id: &str,
        from: SequenceNr,
    ) -> Result<Vec<(SequenceNr, Vec<u8>)>, JournalError>;

    /// Store a snapshot covering all events up to and including `sequence_nr`.
    async fn save_snapshot(
        &self,
        persistence_id: &str,
        sequence_nr: SequenceNr,
        snapshot: &[u8],
    ) -> Result<(), JournalError>;

    /// Latest stored snapshot, if any.
    async fn load_snapshot(
        &self,
        persistence_id: &str,
    ) -> Result<Option<(SequenceNr, Vec<u8>)>, JournalError>;
}

/// Recover a serde-encoded state: start from the latest snapshot (if one
/// exists), then fold the remaining events.
pub async fn recover<S, E, F>(
    journal: &dyn Journal,
    persistence_id: &str,
    initial: S,
    mut fold: F,
) -> Result<(S, SequenceNr), JournalError>
where
    S: serde::de::DeserializeOwned,
    E: serde::de::DeserializeOwned,
    F: FnMut(S, E) -> S,
{
    let (mut state, mut last_seq) = match journal.load_snapshot(persistence_id).await? {
        Some((seq, bytes)) => {
            let state = serde_json::from_slice(&bytes).map_err(|e| JournalError::Corrupt {
                persistence_id: persistence_id.to_string(),
                sequence_nr: seq,
                reason: e.to_string(),
            })?;
            (state, seq)
        }
        None => (initial, 0),
    };

    for (seq, bytes) in journal.replay(persistence_id, last_seq).await? {
        let event: E = serde_json::from_slice(&bytes).map_err(|e| JournalError::Corrupt {
            persistence_id: persistence_id.to_string(),
            sequence_nr: seq,
            reason: e.to_string(),
        })?;
        state = fold(state, event);
        last_seq = seq;
    }

    Ok((state, last_seq))
}
