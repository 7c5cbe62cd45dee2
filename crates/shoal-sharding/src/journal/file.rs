//! File-Backed Journal
//!
//! One JSON-lines file per persistence id under a base directory, with
//! the latest snapshot in a sidecar file. Events must themselves be JSON
//! (everything this crate persists is), so the files stay greppable
//! during an incident. Appends are serialized per journal and synced to
//! disk before the sequence number is returned.

use super::{Journal, JournalError, SequenceNr};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Serialize, Deserialize)]
struct EventRecord {
    seq: SequenceNr,
    written_at: chrono::DateTime<chrono::Utc>,
    event: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    seq: SequenceNr,
    written_at: chrono::DateTime<chrono::Utc>,
    state: serde_json::Value,
}

/// JSON-lines journal rooted at a directory.
#[derive(Clone)]
pub struct FileJournal {
    base_dir: PathBuf,
    // Highest known sequence number per persistence id; loaded lazily.
    sequences: Arc<Mutex<HashMap<String, SequenceNr>>>,
}

impl FileJournal {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            sequences: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn events_path(&self, persistence_id: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.events.jsonl", encode_id(persistence_id)))
    }

    fn snapshot_path(&self, persistence_id: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.snapshot.json", encode_id(persistence_id)))
    }

    async fn read_records(
        &self,
        persistence_id: &str,
    ) -> Result<Vec<EventRecord>, JournalError> {
        let path = self.events_path(persistence_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_nr, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord =
                serde_json::from_str(line).map_err(|e| JournalError::Corrupt {
                    persistence_id: persistence_id.to_string(),
                    sequence_nr: line_nr as SequenceNr + 1,
                    reason: e.to_string(),
                })?;
            records.push(record);
        }
        Ok(records)
    }

    async fn current_sequence(&self, persistence_id: &str) -> Result<SequenceNr, JournalError> {
        let mut sequences = self.sequences.lock().await;
        if let Some(seq) = sequences.get(persistence_id) {
            return Ok(*seq);
        }
        let seq = self
            .read_records(persistence_id)
            .await?
            .last()
            .map(|r| r.seq)
            .unwrap_or(0);
        sequences.insert(persistence_id.to_string(), seq);
        Ok(seq)
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(
        &self,
        persistence_id: &str,
        event: &[u8],
    ) -> Result<SequenceNr, JournalError> {
        let event: serde_json::Value =
            serde_json::from_slice(event).map_err(|e| JournalError::Backend(format!(
                "event is not valid json: {e}"
            )))?;

        let seq = self.current_sequence(persistence_id).await? + 1;
        let record = EventRecord {
            seq,
            written_at: chrono::Utc::now(),
            event,
        };
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| JournalError::Backend(e.to_string()))?;
        line.push(b'\n');

        fs::create_dir_all(&self.base_dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(persistence_id))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        self.sequences
            .lock()
            .await
            .insert(persistence_id.to_string(), seq);
        Ok(seq)
    }

    async fn replay(
        &self,
        persistence_id: &str,
        from: SequenceNr,
    ) -> Result<Vec<(SequenceNr, Vec<u8>)>, JournalError> {
        let records = self.read_records(persistence_id).await?;
        let mut events = Vec::new();
        for record in records {
            if record.seq <= from {
                continue;
            }
            let bytes = serde_json::to_vec(&record.event)
                .map_err(|e| JournalError::Backend(e.to_string()))?;
            events.push((record.seq, bytes));
        }
        Ok(events)
    }

    async fn save_snapshot(
        &self,
        persistence_id: &str,
        sequence_nr: SequenceNr,
        snapshot: &[u8],
    ) -> Result<(), JournalError> {
        let state: serde_json::Value =
            serde_json::from_slice(snapshot).map_err(|e| JournalError::Backend(format!(
                "snapshot is not valid json: {e}"
            )))?;
        let record = SnapshotRecord {
            seq: sequence_nr,
            written_at: chrono::Utc::now(),
            state,
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| JournalError::Backend(e.to_string()))?;

        fs::create_dir_all(&self.base_dir).await?;
        // Write-then-rename so a crash never leaves a torn snapshot.
        let final_path = self.snapshot_path(persistence_id);
        let tmp_path = final_path.with_extension("json.tmp");
        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn load_snapshot(
        &self,
        persistence_id: &str,
    ) -> Result<Option<(SequenceNr, Vec<u8>)>, JournalError> {
        let path = self.snapshot_path(persistence_id);
        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: SnapshotRecord =
            serde_json::from_slice(&contents).map_err(|e| JournalError::Corrupt {
                persistence_id: persistence_id.to_string(),
                sequence_nr: 0,
                reason: e.to_string(),
            })?;
        let state = serde_json::to_vec(&record.state)
            .map_err(|e| JournalError::Backend(e.to_string()))?;
        Ok(Some((record.seq, state)))
    }
}

/// Map a persistence id to a filesystem-safe file name.
fn encode_id(persistence_id: &str) -> String {
    persistence_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '+'
            }
        })
        .collect()
}
