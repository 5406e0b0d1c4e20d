//! Append-only journal of committed record versions.
//!
//! The store's tables are logical and in-memory; the journal is the durable
//! backend behind them.  Every version (put, transition, amend) is appended
//! as one JSONL line before the mutation commits, and replayed at startup to
//! rebuild the full version history; the store reconciles the replay against
//! the audit trail, so a line whose mutation later failed does not resurrect.
//! Any key-value or document backend could stand in for this file — the
//! engine only needs the append/replay access pattern.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::MemoryError;
use crate::schema::MemoryRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub record: MemoryRecord,
}

#[derive(Debug, Clone)]
pub struct RecordJournal {
    path: PathBuf,
    /// Serializes appends: mutations to different ids run concurrently in the
    /// store, and their lines must not interleave.  Shared across clones.
    write_lock: Arc<Mutex<()>>,
}

impl RecordJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &MemoryRecord) -> Result<(), MemoryError> {
        let _writer = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(MemoryError::Journal)?;
        }

        let event = JournalEvent {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            record: record.clone(),
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(MemoryError::Journal)?;
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(MemoryError::Journal)?;
        file.flush().await.map_err(MemoryError::Journal)?;
        file.sync_all().await.map_err(MemoryError::Journal)?;
        Ok(())
    }

    /// Load every journalled version in append order.  Corrupt lines are
    /// skipped with a warning and preserved in a `.corrupt` sidecar.
    pub fn load(&self) -> Result<Vec<JournalEvent>, MemoryError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(MemoryError::Journal)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result.map_err(MemoryError::Journal)?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<JournalEvent>(&line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    corrupt_count += 1;
                    warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt journal record — skipping line (original preserved in .corrupt file)"
                    );
                    let corrupt_path = self.path.with_extension("jsonl.corrupt");
                    if let Ok(mut bad) = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&corrupt_path)
                    {
                        use std::io::Write as _;
                        let _ = writeln!(bad, "{line}");
                    }
                }
            }
        }

        if corrupt_count > 0 {
            warn!(
                corrupt_lines = corrupt_count,
                path = %self.path.display(),
                "journal loaded with skipped corrupt lines — inspect .corrupt sidecar"
            );
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::schema::{GeneratedBy, JaneMemory, MemoryBody, MemoryStatus};

    fn make_record(content: &str, version: u64) -> MemoryRecord {
        MemoryRecord {
            id: Uuid::new_v4(),
            version,
            status: MemoryStatus::Draft,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expires_at: None,
            source_document: None,
            source_page: None,
            generated_by: GeneratedBy::LanguageModel {
                model: "llama3.1:8b".to_string(),
            },
            needs_encryption: false,
            body: MemoryBody::Jane(JaneMemory {
                topic: "gardening".to_string(),
                related_topics: BTreeSet::new(),
                contradicts: BTreeSet::new(),
                supports: BTreeSet::new(),
                content: content.to_string(),
                detailed_content: serde_json::Value::Null,
            }),
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("jane-journal-test-{}.jsonl", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn append_and_load_round_trip() {
        let path = temp_path();
        let journal = RecordJournal::new(&path);
        journal.append(&make_record("keeps a rose garden", 1)).await.unwrap();
        journal.append(&make_record("prefers mornings", 1)).await.unwrap();
        let events = journal.load().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].record.body.content(), "keeps a rose garden");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn versions_preserved_in_order() {
        let path = temp_path();
        let journal = RecordJournal::new(&path);
        let mut record = make_record("v1", 1);
        journal.append(&record).await.unwrap();
        record.version = 2;
        journal.append(&record).await.unwrap();
        let events = journal.load().unwrap();
        assert_eq!(events[0].record.version, 1);
        assert_eq!(events[1].record.version, 2);
        assert_eq!(events[0].record.id, events[1].record.id);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_nonexistent_returns_empty() {
        let journal = RecordJournal::new(temp_path());
        assert!(journal.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_skips_corrupt_lines() {
        let path = temp_path();
        let journal = RecordJournal::new(&path);
        journal.append(&make_record("valid", 1)).await.unwrap();
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "not json at all").unwrap();
        }
        journal.append(&make_record("also valid", 1)).await.unwrap();
        let events = journal.load().unwrap();
        assert_eq!(events.len(), 2);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("jsonl.corrupt"));
    }
}
