//! Append-only audit trail.
//!
//! One [`AuditEntry`] is written for every status transition of every memory,
//! birth included.  Entries are never mutated or deleted; the JSONL file is
//! only ever appended to, and each append is fsync'd so the trail survives a
//! crash immediately after the commit it witnesses.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::MemoryError;
use crate::schema::{Actor, MemoryStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub memory_id: Uuid,
    /// `None` marks the record's birth entry.
    pub from_status: Option<MemoryStatus>,
    pub to_status: MemoryStatus,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// The audit trail: an in-memory sequence mirrored to an optional JSONL file.
///
/// When a path is configured, the file append happens before the in-memory
/// commit and a failed append fails the whole operation — the store relies on
/// this to guarantee no mutation without its audit record.
#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    /// Volatile trail, for tests and ephemeral engines.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Durable trail at `path`.  Existing entries are loaded eagerly; corrupt
    /// lines are skipped with a warning and preserved in a `.corrupt` sidecar.
    pub fn at_path(path: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let path = path.into();
        let entries = load_jsonl(&path)?;
        Ok(Self::from_parts(Some(path), entries))
    }

    /// Assemble a trail from already-loaded entries.  Used by the store, which
    /// needs the entries itself to reconcile the journal during replay.
    pub(crate) fn from_parts(path: Option<PathBuf>, entries: Vec<AuditEntry>) -> Self {
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn append(&self, entry: AuditEntry) -> Result<(), MemoryError> {
        // The lock covers the file append too: mutations to different ids run
        // concurrently in the store, and their lines must not interleave.
        let mut entries = self.entries.lock().await;
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(MemoryError::Audit)?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(MemoryError::Audit)?;
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            file.write_all(line.as_bytes())
                .await
                .map_err(MemoryError::Audit)?;
            // Flush userspace buffers and fsync so the entry survives a crash
            // immediately after the mutation it witnesses.
            file.flush().await.map_err(MemoryError::Audit)?;
            file.sync_all().await.map_err(MemoryError::Audit)?;
        }

        entries.push(entry);
        Ok(())
    }

    /// All entries for one memory id, in append order.
    pub async fn entries_for(&self, memory_id: Uuid) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.memory_id == memory_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

pub(crate) fn load_jsonl(path: &Path) -> Result<Vec<AuditEntry>, MemoryError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = std::fs::OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(MemoryError::Audit)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut corrupt_count = 0usize;

    for (line_idx, line_result) in reader.lines().enumerate() {
        let line = line_result.map_err(MemoryError::Audit)?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<AuditEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                corrupt_count += 1;
                warn!(
                    line = line_idx + 1,
                    error = %err,
                    path = %path.display(),
                    "corrupt audit record — skipping line (original preserved in .corrupt file)"
                );
                let corrupt_path = path.with_extension("jsonl.corrupt");
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
            path = %path.display(),
            "audit log loaded with skipped corrupt lines — inspect .corrupt sidecar"
        );
    }

    Ok(entries)
}
