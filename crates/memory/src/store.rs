//! Versioned, typed record storage with status transitions.
//!
//! The tables are logical: a map of full version histories, durably backed by
//! the record journal and witnessed by the audit trail.  Reads snapshot the
//! map under a briefly-held lock and run fully in parallel.  Writers to one
//! id serialize on a per-id gate held across the durable appends; writers to
//! different ids never block each other, and no table lock is ever held over
//! disk I/O.  Same-id races are still decided by the optimistic
//! `expected_version` check — the loser gets [`MemoryError::Conflict`] and
//! must re-read and retry.
//!
//! Unit of work for a mutation: journal append, then audit append, then the
//! in-memory commit.  A journal failure aborts before anything is witnessed
//! or visible; an audit failure aborts before anything is visible, and the
//! orphaned journal line is dropped on the next replay because no audit
//! entry witnesses it.  Either way, every state a memory ever occupies has
//! exactly one audit entry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEntry, AuditLog};
use crate::error::MemoryError;
use crate::journal::RecordJournal;
use crate::schema::{
    Actor, GeneratedBy, MemoryBody, MemoryDraft, MemoryKind, MemoryRecord, MemoryStatus,
};

pub struct MemoryStore {
    tables: RwLock<HashMap<Uuid, Vec<MemoryRecord>>>,
    /// Per-id writer gates; see [`MemoryStore::write_handle`].
    write_gate: std::sync::Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    audit: AuditLog,
    journal: Option<RecordJournal>,
}

impl MemoryStore {
    /// Volatile store with an in-memory audit trail, for tests and ephemeral
    /// engines.
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            write_gate: std::sync::Mutex::new(HashMap::new()),
            audit: AuditLog::in_memory(),
            journal: None,
        }
    }

    /// Durable store: the audit trail is loaded from `audit_path` and the
    /// version histories are replayed from the record journal, reconciled
    /// against the trail so only witnessed mutations resurrect.
    pub fn with_persistence(
        audit_path: impl AsRef<Path>,
        journal_path: impl AsRef<Path>,
    ) -> Result<Self, MemoryError> {
        let audit_path = audit_path.as_ref().to_path_buf();
        let audit_entries = audit::load_jsonl(&audit_path)?;
        let journal = RecordJournal::new(journal_path.as_ref().to_path_buf());

        let mut tables: HashMap<Uuid, Vec<MemoryRecord>> = HashMap::new();
        let events = journal.load()?;
        let replayed = events.len();
        for event in events {
            let history = tables.entry(event.record.id).or_default();
            // Duplicate versions appear when a mutation failed after its
            // journal line landed and the caller re-read and re-applied; the
            // later append is the one that committed.
            if let Some(existing) = history
                .iter_mut()
                .find(|r| r.version == event.record.version)
            {
                warn!(id = %event.record.id, version = event.record.version, "duplicate journalled version — keeping the later append");
                *existing = event.record;
                continue;
            }
            history.push(event.record);
        }
        for history in tables.values_mut() {
            history.sort_by_key(|r| r.version);
        }
        reconcile_with_audit(&mut tables, &audit_entries);

        debug!(
            records = tables.len(),
            versions = replayed,
            "memory store replayed from journal"
        );
        Ok(Self {
            tables: RwLock::new(tables),
            write_gate: std::sync::Mutex::new(HashMap::new()),
            audit: AuditLog::from_parts(Some(audit_path), audit_entries),
            journal: Some(journal),
        })
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Per-id writer gate.  Held across a mutation's durable appends so
    /// same-id writers serialize with the version check, while readers and
    /// writers to other ids proceed untouched.
    fn write_handle(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut gate = self.write_gate.lock().expect("write gate mutex poisoned");
        Arc::clone(gate.entry(id).or_default())
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    /// Latest version of `id`.  Soft-deleted records are still returned; the
    /// status tells the caller.
    pub async fn get(&self, id: Uuid) -> Result<MemoryRecord, MemoryError> {
        let tables = self.tables.read().await;
        tables
            .get(&id)
            .and_then(|history| history.last())
            .cloned()
            .ok_or(MemoryError::NotFound(id))
    }

    /// Full version history of `id`, oldest first.
    pub async fn history(&self, id: Uuid) -> Result<Vec<MemoryRecord>, MemoryError> {
        let tables = self.tables.read().await;
        tables
            .get(&id)
            .cloned()
            .ok_or(MemoryError::NotFound(id))
    }

    /// Latest versions matching `kind` and `status`.
    pub async fn list_by_kind_and_status(
        &self,
        kind: MemoryKind,
        status: MemoryStatus,
    ) -> Vec<MemoryRecord> {
        let tables = self.tables.read().await;
        tables
            .values()
            .filter_map(|history| history.last())
            .filter(|r| r.kind() == kind && r.status == status)
            .cloned()
            .collect()
    }

    // ── Writes ─────────────────────────────────────────────────────────────

    /// Insert a new memory.  Assigns id, version 1, and timestamps; writes the
    /// birth audit entry.
    pub async fn put(&self, draft: MemoryDraft) -> Result<MemoryRecord, MemoryError> {
        validate_draft(&draft)?;

        let now = Utc::now();
        let record = MemoryRecord {
            id: Uuid::new_v4(),
            version: 1,
            status: draft.status,
            created_at: now,
            updated_at: now,
            expires_at: draft.expires_at,
            source_document: draft.source_document,
            source_page: draft.source_page,
            generated_by: draft.generated_by,
            needs_encryption: draft.needs_encryption,
            body: draft.body,
        };

        // The id is fresh, so no competing writer exists and no gate is
        // taken.  Durable first, visible second.
        if let Some(journal) = &self.journal {
            journal.append(&record).await?;
        }
        self.audit
            .append(AuditEntry {
                memory_id: record.id,
                from_status: None,
                to_status: record.status,
                actor: Actor::System,
                timestamp: now,
                reason: "created".to_string(),
            })
            .await?;
        self.tables
            .write()
            .await
            .insert(record.id, vec![record.clone()]);

        debug!(id = %record.id, kind = record.kind().slug(), status = record.status.label(), "memory stored");
        Ok(record)
    }

    /// Move `id` to `new_status`, enforcing the state machine and optimistic
    /// versioning.  Appends exactly one audit entry on success.
    pub async fn transition(
        &self,
        id: Uuid,
        expected_version: u64,
        new_status: MemoryStatus,
        actor: Actor,
        reason: &str,
    ) -> Result<MemoryRecord, MemoryError> {
        let gate = self.write_handle(id);
        let _writer = gate.lock().await;

        let current = {
            let tables = self.tables.read().await;
            tables
                .get(&id)
                .and_then(|history| history.last())
                .cloned()
                .ok_or(MemoryError::NotFound(id))?
        };

        if current.version != expected_version {
            return Err(MemoryError::Conflict {
                id,
                expected: expected_version,
                found: current.version,
            });
        }
        if !current.status.can_transition(new_status, &actor) {
            warn!(
                id = %id,
                from = current.status.label(),
                to = new_status.label(),
                %actor,
                "rejected invalid transition"
            );
            return Err(MemoryError::InvalidTransition {
                id,
                from: current.status,
                to: new_status,
            });
        }

        let now = Utc::now();
        let mut next = current.clone();
        next.version += 1;
        next.status = new_status;
        next.updated_at = now;

        // Durable appends run under the per-id gate only; readers and
        // writers to other ids are never behind this I/O.
        if let Some(journal) = &self.journal {
            journal.append(&next).await?;
        }
        self.audit
            .append(AuditEntry {
                memory_id: id,
                from_status: Some(current.status),
                to_status: new_status,
                actor,
                timestamp: now,
                reason: reason.to_string(),
            })
            .await?;

        let mut tables = self.tables.write().await;
        tables
            .get_mut(&id)
            .ok_or(MemoryError::NotFound(id))?
            .push(next.clone());
        drop(tables);

        debug!(id = %id, to = new_status.label(), version = next.version, "memory transitioned");
        Ok(next)
    }

    /// Mutate a record's content without a status change.  Bumps the version
    /// and retains the old one, but writes no audit entry — the audit trail
    /// counts status transitions only.  Used for contradicts/supports link
    /// recording and human edits during review resolution.
    pub async fn amend<F>(
        &self,
        id: Uuid,
        expected_version: u64,
        mutate: F,
    ) -> Result<MemoryRecord, MemoryError>
    where
        F: FnOnce(&mut MemoryRecord),
    {
        let gate = self.write_handle(id);
        let _writer = gate.lock().await;

        let current = {
            let tables = self.tables.read().await;
            tables
                .get(&id)
                .and_then(|history| history.last())
                .cloned()
                .ok_or(MemoryError::NotFound(id))?
        };

        if current.version != expected_version {
            return Err(MemoryError::Conflict {
                id,
                expected: expected_version,
                found: current.version,
            });
        }
        if current.status == MemoryStatus::Deleted {
            return Err(MemoryError::InvalidMemory(
                "cannot amend a deleted memory".to_string(),
            ));
        }
        if matches!(current.body, MemoryBody::Knowledge(_)) && current.status == MemoryStatus::Canon
        {
            return Err(MemoryError::InvalidMemory(
                "knowledge chunks are immutable once canon".to_string(),
            ));
        }

        let mut next = current.clone();
        mutate(&mut next);
        // The closure may only touch content fields; identity, status, and
        // history bookkeeping stay under store control.
        next.id = id;
        next.status = current.status;
        next.created_at = current.created_at;
        next.version = current.version + 1;
        next.updated_at = Utc::now();

        if let MemoryBody::Jane(jane) = &next.body {
            if jane.contradicts.contains(&id) || jane.supports.contains(&id) {
                return Err(MemoryError::InvalidMemory(
                    "a memory may not appear in its own contradicts/supports set".to_string(),
                ));
            }
        }

        if let Some(journal) = &self.journal {
            journal.append(&next).await?;
        }
        let mut tables = self.tables.write().await;
        tables
            .get_mut(&id)
            .ok_or(MemoryError::NotFound(id))?
            .push(next.clone());
        drop(tables);

        debug!(id = %id, version = next.version, "memory amended");
        Ok(next)
    }
}

/// Drop journalled versions the audit trail never witnessed.  A failure (or
/// crash) between the journal append and the audit append leaves the version
/// on disk even though the mutation was aborted; it must not resurrect on
/// replay, or the audit-count invariant breaks.  Amendments keep their status
/// and consume no witness; every status-changing version, birth included,
/// must match the next witnessed status for its id.
fn reconcile_with_audit(
    tables: &mut HashMap<Uuid, Vec<MemoryRecord>>,
    entries: &[AuditEntry],
) {
    let mut witnessed: HashMap<Uuid, Vec<MemoryStatus>> = HashMap::new();
    for entry in entries {
        witnessed
            .entry(entry.memory_id)
            .or_default()
            .push(entry.to_status);
    }

    tables.retain(|id, history| {
        let mut seq = witnessed.remove(id).unwrap_or_default().into_iter();
        let mut prev: Option<MemoryStatus> = None;
        let mut kept = 0usize;
        for record in history.iter() {
            if prev != Some(record.status) && seq.next() != Some(record.status) {
                warn!(
                    id = %id,
                    version = record.version,
                    "journalled version lacks an audit witness — dropped on replay"
                );
                break;
            }
            prev = Some(record.status);
            kept += 1;
        }
        history.truncate(kept);
        !history.is_empty()
    });
}

fn validate_draft(draft: &MemoryDraft) -> Result<(), MemoryError> {
    match draft.status {
        MemoryStatus::Draft => {
            if matches!(draft.body, MemoryBody::Knowledge(_)) {
                return Err(MemoryError::InvalidMemory(
                    "knowledge chunks are reference material and are created directly in canon"
                        .to_string(),
                ));
            }
        }
        MemoryStatus::Canon => {
            let human_authored = matches!(draft.generated_by, GeneratedBy::Human { .. });
            let knowledge = matches!(draft.body, MemoryBody::Knowledge(_));
            if !human_authored && !knowledge {
                return Err(MemoryError::InvalidMemory(
                    "only human-authored foundation content or knowledge chunks may be born canon"
                        .to_string(),
                ));
            }
        }
        other => {
            return Err(MemoryError::InvalidMemory(format!(
                "a memory is born draft or canon, not {}",
                other.label()
            )));
        }
    }

    match &draft.body {
        MemoryBody::Client(client) => {
            if !(1..=5).contains(&client.sensitivity_level) {
                return Err(MemoryError::InvalidMemory(format!(
                    "sensitivity level {} outside 1..=5",
                    client.sensitivity_level
                )));
            }
            if client.client_id.trim().is_empty() {
                return Err(MemoryError::InvalidMemory(
                    "client memory requires a client id".to_string(),
                ));
            }
        }
        MemoryBody::Jane(jane) => {
            if jane.topic.trim().is_empty() {
                return Err(MemoryError::InvalidMemory(
                    "jane memory requires a topic".to_string(),
                ));
            }
        }
        MemoryBody::Knowledge(_) => {}
    }

    Ok(())
}
