//! Brute-force cosine similarity index, one collection per memory kind.
//!
//! The index is a derived, eventually-consistent cache over the store's
//! vectors.  Entries carry a copy of the record's status and client id taken
//! at index time, and queries only ever return canon entries — so a lagging
//! upsert can never leak quarantined or deleted content into retrieval.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

use crate::schema::{MemoryKind, MemoryRecord, MemoryStatus};

/// Query scope: a named collection, with client-memory queries additionally
/// restricted to one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope<'a> {
    Jane,
    Client(&'a str),
    Knowledge,
}

impl Scope<'_> {
    pub fn kind(&self) -> MemoryKind {
        match self {
            Self::Jane => MemoryKind::Jane,
            Self::Client(_) => MemoryKind::Client,
            Self::Knowledge => MemoryKind::Knowledge,
        }
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    client_id: Option<String>,
    status: MemoryStatus,
    updated_at: DateTime<Utc>,
    vector: Vec<f32>,
}

#[derive(Debug, Default)]
pub struct SimilarityIndex {
    collections: RwLock<HashMap<MemoryKind, HashMap<Uuid, IndexEntry>>>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a memory's vector, capturing status and client id
    /// from the record as of now.
    pub async fn index(&self, record: &MemoryRecord, vector: Vec<f32>) {
        let entry = IndexEntry {
            client_id: record.body.as_client().map(|c| c.client_id.clone()),
            status: record.status,
            updated_at: record.updated_at,
            vector,
        };
        let mut collections = self.collections.write().await;
        collections
            .entry(record.kind())
            .or_default()
            .insert(record.id, entry);
    }

    /// Keep the derived status copy in step with a store transition.
    pub async fn set_status(&self, id: Uuid, status: MemoryStatus, updated_at: DateTime<Utc>) {
        let mut collections = self.collections.write().await;
        for collection in collections.values_mut() {
            if let Some(entry) = collection.get_mut(&id) {
                entry.status = status;
                entry.updated_at = updated_at;
                return;
            }
        }
    }

    pub async fn remove(&self, id: Uuid) {
        let mut collections = self.collections.write().await;
        for collection in collections.values_mut() {
            if collection.remove(&id).is_some() {
                return;
            }
        }
    }

    /// The `k` nearest canon entries in `scope` by cosine similarity.
    /// Scores lie in [-1, 1], ordered descending; ties broken by more-recent
    /// `updated_at` first.
    pub async fn query(&self, scope: Scope<'_>, vector: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(&scope.kind()) else {
            return Vec::new();
        };

        let mut scored: Vec<(Uuid, f32, DateTime<Utc>)> = collection
            .iter()
            .filter(|(_, entry)| entry.status == MemoryStatus::Canon)
            .filter(|(_, entry)| match &scope {
                Scope::Client(client_id) => entry.client_id.as_deref() == Some(*client_id),
                _ => true,
            })
            .map(|(id, entry)| (*id, cosine_similarity(&entry.vector, vector), entry.updated_at))
            .collect();

        scored.sort_by(|(_, ls, lt), (_, rs, rt)| rs.total_cmp(ls).then_with(|| rt.cmp(lt)));
        scored.truncate(k);

        trace!(kind = scope.kind().slug(), hits = scored.len(), "similarity query");
        scored.into_iter().map(|(id, score, _)| (id, score)).collect()
    }

    pub async fn len(&self) -> usize {
        let collections = self.collections.read().await;
        collections.values().map(|c| c.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}
