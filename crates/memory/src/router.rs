//! Retrieval router: classify, fan out, merge, degrade gracefully.
//!
//! A conversation turn is classified into one or more buckets, each bucket
//! runs as an independently-deadlined sub-query, and whatever completes in
//! time is merged, ranked, deduplicated, and cached.  A missed deadline never
//! blocks the turn: partial context is strictly better than waiting, and a
//! fully-timed-out retrieval is signalled so the caller can fall back to a
//! generic reply.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jane_config::RetrievalConfig;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::EmbedFn;
use crate::cache::{HotContextCache, fingerprint};
use crate::index::{Scope, SimilarityIndex};
use crate::sanitizer::Sanitizer;
use crate::schema::{MemoryKind, MemoryStatus};
use crate::store::MemoryStore;

/// Non-exclusive query classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryBucket {
    AboutJane,
    ClientHistory,
    Therapeutic,
}

#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    /// The current conversation turn.
    pub turn_text: String,
    pub client_id: String,
    /// Recent conversation window used for the cache fingerprint.  Usually a
    /// few turns; falls back to `turn_text` when empty.
    pub window: String,
    /// Explicit classification hint; `None` means classify heuristically.
    pub hint: Option<Vec<QueryBucket>>,
}

impl RetrievalQuery {
    pub fn new(turn_text: impl Into<String>, client_id: impl Into<String>) -> Self {
        let turn_text = turn_text.into();
        Self {
            window: turn_text.clone(),
            turn_text,
            client_id: client_id.into(),
            hint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextItem {
    pub memory_id: Uuid,
    pub kind: MemoryKind,
    pub score: f32,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// The merged, ranked, deduplicated retrieval result.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub items: Vec<ContextItem>,
    /// At least one sub-query missed its deadline.
    pub degraded: bool,
    pub from_cache: bool,
}

impl ContextBundle {
    /// The explicit empty-context signal: every sub-query missed its
    /// deadline.  The caller should produce a generic fallback reply.
    pub fn is_empty_context(&self) -> bool {
        self.degraded && self.items.is_empty()
    }
}

pub struct RetrievalRouter {
    store: Arc<MemoryStore>,
    index: Arc<SimilarityIndex>,
    sanitizer: Arc<Sanitizer>,
    cache: Arc<HotContextCache<ContextBundle>>,
    embed: EmbedFn,
    cfg: RetrievalConfig,
}

impl RetrievalRouter {
    pub fn new(
        store: Arc<MemoryStore>,
        index: Arc<SimilarityIndex>,
        sanitizer: Arc<Sanitizer>,
        cache: Arc<HotContextCache<ContextBundle>>,
        embed: EmbedFn,
        cfg: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            index,
            sanitizer,
            cache,
            embed,
            cfg,
        }
    }

    /// Assemble context for a conversation turn.  Never errors: the worst
    /// case is an empty, degraded bundle.
    pub async fn retrieve(&self, query: &RetrievalQuery) -> ContextBundle {
        let window = if query.window.is_empty() {
            &query.turn_text
        } else {
            &query.window
        };
        let key = fingerprint(window, &query.client_id);
        if let Some(mut cached) = self.cache.get(&key).await {
            cached.from_cache = true;
            debug!(client_id = %query.client_id, "hot-context cache hit");
            return cached;
        }

        let buckets = match &query.hint {
            Some(hint) if !hint.is_empty() => hint.clone(),
            _ => classify(&query.turn_text),
        };
        debug!(client_id = %query.client_id, ?buckets, "retrieval fan-out");

        let sub_queries = buckets.iter().map(|bucket| {
            let bucket = *bucket;
            let deadline = Duration::from_millis(self.deadline_ms(bucket));
            async move {
                match tokio::time::timeout(deadline, self.sub_query(bucket, query)).await {
                    Ok(items) => Some(items),
                    Err(_) => {
                        warn!(?bucket, ?deadline, "retrieval sub-query missed its deadline");
                        None
                    }
                }
            }
        });
        let results = futures::future::join_all(sub_queries).await;

        let degraded = results.iter().any(|r| r.is_none());
        let collected: Vec<ContextItem> = results.into_iter().flatten().flatten().collect();

        let bundle = ContextBundle {
            items: assemble_bundle(collected, self.cfg.bundle_limit, self.cfg.dedup_threshold),
            degraded,
            from_cache: false,
        };

        // Degraded bundles are not cached: serving partial context from the
        // hot cache would pin the degradation past the transient timeout.
        if !degraded {
            self.cache.put(key, bundle.clone()).await;
        }
        bundle
    }

    fn deadline_ms(&self, bucket: QueryBucket) -> u64 {
        match bucket {
            QueryBucket::AboutJane => self.cfg.jane_deadline_ms,
            QueryBucket::ClientHistory => self.cfg.client_deadline_ms,
            QueryBucket::Therapeutic => self.cfg.knowledge_deadline_ms,
        }
    }

    async fn sub_query(&self, bucket: QueryBucket, query: &RetrievalQuery) -> Vec<ContextItem> {
        match bucket {
            QueryBucket::AboutJane => self.jane_sub_query(&query.turn_text).await,
            QueryBucket::ClientHistory => {
                self.vector_sub_query(
                    Scope::Client(&query.client_id),
                    &query.turn_text,
                    MemoryKind::Client,
                )
                .await
            }
            QueryBucket::Therapeutic => {
                let mut items = self
                    .vector_sub_query(Scope::Knowledge, &query.turn_text, MemoryKind::Knowledge)
                    .await;
                for item in &mut items {
                    let outcome = self.sanitizer.sanitize(&item.content);
                    item.content = outcome.text;
                }
                items
            }
        }
    }

    /// Exact-topic matches first; similarity only when none exist.
    async fn jane_sub_query(&self, turn_text: &str) -> Vec<ContextItem> {
        let terms = tokenize(turn_text);
        let canon = self
            .store
            .list_by_kind_and_status(MemoryKind::Jane, MemoryStatus::Canon)
            .await;

        let exact: Vec<ContextItem> = canon
            .iter()
            .filter(|record| {
                record.body.as_jane().is_some_and(|jane| {
                    terms.contains(&jane.topic.to_lowercase())
                        || jane
                            .related_topics
                            .iter()
                            .any(|t| terms.contains(&t.to_lowercase()))
                })
            })
            .map(|record| ContextItem {
                memory_id: record.id,
                kind: MemoryKind::Jane,
                score: 1.0,
                content: record.body.content().to_string(),
                updated_at: record.updated_at,
            })
            .collect();

        if !exact.is_empty() {
            return exact;
        }
        self.vector_sub_query(Scope::Jane, turn_text, MemoryKind::Jane)
            .await
    }

    async fn vector_sub_query(
        &self,
        scope: Scope<'_>,
        turn_text: &str,
        kind: MemoryKind,
    ) -> Vec<ContextItem> {
        let Some(vector) = (self.embed)(turn_text.to_string()).await else {
            warn!(kind = kind.slug(), "embedding unavailable — sub-query returns no items");
            return Vec::new();
        };

        let hits = self.index.query(scope, &vector, self.cfg.top_k).await;
        let mut items = Vec::with_capacity(hits.len());
        for (memory_id, score) in hits {
            match self.store.get(memory_id).await {
                Ok(record) => items.push(ContextItem {
                    memory_id,
                    kind,
                    score,
                    content: record.body.content().to_string(),
                    updated_at: record.updated_at,
                }),
                // The index may briefly lag the store; a missing record is
                // skipped, never an error.
                Err(err) => debug!(%memory_id, %err, "index hit missing from store — skipped"),
            }
        }
        items
    }
}

// ── Classification ────────────────────────────────────────────────────────────

const THERAPEUTIC_TERMS: &[&str] = &[
    "anxiety", "anxious", "panic", "cope", "coping", "technique", "exercise", "breathing",
    "grounding", "depressed", "depression", "grief", "stress", "stressed", "trauma", "therapy",
    "sleep", "insomnia", "mindfulness",
];

/// Classify a turn into one or more buckets.  Non-exclusive by design; a turn
/// that matches nothing consults all three buckets, since missing context is
/// worse than extra sub-queries the deadlines already bound.
pub fn classify(turn_text: &str) -> Vec<QueryBucket> {
    let words: BTreeSet<String> = turn_text
        .split(|ch: char| !ch.is_alphanumeric() && ch != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();

    let mut buckets = Vec::new();
    if ["you", "your", "yourself", "jane"]
        .iter()
        .any(|w| words.contains(*w))
    {
        buckets.push(QueryBucket::AboutJane);
    }
    if ["i", "i'm", "i've", "me", "my", "we", "last", "remember", "told"]
        .iter()
        .any(|w| words.contains(*w))
    {
        buckets.push(QueryBucket::ClientHistory);
    }
    if THERAPEUTIC_TERMS.iter().any(|w| words.contains(*w)) {
        buckets.push(QueryBucket::Therapeutic);
    }

    if buckets.is_empty() {
        buckets = vec![
            QueryBucket::AboutJane,
            QueryBucket::ClientHistory,
            QueryBucket::Therapeutic,
        ];
    }
    buckets
}

// ── Ranking and deduplication ─────────────────────────────────────────────────

/// Common English stop words excluded from the lexical term set.
/// Filtering these prevents high-frequency words from inflating the overlap
/// ratio between unrelated items.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "was", "has", "are", "not", "this", "that", "with", "from", "have",
    "you", "can", "its", "will", "but", "they", "all", "been", "also", "into", "more", "than",
    "when", "who", "what", "how", "out", "our", "new", "now",
];

pub(crate) fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Jaccard overlap of the two token sets, in [0, 1].
fn token_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

/// Sort by (score, recency), drop exact id duplicates, collapse near-duplicate
/// content onto the highest-scoring representative, cap at `limit`.
fn assemble_bundle(mut items: Vec<ContextItem>, limit: usize, threshold: f32) -> Vec<ContextItem> {
    items.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });

    let mut kept: Vec<(ContextItem, BTreeSet<String>)> = Vec::new();
    for item in items {
        if kept.iter().any(|(k, _)| k.memory_id == item.memory_id) {
            continue;
        }
        let terms = tokenize(&item.content);
        let near_duplicate = kept
            .iter()
            .any(|(_, kept_terms)| token_overlap(&terms, kept_terms) >= threshold);
        if near_duplicate {
            continue;
        }
        kept.push((item, terms));
        if kept.len() == limit {
            break;
        }
    }

    kept.into_iter().map(|(item, _)| item).collect()
}
