//! The engine facade: wires configuration and the external collaborators
//! into the component graph and exposes the high-level operations a
//! conversation runtime needs.

use std::sync::Arc;

use anyhow::Result;
use jane_config::EngineConfig;
use jane_llm::{Embed, Generate};
use tracing::info;
use uuid::Uuid;

use crate::EmbedFn;
use crate::audit::AuditEntry;
use crate::cache::{CacheStats, HotContextCache};
use crate::error::MemoryError;
use crate::index::SimilarityIndex;
use crate::quarantine::{QuarantinePipeline, ReviewDecision, SubmissionOutcome};
use crate::router::{ContextBundle, RetrievalQuery, RetrievalRouter};
use crate::sanitizer::Sanitizer;
use crate::schema::{
    Actor, JaneMemory, KnowledgeChunk, MemoryBody, MemoryDraft, MemoryKind, MemoryRecord,
    MemoryStatus, Session,
};
use crate::store::MemoryStore;
use crate::summarizer::SessionSummarizer;
use crate::validator::ConsistencyValidator;

/// Snapshot of the engine's record and cache population.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub canon_jane: usize,
    pub canon_client: usize,
    pub canon_knowledge: usize,
    pub quarantined: usize,
    pub pending_review: usize,
    pub index_size: usize,
    pub cache: CacheStats,
}

pub struct MemoryEngine {
    store: Arc<MemoryStore>,
    index: Arc<SimilarityIndex>,
    cache: Arc<HotContextCache<ContextBundle>>,
    router: RetrievalRouter,
    pipeline: Arc<QuarantinePipeline>,
    summarizer: SessionSummarizer,
    embed: EmbedFn,
}

impl MemoryEngine {
    /// Volatile engine, for tests and ephemeral runtimes.
    pub fn new(cfg: EngineConfig, generate: Arc<dyn Generate>, embed: EmbedFn) -> Self {
        Self::build(cfg, generate, embed, MemoryStore::in_memory())
    }

    /// Durable engine backed by the audit log and record journal configured
    /// in `[storage]`.
    pub fn with_persistence(
        cfg: EngineConfig,
        generate: Arc<dyn Generate>,
        embed: EmbedFn,
    ) -> Result<Self, MemoryError> {
        let data_dir = std::path::Path::new(&cfg.storage.data_dir);
        let store = MemoryStore::with_persistence(
            data_dir.join(&cfg.storage.audit_log),
            data_dir.join(&cfg.storage.record_journal),
        )?;
        info!(data_dir = %data_dir.display(), "memory engine loaded from journal");
        Ok(Self::build(cfg, generate, embed, store))
    }

    fn build(
        cfg: EngineConfig,
        generate: Arc<dyn Generate>,
        embed: EmbedFn,
        store: MemoryStore,
    ) -> Self {
        let store = Arc::new(store);
        let index = Arc::new(SimilarityIndex::new());
        let cache = Arc::new(HotContextCache::new(cfg.retrieval.cache_capacity));
        let sanitizer = Arc::new(Sanitizer::with_default_rules());

        let validator = Arc::new(ConsistencyValidator::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&generate),
            cfg.validator.clone(),
        ));
        let pipeline = Arc::new(QuarantinePipeline::new(
            Arc::clone(&store),
            Arc::clone(&index),
            validator,
            Arc::clone(&cache),
            Arc::clone(&embed),
        ));
        let router = RetrievalRouter::new(
            Arc::clone(&store),
            Arc::clone(&index),
            sanitizer,
            Arc::clone(&cache),
            Arc::clone(&embed),
            cfg.retrieval.clone(),
        );
        let summarizer = SessionSummarizer::new(
            generate,
            Arc::clone(&pipeline),
            cfg.summarizer.clone(),
            cfg.llm.model.clone(),
        );

        Self {
            store,
            index,
            cache,
            router,
            pipeline,
            summarizer,
            embed,
        }
    }

    /// Adapt an [`Embed`] service into the closure seam the components use.
    /// Failures become `None`: retrieval degrades, it never errors.
    pub fn embed_fn_from(client: Arc<dyn Embed>) -> EmbedFn {
        Arc::new(move |text| {
            let client = Arc::clone(&client);
            Box::pin(async move { client.embed(&text).await.ok() })
        })
    }

    // ── Retrieval ──────────────────────────────────────────────────────────

    /// Assemble context for a conversation turn.  Never errors; worst case is
    /// an empty, degraded bundle.
    pub async fn retrieve(&self, query: &RetrievalQuery) -> ContextBundle {
        self.router.retrieve(query).await
    }

    // ── Writing memories ───────────────────────────────────────────────────

    /// Run a model-generated draft through the quarantine pipeline.
    pub async fn submit_draft(&self, draft: MemoryDraft) -> Result<SubmissionOutcome, MemoryError> {
        self.pipeline.submit(draft).await
    }

    /// Convenience wrapper for the common case: a model-drafted Jane fact.
    pub async fn submit_jane_draft(
        &self,
        model: &str,
        jane: JaneMemory,
    ) -> Result<SubmissionOutcome, MemoryError> {
        self.pipeline
            .submit(MemoryDraft::generated(model, MemoryBody::Jane(jane)))
            .await
    }

    /// Human-authored foundation content: stored directly as canon and made
    /// retrievable.
    pub async fn add_foundation(
        &self,
        editor_id: &str,
        body: MemoryBody,
    ) -> Result<MemoryRecord, MemoryError> {
        let record = self
            .store
            .put(MemoryDraft::foundation(editor_id, body))
            .await?;
        if let Some(vector) = (self.embed)(record.body.content().to_string()).await {
            self.index.index(&record, vector).await;
        }
        self.cache.invalidate_kind(record.kind());
        Ok(record)
    }

    /// Knowledge chunks skip quarantine: reference material enters canon
    /// directly, carrying its own embedding.
    pub async fn ingest_knowledge(
        &self,
        source_document: &str,
        page: u32,
        chunk: KnowledgeChunk,
    ) -> Result<MemoryRecord, MemoryError> {
        let vector = chunk.embedding.clone();
        let record = self
            .store
            .put(MemoryDraft::knowledge(source_document, page, chunk))
            .await?;
        self.index.index(&record, vector).await;
        self.cache.invalidate_kind(MemoryKind::Knowledge);
        Ok(record)
    }

    // ── Lifecycle operations ───────────────────────────────────────────────

    pub async fn resolve_human_review(
        &self,
        id: Uuid,
        decision: ReviewDecision,
        editor_id: &str,
    ) -> Result<MemoryRecord, MemoryError> {
        self.pipeline.resolve_human_review(id, decision, editor_id).await
    }

    pub async fn delete_memory(
        &self,
        id: Uuid,
        actor: Actor,
        reason: &str,
    ) -> Result<MemoryRecord, MemoryError> {
        self.pipeline.delete(id, actor, reason).await
    }

    /// Condense a finished session into client-memory drafts and quarantine
    /// each of them.
    pub async fn end_session(
        &self,
        session: &mut Session,
        session_number: u32,
        transcript: &str,
    ) -> Result<Vec<SubmissionOutcome>> {
        self.summarizer
            .summarize_session(session, session_number, transcript)
            .await
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    pub async fn get(&self, id: Uuid) -> Result<MemoryRecord, MemoryError> {
        self.store.get(id).await
    }

    pub async fn audit_trail(&self, id: Uuid) -> Vec<AuditEntry> {
        self.store.audit().entries_for(id).await
    }

    pub async fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            index_size: self.index.len().await,
            cache: self.cache.stats().await,
            ..Default::default()
        };
        for kind in [MemoryKind::Jane, MemoryKind::Client, MemoryKind::Knowledge] {
            let canon = self
                .store
                .list_by_kind_and_status(kind, MemoryStatus::Canon)
                .await
                .len();
            match kind {
                MemoryKind::Jane => stats.canon_jane = canon,
                MemoryKind::Client => stats.canon_client = canon,
                MemoryKind::Knowledge => stats.canon_knowledge = canon,
            }
            stats.quarantined += self
                .store
                .list_by_kind_and_status(kind, MemoryStatus::Quarantined)
                .await
                .len();
            stats.pending_review += self
                .store
                .list_by_kind_and_status(kind, MemoryStatus::HumanReview)
                .await
                .len();
        }
        stats
    }
}
