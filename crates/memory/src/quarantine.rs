//! Quarantine pipeline: draft → quarantined → canon | human_review.
//!
//! `submit` is not cancellable once started — the record exists in
//! `quarantined` status from the first transition, and abandonment must go
//! through `resolve_human_review` or an explicit delete, never a silent
//! rollback.  Store-level `Conflict` losses are absorbed here by re-reading
//! and re-applying the same target status; the decision itself is never
//! re-made on a conflict.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::EmbedFn;
use crate::cache::HotContextCache;
use crate::error::MemoryError;
use crate::index::SimilarityIndex;
use crate::router::ContextBundle;
use crate::schema::{
    Actor, GeneratedBy, MemoryBody, MemoryDraft, MemoryKind, MemoryRecord, MemoryStatus,
};
use crate::store::MemoryStore;
use crate::validator::{ConsistencyValidator, Verdict};

#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub memory_id: Uuid,
    pub status: MemoryStatus,
    /// `None` when the pipeline did not (re-)validate, e.g. an idempotent
    /// resubmission of an already-canon draft.
    pub verdict: Option<Verdict>,
}

#[derive(Debug, Clone)]
pub enum ReviewDecision {
    /// Promote to canon, optionally with content edited by the reviewer.
    Approve { edited_content: Option<String> },
    /// Soft-delete the draft.
    Reject,
}

/// Keyed cooperative lock: at most one quarantined Jane draft per topic is in
/// flight at a time, so two contradictory drafts about the same topic can
/// never be validated against each other's absence.
#[derive(Default)]
struct TopicGate {
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TopicGate {
    fn handle(&self, topic: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("topic gate mutex poisoned");
        Arc::clone(locks.entry(topic.to_string()).or_default())
    }
}

pub struct QuarantinePipeline {
    store: Arc<MemoryStore>,
    index: Arc<SimilarityIndex>,
    validator: Arc<ConsistencyValidator>,
    cache: Arc<HotContextCache<ContextBundle>>,
    embed: EmbedFn,
    topic_gate: TopicGate,
}

impl QuarantinePipeline {
    pub fn new(
        store: Arc<MemoryStore>,
        index: Arc<SimilarityIndex>,
        validator: Arc<ConsistencyValidator>,
        cache: Arc<HotContextCache<ContextBundle>>,
        embed: EmbedFn,
    ) -> Self {
        Self {
            store,
            index,
            validator,
            cache,
            embed,
            topic_gate: TopicGate::default(),
        }
    }

    /// Run a new draft through quarantine to a terminal state.
    pub async fn submit(&self, draft: MemoryDraft) -> Result<SubmissionOutcome, MemoryError> {
        if draft.status != MemoryStatus::Draft {
            return Err(MemoryError::InvalidMemory(format!(
                "quarantine expects a draft, got {}",
                draft.status.label()
            )));
        }

        // Hold the per-topic gate for Jane drafts until a terminal state is
        // reached; a second submission for the topic waits cooperatively.
        let gate = match &draft.body {
            MemoryBody::Jane(jane) => Some(self.topic_gate.handle(&jane.topic)),
            _ => None,
        };
        let _guard = match &gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let record = self.store.put(draft).await?;
        self.run_to_terminal(record).await
    }

    /// Re-run the pipeline for an already-stored record.  Idempotent: a draft
    /// that already reached canon is a no-op with no new audit entry.
    pub async fn resubmit(&self, id: Uuid) -> Result<SubmissionOutcome, MemoryError> {
        let record = self.store.get(id).await?;
        match record.status {
            MemoryStatus::Canon => {
                debug!(id = %id, "resubmission of canon memory is a no-op");
                Ok(SubmissionOutcome {
                    memory_id: id,
                    status: MemoryStatus::Canon,
                    verdict: None,
                })
            }
            MemoryStatus::Draft | MemoryStatus::Quarantined => {
                let gate = match &record.body {
                    MemoryBody::Jane(jane) => Some(self.topic_gate.handle(&jane.topic)),
                    _ => None,
                };
                let _guard = match &gate {
                    Some(gate) => Some(gate.lock().await),
                    None => None,
                };
                // Re-read under the gate; the in-flight submission we may have
                // waited on could have advanced this record.
                let record = self.store.get(id).await?;
                if record.status.is_pipeline_terminal() {
                    return Ok(SubmissionOutcome {
                        memory_id: id,
                        status: record.status,
                        verdict: None,
                    });
                }
                self.run_to_terminal(record).await
            }
            MemoryStatus::HumanReview | MemoryStatus::Deleted => Ok(SubmissionOutcome {
                memory_id: id,
                status: record.status,
                verdict: None,
            }),
        }
    }

    async fn run_to_terminal(
        &self,
        record: MemoryRecord,
    ) -> Result<SubmissionOutcome, MemoryError> {
        let id = record.id;
        let record = if record.status == MemoryStatus::Draft {
            self.transition_with_retry(id, MemoryStatus::Quarantined, Actor::System, "submitted for validation")
                .await?
        } else {
            record
        };

        let embedding = (self.embed)(record.body.content().to_string()).await;
        if let Some(vector) = &embedding {
            // Indexed now, surfaced only once the status copy says canon.
            self.index.index(&record, vector.clone()).await;
        }

        let verdict = match record.kind() {
            MemoryKind::Jane => {
                self.validator
                    .validate_jane(&record, embedding.as_deref())
                    .await?
            }
            MemoryKind::Client => self.validator.validate_client(&record).await,
            MemoryKind::Knowledge => {
                // Unreachable through put(), which rejects knowledge drafts.
                return Err(MemoryError::InvalidMemory(
                    "knowledge chunks do not pass through quarantine".to_string(),
                ));
            }
        };

        let settled = match &verdict {
            Verdict::Consistent { .. } => {
                let settled = self
                    .transition_with_retry(id, MemoryStatus::Canon, Actor::System, "validator: consistent")
                    .await?;
                self.index
                    .set_status(id, MemoryStatus::Canon, settled.updated_at)
                    .await;
                self.cache.invalidate_kind(settled.kind());
                settled
            }
            Verdict::Inconsistent { conflicts } => {
                let reason = if conflicts.is_empty() {
                    "validator: judgment unavailable".to_string()
                } else {
                    let ids = conflicts
                        .iter()
                        .map(Uuid::to_string)
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("validator: conflicts with {ids}")
                };
                self.transition_with_retry(id, MemoryStatus::HumanReview, Actor::System, &reason)
                    .await?
            }
        };

        info!(
            id = %id,
            kind = settled.kind().slug(),
            status = settled.status.label(),
            "quarantine pipeline settled"
        );
        Ok(SubmissionOutcome {
            memory_id: id,
            status: settled.status,
            verdict: Some(verdict),
        })
    }

    /// The only path out of human review.  Edits made during resolution are
    /// re-attributed to the human editor.
    pub async fn resolve_human_review(
        &self,
        id: Uuid,
        decision: ReviewDecision,
        editor_id: &str,
    ) -> Result<MemoryRecord, MemoryError> {
        let current = self.store.get(id).await?;
        if current.status != MemoryStatus::HumanReview {
            return Err(MemoryError::InvalidTransition {
                id,
                from: current.status,
                to: MemoryStatus::Canon,
            });
        }

        let actor = Actor::Human(editor_id.to_string());
        match decision {
            ReviewDecision::Approve { edited_content } => {
                if let Some(content) = edited_content {
                    let editor = editor_id.to_string();
                    self.amend_with_retry(id, move |record| {
                        match &mut record.body {
                            MemoryBody::Jane(jane) => jane.content = content.clone(),
                            MemoryBody::Client(client) => client.content = content.clone(),
                            MemoryBody::Knowledge(chunk) => chunk.content = content.clone(),
                        }
                        record.generated_by = GeneratedBy::Human {
                            editor_id: editor.clone(),
                        };
                    })
                    .await?;
                }

                let settled = self
                    .transition_with_retry(id, MemoryStatus::Canon, actor, "human review: approved")
                    .await?;
                if let Some(vector) = (self.embed)(settled.body.content().to_string()).await {
                    self.index.index(&settled, vector).await;
                } else {
                    self.index
                        .set_status(id, MemoryStatus::Canon, settled.updated_at)
                        .await;
                }
                self.cache.invalidate_kind(settled.kind());
                info!(id = %id, editor = editor_id, "human review approved");
                Ok(settled)
            }
            ReviewDecision::Reject => {
                let settled = self
                    .transition_with_retry(id, MemoryStatus::Deleted, actor, "human review: rejected")
                    .await?;
                self.index.remove(id).await;
                info!(id = %id, editor = editor_id, "human review rejected");
                Ok(settled)
            }
        }
    }

    /// Soft-delete from any state.  The record is retained with status
    /// `deleted`, removed from retrieval, and its id is never reused.
    pub async fn delete(
        &self,
        id: Uuid,
        actor: Actor,
        reason: &str,
    ) -> Result<MemoryRecord, MemoryError> {
        let current = self.store.get(id).await?;
        if current.status == MemoryStatus::Deleted {
            return Ok(current);
        }
        let was_canon = current.status == MemoryStatus::Canon;

        let settled = self
            .transition_with_retry(id, MemoryStatus::Deleted, actor, reason)
            .await?;
        self.index.remove(id).await;
        if was_canon {
            self.cache.invalidate_kind(settled.kind());
        }
        Ok(settled)
    }

    /// Re-read and re-apply the same target status until it lands or is
    /// already applied.  An idempotent retry of the transition, never a
    /// re-decision.
    async fn transition_with_retry(
        &self,
        id: Uuid,
        target: MemoryStatus,
        actor: Actor,
        reason: &str,
    ) -> Result<MemoryRecord, MemoryError> {
        loop {
            let current = self.store.get(id).await?;
            if current.status == target {
                return Ok(current);
            }
            match self
                .store
                .transition(id, current.version, target, actor.clone(), reason)
                .await
            {
                Ok(record) => return Ok(record),
                Err(MemoryError::Conflict { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
    }

    async fn amend_with_retry<F>(&self, id: Uuid, mutate: F) -> Result<MemoryRecord, MemoryError>
    where
        F: Fn(&mut MemoryRecord) + Clone,
    {
        loop {
            let current = self.store.get(id).await?;
            match self.store.amend(id, current.version, mutate.clone()).await {
                Ok(record) => return Ok(record),
                Err(MemoryError::Conflict { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use jane_config::ValidatorConfig;
    use jane_llm::Generate;

    use super::*;
    use crate::schema::{ClientMemory, JaneMemory};

    /// Judge that always replies with the given verdict line after a fixed
    /// delay, tracking how many calls overlap in time.
    struct ConcurrencyProbeJudge {
        reply: String,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ConcurrencyProbeJudge {
        fn new(reply: &str, delay: Duration) -> Self {
            Self {
                reply: reply.to_string(),
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn max_overlap(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generate for ConcurrencyProbeJudge {
        async fn generate(&self, _prompt: &str, _context: &str) -> anyhow::Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    struct FixedJudge(String);

    #[async_trait]
    impl Generate for FixedJudge {
        async fn generate(&self, _prompt: &str, _context: &str) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    fn embed_fixed(vector: Vec<f32>) -> EmbedFn {
        Arc::new(move |_text| {
            let vector = vector.clone();
            Box::pin(async move { Some(vector) })
        })
    }

    fn jane_draft(topic: &str, content: &str) -> MemoryDraft {
        MemoryDraft::generated(
            "llama3.1:8b",
            MemoryBody::Jane(JaneMemory {
                topic: topic.to_string(),
                related_topics: BTreeSet::new(),
                contradicts: BTreeSet::new(),
                supports: BTreeSet::new(),
                content: content.to_string(),
                detailed_content: serde_json::Value::Null,
            }),
        )
    }

    fn client_draft(client_id: &str, content: &str) -> MemoryDraft {
        MemoryDraft::generated(
            "llama3.1:8b",
            MemoryBody::Client(ClientMemory {
                client_id: client_id.to_string(),
                disclosure_type: "personal_history".to_string(),
                sensitivity_level: 2,
                topics: BTreeSet::new(),
                content: content.to_string(),
                disclosed_at: Utc::now(),
                session_number: 1,
            }),
        )
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        index: Arc<SimilarityIndex>,
        cache: Arc<HotContextCache<ContextBundle>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::in_memory()),
                index: Arc::new(SimilarityIndex::new()),
                cache: Arc::new(HotContextCache::new(16)),
            }
        }

        fn pipeline(&self, judge: Arc<dyn Generate>) -> QuarantinePipeline {
            let mut cfg = ValidatorConfig::default();
            cfg.judgment_timeout_ms = 1_000;
            cfg.max_retries = 0;
            cfg.retry_backoff_ms = 1;
            let validator = Arc::new(ConsistencyValidator::new(
                Arc::clone(&self.store),
                Arc::clone(&self.index),
                judge,
                cfg,
            ));
            QuarantinePipeline::new(
                Arc::clone(&self.store),
                Arc::clone(&self.index),
                validator,
                Arc::clone(&self.cache),
                embed_fixed(vec![1.0, 0.0]),
            )
        }

        async fn seed_canon_jane(&self, topic: &str, content: &str) -> Uuid {
            let record = self
                .store
                .put(MemoryDraft::foundation(
                    "editor-7",
                    MemoryBody::Jane(JaneMemory {
                        topic: topic.to_string(),
                        related_topics: BTreeSet::new(),
                        contradicts: BTreeSet::new(),
                        supports: BTreeSet::new(),
                        content: content.to_string(),
                        detailed_content: serde_json::Value::Null,
                    }),
                ))
                .await
                .unwrap();
            self.index.index(&record, vec![1.0, 0.0]).await;
            record.id
        }
    }

    // ── Happy paths ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn consistent_draft_reaches_canon() {
        let fixture = Fixture::new();
        fixture.seed_canon_jane("gardening", "tends roses").await;
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("VERDICT 1: SUPPORTS".to_string())));

        let outcome = pipeline
            .submit(jane_draft("gardening", "prunes the roses in spring"))
            .await
            .unwrap();
        assert_eq!(outcome.status, MemoryStatus::Canon);
        assert!(outcome.verdict.as_ref().unwrap().is_consistent());

        // Audit trail: draft, quarantined, canon.
        let trail = fixture.store.audit().entries_for(outcome.memory_id).await;
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[2].to_status, MemoryStatus::Canon);
        assert_eq!(trail[2].reason, "validator: consistent");
    }

    #[tokio::test]
    async fn inconsistent_draft_lands_in_human_review_with_conflict_reason() {
        let fixture = Fixture::new();
        let texas_id = fixture.seed_canon_jane("childhood", "grew up in Texas").await;
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("VERDICT 1: CONTRADICTS".to_string())));

        let outcome = pipeline
            .submit(jane_draft("childhood", "grew up in Ohio"))
            .await
            .unwrap();
        assert_eq!(outcome.status, MemoryStatus::HumanReview);
        assert_eq!(
            outcome.verdict,
            Some(Verdict::Inconsistent {
                conflicts: vec![texas_id]
            })
        );

        let trail = fixture.store.audit().entries_for(outcome.memory_id).await;
        assert!(trail[2].reason.contains(&texas_id.to_string()));

        // The record carries the contradicts link even while pending review.
        let record = fixture.store.get(outcome.memory_id).await.unwrap();
        assert!(record.body.as_jane().unwrap().contradicts.contains(&texas_id));
    }

    #[tokio::test]
    async fn first_draft_on_new_topic_is_trivially_consistent() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("unused".to_string())));

        let outcome = pipeline
            .submit(jane_draft("astronomy", "stargazes in winter"))
            .await
            .unwrap();
        assert_eq!(outcome.status, MemoryStatus::Canon);
    }

    #[tokio::test]
    async fn client_draft_takes_simplified_path() {
        let fixture = Fixture::new();
        // A canon Jane memory on a matching vector must not be consulted for
        // client drafts.
        fixture.seed_canon_jane("childhood", "grew up in Texas").await;
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("unused".to_string())));

        let outcome = pipeline
            .submit(client_draft("c1", "started a new job last month"))
            .await
            .unwrap();
        assert_eq!(outcome.status, MemoryStatus::Canon);
    }

    #[tokio::test]
    async fn canon_memory_becomes_retrievable_via_index() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("unused".to_string())));

        let outcome = pipeline
            .submit(jane_draft("astronomy", "stargazes in winter"))
            .await
            .unwrap();
        let hits = fixture
            .index
            .query(crate::index::Scope::Jane, &[1.0, 0.0], 10)
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, outcome.memory_id);
    }

    #[tokio::test]
    async fn quarantined_draft_is_never_retrievable() {
        let fixture = Fixture::new();
        fixture.seed_canon_jane("childhood", "grew up in Texas").await;
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("VERDICT 1: CONTRADICTS".to_string())));

        pipeline
            .submit(jane_draft("childhood", "grew up in Ohio"))
            .await
            .unwrap();

        // Only the canon Texas memory is visible.
        let hits = fixture
            .index
            .query(crate::index::Scope::Jane, &[1.0, 0.0], 10)
            .await;
        assert_eq!(hits.len(), 1);
    }

    // ── Idempotence ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn resubmitting_canon_draft_is_a_no_op() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("unused".to_string())));

        let outcome = pipeline
            .submit(jane_draft("astronomy", "stargazes in winter"))
            .await
            .unwrap();
        let audit_before = fixture.store.audit().len().await;

        let again = pipeline.resubmit(outcome.memory_id).await.unwrap();
        assert_eq!(again.status, MemoryStatus::Canon);
        assert!(again.verdict.is_none());
        assert_eq!(fixture.store.audit().len().await, audit_before);
    }

    // ── Human review ───────────────────────────────────────────────────────

    async fn draft_in_review(fixture: &Fixture, pipeline: &QuarantinePipeline) -> Uuid {
        fixture.seed_canon_jane("childhood", "grew up in Texas").await;
        pipeline
            .submit(jane_draft("childhood", "grew up in Ohio"))
            .await
            .unwrap()
            .memory_id
    }

    #[tokio::test]
    async fn approve_promotes_to_canon_without_reattribution() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("VERDICT 1: CONTRADICTS".to_string())));
        let id = draft_in_review(&fixture, &pipeline).await;

        let settled = pipeline
            .resolve_human_review(id, ReviewDecision::Approve { edited_content: None }, "editor-7")
            .await
            .unwrap();
        assert_eq!(settled.status, MemoryStatus::Canon);
        // No edits were made, so authorship stays with the model.
        assert!(matches!(settled.generated_by, GeneratedBy::LanguageModel { .. }));
    }

    #[tokio::test]
    async fn approve_with_edits_reattributes_to_editor() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("VERDICT 1: CONTRADICTS".to_string())));
        let id = draft_in_review(&fixture, &pipeline).await;

        let settled = pipeline
            .resolve_human_review(
                id,
                ReviewDecision::Approve {
                    edited_content: Some("lived in Ohio until age six, then Texas".to_string()),
                },
                "editor-7",
            )
            .await
            .unwrap();
        assert_eq!(settled.status, MemoryStatus::Canon);
        assert_eq!(settled.body.content(), "lived in Ohio until age six, then Texas");
        assert_eq!(
            settled.generated_by,
            GeneratedBy::Human {
                editor_id: "editor-7".to_string()
            }
        );
    }

    #[tokio::test]
    async fn reject_soft_deletes() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("VERDICT 1: CONTRADICTS".to_string())));
        let id = draft_in_review(&fixture, &pipeline).await;

        let settled = pipeline
            .resolve_human_review(id, ReviewDecision::Reject, "editor-7")
            .await
            .unwrap();
        assert_eq!(settled.status, MemoryStatus::Deleted);
        // Record retained for audit, invisible to retrieval.
        assert!(fixture.store.get(id).await.is_ok());
    }

    #[tokio::test]
    async fn resolve_requires_human_review_status() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("unused".to_string())));
        let outcome = pipeline
            .submit(jane_draft("astronomy", "stargazes in winter"))
            .await
            .unwrap();

        let err = pipeline
            .resolve_human_review(
                outcome.memory_id,
                ReviewDecision::Approve { edited_content: None },
                "editor-7",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidTransition { .. }));
    }

    // ── Delete ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn delete_removes_from_index_and_is_idempotent() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("unused".to_string())));
        let outcome = pipeline
            .submit(jane_draft("astronomy", "stargazes in winter"))
            .await
            .unwrap();

        pipeline
            .delete(outcome.memory_id, Actor::System, "retracted")
            .await
            .unwrap();
        assert!(fixture.index.is_empty().await);

        // Deleting again is a no-op, not an error.
        let again = pipeline
            .delete(outcome.memory_id, Actor::System, "retracted")
            .await
            .unwrap();
        assert_eq!(again.status, MemoryStatus::Deleted);
    }

    #[tokio::test]
    async fn deleting_cited_memory_leaves_citer_intact() {
        let fixture = Fixture::new();
        let texas_id = fixture.seed_canon_jane("childhood", "grew up in Texas").await;
        let pipeline = fixture.pipeline(Arc::new(FixedJudge("VERDICT 1: CONTRADICTS".to_string())));
        let citer_id = pipeline
            .submit(jane_draft("childhood", "grew up in Ohio"))
            .await
            .unwrap()
            .memory_id;

        pipeline.delete(texas_id, Actor::System, "retracted").await.unwrap();

        // The citer still holds the now-dangling reference; no cascade.
        let citer = fixture.store.get(citer_id).await.unwrap();
        assert!(citer.body.as_jane().unwrap().contradicts.contains(&texas_id));
        assert_eq!(citer.status, MemoryStatus::HumanReview);
    }

    // ── Topic gate ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn same_topic_jane_submissions_are_serialized() {
        let fixture = Fixture::new();
        fixture.seed_canon_jane("sleep", "sleeps eight hours").await;
        let judge = Arc::new(ConcurrencyProbeJudge::new(
            "VERDICT 1: SUPPORTS",
            Duration::from_millis(60),
        ));
        let pipeline = Arc::new(fixture.pipeline(Arc::clone(&judge) as Arc<dyn Generate>));

        let a = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline.submit(jane_draft("sleep", "keeps a strict bedtime")).await
            })
        };
        let b = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline.submit(jane_draft("sleep", "wakes before sunrise")).await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(judge.max_overlap(), 1, "same-topic validations must not overlap");
    }

    #[tokio::test]
    async fn different_topic_jane_submissions_run_in_parallel() {
        let fixture = Fixture::new();
        fixture.seed_canon_jane("sleep", "sleeps eight hours").await;
        fixture.seed_canon_jane("diet", "cooks vegetarian meals").await;
        let judge = Arc::new(ConcurrencyProbeJudge::new(
            "VERDICT 1: SUPPORTS",
            Duration::from_millis(60),
        ));
        let pipeline = Arc::new(fixture.pipeline(Arc::clone(&judge) as Arc<dyn Generate>));

        let a = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline.submit(jane_draft("sleep", "keeps a strict bedtime")).await
            })
        };
        let b = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline.submit(jane_draft("diet", "bakes her own bread")).await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(judge.max_overlap(), 2, "distinct topics must validate concurrently");
    }
}
