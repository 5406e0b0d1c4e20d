//! Consistency validation of draft memories against canon.
//!
//! The validator selects plausibly-related canon memories (exact topic match
//! plus vector neighbours), asks the judgment model to classify agreement per
//! related memory, and fails safe: a judgment call that errors, times out, or
//! returns nothing parseable is retried a bounded number of times and then
//! forced to Inconsistent — unverifiable claims never silently enter canon.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use jane_config::ValidatorConfig;
use jane_llm::Generate;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::MemoryError;
use crate::index::{Scope, SimilarityIndex};
use crate::schema::{MemoryBody, MemoryKind, MemoryRecord, MemoryStatus};
use crate::store::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Consistent { supports: Vec<Uuid> },
    Inconsistent { conflicts: Vec<Uuid> },
}

impl Verdict {
    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent { .. })
    }
}

pub struct ConsistencyValidator {
    store: Arc<MemoryStore>,
    index: Arc<SimilarityIndex>,
    judge: Arc<dyn Generate>,
    cfg: ValidatorConfig,
}

impl ConsistencyValidator {
    pub fn new(
        store: Arc<MemoryStore>,
        index: Arc<SimilarityIndex>,
        judge: Arc<dyn Generate>,
        cfg: ValidatorConfig,
    ) -> Self {
        Self {
            store,
            index,
            judge,
            cfg,
        }
    }

    /// Validate a Jane draft against canon Jane memories and record the
    /// discovered supports/contradicts links on the draft.
    pub async fn validate_jane(
        &self,
        draft: &MemoryRecord,
        embedding: Option<&[f32]>,
    ) -> Result<Verdict, MemoryError> {
        let candidates = self.related_canon_jane(draft, embedding).await;
        if candidates.is_empty() {
            debug!(id = %draft.id, "no related canon memories — trivially consistent");
            return Ok(Verdict::Consistent { supports: vec![] });
        }

        let verdict = self.judge_against(draft, &candidates).await;
        self.record_links(draft.id, &verdict).await?;

        match &verdict {
            Verdict::Consistent { supports } => {
                info!(id = %draft.id, supports = supports.len(), "draft judged consistent")
            }
            Verdict::Inconsistent { conflicts } => {
                info!(id = %draft.id, conflicts = conflicts.len(), "draft judged inconsistent")
            }
        }
        Ok(verdict)
    }

    /// Simplified pass for client disclosures: only direct self-contradiction
    /// against the same client's prior canon disclosures.  Client memories
    /// carry no link sets, so nothing is recorded.
    pub async fn validate_client(&self, draft: &MemoryRecord) -> Verdict {
        let Some(client) = draft.body.as_client() else {
            return Verdict::Consistent { supports: vec![] };
        };

        let mut candidates: Vec<MemoryRecord> = self
            .store
            .list_by_kind_and_status(MemoryKind::Client, MemoryStatus::Canon)
            .await
            .into_iter()
            .filter(|r| {
                r.body
                    .as_client()
                    .is_some_and(|c| c.client_id == client.client_id)
            })
            .collect();
        candidates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        candidates.truncate(self.cfg.related_top_n);

        if candidates.is_empty() {
            return Verdict::Consistent { supports: vec![] };
        }
        self.judge_against(draft, &candidates).await
    }

    /// Exact-topic canon matches plus top-n vector neighbours, draft excluded.
    async fn related_canon_jane(
        &self,
        draft: &MemoryRecord,
        embedding: Option<&[f32]>,
    ) -> Vec<MemoryRecord> {
        let canon = self
            .store
            .list_by_kind_and_status(MemoryKind::Jane, MemoryStatus::Canon)
            .await;

        let draft_jane = draft.body.as_jane();
        let mut selected: Vec<MemoryRecord> = Vec::new();
        let mut seen: BTreeSet<Uuid> = BTreeSet::new();

        if let Some(draft_jane) = draft_jane {
            for record in &canon {
                let Some(jane) = record.body.as_jane() else {
                    continue;
                };
                let topical = jane.topic == draft_jane.topic
                    || jane.related_topics.contains(&draft_jane.topic)
                    || draft_jane.related_topics.contains(&jane.topic);
                if topical && record.id != draft.id && seen.insert(record.id) {
                    selected.push(record.clone());
                }
            }
        }

        if let Some(vector) = embedding {
            let neighbours = self
                .index
                .query(Scope::Jane, vector, self.cfg.related_top_n)
                .await;
            for (id, _) in neighbours {
                if id == draft.id || !seen.insert(id) {
                    continue;
                }
                if let Ok(record) = self.store.get(id).await {
                    selected.push(record);
                }
            }
        }

        // Topical matches always come first; keep the judgment prompt bounded
        // even when a topic has accumulated many canon facts.
        selected.truncate(self.cfg.related_top_n.max(16));
        selected
    }

    /// Run the judgment call with bounded retries and backoff.  Every failure
    /// mode collapses to Inconsistent with no named conflicts.
    async fn judge_against(&self, draft: &MemoryRecord, candidates: &[MemoryRecord]) -> Verdict {
        let prompt = judgment_prompt(draft.body.content(), candidates);
        let candidate_ids: Vec<Uuid> = candidates.iter().map(|c| c.id).collect();
        let timeout = Duration::from_millis(self.cfg.judgment_timeout_ms);

        for attempt in 0..=self.cfg.max_retries {
            if attempt > 0 {
                let backoff = self.cfg.retry_backoff_ms << (attempt - 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            match tokio::time::timeout(timeout, self.judge.generate(&prompt, "")).await {
                Ok(Ok(reply)) => {
                    if let Some(verdict) = parse_judgment(&reply, &candidate_ids) {
                        return verdict;
                    }
                    warn!(id = %draft.id, attempt, "judgment reply unparseable");
                }
                Ok(Err(err)) => {
                    warn!(id = %draft.id, attempt, %err, "judgment call failed");
                }
                Err(_) => {
                    warn!(id = %draft.id, attempt, "judgment call timed out");
                }
            }
        }

        // Fail-safe: unverifiable claims never silently enter canon.
        warn!(id = %draft.id, "judgment exhausted retries — forcing inconsistent");
        Verdict::Inconsistent { conflicts: vec![] }
    }

    /// Persist the verdict's links on the draft.  Recorded regardless of the
    /// draft's final status so the relationship survives human review.
    async fn record_links(&self, draft_id: Uuid, verdict: &Verdict) -> Result<(), MemoryError> {
        let (supports, conflicts) = match verdict {
            Verdict::Consistent { supports } => (supports.clone(), Vec::new()),
            Verdict::Inconsistent { conflicts } => (Vec::new(), conflicts.clone()),
        };
        if supports.is_empty() && conflicts.is_empty() {
            return Ok(());
        }

        // Link recording is an amendment; a concurrent bump just means
        // re-reading and re-applying.
        loop {
            let current = self.store.get(draft_id).await?;
            let result = self
                .store
                .amend(draft_id, current.version, |record| {
                    if let MemoryBody::Jane(jane) = &mut record.body {
                        jane.supports.extend(supports.iter().copied());
                        jane.contradicts.extend(conflicts.iter().copied());
                    }
                })
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(MemoryError::Conflict { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
    }
}

fn judgment_prompt(draft_content: &str, candidates: &[MemoryRecord]) -> String {
    let mut prompt = String::from(
        "Audit the persona's memory for internal consistency.\n\nCANDIDATE FACT:\n",
    );
    prompt.push_str(draft_content);
    prompt.push_str("\n\nESTABLISHED MEMORIES:\n");
    for (i, candidate) in candidates.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, candidate.body.content()));
    }
    prompt.push_str(
        "\nFor each established memory, answer with exactly one line:\n\
         VERDICT <number>: SUPPORTS or CONTRADICTS or UNRELATED\n\
         A memory SUPPORTS the candidate only if it corroborates it; it \
         CONTRADICTS if both cannot be true of the same person.\n",
    );
    prompt
}

/// Parse the judgment reply.  Tolerant of prose around the verdict lines;
/// returns `None` when not a single verdict can be extracted, which counts as
/// a failed attempt.
fn parse_judgment(reply: &str, candidate_ids: &[Uuid]) -> Option<Verdict> {
    let mut supports = Vec::new();
    let mut conflicts = Vec::new();
    let mut parsed_any = false;

    for line in reply.lines() {
        let upper = line.to_ascii_uppercase();
        if !upper.contains("VERDICT") {
            continue;
        }
        let number: Option<usize> = upper
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok();
        let Some(number) = number else { continue };
        let Some(id) = number.checked_sub(1).and_then(|i| candidate_ids.get(i)) else {
            continue;
        };

        if upper.contains("CONTRADICT") {
            conflicts.push(*id);
            parsed_any = true;
        } else if upper.contains("SUPPORT") {
            supports.push(*id);
            parsed_any = true;
        } else if upper.contains("UNRELATED") {
            parsed_any = true;
        }
    }

    if !parsed_any {
        return None;
    }
    // A single contradiction makes the whole verdict Inconsistent.
    if conflicts.is_empty() {
        Some(Verdict::Consistent { supports })
    } else {
        Some(Verdict::Inconsistent { conflicts })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::schema::{Actor, ClientMemory, JaneMemory, MemoryDraft};

    /// Judgment double that replays scripted outcomes in order, then repeats
    /// the last one.
    struct ScriptedJudge {
        replies: Vec<Result<String, String>>,
        calls: AtomicUsize,
    }

    impl ScriptedJudge {
        fn new(replies: Vec<Result<String, String>>) -> Self {
            Self {
                replies,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generate for ScriptedJudge {
        async fn generate(&self, _prompt: &str, _context: &str) -> anyhow::Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .get(call)
                .or_else(|| self.replies.last())
                .cloned()
                .unwrap_or_else(|| Err("no scripted reply".to_string()));
            match reply {
                Ok(text) => Ok(text),
                Err(msg) => bail!(msg),
            }
        }
    }

    /// Judgment double that never answers within any reasonable deadline.
    struct StalledJudge;

    #[async_trait]
    impl Generate for StalledJudge {
        async fn generate(&self, _prompt: &str, _context: &str) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn jane_body(topic: &str, content: &str) -> MemoryBody {
        MemoryBody::Jane(JaneMemory {
            topic: topic.to_string(),
            related_topics: BTreeSet::new(),
            contradicts: BTreeSet::new(),
            supports: BTreeSet::new(),
            content: content.to_string(),
            detailed_content: serde_json::Value::Null,
        })
    }

    fn fast_cfg() -> ValidatorConfig {
        let mut cfg = ValidatorConfig::default();
        cfg.judgment_timeout_ms = 50;
        cfg.max_retries = 1;
        cfg.retry_backoff_ms = 1;
        cfg
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        index: Arc<SimilarityIndex>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::in_memory()),
                index: Arc::new(SimilarityIndex::new()),
            }
        }

        fn validator(&self, judge: Arc<dyn Generate>, cfg: ValidatorConfig) -> ConsistencyValidator {
            ConsistencyValidator::new(Arc::clone(&self.store), Arc::clone(&self.index), judge, cfg)
        }

        async fn canon_jane(&self, topic: &str, content: &str) -> Uuid {
            self.store
                .put(MemoryDraft::foundation("editor-7", jane_body(topic, content)))
                .await
                .unwrap()
                .id
        }

        async fn quarantined_jane(&self, topic: &str, content: &str) -> MemoryRecord {
            let record = self
                .store
                .put(MemoryDraft::generated("llama3.1:8b", jane_body(topic, content)))
                .await
                .unwrap();
            self.store
                .transition(record.id, 1, MemoryStatus::Quarantined, Actor::System, "submitted")
                .await
                .unwrap()
        }
    }

    // ── Judgment parsing ───────────────────────────────────────────────────

    #[test]
    fn parse_extracts_verdict_lines() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let reply = "Looking at each memory:\n\
                     VERDICT 1: SUPPORTS\n\
                     VERDICT 2: UNRELATED\n\
                     verdict 3: contradicts\n";
        let verdict = parse_judgment(reply, &ids).unwrap();
        assert_eq!(verdict, Verdict::Inconsistent { conflicts: vec![ids[2]] });
    }

    #[test]
    fn parse_all_supporting_is_consistent() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let reply = "VERDICT 1: SUPPORTS\nVERDICT 2: UNRELATED\n";
        let verdict = parse_judgment(reply, &ids).unwrap();
        assert_eq!(verdict, Verdict::Consistent { supports: vec![ids[0]] });
    }

    #[test]
    fn parse_ignores_out_of_range_numbers() {
        let ids = vec![Uuid::new_v4()];
        let reply = "VERDICT 1: SUPPORTS\nVERDICT 7: CONTRADICTS\nVERDICT 0: CONTRADICTS\n";
        let verdict = parse_judgment(reply, &ids).unwrap();
        assert!(verdict.is_consistent());
    }

    #[test]
    fn parse_pure_prose_is_none() {
        let ids = vec![Uuid::new_v4()];
        assert!(parse_judgment("these seem fine to me", &ids).is_none());
    }

    // ── Jane validation ────────────────────────────────────────────────────

    #[tokio::test]
    async fn contradiction_on_same_topic_is_inconsistent() {
        // Canon says Texas; the draft says Ohio.  The validator must surface
        // the Texas memory as the conflict.
        let fixture = Fixture::new();
        let texas_id = fixture.canon_jane("childhood", "grew up in Texas").await;
        let draft = fixture.quarantined_jane("childhood", "grew up in Ohio").await;

        let judge = Arc::new(ScriptedJudge::new(vec![Ok(
            "VERDICT 1: CONTRADICTS".to_string()
        )]));
        let validator = fixture.validator(judge, fast_cfg());

        let verdict = validator.validate_jane(&draft, None).await.unwrap();
        assert_eq!(verdict, Verdict::Inconsistent { conflicts: vec![texas_id] });

        // The contradicts link is recorded on the draft immediately.
        let amended = fixture.store.get(draft.id).await.unwrap();
        let jane = amended.body.as_jane().unwrap();
        assert!(jane.contradicts.contains(&texas_id));
    }

    #[tokio::test]
    async fn corroboration_records_supports_links() {
        let fixture = Fixture::new();
        let canon_id = fixture
            .canon_jane("gardening", "tends a rose garden every weekend")
            .await;
        let draft = fixture
            .quarantined_jane("gardening", "spends weekends among the roses")
            .await;

        let judge = Arc::new(ScriptedJudge::new(vec![Ok("VERDICT 1: SUPPORTS".to_string())]));
        let validator = fixture.validator(judge, fast_cfg());

        let verdict = validator.validate_jane(&draft, None).await.unwrap();
        assert_eq!(verdict, Verdict::Consistent { supports: vec![canon_id] });

        let amended = fixture.store.get(draft.id).await.unwrap();
        assert!(amended.body.as_jane().unwrap().supports.contains(&canon_id));
    }

    #[tokio::test]
    async fn no_related_canon_is_trivially_consistent() {
        let fixture = Fixture::new();
        let draft = fixture.quarantined_jane("astronomy", "stargazes in winter").await;

        // The judge must never be consulted.
        let judge = Arc::new(ScriptedJudge::new(vec![Err("must not be called".to_string())]));
        let validator = fixture.validator(Arc::clone(&judge) as Arc<dyn Generate>, fast_cfg());

        let verdict = validator.validate_jane(&draft, None).await.unwrap();
        assert!(verdict.is_consistent());
        assert_eq!(judge.call_count(), 0);
    }

    #[tokio::test]
    async fn judgment_failure_is_forced_inconsistent_after_retries() {
        let fixture = Fixture::new();
        fixture.canon_jane("childhood", "grew up in Texas").await;
        let draft = fixture.quarantined_jane("childhood", "grew up in Ohio").await;

        let judge = Arc::new(ScriptedJudge::new(vec![Err("service down".to_string())]));
        let validator = fixture.validator(Arc::clone(&judge) as Arc<dyn Generate>, fast_cfg());

        let verdict = validator.validate_jane(&draft, None).await.unwrap();
        assert_eq!(verdict, Verdict::Inconsistent { conflicts: vec![] });
        // First attempt plus one retry.
        assert_eq!(judge.call_count(), 2);
    }

    #[tokio::test]
    async fn judgment_timeout_is_forced_inconsistent() {
        let fixture = Fixture::new();
        fixture.canon_jane("childhood", "grew up in Texas").await;
        let draft = fixture.quarantined_jane("childhood", "grew up in Ohio").await;

        let mut cfg = fast_cfg();
        cfg.max_retries = 0;
        let validator = fixture.validator(Arc::new(StalledJudge), cfg);

        let verdict = validator.validate_jane(&draft, None).await.unwrap();
        assert_eq!(verdict, Verdict::Inconsistent { conflicts: vec![] });
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let fixture = Fixture::new();
        let canon_id = fixture.canon_jane("childhood", "grew up in Texas").await;
        let draft = fixture
            .quarantined_jane("childhood", "spent summers on the family ranch")
            .await;

        let judge = Arc::new(ScriptedJudge::new(vec![
            Err("blip".to_string()),
            Ok("VERDICT 1: SUPPORTS".to_string()),
        ]));
        let validator = fixture.validator(Arc::clone(&judge) as Arc<dyn Generate>, fast_cfg());

        let verdict = validator.validate_jane(&draft, None).await.unwrap();
        assert_eq!(verdict, Verdict::Consistent { supports: vec![canon_id] });
        assert_eq!(judge.call_count(), 2);
    }

    #[tokio::test]
    async fn vector_neighbours_join_the_candidate_set() {
        let fixture = Fixture::new();
        // Different topic, so only the vector path can find it.
        let related_id = fixture
            .canon_jane("hometown", "has lived in Texas all her life")
            .await;
        let related = fixture.store.get(related_id).await.unwrap();
        fixture.index.index(&related, vec![1.0, 0.0]).await;

        let draft = fixture.quarantined_jane("childhood", "grew up in Ohio").await;

        let judge = Arc::new(ScriptedJudge::new(vec![Ok(
            "VERDICT 1: CONTRADICTS".to_string()
        )]));
        let validator = fixture.validator(judge, fast_cfg());

        let verdict = validator
            .validate_jane(&draft, Some(&[0.9, 0.1]))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Inconsistent { conflicts: vec![related_id] });
    }

    // ── Client validation ──────────────────────────────────────────────────

    fn client_body(client_id: &str, content: &str) -> MemoryBody {
        MemoryBody::Client(ClientMemory {
            client_id: client_id.to_string(),
            disclosure_type: "personal_history".to_string(),
            sensitivity_level: 2,
            topics: BTreeSet::new(),
            content: content.to_string(),
            disclosed_at: Utc::now(),
            session_number: 1,
        })
    }

    #[tokio::test]
    async fn client_pass_checks_own_disclosures_only() {
        let fixture = Fixture::new();
        // Another client's disclosure must not enter the candidate set.
        fixture
            .store
            .put(MemoryDraft::foundation("editor-7", client_body("c2", "is an only child")))
            .await
            .unwrap();

        let draft = fixture
            .store
            .put(MemoryDraft::generated("llama3.1:8b", client_body("c1", "has two brothers")))
            .await
            .unwrap();

        let judge = Arc::new(ScriptedJudge::new(vec![Err("must not be called".to_string())]));
        let validator = fixture.validator(Arc::clone(&judge) as Arc<dyn Generate>, fast_cfg());

        let verdict = validator.validate_client(&draft).await;
        assert!(verdict.is_consistent());
        assert_eq!(judge.call_count(), 0);
    }

    #[tokio::test]
    async fn client_self_contradiction_is_inconsistent() {
        let fixture = Fixture::new();
        let prior = fixture
            .store
            .put(MemoryDraft::foundation("editor-7", client_body("c1", "is an only child")))
            .await
            .unwrap();

        let draft = fixture
            .store
            .put(MemoryDraft::generated("llama3.1:8b", client_body("c1", "has two brothers")))
            .await
            .unwrap();

        let judge = Arc::new(ScriptedJudge::new(vec![Ok(
            "VERDICT 1: CONTRADICTS".to_string()
        )]));
        let validator = fixture.validator(judge, fast_cfg());

        let verdict = validator.validate_client(&draft).await;
        assert_eq!(verdict, Verdict::Inconsistent { conflicts: vec![prior.id] });
    }
}
