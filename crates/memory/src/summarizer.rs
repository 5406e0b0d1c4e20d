//! End-of-session condensation into ClientMemory drafts.
//!
//! The drafting model turns the transcript and discussed topics into
//! disclosure lines, each of which becomes one ClientMemory draft submitted
//! through the quarantine pipeline's client path.  The session record gains
//! the summary and references to the resulting memories; it owns none of
//! them.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use jane_config::SummarizerConfig;
use jane_llm::Generate;
use serde_json::json;
use tracing::{info, warn};

use crate::quarantine::{QuarantinePipeline, SubmissionOutcome};
use crate::schema::{ClientMemory, MemoryBody, MemoryDraft, Session, truncate_str};

pub struct SessionSummarizer {
    drafter: Arc<dyn Generate>,
    pipeline: Arc<QuarantinePipeline>,
    cfg: SummarizerConfig,
    /// Recorded as `generated_by.language_model` on every draft.
    model_name: String,
}

/// One disclosure parsed out of the drafting reply.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DisclosureDraft {
    pub disclosure_type: String,
    pub sensitivity_level: u8,
    pub topics: BTreeSet<String>,
    pub content: String,
}

impl SessionSummarizer {
    pub fn new(
        drafter: Arc<dyn Generate>,
        pipeline: Arc<QuarantinePipeline>,
        cfg: SummarizerConfig,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            drafter,
            pipeline,
            cfg,
            model_name: model_name.into(),
        }
    }

    /// Condense a finished session into ClientMemory drafts and run each
    /// through quarantine.  Appends the summary and memory references to the
    /// session record.
    pub async fn summarize_session(
        &self,
        session: &mut Session,
        session_number: u32,
        transcript: &str,
    ) -> Result<Vec<SubmissionOutcome>> {
        let prompt = drafting_prompt(
            session,
            truncate_str(transcript, self.cfg.transcript_char_budget),
        );
        let reply = self
            .drafter
            .generate(&prompt, "")
            .await
            .context("session drafting call failed")?;

        let mut disclosures = parse_disclosures(&reply);
        if disclosures.len() > self.cfg.max_drafts_per_session {
            warn!(
                parsed = disclosures.len(),
                kept = self.cfg.max_drafts_per_session,
                "drafting reply exceeded per-session budget — truncating"
            );
            disclosures.truncate(self.cfg.max_drafts_per_session);
        }

        let disclosed_at = Utc::now();
        let mut outcomes = Vec::with_capacity(disclosures.len());
        for disclosure in disclosures {
            let mut draft = MemoryDraft::generated(
                self.model_name.clone(),
                MemoryBody::Client(ClientMemory {
                    client_id: session.client_id.clone(),
                    disclosure_type: disclosure.disclosure_type,
                    sensitivity_level: disclosure.sensitivity_level,
                    topics: disclosure.topics,
                    content: disclosure.content,
                    disclosed_at,
                    session_number,
                }),
            );
            draft.needs_encryption =
                disclosure_needs_encryption(&draft, self.cfg.encrypt_at_sensitivity);

            let outcome = self.pipeline.submit(draft).await?;
            session.memory_refs.push(outcome.memory_id);
            outcomes.push(outcome);
        }

        session.summary = json!({
            "session_number": session_number,
            "topics_discussed": session.topics_discussed,
            "disclosures": outcomes.len(),
            "drafted_by": self.model_name,
        });

        info!(
            session_id = %session.id,
            client_id = %session.client_id,
            drafts = outcomes.len(),
            "session summarized"
        );
        Ok(outcomes)
    }
}

fn disclosure_needs_encryption(draft: &MemoryDraft, threshold: u8) -> bool {
    draft
        .body
        .as_client()
        .is_some_and(|c| c.sensitivity_level >= threshold)
}

fn drafting_prompt(session: &Session, transcript: &str) -> String {
    let topics = if session.topics_discussed.is_empty() {
        "(none recorded)".to_string()
    } else {
        session.topics_discussed.join(", ")
    };
    format!(
        "A client session has ended.  Extract the facts the client disclosed \
         about themselves, one per line, in exactly this format:\n\
         DISCLOSURE[type=<kind>, sensitivity=<1-5>, topics=<a|b|c>]: <one sentence>\n\
         Only include facts the client stated about their own life.\n\n\
         TOPICS DISCUSSED: {topics}\n\nTRANSCRIPT:\n{transcript}\n"
    )
}

/// Parse disclosure lines out of the drafting reply.  Tolerant: a bare
/// bullet line still yields a draft with conservative defaults, and prose
/// lines are ignored.
pub(crate) fn parse_disclosures(reply: &str) -> Vec<DisclosureDraft> {
    let mut drafts = Vec::new();
    for line in reply.lines() {
        let line = line.trim().trim_start_matches('-').trim_start_matches('*').trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("DISCLOSURE[") {
            let Some((attrs, content)) = rest.split_once("]:") else {
                continue;
            };
            let content = content.trim();
            if content.is_empty() {
                continue;
            }

            let mut disclosure_type = "general".to_string();
            let mut sensitivity = 2u8;
            let mut topics = BTreeSet::new();
            for attr in attrs.split(',') {
                let Some((key, value)) = attr.split_once('=') else {
                    continue;
                };
                match key.trim() {
                    "type" => disclosure_type = value.trim().to_string(),
                    "sensitivity" => {
                        if let Ok(level) = value.trim().parse::<u8>() {
                            sensitivity = level.clamp(1, 5);
                        }
                    }
                    "topics" => {
                        topics = value
                            .split('|')
                            .map(|t| t.trim().to_lowercase())
                            .filter(|t| !t.is_empty())
                            .collect();
                    }
                    _ => {}
                }
            }

            drafts.push(DisclosureDraft {
                disclosure_type,
                sensitivity_level: sensitivity,
                topics,
                content: content.to_string(),
            });
        }
    }

    if drafts.is_empty() {
        // Fallback: treat bullet-style lines as plain disclosures so a model
        // that ignored the format still produces usable drafts.
        for line in reply.lines() {
            let trimmed = line.trim();
            if let Some(content) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* "))
            {
                let content = content.trim();
                if !content.is_empty() {
                    drafts.push(DisclosureDraft {
                        disclosure_type: "general".to_string(),
                        sensitivity_level: 2,
                        topics: BTreeSet::new(),
                        content: content.to_string(),
                    });
                }
            }
        }
    }

    drafts
}
