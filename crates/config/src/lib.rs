use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Retrieval config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Deadline in milliseconds for the Jane-memory sub-query.
    pub jane_deadline_ms: u64,
    /// Deadline in milliseconds for the client-history sub-query.
    pub client_deadline_ms: u64,
    /// Deadline in milliseconds for the knowledge-base sub-query.
    pub knowledge_deadline_ms: u64,
    /// Nearest-neighbour count requested from each similarity sub-query.
    pub top_k: usize,
    /// Maximum items in the merged context bundle.
    pub bundle_limit: usize,
    /// Token-overlap ratio above which two items are treated as
    /// near-duplicates and collapsed to the higher-scoring one.
    pub dedup_threshold: f32,
    /// Number of (query fingerprint → bundle) pairs held in the hot-context
    /// cache.
    pub cache_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            jane_deadline_ms: 250,
            client_deadline_ms: 250,
            knowledge_deadline_ms: 250,
            top_k: 8,
            bundle_limit: 12,
            dedup_threshold: 0.8,
            cache_capacity: 128,
        }
    }
}

// ── Validator config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// How many plausibly-related canon memories are shown to the judgment
    /// model alongside a draft.
    pub related_top_n: usize,
    /// Deadline in milliseconds for one judgment call.
    pub judgment_timeout_ms: u64,
    /// Retries after a failed or timed-out judgment call before the verdict
    /// is forced to Inconsistent.
    pub max_retries: u32,
    /// Base backoff in milliseconds between judgment retries (doubles per
    /// attempt).
    pub retry_backoff_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            related_top_n: 5,
            judgment_timeout_ms: 8_000,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

// ── Summarizer config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Maximum ClientMemory drafts produced from one session.
    pub max_drafts_per_session: usize,
    /// Transcript character budget fed into the drafting prompt.
    pub transcript_char_budget: usize,
    /// Disclosures at or above this sensitivity level are flagged for
    /// encrypted storage.
    pub encrypt_at_sensitivity: u8,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_drafts_per_session: 6,
            transcript_char_budget: 8_000,
            encrypt_at_sensitivity: 4,
        }
    }
}

// ── Storage config ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the append-only audit log and the record journal.
    pub data_dir: String,
    /// Audit log filename inside `data_dir`.
    pub audit_log: String,
    /// Record journal filename inside `data_dir`.
    pub record_journal: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: ".jane/memory".to_string(),
            audit_log: "audit.jsonl".to_string(),
            record_journal: "records.jsonl".to_string(),
        }
    }
}

// ── LLM config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for the generate/embed API.  Overridden at runtime by the
    /// `JANE_LLM_BASE_URL` environment variable when set.
    pub base_url: String,
    /// Model used for consistency judgments and session drafting.
    pub model: String,
    /// Model used for embedding vectors.
    pub embed_model: String,
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub retrieval: RetrievalConfig,
    pub validator: ValidatorConfig,
    pub summarizer: SummarizerConfig,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub telemetry: TelemetryConfig,
}

impl EngineConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("JANE_LLM_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
