use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Memory kinds — a closed tag, not an inheritance hierarchy.
///
/// | Kind        | Purpose                                                  |
/// |-------------|----------------------------------------------------------|
/// | `Jane`      | Facts about the persona itself (biography, opinions)     |
/// | `Client`    | Facts a client disclosed about themselves                |
/// | `Knowledge` | Reference-material chunks from the knowledge base        |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    Jane,
    Client,
    Knowledge,
}

impl MemoryKind {
    /// Canonical display label used in prompts and log lines.
    pub fn label(self) -> &'static str {
        match self {
            Self::Jane => "Jane",
            Self::Client => "Client",
            Self::Knowledge => "Knowledge",
        }
    }

    /// Kebab-case slug used for file names, index keys, and log lines.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Jane => "jane",
            Self::Client => "client",
            Self::Knowledge => "knowledge",
        }
    }
}

/// Lifecycle status of a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Draft,
    Quarantined,
    Canon,
    HumanReview,
    Deleted,
}

impl MemoryStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Quarantined => "quarantined",
            Self::Canon => "canon",
            Self::HumanReview => "human_review",
            Self::Deleted => "deleted",
        }
    }

    /// Whether the state machine permits the `self → to` edge for `actor`.
    ///
    /// Edges: draft → quarantined; quarantined → canon | human_review;
    /// human_review → canon | deleted (human-only); any → deleted.
    /// `Deleted` is terminal and ids are never reused.
    pub fn can_transition(self, to: MemoryStatus, actor: &Actor) -> bool {
        if self == MemoryStatus::Deleted {
            return false;
        }
        match (self, to) {
            (_, MemoryStatus::Deleted) => {
                // Leaving human review, even to delete, is reserved for humans.
                self != MemoryStatus::HumanReview || matches!(actor, Actor::Human(_))
            }
            (MemoryStatus::Draft, MemoryStatus::Quarantined) => true,
            (MemoryStatus::Quarantined, MemoryStatus::Canon) => true,
            (MemoryStatus::Quarantined, MemoryStatus::HumanReview) => true,
            (MemoryStatus::HumanReview, MemoryStatus::Canon) => matches!(actor, Actor::Human(_)),
            _ => false,
        }
    }

    /// Terminal with respect to the quarantine pipeline: no further automated
    /// transition will be attempted.
    pub fn is_pipeline_terminal(self) -> bool {
        matches!(self, Self::Canon | Self::HumanReview | Self::Deleted)
    }
}

/// The agent that produced a memory's current content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedBy {
    LanguageModel { model: String },
    Human { editor_id: String },
}

/// The agent performing a status transition, recorded in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    Human(String),
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::System => write!(f, "system"),
            Actor::Human(id) => write!(f, "human:{id}"),
        }
    }
}

// ── Kind-specific payloads ────────────────────────────────────────────────────

/// A fact about the Jane persona.
///
/// `contradicts` / `supports` hold plain id references resolved through the
/// store at read time.  A deleted citee leaves the reference dangling; it
/// never cascades into the citer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JaneMemory {
    pub topic: String,
    #[serde(default)]
    pub related_topics: BTreeSet<String>,
    #[serde(default)]
    pub contradicts: BTreeSet<Uuid>,
    #[serde(default)]
    pub supports: BTreeSet<Uuid>,
    pub content: String,
    /// Structured elaboration of `content` (timeline entries, quotes, etc.).
    #[serde(default)]
    pub detailed_content: serde_json::Value,
}

/// A fact a client disclosed about themselves during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMemory {
    pub client_id: String,
    pub disclosure_type: String,
    /// 1 (incidental) through 5 (deeply sensitive).  Range-checked on put.
    pub sensitivity_level: u8,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    pub content: String,
    pub disclosed_at: DateTime<Utc>,
    pub session_number: u32,
}

/// A chunk of reference material from the knowledge base.  Immutable once
/// canon; created directly in canon status, skipping quarantine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    #[serde(default)]
    pub topics: BTreeSet<String>,
    pub content: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryBody {
    Jane(JaneMemory),
    Client(ClientMemory),
    Knowledge(KnowledgeChunk),
}

impl MemoryBody {
    pub fn kind(&self) -> MemoryKind {
        match self {
            Self::Jane(_) => MemoryKind::Jane,
            Self::Client(_) => MemoryKind::Client,
            Self::Knowledge(_) => MemoryKind::Knowledge,
        }
    }

    /// The free-text content used for retrieval display, deduplication, and
    /// judgment prompts.
    pub fn content(&self) -> &str {
        match self {
            Self::Jane(j) => &j.content,
            Self::Client(c) => &c.content,
            Self::Knowledge(k) => &k.content,
        }
    }

    pub fn as_jane(&self) -> Option<&JaneMemory> {
        match self {
            Self::Jane(j) => Some(j),
            _ => None,
        }
    }

    pub fn as_client(&self) -> Option<&ClientMemory> {
        match self {
            Self::Client(c) => Some(c),
            _ => None,
        }
    }
}

// ── Record envelope ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    /// Monotonically increasing; every mutation creates a new version and the
    /// store retains the old one.
    pub version: u64,
    pub status: MemoryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_document: Option<String>,
    #[serde(default)]
    pub source_page: Option<u32>,
    pub generated_by: GeneratedBy,
    pub needs_encryption: bool,
    pub body: MemoryBody,
}

impl MemoryRecord {
    pub fn kind(&self) -> MemoryKind {
        self.body.kind()
    }

    /// First 8 characters of the UUID, used as a compact display identifier.
    pub fn id_short(&self) -> String {
        self.id.to_string()[..8].to_string()
    }
}

/// A not-yet-stored memory handed to [`crate::store::MemoryStore::put`].
/// The store assigns id, version, and timestamps on insert.
#[derive(Debug, Clone)]
pub struct MemoryDraft {
    pub status: MemoryStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub source_document: Option<String>,
    pub source_page: Option<u32>,
    pub generated_by: GeneratedBy,
    pub needs_encryption: bool,
    pub body: MemoryBody,
}

impl MemoryDraft {
    /// A system-generated draft, born in `Draft` status.
    pub fn generated(model: impl Into<String>, body: MemoryBody) -> Self {
        Self {
            status: MemoryStatus::Draft,
            expires_at: None,
            source_document: None,
            source_page: None,
            generated_by: GeneratedBy::LanguageModel {
                model: model.into(),
            },
            needs_encryption: false,
            body,
        }
    }

    /// Human-authored foundation content, born directly in `Canon`.
    pub fn foundation(editor_id: impl Into<String>, body: MemoryBody) -> Self {
        Self {
            status: MemoryStatus::Canon,
            expires_at: None,
            source_document: None,
            source_page: None,
            generated_by: GeneratedBy::Human {
                editor_id: editor_id.into(),
            },
            needs_encryption: false,
            body,
        }
    }

    /// A knowledge chunk, born directly in `Canon` with document provenance.
    pub fn knowledge(
        source_document: impl Into<String>,
        page: u32,
        chunk: KnowledgeChunk,
    ) -> Self {
        Self {
            status: MemoryStatus::Canon,
            expires_at: None,
            source_document: Some(source_document.into()),
            source_page: Some(page),
            generated_by: GeneratedBy::Human {
                editor_id: "knowledge-ingest".to_string(),
            },
            needs_encryption: false,
            body: MemoryBody::Knowledge(chunk),
        }
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// A client session record.  Created by the external session-management
/// collaborator; the engine only appends the summary and memory references.
/// References are many-to-many and ownership-free in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub client_id: String,
    pub date: DateTime<Utc>,
    /// Ordered as discussed during the session.
    pub topics_discussed: Vec<String>,
    #[serde(default)]
    pub summary: serde_json::Value,
    #[serde(default)]
    pub memory_refs: Vec<Uuid>,
}

/// Truncate `s` to at most `max_chars` Unicode scalar values, returning a
/// sub-slice.  Used by the summarizer prompt builder.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
