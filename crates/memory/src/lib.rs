pub mod audit;
pub mod cache;
pub mod engine;
pub mod error;
pub mod index;
pub mod journal;
pub mod quarantine;
pub mod router;
pub mod sanitizer;
pub mod schema;
pub mod store;
pub mod summarizer;
pub mod validator;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// An async function that maps a text string to an optional embedding vector.
/// Stored as an `Arc` so it can be cloned across components.  The returned
/// future is `Send + 'static` so it can be spawned or `.await`ed anywhere.
/// `None` means the embedding backend failed or is unavailable; callers
/// degrade rather than error.
pub type EmbedFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<Vec<f32>>> + Send>> + Send + Sync>;

pub use audit::AuditEntry;
pub use engine::{EngineStats, MemoryEngine};
pub use error::MemoryError;
pub use quarantine::{ReviewDecision, SubmissionOutcome};
pub use router::{ContextBundle, ContextItem, QueryBucket, RetrievalQuery};
pub use schema::{
    Actor, ClientMemory, GeneratedBy, JaneMemory, KnowledgeChunk, MemoryBody, MemoryDraft,
    MemoryKind, MemoryRecord, MemoryStatus, Session,
};
pub use validator::Verdict;
