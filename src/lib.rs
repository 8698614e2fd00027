//! lm-assist: retrieval and curation layer for coding-assistant sessions
//!
//! Watches per-session transcripts, distills explore sub-agent output into
//! knowledge documents, indexes both into a hybrid vector + full-text
//! store, and serves context suggestions back to the assistant over HTTP
//! and a hub relay channel.

pub mod config;
pub mod error;
pub mod knowledge;
pub mod paths;
pub mod pricing;
pub mod relay;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod sync;
pub mod vector;

pub use config::{AssistConfig, MachineIdentity, Settings};
pub use error::{AssistError, Result};
pub use knowledge::{Knowledge, KnowledgeGenerator, KnowledgeStore};
pub use retrieval::context::ContextSuggester;
pub use retrieval::RetrievalEngine;
pub use session::{SessionCache, TranscriptWatcher};
pub use sync::{HubChannel, HubClient, RemoteSyncService};
pub use vector::{Embedder, HashEmbedder, VectorStore};
