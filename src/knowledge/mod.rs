//! Knowledge documents: models, file format, store, and generator.

pub mod generator;
pub mod markdown;
pub mod models;
pub mod store;

pub use generator::{GenerateAllResult, GeneratorStatus, KnowledgeGenerator};
pub use markdown::{parse_knowledge_md, render_knowledge_md};
pub use models::{
    Comment, CommentSource, CommentState, CommentType, IndexEntry, Knowledge, KnowledgePart,
    KnowledgeStatus, KnowledgeType, ListFilter, RemoteOrigin,
};
pub use store::{KnowledgePatch, KnowledgeStore, NewKnowledge, NewPart};
