//! Vector storage, embedding, and indexing.

pub mod embedding;
pub mod indexer;
pub mod models;
pub mod store;

pub use embedding::{Embedder, HashEmbedder, VECTOR_DIM};
pub use models::{RowFilter, RowType, SearchHit, VectorInsert, VectorRow};
pub use store::{rrf_combine, VectorStore};
