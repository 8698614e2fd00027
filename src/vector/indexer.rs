//! Knowledge indexer
//!
//! Converts a knowledge document into one title vector plus one vector per
//! part and writes them to the vector store. Indexing is best-effort:
//! retrieval keeps functioning without vectors, so failures are logged and
//! swallowed by callers that cannot propagate.

use crate::knowledge::models::Knowledge;
use crate::vector::models::{content_type, RowType, VectorInsert, VectorRow, ABSENT};
use crate::vector::VectorStore;
use anyhow::Result;
use tracing::warn;

/// Build the vector inserts for one document: the title row embeds
/// `"{title} [{type}]"`, each part row embeds `"{partId}: {title}: {summary}"`.
///
/// The `knowledge_id` column carries the document's index key
/// (`machine:id` for remote documents), so rows from a peer's `K001` never
/// collide with the local `K001`.
pub fn extract_vectors(doc: &Knowledge) -> Vec<VectorInsert> {
    let timestamp = doc.updated_at.to_rfc3339();
    let key = doc.index_key();
    let mut inserts = Vec::with_capacity(doc.parts.len() + 1);

    inserts.push(VectorInsert {
        row: VectorRow {
            id: format!("knowledge:{}:title", key),
            row_type: RowType::Knowledge,
            session_id: doc.source_session_id.clone().unwrap_or_default(),
            milestone_index: ABSENT,
            knowledge_id: key.clone(),
            part_id: String::new(),
            project_path: doc.project.clone(),
            phase: ABSENT,
            content_type: content_type::KNOWLEDGE_TITLE.to_string(),
            text: format!("{} [{}]", doc.title, doc.knowledge_type),
            timestamp: timestamp.clone(),
        },
    });

    for part in &doc.parts {
        inserts.push(VectorInsert {
            row: VectorRow {
                id: format!("knowledge:{}:{}", key, part.part_id),
                row_type: RowType::Knowledge,
                session_id: doc.source_session_id.clone().unwrap_or_default(),
                milestone_index: ABSENT,
                knowledge_id: key.clone(),
                part_id: part.part_id.clone(),
                project_path: doc.project.clone(),
                phase: ABSENT,
                content_type: content_type::KNOWLEDGE_PART.to_string(),
                text: format!("{}: {}: {}", part.part_id, part.title, part.summary),
                timestamp: timestamp.clone(),
            },
        });
    }

    inserts
}

/// Write a document's vectors. Callers batch several documents and rebuild
/// the FTS index once afterwards.
pub async fn index_knowledge(store: &VectorStore, doc: &Knowledge) -> Result<usize> {
    store.add_vectors(extract_vectors(doc)).await
}

/// Replace a document's vectors after an update.
pub async fn reindex_knowledge(store: &VectorStore, doc: &Knowledge) -> Result<usize> {
    store.delete_knowledge(&doc.index_key()).await?;
    store.add_vectors(extract_vectors(doc)).await
}

/// Best-effort variant used on write paths that must not fail on vector
/// trouble.
pub async fn index_knowledge_best_effort(store: &VectorStore, doc: &Knowledge) {
    if let Err(e) = index_knowledge(store, doc).await {
        warn!("Indexing {} failed (ignored): {}", doc.id, e);
    }
}
