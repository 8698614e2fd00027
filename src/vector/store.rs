//! Vector store backed by LanceDB
//!
//! Persists `(vector, metadata)` rows under `{dataDir}/lance-store/` and
//! answers cosine-similarity queries, full-text queries over the `text`
//! column, and the hybrid combination of the two via Reciprocal Rank Fusion.
//!
//! The FTS index is allowed to lag writes: `add_vectors` never rebuilds it,
//! callers invoke [`VectorStore::rebuild_fts_index`] once after a write pass
//! when they need visibility.

use crate::vector::embedding::{Embedder, VECTOR_DIM};
use crate::vector::models::*;
use anyhow::{Context, Result};
use arrow_array::{
    self as arrow, Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, StringArray,
};
use arrow_schema::{self as schema, DataType, Field, Schema, SchemaRef};
use futures::stream::StreamExt;
use lancedb::index::scalar::{FtsIndexBuilder, FullTextSearchQuery};
use lancedb::index::Index;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, Table};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const TABLE_NAME: &str = "vectors";
/// Batch size for embedding + append.
const WRITE_CHUNK: usize = 50;
/// Vector hits below this similarity are dropped before fusion.
const MIN_VECTOR_SIMILARITY: f64 = 0.57;
/// RRF parameters.
const RRF_K: f64 = 60.0;
const RRF_WEIGHT_VECTOR: f64 = 1.0;
const RRF_WEIGHT_FTS: f64 = 0.8;

/// Wraps prepared batches for LanceDB ingestion.
struct SimpleRecordBatchReader {
    schema: SchemaRef,
    batches: std::vec::IntoIter<RecordBatch>,
}

impl SimpleRecordBatchReader {
    fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            schema,
            batches: batches.into_iter(),
        }
    }
}

impl Iterator for SimpleRecordBatchReader {
    type Item = std::result::Result<RecordBatch, schema::ArrowError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.batches.next().map(Ok)
    }
}

impl arrow::RecordBatchReader for SimpleRecordBatchReader {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

pub struct VectorStore {
    db_path: PathBuf,
    embedder: Arc<dyn Embedder>,
    connection: Option<Connection>,
    table: Option<Table>,
}

impl VectorStore {
    pub fn new(db_path: PathBuf, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            db_path,
            embedder,
            connection: None,
            table: None,
        }
    }

    /// Connect and open the table, creating it with an init row on first use.
    pub async fn initialize(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.db_path)
            .await
            .context("creating vector store directory")?;

        let uri = self.db_path.to_string_lossy().to_string();
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .context("connecting to LanceDB")?;

        match connection.open_table(TABLE_NAME).execute().await {
            Ok(table) => {
                self.table = Some(table);
                info!("Opened existing vector table at {:?}", self.db_path);
            }
            Err(_) => {
                let table = Self::create_table(&connection).await?;
                self.table = Some(table);
                info!("Created vector table at {:?}", self.db_path);
            }
        }
        self.connection = Some(connection);
        Ok(())
    }

    fn table(&self) -> Result<&Table> {
        self.table
            .as_ref()
            .context("vector store not initialized")
    }

    pub fn is_initialized(&self) -> bool {
        self.connection.is_some() && self.table.is_some()
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    VECTOR_DIM as i32,
                ),
                false,
            ),
            Field::new("row_type", DataType::Utf8, false),
            Field::new("session_id", DataType::Utf8, false),
            Field::new("milestone_index", DataType::Int32, false),
            Field::new("knowledge_id", DataType::Utf8, false),
            Field::new("part_id", DataType::Utf8, false),
            Field::new("project_path", DataType::Utf8, false),
            Field::new("phase", DataType::Int32, false),
            Field::new("content_type", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("timestamp", DataType::Utf8, false),
        ]))
    }

    async fn create_table(connection: &Connection) -> Result<Table> {
        let schema = Self::schema();
        // Seed row so the engine can infer column types.
        let init = VectorRow {
            id: "init".to_string(),
            row_type: RowType::Session,
            session_id: "init".to_string(),
            milestone_index: ABSENT,
            knowledge_id: String::new(),
            part_id: String::new(),
            project_path: String::new(),
            phase: ABSENT,
            content_type: "system".to_string(),
            text: "initialization record".to_string(),
            timestamp: String::new(),
        };
        let batch = Self::record_batch(schema.clone(), &[(init, vec![0.0; VECTOR_DIM])])?;
        let reader = SimpleRecordBatchReader::new(schema, vec![batch]);

        connection
            .create_table(TABLE_NAME, reader)
            .execute()
            .await
            .context("creating vector table")
    }

    fn record_batch(schema: SchemaRef, rows: &[(VectorRow, Vec<f32>)]) -> Result<RecordBatch> {
        let ids: StringArray = rows.iter().map(|(r, _)| Some(r.id.as_str())).collect();
        let row_types: StringArray = rows
            .iter()
            .map(|(r, _)| Some(r.row_type.to_string()))
            .collect();
        let session_ids: StringArray = rows
            .iter()
            .map(|(r, _)| Some(r.session_id.as_str()))
            .collect();
        let milestone_indexes = Int32Array::from(
            rows.iter()
                .map(|(r, _)| r.milestone_index)
                .collect::<Vec<_>>(),
        );
        let knowledge_ids: StringArray = rows
            .iter()
            .map(|(r, _)| Some(r.knowledge_id.as_str()))
            .collect();
        let part_ids: StringArray = rows.iter().map(|(r, _)| Some(r.part_id.as_str())).collect();
        let project_paths: StringArray = rows
            .iter()
            .map(|(r, _)| Some(r.project_path.as_str()))
            .collect();
        let phases = Int32Array::from(rows.iter().map(|(r, _)| r.phase).collect::<Vec<_>>());
        let content_types: StringArray = rows
            .iter()
            .map(|(r, _)| Some(r.content_type.as_str()))
            .collect();
        let texts: StringArray = rows
            .iter()
            .map(|(r, _)| Some(truncate_chars(&r.text, TEXT_STORE_LIMIT)))
            .collect();
        let timestamps: StringArray = rows
            .iter()
            .map(|(r, _)| Some(r.timestamp.as_str()))
            .collect();

        let values: Float32Array = rows
            .iter()
            .flat_map(|(_, v)| v.iter().copied())
            .collect();
        let vectors = FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            VECTOR_DIM as i32,
            Arc::new(values),
            None,
        );

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(ids),
                Arc::new(vectors),
                Arc::new(row_types),
                Arc::new(session_ids),
                Arc::new(milestone_indexes),
                Arc::new(knowledge_ids),
                Arc::new(part_ids),
                Arc::new(project_paths),
                Arc::new(phases),
                Arc::new(content_types),
                Arc::new(texts),
                Arc::new(timestamps),
            ],
        )
        .context("building record batch")
    }

    /// Append rows, embedding their text in batched chunks. The FTS index is
    /// deliberately left stale; call [`Self::rebuild_fts_index`] afterwards.
    pub async fn add_vectors(&self, inserts: Vec<VectorInsert>) -> Result<usize> {
        if inserts.is_empty() {
            return Ok(0);
        }
        let table = self.table()?;
        let schema = Self::schema();
        let mut written = 0usize;

        for chunk in inserts.chunks(WRITE_CHUNK) {
            let texts: Vec<String> = chunk.iter().map(|i| i.row.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;

            let rows: Vec<(VectorRow, Vec<f32>)> = chunk
                .iter()
                .zip(vectors)
                .map(|(insert, vector)| (insert.row.clone(), vector))
                .collect();

            let batch = Self::record_batch(schema.clone(), &rows)?;
            let reader = SimpleRecordBatchReader::new(schema.clone(), vec![batch]);
            table
                .add(reader)
                .execute()
                .await
                .context("appending vector rows")?;
            written += rows.len();
        }

        debug!("Appended {} vector rows", written);
        Ok(written)
    }

    /// Rebuild the inverted index over the `text` column. Called once after
    /// a write pass, never per chunk.
    pub async fn rebuild_fts_index(&self) -> Result<()> {
        let table = self.table()?;
        table
            .create_index(&["text"], Index::FTS(FtsIndexBuilder::default()))
            .execute()
            .await
            .context("rebuilding FTS index")?;
        info!("FTS index rebuilt");
        Ok(())
    }

    /// Cosine-similarity search. Returns hits with similarity in `[0, 1]`.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<SearchHit>> {
        let table = self.table()?;
        let vector = self.embedder.embed(query).await?;

        let mut search = table
            .vector_search(vector)
            .context("starting vector search")?
            .limit(limit);
        if let Some(predicate) = filter.and_then(|f| f.predicate()) {
            search = search.only_if(predicate);
        }

        let mut stream = search.execute().await.context("running vector search")?;
        let mut hits = Vec::new();
        while let Some(batch) = stream.next().await {
            let batch = batch?;
            for row_idx in 0..batch.num_rows() {
                let Some(row) = extract_row(&batch, row_idx)? else {
                    continue;
                };
                let distance = float_col(&batch, "_distance", row_idx).unwrap_or(2.0);
                let similarity = 1.0 - (distance as f64) / 2.0;
                hits.push(SearchHit {
                    row,
                    score: similarity,
                });
            }
        }
        Ok(hits)
    }

    /// Full-text search over the stored `text` column. Scores are BM25-ish
    /// and only meaningful for ranking.
    pub async fn fts_search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<SearchHit>> {
        let table = self.table()?;

        let mut search = table
            .query()
            .full_text_search(FullTextSearchQuery::new(query.to_string()))
            .limit(limit);
        if let Some(predicate) = filter.and_then(|f| f.predicate()) {
            search = search.only_if(predicate);
        }

        let mut stream = match search.execute().await {
            Ok(stream) => stream,
            Err(e) => {
                // No FTS index yet: degrade to an empty leg rather than
                // failing the whole hybrid query.
                debug!("FTS search unavailable: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut hits = Vec::new();
        let mut rank = 0usize;
        while let Some(batch) = stream.next().await {
            let batch = batch?;
            for row_idx in 0..batch.num_rows() {
                let Some(row) = extract_row(&batch, row_idx)? else {
                    continue;
                };
                rank += 1;
                let score = float_col(&batch, "_score", row_idx)
                    .map(|s| s as f64)
                    .unwrap_or_else(|| 1.0 / rank as f64);
                hits.push(SearchHit { row, score });
            }
        }
        Ok(hits)
    }

    /// Hybrid search: vector and FTS legs fetched at 3× the requested limit,
    /// deduplicated per entity, fused with Reciprocal Rank Fusion.
    pub async fn hybrid_search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<SearchHit>> {
        let fetch = limit.saturating_mul(3).max(1);

        let (vector_hits, fts_hits) = tokio::join!(
            self.search(query, fetch, filter),
            self.fts_search(query, fetch, filter),
        );
        let mut vector_hits = vector_hits?;
        let fts_hits = fts_hits.unwrap_or_default();

        vector_hits.retain(|hit| hit.score >= MIN_VECTOR_SIMILARITY);

        Ok(rrf_combine(vector_hits, fts_hits, limit))
    }

    /// Does any row reference this knowledge document?
    pub async fn has_knowledge(&self, knowledge_id: &str) -> Result<bool> {
        let table = self.table()?;
        let count = table
            .count_rows(Some(format!(
                "knowledge_id = '{}'",
                knowledge_id.replace('\'', "''")
            )))
            .await
            .context("counting knowledge rows")?;
        Ok(count > 0)
    }

    /// Total row count, init row included.
    pub async fn count_rows(&self) -> Result<usize> {
        let table = self.table()?;
        table.count_rows(None).await.context("counting rows")
    }

    /// Rows that carry real content (excludes the init row).
    pub async fn content_row_count(&self) -> Result<usize> {
        let table = self.table()?;
        table
            .count_rows(Some("content_type != 'system'".to_string()))
            .await
            .context("counting content rows")
    }

    pub async fn delete_knowledge(&self, knowledge_id: &str) -> Result<()> {
        self.delete_where(&format!(
            "knowledge_id = '{}'",
            knowledge_id.replace('\'', "''")
        ))
        .await
    }

    pub async fn delete_milestone(&self, session_id: &str, milestone_index: i32) -> Result<()> {
        self.delete_where(&format!(
            "session_id = '{}' AND milestone_index = {}",
            session_id.replace('\'', "''"),
            milestone_index
        ))
        .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.delete_where(&format!(
            "session_id = '{}'",
            session_id.replace('\'', "''")
        ))
        .await
    }

    async fn delete_where(&self, predicate: &str) -> Result<()> {
        let table = self.table()?;
        table
            .delete(predicate)
            .await
            .with_context(|| format!("deleting rows where {}", predicate))?;
        debug!("Deleted vector rows where {}", predicate);
        Ok(())
    }
}

/// Reciprocal Rank Fusion over the two deduplicated legs.
///
/// Each leg is sorted by its own score, ranked 1-based, and an entity's
/// fused score is `Σ w/(K+rank)` over the legs that contain it. The vector
/// row is preferred when both legs carry the entity (richer metadata).
pub fn rrf_combine(
    vector_hits: Vec<SearchHit>,
    fts_hits: Vec<SearchHit>,
    limit: usize,
) -> Vec<SearchHit> {
    let vector_ranked = dedupe_and_rank(vector_hits);
    let fts_ranked = dedupe_and_rank(fts_hits);

    let mut fused: HashMap<String, (Option<VectorRow>, Option<VectorRow>, f64)> = HashMap::new();

    for (entity, row, rank) in vector_ranked {
        let entry = fused.entry(entity).or_insert((None, None, 0.0));
        entry.0 = Some(row);
        entry.2 += RRF_WEIGHT_VECTOR / (RRF_K + rank as f64);
    }
    for (entity, row, rank) in fts_ranked {
        let entry = fused.entry(entity).or_insert((None, None, 0.0));
        entry.1 = Some(row);
        entry.2 += RRF_WEIGHT_FTS / (RRF_K + rank as f64);
    }

    let mut combined: Vec<SearchHit> = fused
        .into_values()
        .filter_map(|(vector_row, fts_row, score)| {
            vector_row
                .or(fts_row)
                .map(|row| SearchHit { row, score })
        })
        .collect();

    combined.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    combined.truncate(limit);
    combined
}

/// Keep the best-scoring hit per entity, then assign 1-based ranks by score.
fn dedupe_and_rank(hits: Vec<SearchHit>) -> Vec<(String, VectorRow, usize)> {
    let mut best: HashMap<String, SearchHit> = HashMap::new();
    for hit in hits {
        let entity = hit.row.entity_id();
        match best.get(&entity) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(entity, hit);
            }
        }
    }

    let mut deduped: Vec<(String, SearchHit)> = best.into_iter().collect();
    deduped.sort_by(|a, b| {
        b.1.score
            .partial_cmp(&a.1.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    deduped
        .into_iter()
        .enumerate()
        .map(|(i, (entity, hit))| (entity, hit.row, i + 1))
        .collect()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

fn float_col(batch: &RecordBatch, name: &str, row: usize) -> Option<f32> {
    batch
        .column_by_name(name)?
        .as_any()
        .downcast_ref::<Float32Array>()
        .map(|col| col.value(row))
}

fn string_col<'a>(batch: &'a RecordBatch, name: &str, row: usize) -> Result<&'a str> {
    Ok(batch
        .column_by_name(name)
        .with_context(|| format!("missing column {}", name))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("column {} is not a string", name))?
        .value(row))
}

fn int_col(batch: &RecordBatch, name: &str, row: usize) -> Result<i32> {
    Ok(batch
        .column_by_name(name)
        .with_context(|| format!("missing column {}", name))?
        .as_any()
        .downcast_ref::<Int32Array>()
        .with_context(|| format!("column {} is not an int", name))?
        .value(row))
}

/// Extract a row from a result batch; the init row maps to `None`.
fn extract_row(batch: &RecordBatch, row: usize) -> Result<Option<VectorRow>> {
    let content_type = string_col(batch, "content_type", row)?.to_string();
    if content_type == "system" {
        return Ok(None);
    }

    Ok(Some(VectorRow {
        id: string_col(batch, "id", row)?.to_string(),
        row_type: RowType::from(string_col(batch, "row_type", row)?),
        session_id: string_col(batch, "session_id", row)?.to_string(),
        milestone_index: int_col(batch, "milestone_index", row)?,
        knowledge_id: string_col(batch, "knowledge_id", row)?.to_string(),
        part_id: string_col(batch, "part_id", row)?.to_string(),
        project_path: string_col(batch, "project_path", row)?.to_string(),
        phase: int_col(batch, "phase", row)?,
        content_type,
        text: string_col(batch, "text", row)?.to_string(),
        timestamp: string_col(batch, "timestamp", row)?.to_string(),
    }))
}
