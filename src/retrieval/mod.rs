//! Retrieval engine
//!
//! Runs hybrid search over the vector store, filters out rows whose backing
//! document no longer exists, applies the content-match boost, and enriches
//! results with resolved titles and origin metadata.

pub mod context;

use crate::knowledge::{Knowledge, KnowledgeStore, KnowledgeType};
use crate::vector::models::content_type;
use crate::vector::{RowFilter, RowType, VectorStore};
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// Queries longer than this get the verbatim content-match pass.
const CONTENT_MATCH_MIN_QUERY: usize = 15;
/// Score multiplier for verbatim matches already in the pool.
const CONTENT_MATCH_BOOST: f64 = 2.0;
/// Floor for injected content matches when the pool is empty.
const CONTENT_MATCH_MIN_SCORE: f64 = 0.03;
/// Overfetch when the caller gave no limit.
const UNLIMITED_FETCH: usize = 50;

/// A fully enriched knowledge search result.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSearchResult {
    pub knowledge_id: String,
    /// Empty for title rows.
    pub part_id: String,
    pub score: f64,
    pub text: String,
    pub timestamp: String,
    pub knowledge_title: String,
    pub part_title: String,
    #[serde(rename = "knowledgeType")]
    pub knowledge_type: KnowledgeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_os: Option<String>,
}

/// A milestone search result, enriched from row metadata only (the milestone
/// store is managed elsewhere).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneSearchResult {
    pub session_id: String,
    pub milestone_index: i32,
    pub phase: i32,
    pub score: f64,
    pub text: String,
    pub timestamp: String,
    pub project_path: String,
}

pub struct RetrievalEngine {
    vectors: Arc<VectorStore>,
    knowledge: Arc<KnowledgeStore>,
}

impl RetrievalEngine {
    pub fn new(vectors: Arc<VectorStore>, knowledge: Arc<KnowledgeStore>) -> Self {
        Self { vectors, knowledge }
    }

    /// Search knowledge. `limit` of `None` means "unlimited" (capped at the
    /// engine's overfetch); `type_filter` restricts by document type after
    /// enrichment.
    pub async fn search_knowledge(
        &self,
        query: &str,
        limit: Option<usize>,
        type_filter: Option<KnowledgeType>,
        project: Option<&str>,
    ) -> Result<Vec<KnowledgeSearchResult>> {
        let fetch = match limit {
            Some(limit) => limit.saturating_mul(2).max(15),
            None => UNLIMITED_FETCH,
        };

        let mut filter = RowFilter::of_type(RowType::Knowledge);
        filter.project_path = project.map(|p| p.to_string());

        let hits = self
            .vectors
            .hybrid_search(query, fetch, Some(&filter))
            .await?;

        // Orphan sweep: a row whose document vanished is dead weight.
        let mut results: Vec<KnowledgeSearchResult> = Vec::new();
        for hit in hits {
            let Some(doc) = self.knowledge.resolve(&hit.row.knowledge_id).await else {
                debug!("Dropping orphan vector row for {}", hit.row.knowledge_id);
                continue;
            };
            if let Some(wanted) = type_filter {
                if doc.knowledge_type != wanted {
                    continue;
                }
            }
            results.push(enrich(&doc, &hit.row.part_id, hit.score, hit.row.timestamp.clone()));
        }

        if query.chars().count() > CONTENT_MATCH_MIN_QUERY {
            self.apply_content_match(query, type_filter, project, &mut results)
                .await;
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Boost pool entries whose referenced text contains the query verbatim,
    /// then sweep the whole store for matching parts the pool missed and
    /// inject them at the pool's current maximum score.
    async fn apply_content_match(
        &self,
        query: &str,
        type_filter: Option<KnowledgeType>,
        project: Option<&str>,
        results: &mut Vec<KnowledgeSearchResult>,
    ) {
        let needle = query.to_lowercase();

        for result in results.iter_mut() {
            let Some(doc) = self.knowledge.resolve(&result.knowledge_id).await else {
                continue;
            };
            let haystack = if result.part_id.is_empty() {
                doc.title.to_lowercase()
            } else {
                match doc.part(&result.part_id) {
                    Some(part) => format!("{} {} {}", part.title, part.summary, part.content)
                        .to_lowercase(),
                    None => continue,
                }
            };
            if haystack.contains(&needle) {
                result.score *= CONTENT_MATCH_BOOST;
            }
        }

        let max_score = results
            .iter()
            .map(|r| r.score)
            .fold(CONTENT_MATCH_MIN_SCORE, f64::max);

        let entries = self.knowledge.list(&Default::default()).await;
        for entry in entries {
            if let Some(wanted) = type_filter {
                if entry.knowledge_type != wanted {
                    continue;
                }
            }
            if let Some(project) = project {
                if entry.project != project {
                    continue;
                }
            }
            let Some(doc) = self
                .knowledge
                .get(&entry.id, entry.machine_id.as_deref())
                .await
            else {
                continue;
            };
            for part in &doc.parts {
                let already_present = results
                    .iter()
                    .any(|r| r.knowledge_id == doc.id && r.part_id == part.part_id);
                if already_present {
                    continue;
                }
                let haystack =
                    format!("{} {} {}", part.title, part.summary, part.content).to_lowercase();
                if haystack.contains(&needle) {
                    results.push(enrich(
                        &doc,
                        &part.part_id,
                        max_score,
                        doc.updated_at.to_rfc3339(),
                    ));
                }
            }
        }
    }

    /// Milestone variant of the same skeleton, enriched from row metadata.
    pub async fn search_milestones(
        &self,
        query: &str,
        limit: Option<usize>,
        project: Option<&str>,
    ) -> Result<Vec<MilestoneSearchResult>> {
        let fetch = match limit {
            Some(limit) => limit.saturating_mul(2).max(15),
            None => UNLIMITED_FETCH,
        };

        let mut filter = RowFilter::of_type(RowType::Milestone);
        filter.project_path = project.map(|p| p.to_string());

        let hits = self
            .vectors
            .hybrid_search(query, fetch, Some(&filter))
            .await?;

        let needle = query.to_lowercase();
        let mut results: Vec<MilestoneSearchResult> = hits
            .into_iter()
            .map(|hit| {
                let mut score = hit.score;
                if query.chars().count() > CONTENT_MATCH_MIN_QUERY
                    && hit.row.text.to_lowercase().contains(&needle)
                {
                    score *= CONTENT_MATCH_BOOST;
                }
                MilestoneSearchResult {
                    session_id: hit.row.session_id,
                    milestone_index: hit.row.milestone_index,
                    phase: hit.row.phase,
                    score,
                    text: hit.row.text,
                    timestamp: hit.row.timestamp,
                    project_path: hit.row.project_path,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        Ok(results)
    }
}

fn enrich(doc: &Knowledge, part_id: &str, score: f64, timestamp: String) -> KnowledgeSearchResult {
    let (part_title, text) = match doc.part(part_id) {
        Some(part) => (part.title.clone(), part.summary.clone()),
        None => (String::new(), doc.title.clone()),
    };
    KnowledgeSearchResult {
        knowledge_id: doc.id.clone(),
        part_id: part_id.to_string(),
        score,
        text,
        timestamp,
        knowledge_title: doc.title.clone(),
        part_title,
        knowledge_type: doc.knowledge_type,
        origin: doc.origin.as_ref().map(|_| "remote".to_string()),
        machine_hostname: doc.origin.as_ref().map(|o| o.machine_hostname.clone()),
        machine_os: doc.origin.as_ref().map(|o| o.machine_os.clone()),
    }
}
