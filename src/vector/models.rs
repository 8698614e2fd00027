//! Vector row model
//!
//! Rows are an index, not a source of truth: each one references a session,
//! a milestone, or a knowledge part. The backing engine infers column types
//! from the first batch, so optional numeric fields use a −1 sentinel and
//! optional strings use the empty string.

use serde::{Deserialize, Serialize};

/// Sentinel for absent numeric foreign keys.
pub const ABSENT: i32 = -1;

/// What a row indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowType {
    Session,
    Milestone,
    Knowledge,
}

impl std::fmt::Display for RowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowType::Session => write!(f, "session"),
            RowType::Milestone => write!(f, "milestone"),
            RowType::Knowledge => write!(f, "knowledge"),
        }
    }
}

impl From<&str> for RowType {
    fn from(s: &str) -> Self {
        match s {
            "session" => RowType::Session,
            "milestone" => RowType::Milestone,
            _ => RowType::Knowledge,
        }
    }
}

/// Content-type tags carried on rows.
pub mod content_type {
    pub const KNOWLEDGE_TITLE: &str = "knowledge_title";
    pub const KNOWLEDGE_PART: &str = "knowledge_part";
    pub const PROMPT: &str = "prompt";
    pub const RESULT: &str = "result";
}

/// One stored row, minus the vector itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorRow {
    pub id: String,
    pub row_type: RowType,
    pub session_id: String,
    pub milestone_index: i32,
    pub knowledge_id: String,
    pub part_id: String,
    pub project_path: String,
    pub phase: i32,
    pub content_type: String,
    /// The embedded string, truncated for storage.
    pub text: String,
    /// ISO-8601 or empty.
    pub timestamp: String,
}

impl VectorRow {
    /// The identity results are deduplicated on: for knowledge rows the part
    /// (falling back to the document), for milestones the
    /// `session:index` pair, otherwise the session.
    pub fn entity_id(&self) -> String {
        match self.row_type {
            RowType::Knowledge => {
                if !self.part_id.is_empty() {
                    self.part_id.clone()
                } else {
                    self.knowledge_id.clone()
                }
            }
            RowType::Milestone => format!("{}:{}", self.session_id, self.milestone_index),
            RowType::Session => self.session_id.clone(),
        }
    }
}

/// Insert request: a row plus the text to embed. The stored `text` column is
/// truncated to [`TEXT_STORE_LIMIT`] characters; embedding sees the full
/// string.
#[derive(Debug, Clone)]
pub struct VectorInsert {
    pub row: VectorRow,
}

/// Stored-text truncation limit.
pub const TEXT_STORE_LIMIT: usize = 500;

/// Equality filter over row columns, ANDed together.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    pub row_type: Option<RowType>,
    pub session_id: Option<String>,
    pub knowledge_id: Option<String>,
    pub project_path: Option<String>,
}

impl RowFilter {
    pub fn of_type(row_type: RowType) -> Self {
        Self {
            row_type: Some(row_type),
            ..Default::default()
        }
    }

    /// Render as a SQL-ish predicate for the backing engine, or `None` when
    /// unconstrained.
    pub fn predicate(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(row_type) = self.row_type {
            clauses.push(format!("row_type = '{}'", row_type));
        }
        if let Some(session) = &self.session_id {
            clauses.push(format!("session_id = '{}'", escape(session)));
        }
        if let Some(knowledge) = &self.knowledge_id {
            clauses.push(format!("knowledge_id = '{}'", escape(knowledge)));
        }
        if let Some(project) = &self.project_path {
            clauses.push(format!("project_path = '{}'", escape(project)));
        }
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" AND "))
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// One search result: the row and its score (similarity for plain vector
/// search, fused score for hybrid search).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    #[serde(flatten)]
    pub row: VectorRow,
    pub score: f64,
}
