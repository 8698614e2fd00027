//! Data models for knowledge documents, comments, and the index
//!
//! A document is an ordered list of parts under a `K###` identifier; comments
//! live in a sidecar file per document; the index is the lightweight map the
//! store consults for listing and dedup without touching document files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Knowledge document classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    Algorithm,
    Contract,
    Schema,
    Wiring,
    Invariant,
    Flow,
}

impl std::fmt::Display for KnowledgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KnowledgeType::Algorithm => write!(f, "algorithm"),
            KnowledgeType::Contract => write!(f, "contract"),
            KnowledgeType::Schema => write!(f, "schema"),
            KnowledgeType::Wiring => write!(f, "wiring"),
            KnowledgeType::Invariant => write!(f, "invariant"),
            KnowledgeType::Flow => write!(f, "flow"),
        }
    }
}

impl From<&str> for KnowledgeType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "algorithm" => KnowledgeType::Algorithm,
            "contract" => KnowledgeType::Contract,
            "schema" => KnowledgeType::Schema,
            "invariant" => KnowledgeType::Invariant,
            "flow" => KnowledgeType::Flow,
            _ => KnowledgeType::Wiring,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeStatus {
    Active,
    Outdated,
    Archived,
}

impl std::fmt::Display for KnowledgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KnowledgeStatus::Active => write!(f, "active"),
            KnowledgeStatus::Outdated => write!(f, "outdated"),
            KnowledgeStatus::Archived => write!(f, "archived"),
        }
    }
}

impl From<&str> for KnowledgeStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "outdated" => KnowledgeStatus::Outdated,
            "archived" => KnowledgeStatus::Archived,
            _ => KnowledgeStatus::Active,
        }
    }
}

/// One section of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgePart {
    /// `{docId}.{1-based index}`; maintained by [`Knowledge::renumber_parts`].
    pub part_id: String,
    pub title: String,
    /// One paragraph.
    pub summary: String,
    pub content: String,
}

/// Origin marker for documents synced from a peer workstation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOrigin {
    pub machine_id: String,
    pub machine_hostname: String,
    pub machine_os: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Knowledge {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub knowledge_type: KnowledgeType,
    /// Absolute project path. An identifier, not a filesystem dependency.
    pub project: String,
    pub status: KnowledgeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<String>,
    pub parts: Vec<KnowledgePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<RemoteOrigin>,
}

impl Knowledge {
    pub fn is_remote(&self) -> bool {
        self.origin.is_some()
    }

    /// Re-derive every `part_id` from the document id and position. Must run
    /// after any write to `parts`.
    pub fn renumber_parts(&mut self) {
        for (i, part) in self.parts.iter_mut().enumerate() {
            part.part_id = format!("{}.{}", self.id, i + 1);
        }
    }

    /// Look up a part by its full `K###.n` id.
    pub fn part(&self, part_id: &str) -> Option<&KnowledgePart> {
        self.parts.iter().find(|p| p.part_id == part_id)
    }

    /// Composite key used in the index: plain id for local documents,
    /// `{machineId}:{id}` for remote ones.
    pub fn index_key(&self) -> String {
        match &self.origin {
            Some(origin) => format!("{}:{}", origin.machine_id, self.id),
            None => self.id.clone(),
        }
    }
}

/// Build an index key from parts.
pub fn index_key(id: &str, machine_id: Option<&str>) -> String {
    match machine_id {
        Some(machine) => format!("{}:{}", machine, id),
        None => id.to_string(),
    }
}

/// True when `id` has the local document shape `K<digits>`.
pub fn is_local_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next() == Some('K') && {
        let rest: Vec<char> = chars.collect();
        !rest.is_empty() && rest.iter().all(|c| c.is_ascii_digit())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentType {
    Remove,
    Update,
    Outdated,
    Expand,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentSource {
    Llm,
    User,
    Reviewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentState {
    NotAddressed,
    Addressed,
}

/// A review comment attached to a document or one of its parts. Comments are
/// created, optionally transitioned to addressed, and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
    #[serde(rename = "type")]
    pub comment_type: CommentType,
    pub content: String,
    pub source: CommentSource,
    pub state: CommentState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addressed_at: Option<DateTime<Utc>>,
}

/// On-disk sidecar: one JSON object per document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentFile {
    pub comments: Vec<Comment>,
    pub next_comment_id: u64,
}

/// Lightweight per-document metadata held in the index file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub knowledge_type: KnowledgeType,
    pub project: String,
    pub status: KnowledgeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    pub part_count: usize,
}

impl IndexEntry {
    pub fn from_knowledge(doc: &Knowledge) -> Self {
        Self {
            id: doc.id.clone(),
            title: doc.title.clone(),
            knowledge_type: doc.knowledge_type,
            project: doc.project.clone(),
            status: doc.status,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            source_session_id: doc.source_session_id.clone(),
            source_agent_id: doc.source_agent_id.clone(),
            machine_id: doc.origin.as_ref().map(|o| o.machine_id.clone()),
            part_count: doc.parts.len(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.machine_id.is_some()
    }
}

/// The persisted index file: a map from index key to entry plus the
/// monotonic id allocator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeIndex {
    pub knowledges: HashMap<String, IndexEntry>,
    pub next_id: u64,
}

/// Filter for [`list`](crate::knowledge::KnowledgeStore::list) scans.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    pub project: Option<String>,
    #[serde(rename = "type")]
    pub knowledge_type: Option<KnowledgeType>,
    pub status: Option<KnowledgeStatus>,
    /// `local` or `remote`.
    pub origin: Option<String>,
}

impl ListFilter {
    pub fn matches(&self, entry: &IndexEntry) -> bool {
        if let Some(project) = &self.project {
            if &entry.project != project {
                return false;
            }
        }
        if let Some(kind) = self.knowledge_type {
            if entry.knowledge_type != kind {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(origin) = &self.origin {
            let remote = entry.is_remote();
            match origin.as_str() {
                "remote" if !remote => return false,
                "local" if remote => return false,
                _ => {}
            }
        }
        true
    }
}
