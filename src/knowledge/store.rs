//! Knowledge store
//!
//! Owns knowledge documents and their comments on disk and the in-memory
//! index that makes listing and dedup cheap. Layout under the knowledge
//! directory:
//!
//! ```text
//! index.json                    map of index key -> entry, plus nextId
//! K001.md … K{n}.md             local documents
//! comments/K001.json …          one comment sidecar per document
//! remote/{machineId}/K###.md    documents synced from peers
//! ```
//!
//! Every mutation runs under one async mutex, so the dedup check and the
//! id allocation + write of `create` are atomic relative to other creates
//! in this process. The index file is rewritten whole (tmp + rename) after
//! each mutation.

use crate::error::{AssistError, Result};
use crate::knowledge::markdown::{parse_knowledge_md, render_knowledge_md};
use crate::knowledge::models::*;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Soft cap on cached parsed documents.
const DOC_CACHE_CAPACITY: usize = 100;

/// Input for [`KnowledgeStore::create`].
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewKnowledge {
    pub title: String,
    #[serde(rename = "type")]
    pub knowledge_type: KnowledgeType,
    pub project: String,
    pub parts: Vec<NewPart>,
    #[serde(default)]
    pub source_session_id: Option<String>,
    #[serde(default)]
    pub source_agent_id: Option<String>,
    #[serde(default)]
    pub source_timestamp: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPart {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub content: String,
}

/// Patch for [`KnowledgeStore::update`]; absent fields are left untouched.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgePatch {
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub knowledge_type: Option<KnowledgeType>,
    pub status: Option<KnowledgeStatus>,
    pub project: Option<String>,
    pub parts: Option<Vec<NewPart>>,
}

struct CachedDoc {
    doc: Arc<Knowledge>,
    mtime: SystemTime,
}

struct StoreInner {
    index: KnowledgeIndex,
    cache: LruCache<String, CachedDoc>,
}

pub struct KnowledgeStore {
    dir: PathBuf,
    inner: Mutex<StoreInner>,
}

impl KnowledgeStore {
    /// Open (or create) the store rooted at `dir`, loading the index.
    pub async fn open(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AssistError::io(&dir, e))?;
        tokio::fs::create_dir_all(dir.join("comments"))
            .await
            .map_err(|e| AssistError::io(dir.join("comments"), e))?;
        tokio::fs::create_dir_all(dir.join("remote"))
            .await
            .map_err(|e| AssistError::io(dir.join("remote"), e))?;

        let index_path = dir.join("index.json");
        let index = match tokio::fs::read_to_string(&index_path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Index file unparseable, rebuilding: {}", e);
                KnowledgeIndex::default()
            }),
            Err(_) => KnowledgeIndex::default(),
        };

        let store = Self {
            dir,
            inner: Mutex::new(StoreInner {
                index,
                cache: LruCache::new(NonZeroUsize::new(DOC_CACHE_CAPACITY).unwrap()),
            }),
        };
        info!(
            "Knowledge store opened with {} indexed documents",
            store.inner.lock().await.index.knowledges.len()
        );
        Ok(store)
    }

    fn doc_path(&self, id: &str, machine_id: Option<&str>) -> PathBuf {
        match machine_id {
            Some(machine) => self.dir.join("remote").join(machine).join(format!("{}.md", id)),
            None => self.dir.join(format!("{}.md", id)),
        }
    }

    fn comments_path(&self, id: &str) -> PathBuf {
        self.dir.join("comments").join(format!("{}.json", id))
    }

    async fn save_index(&self, index: &KnowledgeIndex) -> Result<()> {
        let path = self.dir.join("index.json");
        let tmp = self.dir.join("index.json.tmp");
        let json = serde_json::to_string_pretty(index).map_err(|e| AssistError::Parse(e.to_string()))?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| AssistError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AssistError::io(&path, e))?;
        Ok(())
    }

    async fn write_doc(&self, doc: &Knowledge) -> Result<()> {
        let machine = doc.origin.as_ref().map(|o| o.machine_id.as_str());
        let path = self.doc_path(&doc.id, machine);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AssistError::io(parent, e))?;
        }
        tokio::fs::write(&path, render_knowledge_md(doc))
            .await
            .map_err(|e| AssistError::io(&path, e))?;
        Ok(())
    }

    fn allocate_id(index: &mut KnowledgeIndex) -> String {
        index.next_id += 1;
        format!("K{:03}", index.next_id)
    }

    /// Create a local document, enforcing the dedup invariants: one document
    /// per `sourceAgentId`, one per non-empty `(title, sourceSessionId)`
    /// pair. Violations surface the existing document's id.
    pub async fn create(&self, data: NewKnowledge) -> Result<Arc<Knowledge>> {
        let mut inner = self.inner.lock().await;

        if let Some(agent) = data.source_agent_id.as_deref() {
            if let Some(existing) = find_local_by_agent(&inner.index, agent) {
                return Err(AssistError::Duplicate {
                    existing_id: existing.id.clone(),
                });
            }
        }
        if let Some(session) = data.source_session_id.as_deref() {
            if !data.title.is_empty() {
                if let Some(existing) =
                    find_local_by_title_session(&inner.index, &data.title, session)
                {
                    return Err(AssistError::Duplicate {
                        existing_id: existing.id.clone(),
                    });
                }
            }
        }

        let id = Self::allocate_id(&mut inner.index);
        let now = Utc::now();
        let mut doc = Knowledge {
            id,
            title: data.title,
            knowledge_type: data.knowledge_type,
            project: data.project,
            status: KnowledgeStatus::Active,
            created_at: now,
            updated_at: now,
            source_session_id: data.source_session_id,
            source_agent_id: data.source_agent_id,
            source_timestamp: data.source_timestamp,
            parts: data
                .parts
                .into_iter()
                .map(|p| KnowledgePart {
                    part_id: String::new(),
                    title: p.title,
                    summary: p.summary,
                    content: p.content,
                })
                .collect(),
            origin: None,
        };
        doc.renumber_parts();

        self.write_doc(&doc).await?;
        inner
            .index
            .knowledges
            .insert(doc.index_key(), IndexEntry::from_knowledge(&doc));
        self.save_index(&inner.index).await?;

        info!("Created knowledge {} ({})", doc.id, doc.title);
        let doc = Arc::new(doc);
        self.cache_put(&mut inner, &doc);
        Ok(doc)
    }

    /// Create a local document from raw Markdown. A usable embedded id is
    /// kept (advancing the allocator past it); a missing, malformed, or
    /// colliding id is replaced with a fresh allocation.
    pub async fn create_from_markdown(&self, md: &str) -> Result<Arc<Knowledge>> {
        let mut doc = parse_knowledge_md(md)?;
        doc.origin = None;

        let mut inner = self.inner.lock().await;

        if let Some(agent) = doc.source_agent_id.as_deref() {
            if let Some(existing) = find_local_by_agent(&inner.index, agent) {
                return Err(AssistError::Duplicate {
                    existing_id: existing.id.clone(),
                });
            }
        }
        if let Some(session) = doc.source_session_id.as_deref() {
            if let Some(existing) = find_local_by_title_session(&inner.index, &doc.title, session)
            {
                return Err(AssistError::Duplicate {
                    existing_id: existing.id.clone(),
                });
            }
        }

        let embedded_usable = is_local_id(&doc.id) && !inner.index.knowledges.contains_key(&doc.id);
        if embedded_usable {
            let numeric: u64 = doc.id[1..].parse().unwrap_or(0);
            if numeric > inner.index.next_id {
                inner.index.next_id = numeric;
            }
        } else {
            doc.id = Self::allocate_id(&mut inner.index);
        }

        let now = Utc::now();
        doc.created_at = now;
        doc.updated_at = now;
        doc.renumber_parts();

        self.write_doc(&doc).await?;
        inner
            .index
            .knowledges
            .insert(doc.index_key(), IndexEntry::from_knowledge(&doc));
        self.save_index(&inner.index).await?;

        let doc = Arc::new(doc);
        self.cache_put(&mut inner, &doc);
        Ok(doc)
    }

    /// Store a document that arrived from a peer. Skips the local dedup
    /// checks; identity is the composite `(machineId, id)` key.
    pub async fn store_remote(&self, doc: Knowledge) -> Result<Arc<Knowledge>> {
        let origin = doc
            .origin
            .clone()
            .ok_or_else(|| AssistError::InvalidRequest("remote document missing origin".into()))?;

        let mut doc = doc;
        doc.renumber_parts();

        let mut inner = self.inner.lock().await;
        self.write_doc(&doc).await?;
        inner
            .index
            .knowledges
            .insert(doc.index_key(), IndexEntry::from_knowledge(&doc));
        self.save_index(&inner.index).await?;

        debug!("Stored remote knowledge {}:{}", origin.machine_id, doc.id);
        let doc = Arc::new(doc);
        self.cache_put(&mut inner, &doc);
        Ok(doc)
    }

    /// Fetch a document. The file is re-read only when its mtime exceeds the
    /// cached mtime; hits refresh LRU order.
    pub async fn get(&self, id: &str, machine_id: Option<&str>) -> Option<Arc<Knowledge>> {
        let key = index_key(id, machine_id);
        let path = self.doc_path(id, machine_id);

        let mtime = tokio::fs::metadata(&path).await.ok()?.modified().ok()?;

        let mut inner = self.inner.lock().await;
        if let Some(cached) = inner.cache.get(&key) {
            if cached.mtime >= mtime {
                return Some(Arc::clone(&cached.doc));
            }
        }

        let raw = tokio::fs::read_to_string(&path).await.ok()?;
        let doc = match parse_knowledge_md(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Unparseable knowledge file {:?}: {}", path, e);
                return None;
            }
        };
        let doc = Arc::new(doc);
        inner.cache.put(
            key,
            CachedDoc {
                doc: Arc::clone(&doc),
                mtime,
            },
        );
        Some(doc)
    }

    /// List index entries matching the filter. Never touches document files.
    pub async fn list(&self, filter: &ListFilter) -> Vec<IndexEntry> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<IndexEntry> = inner
            .index
            .knowledges
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Apply a patch to a local or remote document. Refuses to resurrect a
    /// missing document; always bumps `updatedAt` strictly past the old one.
    pub async fn update(
        &self,
        id: &str,
        machine_id: Option<&str>,
        patch: KnowledgePatch,
    ) -> Result<Arc<Knowledge>> {
        let existing = self
            .get(id, machine_id)
            .await
            .ok_or_else(|| AssistError::NotFound(format!("knowledge {}", id)))?;

        let mut doc = (*existing).clone();
        if let Some(title) = patch.title {
            doc.title = title;
        }
        if let Some(kind) = patch.knowledge_type {
            doc.knowledge_type = kind;
        }
        if let Some(status) = patch.status {
            doc.status = status;
        }
        if let Some(project) = patch.project {
            doc.project = project;
        }
        if let Some(parts) = patch.parts {
            doc.parts = parts
                .into_iter()
                .map(|p| KnowledgePart {
                    part_id: String::new(),
                    title: p.title,
                    summary: p.summary,
                    content: p.content,
                })
                .collect();
            doc.renumber_parts();
        }
        doc.updated_at = bump_instant(doc.updated_at);

        let mut inner = self.inner.lock().await;
        self.write_doc(&doc).await?;
        inner
            .index
            .knowledges
            .insert(doc.index_key(), IndexEntry::from_knowledge(&doc));
        self.save_index(&inner.index).await?;

        let doc = Arc::new(doc);
        self.cache_put(&mut inner, &doc);
        Ok(doc)
    }

    /// Delete a local document: its file, its comment sidecar, and its index
    /// entry. Remote documents go through [`Self::delete_remote_knowledge`].
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.index.knowledges.remove(id).is_none() {
            return Err(AssistError::NotFound(format!("knowledge {}", id)));
        }
        inner.cache.pop(id);

        let doc_path = self.doc_path(id, None);
        if let Err(e) = tokio::fs::remove_file(&doc_path).await {
            warn!("Could not remove {:?}: {}", doc_path, e);
        }
        let comments = self.comments_path(id);
        if comments.exists() {
            let _ = tokio::fs::remove_file(&comments).await;
        }

        self.save_index(&inner.index).await?;
        info!("Deleted knowledge {}", id);
        Ok(())
    }

    /// Refresh the index entry for a document without rewriting its file.
    /// This is the repair path for files edited out-of-band.
    pub async fn resave(&self, doc: &Knowledge) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .index
            .knowledges
            .insert(doc.index_key(), IndexEntry::from_knowledge(doc));
        let numeric = doc
            .id
            .strip_prefix('K')
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        if doc.origin.is_none() && numeric > inner.index.next_id {
            inner.index.next_id = numeric;
        }
        self.save_index(&inner.index).await
    }

    pub async fn find_by_agent_id(&self, agent_id: &str) -> Option<IndexEntry> {
        let inner = self.inner.lock().await;
        find_local_by_agent(&inner.index, agent_id).cloned()
    }

    pub async fn find_by_title_and_session(
        &self,
        title: &str,
        session_id: &str,
    ) -> Option<IndexEntry> {
        let inner = self.inner.lock().await;
        find_local_by_title_session(&inner.index, title, session_id).cloned()
    }

    /// Remote entries, optionally restricted to one machine.
    pub async fn find_remote_knowledge(&self, machine_id: Option<&str>) -> Vec<IndexEntry> {
        let inner = self.inner.lock().await;
        inner
            .index
            .knowledges
            .values()
            .filter(|e| match machine_id {
                Some(machine) => e.machine_id.as_deref() == Some(machine),
                None => e.is_remote(),
            })
            .cloned()
            .collect()
    }

    /// Ids of documents synced from one machine.
    pub async fn get_remote_knowledge_ids(&self, machine_id: &str) -> Vec<String> {
        self.find_remote_knowledge(Some(machine_id))
            .await
            .into_iter()
            .map(|e| e.id)
            .collect()
    }

    /// Remove one remote document (file + index entry). Used by sync when a
    /// peer ships a newer version; the stale-flag path archives instead.
    pub async fn delete_remote_knowledge(&self, machine_id: &str, id: &str) -> Result<()> {
        let key = index_key(id, Some(machine_id));
        let mut inner = self.inner.lock().await;
        if inner.index.knowledges.remove(&key).is_none() {
            return Err(AssistError::NotFound(format!("remote knowledge {}", key)));
        }
        inner.cache.pop(&key);
        let path = self.doc_path(id, Some(machine_id));
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Could not remove {:?}: {}", path, e);
        }
        self.save_index(&inner.index).await
    }

    /// Resolve a document reference: either a composite `machine:id` index
    /// key, or a bare id checked locally first and then against any
    /// machine's remote copy.
    pub async fn resolve(&self, id: &str) -> Option<Arc<Knowledge>> {
        if let Some((machine, bare)) = id.split_once(':') {
            return self.get(bare, Some(machine)).await;
        }
        if let Some(doc) = self.get(id, None).await {
            return Some(doc);
        }
        let machine = {
            let inner = self.inner.lock().await;
            inner
                .index
                .knowledges
                .values()
                .find(|e| e.id == id && e.is_remote())
                .and_then(|e| e.machine_id.clone())
        };
        let machine = machine?;
        self.get(id, Some(&machine)).await
    }

    /// Does the document resolve at all (local id or `machine:id` key)?
    pub async fn exists(&self, knowledge_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.index.knowledges.contains_key(knowledge_id)
            || inner
                .index
                .knowledges
                .values()
                .any(|e| e.id == knowledge_id)
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.index.knowledges.len()
    }

    // ---- comments ----

    async fn load_comments(&self, id: &str) -> CommentFile {
        match tokio::fs::read_to_string(self.comments_path(id)).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => CommentFile::default(),
        }
    }

    async fn save_comments(&self, id: &str, file: &CommentFile) -> Result<()> {
        let path = self.comments_path(id);
        let json = serde_json::to_string_pretty(file).map_err(|e| AssistError::Parse(e.to_string()))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| AssistError::io(&path, e))
    }

    pub async fn add_comment(
        &self,
        id: &str,
        part_id: Option<String>,
        comment_type: CommentType,
        content: String,
        source: CommentSource,
    ) -> Result<Comment> {
        if self.get(id, None).await.is_none() {
            return Err(AssistError::NotFound(format!("knowledge {}", id)));
        }

        let _guard = self.inner.lock().await;
        let mut file = self.load_comments(id).await;
        file.next_comment_id += 1;
        let comment = Comment {
            id: file.next_comment_id,
            part_id,
            comment_type,
            content,
            source,
            state: CommentState::NotAddressed,
            created_at: Utc::now(),
            addressed_at: None,
        };
        file.comments.push(comment.clone());
        self.save_comments(id, &file).await?;
        Ok(comment)
    }

    pub async fn list_comments(&self, id: &str) -> Vec<Comment> {
        self.load_comments(id).await.comments
    }

    pub async fn mark_comment_addressed(&self, id: &str, comment_id: u64) -> Result<Comment> {
        let _guard = self.inner.lock().await;
        let mut file = self.load_comments(id).await;
        let comment = file
            .comments
            .iter_mut()
            .find(|c| c.id == comment_id)
            .ok_or_else(|| AssistError::NotFound(format!("comment {} on {}", comment_id, id)))?;
        comment.state = CommentState::Addressed;
        comment.addressed_at = Some(Utc::now());
        let updated = comment.clone();
        self.save_comments(id, &file).await?;
        Ok(updated)
    }

    // ---- repair ----

    /// Reconcile the index with the files on disk, both directions: index
    /// files that exist but are unindexed, drop entries whose file vanished.
    pub async fn repair(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();

        let mut on_disk: Vec<Knowledge> = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| AssistError::io(&self.dir, e))?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => match parse_knowledge_md(&raw) {
                    Ok(doc) => on_disk.push(doc),
                    Err(e) => warn!("Skipping unparseable {:?} during repair: {}", path, e),
                },
                Err(e) => warn!("Skipping unreadable {:?} during repair: {}", path, e),
            }
        }

        {
            let inner = self.inner.lock().await;
            for doc in &on_disk {
                if !inner.index.knowledges.contains_key(&doc.index_key()) {
                    report.reindexed.push(doc.id.clone());
                }
            }
        }
        for doc in &on_disk {
            if report.reindexed.contains(&doc.id) {
                self.resave(doc).await?;
            }
        }

        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = inner.index.knowledges.keys().cloned().collect();
        for key in keys {
            let entry = inner.index.knowledges.get(&key).cloned();
            let Some(entry) = entry else { continue };
            let path = self.doc_path(&entry.id, entry.machine_id.as_deref());
            if !path.exists() {
                inner.index.knowledges.remove(&key);
                inner.cache.pop(&key);
                report.dropped.push(key);
            }
        }
        if !report.dropped.is_empty() {
            self.save_index(&inner.index).await?;
        }

        info!(
            "Repair complete: {} reindexed, {} dropped",
            report.reindexed.len(),
            report.dropped.len()
        );
        Ok(report)
    }

    fn cache_put(&self, inner: &mut StoreInner, doc: &Arc<Knowledge>) {
        inner.cache.put(
            doc.index_key(),
            CachedDoc {
                doc: Arc::clone(doc),
                mtime: SystemTime::now(),
            },
        );
    }
}

#[derive(Debug, Default)]
pub struct RepairReport {
    pub reindexed: Vec<String>,
    pub dropped: Vec<String>,
}

fn find_local_by_agent<'a>(index: &'a KnowledgeIndex, agent_id: &str) -> Option<&'a IndexEntry> {
    index
        .knowledges
        .values()
        .find(|e| !e.is_remote() && e.source_agent_id.as_deref() == Some(agent_id))
}

fn find_local_by_title_session<'a>(
    index: &'a KnowledgeIndex,
    title: &str,
    session_id: &str,
) -> Option<&'a IndexEntry> {
    if title.is_empty() || session_id.is_empty() {
        return None;
    }
    index.knowledges.values().find(|e| {
        !e.is_remote() && e.title == title && e.source_session_id.as_deref() == Some(session_id)
    })
}

/// `Utc::now()`, nudged forward when the clock has not advanced past the old
/// value, so `updatedAt` is strictly monotonic per document.
fn bump_instant(old: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > old {
        now
    } else {
        old + ChronoDuration::milliseconds(1)
    }
}
