//! Session cache
//!
//! Caches parsed transcript snapshots keyed by file path. Reads are gated on
//! the file's mtime: a hit with an unchanged mtime is O(1) and touches the
//! filesystem only for the stat. Parsing happens at most once per file per
//! mtime thanks to a per-path parse lock.

use crate::pricing::{RateTable, TokenUsage};
use crate::session::transcript::{
    self, parse_subagent, parse_transcript, SubagentSummary, TaskItem,
};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info};

/// Soft cap on cached session entries.
const SESSION_CACHE_CAPACITY: usize = 256;

/// Cached snapshot of one session transcript.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: String,
    pub user_prompts: Vec<String>,
    pub task_list: Vec<TaskItem>,
    pub subagents: Vec<SubagentSummary>,
    pub total_cost_usd: f64,
    pub turn_count: u64,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub forked_from_session_id: Option<String>,
    pub fork_point_uuid: Option<String>,
    pub last_timestamp: Option<String>,
    /// Mtime of the transcript at parse time, used for validation.
    #[serde(skip)]
    pub file_mtime: SystemTime,
    #[serde(skip)]
    pub usage_by_model: HashMap<String, TokenUsage>,
}

pub struct SessionCache {
    entries: Mutex<LruCache<PathBuf, Arc<SessionEntry>>>,
    /// Per-path parse locks so concurrent callers block once per file.
    parse_locks: DashMap<PathBuf, Arc<AsyncMutex<()>>>,
    rates: RateTable,
    warmed_tx: watch::Sender<bool>,
    warmed_rx: watch::Receiver<bool>,
}

impl SessionCache {
    pub fn new(rates: RateTable) -> Self {
        let (warmed_tx, warmed_rx) = watch::channel(false);
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(SESSION_CACHE_CAPACITY).unwrap(),
            )),
            parse_locks: DashMap::new(),
            rates,
            warmed_tx,
            warmed_rx,
        }
    }

    /// Synchronous lookup: the cached entry, or `None` when absent or stale.
    /// Costs one stat; never parses.
    pub fn get_cached(&self, path: &Path) -> Option<Arc<SessionEntry>> {
        let mtime = file_mtime(path)?;
        let mut entries = self.entries.lock();
        let entry = entries.get(path)?;
        if entry.file_mtime == mtime {
            Some(Arc::clone(entry))
        } else {
            None
        }
    }

    /// Asynchronous lookup that parses on miss or staleness. Unreadable or
    /// malformed files yield `None`; the caller decides how to degrade.
    pub async fn get(&self, path: &Path) -> Option<Arc<SessionEntry>> {
        if let Some(entry) = self.get_cached(path) {
            return Some(entry);
        }

        let lock = self
            .parse_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have parsed while we waited.
        if let Some(entry) = self.get_cached(path) {
            return Some(entry);
        }

        let mtime = file_mtime(path)?;
        let entry = self.parse_entry(path, mtime).await?;
        let entry = Arc::new(entry);
        self.entries
            .lock()
            .put(path.to_path_buf(), Arc::clone(&entry));
        Some(entry)
    }

    /// Drop the cached snapshot for one path.
    pub fn invalidate(&self, path: &Path) {
        self.entries.lock().pop(path);
    }

    pub fn invalidate_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn parse_entry(&self, path: &Path, mtime: SystemTime) -> Option<SessionEntry> {
        let parsed = parse_transcript(path).await?;

        let session_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        // Sub-agent transcripts live in `{sessionId}/subagents/` next to the
        // parent file.
        let mut subagents = Vec::new();
        let subagents_dir = path.with_extension("").join("subagents");
        if let Ok(mut dir) = tokio::fs::read_dir(&subagents_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let agent_path = entry.path();
                if agent_path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let agent_id = agent_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                if let Some(summary) =
                    parse_subagent(&agent_path, &agent_id, &parsed.task_launches).await
                {
                    subagents.push(summary);
                }
            }
        }
        subagents.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        let total_cost_usd = parsed.total_cost_override.unwrap_or_else(|| {
            parsed
                .usage_by_model
                .iter()
                .map(|(model, usage)| self.rates.cost(model, usage))
                .sum()
        });

        Some(SessionEntry {
            session_id,
            user_prompts: parsed.user_prompts,
            task_list: parsed.task_list,
            subagents,
            total_cost_usd,
            turn_count: parsed.turn_count,
            model: parsed.model,
            cwd: parsed.cwd,
            forked_from_session_id: parsed.forked_from_session_id,
            fork_point_uuid: parsed.fork_point_uuid,
            last_timestamp: parsed.last_timestamp,
            file_mtime: mtime,
            usage_by_model: parsed.usage_by_model,
        })
    }

    /// Walk every project directory and parse sessions modified within
    /// `window`. Signals [`Self::warmed`] on completion whether or not
    /// anything was parsed.
    pub async fn warm(&self, projects_dir: &Path, window: Duration) {
        let cutoff = SystemTime::now()
            .checked_sub(window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut parsed_count = 0usize;

        if let Ok(mut projects) = tokio::fs::read_dir(projects_dir).await {
            while let Ok(Some(project)) = projects.next_entry().await {
                let project_path = project.path();
                if !project_path.is_dir() {
                    continue;
                }
                let Ok(mut files) = tokio::fs::read_dir(&project_path).await else {
                    continue;
                };
                while let Ok(Some(file)) = files.next_entry().await {
                    let path = file.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                        continue;
                    }
                    match file_mtime(&path) {
                        Some(mtime) if mtime >= cutoff => {
                            if self.get(&path).await.is_some() {
                                parsed_count += 1;
                            }
                        }
                        _ => {}
                    }
                }
            }
        } else {
            debug!("Projects directory missing: {:?}", projects_dir);
        }

        info!("Session cache warmed with {} sessions", parsed_count);
        let _ = self.warmed_tx.send(true);
    }

    /// Resolves once warming has completed. Returns immediately if warming
    /// already ran (or was skipped).
    pub async fn warmed(&self) {
        let mut rx = self.warmed_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Mark warming complete without walking anything (used when warming is
    /// disabled).
    pub fn mark_warmed(&self) {
        let _ = self.warmed_tx.send(true);
    }

    /// Find the first completed sub-agent with the given agent id across a
    /// project directory's sessions.
    pub async fn find_subagent(
        &self,
        project_dir: &Path,
        agent_id: &str,
    ) -> Option<(Arc<SessionEntry>, SubagentSummary)> {
        let mut dir = tokio::fs::read_dir(project_dir).await.ok()?;
        while let Ok(Some(file)) = dir.next_entry().await {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(entry) = self.get(&path).await {
                if let Some(agent) = entry.subagents.iter().find(|a| a.agent_id == agent_id) {
                    return Some((Arc::clone(&entry), agent.clone()));
                }
            }
        }
        None
    }
}

/// Predicate used by the transcript parser; re-exported for callers that
/// filter prompt lists themselves.
pub use crate::session::transcript::is_real_user_prompt;

fn file_mtime(path: &Path) -> Option<SystemTime> {
    match std::fs::metadata(path) {
        Ok(meta) => meta.modified().ok(),
        Err(e) => {
            debug!("Cannot stat {:?}: {}", path, e);
            None
        }
    }
}
