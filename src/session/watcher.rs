//! Filesystem watcher for session transcripts
//!
//! Watches the transcript root recursively, filters for `.jsonl` files,
//! debounces bursts of writes per path, and fans change events out on a
//! broadcast bus so dependents (session cache, generators) can invalidate
//! derived state.

use anyhow::{Context, Result};
use dashmap::DashMap;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const DEBOUNCE_DURATION: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_SIZE: usize = 256;

/// A change observed on one transcript file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl TranscriptEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Created(p) | Self::Modified(p) | Self::Removed(p) => p,
        }
    }
}

type DebounceMap = Arc<DashMap<PathBuf, Instant>>;

/// Watcher over the transcript root. Dropping it stops the watch.
pub struct TranscriptWatcher {
    watcher: RecommendedWatcher,
    watch_path: PathBuf,
    sender: broadcast::Sender<TranscriptEvent>,
}

impl TranscriptWatcher {
    pub fn new(watch_path: PathBuf) -> Result<Self> {
        if !watch_path.exists() {
            warn!(
                "Watch path does not exist, will create: {}",
                watch_path.display()
            );
            std::fs::create_dir_all(&watch_path).context("creating watch directory")?;
        }

        info!("Initializing transcript watcher for {}", watch_path.display());

        let (sender, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let event_sender = sender.clone();
        let debounce: DebounceMap = Arc::new(DashMap::new());

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let kind = match event.kind {
                        EventKind::Create(_) => EventCategory::Create,
                        EventKind::Modify(_) => EventCategory::Modify,
                        EventKind::Remove(_) => EventCategory::Remove,
                        _ => return,
                    };
                    for path in event.paths {
                        if !is_transcript_file(&path, kind) {
                            continue;
                        }
                        if kind != EventCategory::Remove && !should_emit(&debounce, &path) {
                            continue;
                        }
                        let event = match kind {
                            EventCategory::Create => TranscriptEvent::Created(path),
                            EventCategory::Modify => TranscriptEvent::Modified(path),
                            EventCategory::Remove => TranscriptEvent::Removed(path),
                        };
                        debug!("Transcript event: {:?}", event);
                        // A send only fails with zero subscribers; fine.
                        let _ = event_sender.send(event);
                    }
                }
                Err(e) => error!("Filesystem watcher error: {}", e),
            },
            Config::default()
                .with_poll_interval(Duration::from_secs(2))
                .with_compare_contents(false),
        )
        .context("creating filesystem watcher")?;

        Ok(Self {
            watcher,
            watch_path,
            sender,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        self.watcher
            .watch(&self.watch_path, RecursiveMode::Recursive)
            .context("starting directory watch")?;
        info!("Transcript watcher started on {}", self.watch_path.display());
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.watcher
            .unwatch(&self.watch_path)
            .context("stopping directory watch")?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.sender.subscribe()
    }

    pub fn watch_path(&self) -> &Path {
        &self.watch_path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventCategory {
    Create,
    Modify,
    Remove,
}

fn is_transcript_file(path: &Path, kind: EventCategory) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    if name.ends_with(".tmp") || name.ends_with(".swp") {
        return false;
    }
    if !name.ends_with(".jsonl") {
        return false;
    }
    // Removed files no longer stat; for the rest require a real file.
    kind == EventCategory::Remove || path.is_file()
}

fn should_emit(debounce: &DebounceMap, path: &Path) -> bool {
    let now = Instant::now();
    if let Some(last) = debounce.get(path) {
        if now.duration_since(*last) < DEBOUNCE_DURATION {
            return false;
        }
    }
    debounce.insert(path.to_path_buf(), now);
    true
}

/// Wire a watcher subscription into the session cache: every event
/// invalidates the touched path so the next read re-parses.
pub fn spawn_cache_invalidator(
    mut receiver: broadcast::Receiver<TranscriptEvent>,
    cache: Arc<crate::session::SessionCache>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => cache.invalidate(event.path()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Watcher bus lagged, dropping {} events", skipped);
                    cache.invalidate_all();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
