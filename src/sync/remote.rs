//! Remote knowledge sync
//!
//! Mirrors active local-origin knowledge between workstations that share a
//! git origin, via the hub. Sync is one-directional per peer per pass: we
//! pull their local documents into our `remote/{machineId}/` namespace.
//! Entries the peer no longer advertises are flagged archived, never
//! deleted. A pass runs at most once at a time; callers fire-and-forget and
//! poll the status record.

use crate::config::MachineIdentity;
use crate::knowledge::{KnowledgePatch, KnowledgeStatus, KnowledgeStore, RemoteOrigin};
use crate::knowledge::models::IndexEntry;
use crate::knowledge::Knowledge;
use crate::sync::git::{normalized_fetch_remotes, remotes_intersect};
use crate::sync::hub::{HubClient, PeerMachine};
use crate::vector::{indexer, VectorStore};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub status: SyncState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub peers_checked: usize,
    pub entries_synced: usize,
    pub entries_skipped: usize,
    pub entries_flagged_stale: usize,
    pub errors: Vec<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            status: SyncState::Idle,
            started_at: None,
            finished_at: None,
            peers_checked: 0,
            entries_synced: 0,
            entries_skipped: 0,
            entries_flagged_stale: 0,
            errors: Vec::new(),
        }
    }
}

/// Per-machine timestamps of the last completed pass, persisted under the
/// knowledge directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncTimestamps {
    last_sync_timestamps: HashMap<String, DateTime<Utc>>,
}

pub struct RemoteSyncService {
    hub: Arc<HubClient>,
    store: Arc<KnowledgeStore>,
    vectors: Arc<VectorStore>,
    identity: MachineIdentity,
    timestamps_path: PathBuf,
    running: AtomicBool,
    status: Mutex<SyncStatus>,
}

impl RemoteSyncService {
    pub fn new(
        hub: Arc<HubClient>,
        store: Arc<KnowledgeStore>,
        vectors: Arc<VectorStore>,
        identity: MachineIdentity,
        knowledge_dir: &Path,
    ) -> Self {
        Self {
            hub,
            store,
            vectors,
            identity,
            timestamps_path: knowledge_dir.join("last-sync.json"),
            running: AtomicBool::new(false),
            status: Mutex::new(SyncStatus::default()),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    /// Start a sync pass in the background. Fails fast when one is already
    /// running; completion is observed through [`Self::status`].
    pub fn start(self: &Arc<Self>, project: PathBuf) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(anyhow!("sync already running"));
        }

        {
            let mut status = self.status.lock();
            *status = SyncStatus {
                status: SyncState::Running,
                started_at: Some(Utc::now()),
                ..Default::default()
            };
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = service.run(&project).await;
            let mut status = service.status.lock();
            status.finished_at = Some(Utc::now());
            match result {
                Ok(()) => {
                    status.status = if status.errors.is_empty() {
                        SyncState::Done
                    } else {
                        SyncState::Error
                    };
                }
                Err(e) => {
                    warn!("Remote sync failed: {:#}", e);
                    status.errors.push(format!("{:#}", e));
                    status.status = SyncState::Error;
                }
            }
            drop(status);
            service.running.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn run(&self, project: &Path) -> Result<()> {
        let our_remotes = normalized_fetch_remotes(project).await?;
        if our_remotes.is_empty() {
            return Err(anyhow!("project has no fetch remotes"));
        }
        let machines = self.hub.list_machines().await?;
        info!("Remote sync: {} machines registered", machines.len());

        let mut any_synced = false;
        for machine in machines {
            if self.is_self(&machine) {
                continue;
            }
            self.status.lock().peers_checked += 1;

            match self.sync_peer(&machine, &our_remotes).await {
                Ok(synced_any) => {
                    any_synced |= synced_any;
                    self.record_timestamp(&machine.machine_id);
                }
                Err(e) => {
                    warn!("Sync with {} failed: {:#}", machine.machine_id, e);
                    self.status
                        .lock()
                        .errors
                        .push(format!("{}: {:#}", machine.machine_id, e));
                }
            }
        }

        self.save_timestamps()?;

        if any_synced {
            if let Err(e) = self.vectors.rebuild_fts_index().await {
                debug!("FTS rebuild after sync failed (ignored): {}", e);
            }
        }
        Ok(())
    }

    fn is_self(&self, machine: &PeerMachine) -> bool {
        machine.machine_id == self.identity.machine_id
            || machine.gateway_id.as_deref() == Some(self.identity.machine_id.as_str())
    }

    async fn sync_peer(&self, machine: &PeerMachine, our_remotes: &[String]) -> Result<bool> {
        let projects = self.hub.peer_projects(&machine.machine_id).await?;
        let Some(peer_project) = projects
            .iter()
            .find(|p| remotes_intersect(our_remotes, &p.remotes))
        else {
            debug!("Peer {} shares no project origin", machine.machine_id);
            return Ok(false);
        };

        // Only the peer's local-origin documents are pulled; their remote
        // copies are some other machine's to advertise.
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("origin", "local")
            .append_pair("status", "active")
            .append_pair("project", &peer_project.project)
            .finish();
        let path = format!("/knowledge?{}", query);
        let entries: Vec<IndexEntry> = self
            .hub
            .relay_get(&machine.machine_id, &path)
            .await
            .context("fetching peer knowledge list")?;

        let mut seen_ids: Vec<String> = Vec::new();
        let mut wrote_any = false;
        for entry in &entries {
            seen_ids.push(entry.id.clone());
            match self.sync_entry(machine, entry).await {
                Ok(true) => {
                    wrote_any = true;
                    self.status.lock().entries_synced += 1;
                }
                Ok(false) => {
                    self.status.lock().entries_skipped += 1;
                }
                Err(e) => {
                    self.status
                        .lock()
                        .errors
                        .push(format!("{}/{}: {:#}", machine.machine_id, entry.id, e));
                }
            }
        }

        // Anything we hold from this machine that the peer no longer
        // advertises goes stale, but the file stays.
        let local_ids = self.store.get_remote_knowledge_ids(&machine.machine_id).await;
        for stale_id in local_ids.iter().filter(|id| !seen_ids.contains(id)) {
            let patch = KnowledgePatch {
                status: Some(KnowledgeStatus::Archived),
                ..Default::default()
            };
            match self
                .store
                .update(stale_id, Some(&machine.machine_id), patch)
                .await
            {
                Ok(_) => {
                    self.status.lock().entries_flagged_stale += 1;
                    info!("Flagged {}:{} as archived", machine.machine_id, stale_id);
                }
                Err(e) => {
                    self.status
                        .lock()
                        .errors
                        .push(format!("{}/{}: {:#}", machine.machine_id, stale_id, e));
                }
            }
        }

        Ok(wrote_any)
    }

    /// Sync one peer entry. Returns true when something was written.
    async fn sync_entry(&self, machine: &PeerMachine, entry: &IndexEntry) -> Result<bool> {
        let existing = self.store.get(&entry.id, Some(&machine.machine_id)).await;

        if let Some(existing) = &existing {
            if entry.updated_at <= existing.updated_at {
                return Ok(false);
            }
            // Peer is newer: replace wholesale, vectors before document.
            let key = existing.index_key();
            if let Err(e) = self.vectors.delete_knowledge(&key).await {
                debug!("Vector delete for {} failed (ignored): {}", key, e);
            }
            self.store
                .delete_remote_knowledge(&machine.machine_id, &entry.id)
                .await?;
        }

        let mut doc: Knowledge = self
            .hub
            .relay_get(&machine.machine_id, &format!("/knowledge/{}", entry.id))
            .await
            .context("fetching peer document")?;
        doc.origin = Some(RemoteOrigin {
            machine_id: machine.machine_id.clone(),
            machine_hostname: machine.hostname.clone(),
            machine_os: machine.os.clone(),
        });

        let stored = self.store.store_remote(doc).await?;
        if let Err(e) = indexer::index_knowledge(&self.vectors, &stored).await {
            debug!("Indexing synced {} failed (ignored): {}", stored.id, e);
        }
        Ok(true)
    }

    fn record_timestamp(&self, machine_id: &str) {
        let mut timestamps = self.load_timestamps();
        timestamps
            .last_sync_timestamps
            .insert(machine_id.to_string(), Utc::now());
        if let Ok(json) = serde_json::to_string_pretty(&timestamps) {
            let _ = std::fs::write(&self.timestamps_path, json);
        }
    }

    fn load_timestamps(&self) -> SyncTimestamps {
        std::fs::read_to_string(&self.timestamps_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_timestamps(&self) -> Result<()> {
        let timestamps = self.load_timestamps();
        let json = serde_json::to_string_pretty(&timestamps)?;
        std::fs::write(&self.timestamps_path, json)
            .with_context(|| format!("writing {:?}", self.timestamps_path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> MachineIdentity {
        MachineIdentity {
            machine_id: "self-machine".to_string(),
            machine_hostname: "here".to_string(),
            machine_os: "linux".to_string(),
        }
    }

    fn machine(id: &str, gateway: Option<&str>) -> PeerMachine {
        PeerMachine {
            machine_id: id.to_string(),
            gateway_id: gateway.map(|g| g.to_string()),
            hostname: "peer".to_string(),
            os: "linux".to_string(),
            connected: true,
        }
    }

    async fn service(dir: &Path) -> Arc<RemoteSyncService> {
        let store = Arc::new(
            KnowledgeStore::open(dir.join("knowledge")).await.unwrap(),
        );
        let vectors = Arc::new(VectorStore::new(
            dir.join("lance-store"),
            Arc::new(crate::vector::HashEmbedder),
        ));
        let hub = Arc::new(
            HubClient::new("http://127.0.0.1:1".to_string(), "key".to_string()).unwrap(),
        );
        Arc::new(RemoteSyncService::new(
            hub,
            store,
            vectors,
            identity(),
            &dir.join("knowledge"),
        ))
    }

    #[tokio::test]
    async fn test_skips_self_by_machine_and_gateway_id() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        assert!(service.is_self(&machine("self-machine", None)));
        assert!(service.is_self(&machine("other", Some("self-machine"))));
        assert!(!service.is_self(&machine("other", Some("another"))));
    }

    #[tokio::test]
    async fn test_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let project = dir.path().to_path_buf();

        // First start claims the slot (the spawned pass will fail on the
        // unreachable hub, which is fine here).
        service.start(project.clone()).unwrap();
        assert!(service.start(project).is_err());
    }

    #[tokio::test]
    async fn test_status_starts_idle() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let status = service.status();
        assert_eq!(status.status, SyncState::Idle);
        assert_eq!(status.entries_synced, 0);
    }

    #[test]
    fn test_timestamps_round_trip() {
        let mut timestamps = SyncTimestamps::default();
        timestamps
            .last_sync_timestamps
            .insert("m1".to_string(), Utc::now());
        let json = serde_json::to_string(&timestamps).unwrap();
        let back: SyncTimestamps = serde_json::from_str(&json).unwrap();
        assert!(back.last_sync_timestamps.contains_key("m1"));
    }
}
