//! Configuration and environment resolution
//!
//! Resolves the data directory, the assistant transcript root, and hub
//! credentials from the environment, and loads the per-user settings file
//! that tunes context injection and the knowledge generator.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "LM_ASSIST_DATA_DIR";
/// Environment variable overriding the assistant transcript root.
pub const TRANSCRIPT_ROOT_ENV: &str = "CLAUDE_CONFIG_DIR";
/// Hub credentials.
pub const HUB_API_KEY_ENV: &str = "TIER_AGENT_API_KEY";
pub const HUB_URL_ENV: &str = "TIER_AGENT_HUB_URL";

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct AssistConfig {
    /// Root for knowledge files, the vector store, and logs.
    pub data_dir: PathBuf,
    /// Root of the assistant's per-project transcript directories
    /// (`{root}/projects/{encoded}/{sessionId}.jsonl`).
    pub transcript_root: PathBuf,
    /// Hub gateway base URL, when configured.
    pub hub_url: Option<String>,
    /// Hub bearer token, when configured.
    pub hub_api_key: Option<String>,
    /// HTTP listen port.
    pub port: u16,
}

impl AssistConfig {
    /// Resolve configuration from the environment.
    pub fn from_env(port: u16) -> Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;

        let data_dir = std::env::var(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".lm-assist"));

        let transcript_root = std::env::var(TRANSCRIPT_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".claude"));

        Ok(Self {
            data_dir,
            transcript_root,
            hub_url: std::env::var(HUB_URL_ENV).ok().filter(|s| !s.is_empty()),
            hub_api_key: std::env::var(HUB_API_KEY_ENV).ok().filter(|s| !s.is_empty()),
            port,
        })
    }

    pub fn knowledge_dir(&self) -> PathBuf {
        self.data_dir.join("knowledge")
    }

    pub fn lance_dir(&self) -> PathBuf {
        self.data_dir.join("lance-store")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.transcript_root.join("projects")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.knowledge_dir().join("settings.json")
    }

    pub fn machine_file(&self) -> PathBuf {
        self.data_dir.join("machine.json")
    }

    pub fn hub_configured(&self) -> bool {
        self.hub_url.is_some() && self.hub_api_key.is_some()
    }
}

/// Per-user settings stored at `{dataDir}/knowledge/settings.json`.
///
/// Unknown keys are preserved across rewrites via the `extra` map so other
/// tools can stash their own options in the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_true")]
    pub context_inject_knowledge: bool,
    #[serde(default = "default_true")]
    pub context_inject_milestones: bool,
    #[serde(default = "default_knowledge_count")]
    pub context_inject_knowledge_count: usize,
    #[serde(default = "default_milestone_count")]
    pub context_inject_milestone_count: usize,
    /// Additional junk patterns appended to the generator's built-in list.
    #[serde(default)]
    pub generator_junk_patterns: Vec<String>,
    /// Per-model rate overrides, `model -> [input, output, cache_write, cache_read]`
    /// in USD per million tokens.
    #[serde(default)]
    pub model_rates: HashMap<String, [f64; 4]>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

fn default_knowledge_count() -> usize {
    5
}

fn default_milestone_count() -> usize {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            context_inject_knowledge: true,
            context_inject_milestones: true,
            context_inject_knowledge_count: default_knowledge_count(),
            context_inject_milestone_count: default_milestone_count(),
            generator_junk_patterns: Vec::new(),
            model_rates: HashMap::new(),
            extra: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file is absent or
    /// unreadable. Settings never block startup.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    debug!("Settings file unparseable, using defaults: {}", e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing settings to {:?}", path))?;
        Ok(())
    }
}

/// Stable workstation identity, registered with the hub and stamped on
/// documents synced from this machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineIdentity {
    pub machine_id: String,
    pub machine_hostname: String,
    pub machine_os: String,
}

impl MachineIdentity {
    /// Load the persisted identity, creating one on first run. The id is a
    /// hash of hostname plus a random salt so two machines with the same
    /// hostname stay distinct.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(identity) = serde_json::from_str::<MachineIdentity>(&raw) {
                return Ok(identity);
            }
        }

        let hostname = hostname();
        let salt = uuid::Uuid::new_v4().to_string();
        let mut hasher = Sha256::new();
        hasher.update(hostname.as_bytes());
        hasher.update(salt.as_bytes());
        let machine_id = hex::encode(&hasher.finalize()[..16]);

        let identity = Self {
            machine_id,
            machine_hostname: hostname,
            machine_os: std::env::consts::OS.to_string(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&identity)?)
            .with_context(|| format!("persisting machine identity to {:?}", path))?;
        info!("Registered machine identity {}", identity.machine_id);
        Ok(identity)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Initialize file-based logging for the daemon.
///
/// Writes structured logs to `{dataDir}/logs/assist.log` without rotation;
/// stderr keeps the env-filtered subscriber for interactive runs.
pub fn init_daemon_logging(config: &AssistConfig) -> Result<()> {
    let logs_dir = config.logs_dir();
    std::fs::create_dir_all(&logs_dir)?;

    let file_appender = tracing_appender::rolling::never(&logs_dir, "assist.log");

    tracing_subscriber::fmt()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(false)
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();

    Ok(())
}
