//! Hub gateway client
//!
//! Thin typed client over the relay hub's HTTP API: enumerate registered
//! machines and issue hub-relayed GETs against a peer workstation's local
//! HTTP surface. Authentication is the hub's bearer scheme; this crate never
//! sees end-user credentials.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const HUB_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A workstation registered with the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMachine {
    pub machine_id: String,
    #[serde(default)]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub connected: bool,
}

/// A project advertised by a peer, with its normalized fetch remotes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerProject {
    pub project: String,
    #[serde(default)]
    pub remotes: Vec<String>,
}

/// Envelope every peer endpoint responds with.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

pub struct HubClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HubClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HUB_REQUEST_TIMEOUT)
            .build()
            .context("building hub HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Machines registered with the hub, self included.
    pub async fn list_machines(&self) -> Result<Vec<PeerMachine>> {
        let url = format!("{}/api/machines", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("listing hub machines")?;

        if !response.status().is_success() {
            return Err(anyhow!("hub returned {}", response.status()));
        }
        let envelope: Envelope<Vec<PeerMachine>> =
            response.json().await.context("decoding machine list")?;
        envelope
            .data
            .ok_or_else(|| anyhow!("hub machine list had no data: {:?}", envelope.error))
    }

    /// Relay a GET to a peer's local HTTP surface and decode the peer's
    /// envelope.
    pub async fn relay_get<T: serde::de::DeserializeOwned>(
        &self,
        machine_id: &str,
        path_and_query: &str,
    ) -> Result<T> {
        let url = format!(
            "{}/api/machines/{}/relay{}",
            self.base_url, machine_id, path_and_query
        );
        debug!("Hub relay GET {} -> {}", machine_id, path_and_query);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .with_context(|| format!("relaying GET {} to {}", path_and_query, machine_id))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "peer {} returned {} for {}",
                machine_id,
                response.status(),
                path_and_query
            ));
        }

        let envelope: Envelope<T> = response.json().await.context("decoding relayed reply")?;
        if !envelope.success {
            return Err(anyhow!("peer call failed: {:?}", envelope.error));
        }
        envelope
            .data
            .ok_or_else(|| anyhow!("peer reply had no data"))
    }

    /// A peer's advertised projects.
    pub async fn peer_projects(&self, machine_id: &str) -> Result<Vec<PeerProject>> {
        self.relay_get(machine_id, "/projects").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = HubClient::new("https://hub.example.test/".to_string(), "k".to_string())
            .unwrap();
        assert_eq!(client.base_url(), "https://hub.example.test");
    }

    #[test]
    fn test_peer_machine_tolerates_sparse_json() {
        let machine: PeerMachine =
            serde_json::from_str(r#"{"machineId": "m1"}"#).unwrap();
        assert_eq!(machine.machine_id, "m1");
        assert!(machine.gateway_id.is_none());
        assert!(!machine.connected);
    }

    #[test]
    fn test_envelope_decode() {
        let envelope: Envelope<Vec<PeerProject>> = serde_json::from_str(
            r#"{"success": true, "data": [{"project": "/work/repo", "remotes": ["github.com/a/b"]}]}"#,
        )
        .unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.data.unwrap()[0].remotes.len(), 1);
    }
}
