//! Persistent duplex channel to the hub
//!
//! Maintains one WebSocket connection to the hub gateway, authenticates
//! with the bearer key, hands inbound `api_relay` frames to the relay
//! handler, and writes its replies back. Reconnects with capped exponential
//! backoff until shutdown.

use crate::config::MachineIdentity;
use crate::relay::RelayHandler;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct HubChannel {
    ws_url: String,
    api_key: String,
    identity: MachineIdentity,
    relay: Arc<RelayHandler>,
    shutdown: Arc<AtomicBool>,
}

impl HubChannel {
    pub fn new(
        hub_url: &str,
        api_key: String,
        identity: MachineIdentity,
        relay: Arc<RelayHandler>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ws_url: to_ws_url(hub_url),
            api_key,
            identity,
            relay,
            shutdown,
        }
    }

    /// Run the connect/serve/reconnect loop until shutdown.
    pub async fn run(&self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.serve_once().await {
                Ok(()) => {
                    info!("Hub channel closed cleanly");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    warn!("Hub channel error: {:#}", e);
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            debug!("Reconnecting to hub in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        self.relay.teardown();
    }

    async fn serve_once(&self) -> Result<()> {
        let url = format!("{}/api/gateway/connect", self.ws_url);
        let (stream, _) = connect_async(&url).await.context("connecting to hub")?;
        info!("Hub channel connected");

        let (mut write, mut read) = stream.split();

        // Register this machine before serving relay traffic.
        let register = json!({
            "type": "register",
            "apiKey": self.api_key,
            "machineId": self.identity.machine_id,
            "hostname": self.identity.machine_hostname,
            "os": self.identity.machine_os,
        });
        write
            .send(Message::text(register.to_string()))
            .await
            .context("sending registration")?;

        while let Some(message) = read.next().await {
            if self.shutdown.load(Ordering::SeqCst) {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            let message = message.context("reading hub frame")?;
            match message {
                Message::Text(text) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_ref()) else {
                        debug!("Dropping unparseable hub frame");
                        continue;
                    };
                    if frame.get("type").and_then(Value::as_str) == Some("api_relay") {
                        if let Some(reply) = self.relay.handle_frame(&frame).await {
                            write
                                .send(Message::text(reply.to_string()))
                                .await
                                .context("sending relay reply")?;
                        }
                    }
                }
                Message::Ping(payload) => {
                    write
                        .send(Message::Pong(payload))
                        .await
                        .context("answering ping")?;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }
}

fn to_ws_url(hub_url: &str) -> String {
    let trimmed = hub_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    }
}
