//! lm-assist CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lm_assist::config::{init_daemon_logging, AssistConfig, MachineIdentity, Settings};
use lm_assist::knowledge::{KnowledgeGenerator, KnowledgeStore};
use lm_assist::pricing::RateTable;
use lm_assist::relay::{RelayHandler, ServiceRoute};
use lm_assist::retrieval::context::ContextSuggester;
use lm_assist::retrieval::RetrievalEngine;
use lm_assist::server::{run_server, ServerState};
use lm_assist::session::{spawn_cache_invalidator, SessionCache, TranscriptWatcher};
use lm_assist::sync::{HubChannel, HubClient, RemoteSyncService};
use lm_assist::vector::{HashEmbedder, VectorStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lm-assist")]
#[command(about = "Retrieval and curation layer for coding-assistant sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: session watcher, knowledge store, retrieval API
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "7341")]
        port: u16,

        /// Skip warming the session cache at startup
        #[arg(long)]
        no_warm: bool,

        /// Warm window in hours
        #[arg(long, default_value = "72")]
        warm_hours: u64,

        /// Log to stderr instead of the daemon log file
        #[arg(long)]
        foreground: bool,
    },

    /// Prompt-submit hook: read a prompt JSON on stdin, print context
    Hook {
        /// Daemon port to query
        #[arg(short, long, default_value = "7341")]
        port: u16,
    },
}

fn main() {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");

    let result = match cli.command {
        Commands::Serve {
            port,
            no_warm,
            warm_hours,
            foreground,
        } => runtime.block_on(serve(port, no_warm, warm_hours, foreground)),
        Commands::Hook { port } => runtime.block_on(hook(port)),
    };

    if let Err(e) = result {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn serve(port: u16, no_warm: bool, warm_hours: u64, foreground: bool) -> Result<()> {
    let config = AssistConfig::from_env(port)?;
    if foreground {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        init_daemon_logging(&config)?;
    }
    info!("Starting lm-assist on port {}", port);

    std::fs::create_dir_all(config.knowledge_dir())
        .with_context(|| format!("creating {:?}", config.knowledge_dir()))?;

    let settings = Settings::load(&config.settings_path());
    let identity = MachineIdentity::load_or_create(&config.machine_file())?;
    let shutdown = Arc::new(AtomicBool::new(false));

    // Leaves first: session cache and vector store.
    let rates = RateTable::with_overrides(settings.model_rates.clone());
    let sessions = Arc::new(SessionCache::new(rates));

    let embedder = Arc::new(HashEmbedder);
    let mut vectors = VectorStore::new(config.lance_dir(), embedder);
    vectors
        .initialize()
        .await
        .context("initializing vector store")?;
    let vectors = Arc::new(vectors);

    let knowledge = Arc::new(
        KnowledgeStore::open(config.knowledge_dir())
            .await
            .context("opening knowledge store")?,
    );

    let engine = Arc::new(RetrievalEngine::new(
        Arc::clone(&vectors),
        Arc::clone(&knowledge),
    ));
    let suggester = Arc::new(ContextSuggester::new(
        Arc::clone(&engine),
        Arc::clone(&vectors),
        Arc::clone(&sessions),
        config.settings_path(),
        config.projects_dir(),
    ));
    let generator = Arc::new(KnowledgeGenerator::new(
        Arc::clone(&knowledge),
        Arc::clone(&sessions),
        settings.generator_junk_patterns.clone(),
    ));

    // Transcript watcher feeds cache invalidation.
    let mut watcher = TranscriptWatcher::new(config.projects_dir())
        .context("creating transcript watcher")?;
    watcher.start().context("starting transcript watcher")?;
    spawn_cache_invalidator(watcher.subscribe(), Arc::clone(&sessions));

    // Warm in the background; consumers await `sessions.warmed()`.
    if no_warm {
        sessions.mark_warmed();
    } else {
        let sessions = Arc::clone(&sessions);
        let projects_dir = config.projects_dir();
        let window = Duration::from_secs(warm_hours * 3600);
        tokio::spawn(async move {
            sessions.warm(&projects_dir, window).await;
        });
    }

    // Hub-dependent pieces only exist when credentials are configured.
    let sync = if config.hub_configured() {
        let hub = Arc::new(HubClient::new(
            config.hub_url.clone().unwrap(),
            config.hub_api_key.clone().unwrap(),
        )?);
        let sync = Arc::new(RemoteSyncService::new(
            Arc::clone(&hub),
            Arc::clone(&knowledge),
            Arc::clone(&vectors),
            identity.clone(),
            &config.knowledge_dir(),
        ));

        let relay = Arc::new(RelayHandler::new(port, service_routes()));
        let channel = HubChannel::new(
            hub.base_url(),
            hub.api_key().to_string(),
            identity.clone(),
            relay,
            Arc::clone(&shutdown),
        );
        tokio::spawn(async move { channel.run().await });

        Some(sync)
    } else {
        info!("Hub not configured; remote sync and relay disabled");
        None
    };

    setup_signal_handlers(Arc::clone(&shutdown));

    // The watcher must outlive the server.
    let _watcher = watcher;

    let state = ServerState {
        config,
        identity,
        sessions,
        knowledge,
        vectors,
        engine,
        suggester,
        generator,
        sync,
        shutdown,
    };
    run_server(state).await
}

/// Additional local services reachable through the relay. Only the handler's
/// built-in API allow-list is active by default.
fn service_routes() -> Vec<ServiceRoute> {
    Vec::new()
}

fn setup_signal_handlers(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
            let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.expect("Ctrl+C handler");
            info!("Received Ctrl+C, shutting down");
        }
        shutdown.store(true, Ordering::SeqCst);
        std::process::exit(0);
    });
}

/// Prompt-submit hook. Reads `{"prompt": ..., "cwd": ...}` on stdin, asks
/// the daemon for context, prints it. Exits zero even when the daemon is
/// unreachable: a hook must never block a prompt.
async fn hook(port: u16) -> Result<()> {
    use tokio::io::AsyncReadExt;

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("reading hook input")?;

    let payload: serde_json::Value = match serde_json::from_str(&input) {
        Ok(payload) => payload,
        Err(_) => return Ok(()),
    };
    let prompt = payload
        .get("prompt")
        .and_then(|p| p.as_str())
        .unwrap_or_default();
    if prompt.trim().is_empty() {
        return Ok(());
    }

    let body = serde_json::json!({
        "prompt": prompt,
        "sessionId": payload.get("session_id").and_then(|s| s.as_str()),
        "project": payload.get("cwd").and_then(|c| c.as_str()),
    });

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response = client
        .post(format!("http://127.0.0.1:{}/context/suggest", port))
        .json(&body)
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            if let Ok(envelope) = response.json::<serde_json::Value>().await {
                if let Some(context) = envelope
                    .pointer("/data/context")
                    .and_then(|c| c.as_str())
                {
                    if !context.is_empty() {
                        println!("{}", context);
                    }
                }
            }
        }
        Ok(response) => warn!("Context suggest returned {}", response.status()),
        Err(e) => warn!("Daemon unreachable for hook: {}", e),
    }
    Ok(())
}
