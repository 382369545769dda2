#![deny(unsafe_code)]
use anyhow::{Context, Result};
use broker_approval::Coordinator;
use broker_chat::mock::MockTransport;
use broker_config::BrokerConfig;
use broker_daemon::{build_app, run_janitor, AppState};
use broker_notify::NotificationEmitter;
use broker_sandbox::SandboxExecutor;
use broker_store::RequestStore;
use broker_trust::TrustCache;
use broker_vault::SecretVault;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "broker-daemon", version, about = "Human-in-the-loop execution broker")]
struct Args {
    /// Path to a TOML config file. Falls back to defaults plus env overrides
    /// when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = broker_config::load_config(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("loading config: {e}"))?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let filter = EnvFilter::new(format!(
        "broker={level}",
        level = config.log_level.as_deref().unwrap_or("info")
    ));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for warning in broker_config::validate_config(&config)
        .map_err(|e| anyhow::anyhow!("invalid config: {e}"))?
    {
        warn!(%warning, "configuration warning");
    }

    let (state, janitor_store) = build_state(&config).await?;
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!(bind = %config.bind_addr, "broker-daemon listening");

    tokio::spawn(run_janitor(janitor_store, Duration::from_secs(3600)));

    axum::serve(listener, app).await.context("serve")
}

async fn build_state(config: &BrokerConfig) -> Result<(AppState, RequestStore)> {
    let store = RequestStore::open(&config.store_dir)
        .await
        .with_context(|| format!("opening request store at {}", config.store_dir))?;
    let trust = TrustCache::new(store.clone());
    let vault = SecretVault::hydrate(store.clone())
        .await
        .context("hydrating secret vault")?;

    let scratch_root = PathBuf::from(&config.store_dir).join("scratch");
    let sandbox = SandboxExecutor::new(config.sandbox_mode.clone(), scratch_root);

    // The chat transport itself is an external integration left to the
    // deployer; the in-memory mock keeps the daemon runnable standalone and
    // exercises the same ChatTransport seam a real integration would.
    let chat: Arc<dyn broker_chat::ChatTransport> = Arc::new(MockTransport::new());

    let notify = NotificationEmitter::new(
        config.notification_endpoint.clone(),
        PathBuf::from(&config.notification_file),
    );

    let coordinator = Coordinator::new(
        store.clone(),
        trust,
        vault.clone(),
        sandbox,
        chat,
        notify,
    );

    let janitor_store = store.clone();
    Ok((
        AppState {
            store,
            coordinator,
            vault,
        },
        janitor_store,
    ))
}
