// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Offline Token Manager Node
//!
//! Entry point for the `otm-node` binary: the reference issuer service.
//! Parses CLI arguments, initializes logging and metrics, restores the issuer
//! from its token database, runs the periodic expiry sweep, and serves the
//! JSON API.
//!
//! - `run`     — start the issuer service
//! - `init`    — create the data directory and generate the issuer key
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

use otm_protocol::config::ProtocolConfig;
use otm_protocol::crypto::Keypair;
use otm_protocol::ports::InMemoryLedger;
use otm_protocol::storage::{TokenDb, TokenStore};
use otm_protocol::Issuer;

use cli::{Commands, OtmNodeCli};
use logging::LogFormat;
use metrics::{NodeMetrics, SharedMetrics};

const KEY_FILE: &str = "issuer.key";
const CONFIG_FILE: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = OtmNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the issuer: API server, metrics endpoint, and expiry sweep.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "otm_node=info,otm_protocol=info,tower_http=info",
        LogFormat::from_str_lossy(&args.log_format),
    );

    let config = load_config(args.config.as_deref(), &args.data_dir)?;
    let keypair = load_issuer_key(args.issuer_key.as_deref(), &args.data_dir)?;

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        issuer = %keypair.public_key(),
        "starting otm-node"
    );

    // --- Persistent storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = Arc::new(
        TokenDb::open(&db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    tracing::info!(
        path = %db_path.display(),
        tokens = db.token_count(),
        transfers = db.transfer_count(),
        "database opened"
    );

    // --- Issuer ---
    let ledger = Arc::new(InMemoryLedger::new());
    let store: Arc<dyn TokenStore> = db.clone();
    let issuer = Arc::new(
        Issuer::restore(keypair, config.issuer.clone(), ledger, store)
            .context("failed to restore issuer from database")?,
    );

    // --- Metrics ---
    let node_metrics =
        Arc::new(NodeMetrics::new().context("failed to create metrics registry")?);
    node_metrics.observe_stats(&issuer.stats());

    let app_state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            otm_protocol::config::PROTOCOL_VERSION,
        ),
        issuer: Arc::clone(&issuer),
        metrics: Arc::clone(&node_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Expiry sweep ---
    let sweep = tokio::spawn(expiry_sweep(
        Arc::clone(&issuer),
        Arc::clone(&node_metrics),
        config.sweep.interval(),
    ));

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    sweep.abort();
    if let Err(e) = db.flush() {
        tracing::warn!(error = %e, "final database flush failed");
    }
    tracing::info!("otm-node stopped");
    Ok(())
}

/// Refund expired roots on a fixed interval. The first tick fires
/// immediately, which settles anything that expired while the node was down.
async fn expiry_sweep(issuer: Arc<Issuer>, metrics: SharedMetrics, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let batch = issuer.handle_expired_tokens(chrono::Utc::now()).await;
        metrics.refunds_total.inc_by(batch.refunds.len() as u64);
        metrics.value_refunded_total.inc_by(batch.total_refunded);
        metrics.observe_stats(&issuer.stats());
        tracing::debug!(
            refunded = batch.refunds.len(),
            failed = batch.failed.len(),
            "expiry sweep tick"
        );
    }
}

/// Explicit `--config` must exist. Otherwise `config.toml` in the data
/// directory is used when present, else the defaults.
fn load_config(explicit: Option<&Path>, data_dir: &Path) -> Result<ProtocolConfig> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let candidate = data_dir.join(CONFIG_FILE);
            if !candidate.exists() {
                tracing::info!("no config file, using defaults");
                return Ok(ProtocolConfig::default());
            }
            candidate
        }
    };
    let config = ProtocolConfig::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    tracing::info!(path = %path.display(), "config loaded");
    Ok(config)
}

fn load_issuer_key(explicit: Option<&str>, data_dir: &Path) -> Result<Keypair> {
    if let Some(hex_key) = explicit {
        return Keypair::from_hex(hex_key.trim()).context("invalid --issuer-key");
    }
    let key_path = data_dir.join(KEY_FILE);
    let contents = std::fs::read_to_string(&key_path).with_context(|| {
        format!(
            "failed to read issuer key from {} (run `otm-node init` first)",
            key_path.display()
        )
    })?;
    Keypair::from_hex(contents.trim())
        .with_context(|| format!("malformed issuer key in {}", key_path.display()))
}

/// Creates the data directory and writes a fresh issuer key.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("otm_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    tracing::info!(data_dir = %data_dir.display(), "initializing node");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = data_dir.join(KEY_FILE);
    if key_path.exists() && !args.force {
        bail!(
            "{} already exists; pass --force to replace it",
            key_path.display()
        );
    }

    let keypair = Keypair::generate();
    let pubkey_hex = keypair.public_key().to_hex();
    std::fs::write(&key_path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("failed to write issuer key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(
        public_key = %pubkey_hex,
        key_path = %key_path.display(),
        "issuer keypair generated"
    );

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Issuer key     : {}", key_path.display());
    println!("  Public key     : {}", pubkey_hex);

    Ok(())
}

fn print_version() {
    println!("otm-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol {}", otm_protocol::config::PROTOCOL_VERSION);
    println!("wire     v{}", otm_protocol::config::WIRE_FORMAT_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
