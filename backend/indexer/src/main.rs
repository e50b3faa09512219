//! FundChain mirror sync entry point.
//!
//! Starts a background indexer task that follows the FundChain contract's
//! events over JSON-RPC and reconciles them into SQLite. Simultaneously
//! exposes a small Axum REST + WebSocket API for the frontend.

mod abi;
mod api;
mod config;
mod db;
mod engine;
mod errors;
mod events;
mod indexer;
mod models;
mod normalize;
mod notifier;
mod rpc;
mod scanner;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use engine::Reconciler;
use indexer::IndexerState;
use notifier::ChangeNotifier;
use rpc::{ChainClient, RpcChainClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let client = Client::builder()
        .timeout(Duration::from_secs(config.rpc_timeout_secs))
        .build()?;
    let chain: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(
        client,
        &config.rpc_url,
        &config.contract_address,
    ));

    let notifier = ChangeNotifier::new();
    let reconciler = Arc::new(Reconciler::new(
        pool.clone(),
        notifier.clone(),
        config.recent_donations,
    ));
    let cancel = CancellationToken::new();

    // ─── Background indexer ───────────────────────────────
    info!(
        "Following contract {} via {}",
        config.contract_address, config.rpc_url
    );
    let indexer_state = Arc::new(IndexerState {
        chain: chain.clone(),
        reconciler: reconciler.clone(),
        poll_interval: Duration::from_secs(config.poll_interval_secs),
        catch_up_window: config.catch_up_window,
    });
    let indexer_task = tokio::spawn(indexer::run(indexer_state, cancel.clone()));

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(api::ApiState {
        pool,
        reconciler,
        chain,
        notifier,
    }));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let _ = indexer_task.await;
    Ok(())
}
