//! Tokenisation engine entry point.
//!
//! Runs the mint and invoice confirmation loops, the retention sweep, the
//! health monitor and the outbound gossip publisher against one SQLite store,
//! and exposes an Axum REST API for proposers, asset managers, the chain
//! scanner and peers.

mod api;
mod chain;
mod config;
mod confirmer;
mod crypto;
mod db;
mod errors;
mod gossip;
mod health;
mod invoices;
mod ledger;
mod mints;
mod models;
mod offers;
mod policy;
mod protocol;
mod retention;

#[cfg(test)]
mod test_confirmation;
#[cfg(test)]
mod test_ledger;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chain::{ChainNode, ChainRpcClient};
use config::Config;
use confirmer::{ConfirmerState, Pipeline};
use gossip::{GossipClient, GossipPublisher, HttpGossipClient, LogGossipClient};

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

    // HTTP client shared by the chain RPC and the gossip relay.
    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

    let token = CancellationToken::new();
    let mut tasks = Vec::new();

    // ─── Outbound gossip ──────────────────────────────────
    let (publisher, queue) = GossipPublisher::channel(config.gossip_queue_depth);
    let gossip_client: Arc<dyn GossipClient> = match &config.gossip_relay_url {
        Some(url) => {
            info!("Gossip relay: {url}");
            Arc::new(HttpGossipClient::new(client.clone(), url))
        }
        None => {
            info!("No gossip relay configured; outbound gossip is logged only");
            Arc::new(LogGossipClient)
        }
    };
    tasks.push(tokio::spawn(gossip::run_publisher(
        queue,
        gossip_client,
        token.clone(),
    )));

    // ─── Confirmation loops ───────────────────────────────
    let confirmer_state = Arc::new(ConfirmerState {
        pool: pool.clone(),
        poll_interval: Duration::from_secs(config.confirm_poll_interval_secs),
        batch_size: config.confirm_batch_size,
    });
    for pipeline in [Pipeline::Mint, Pipeline::Invoice] {
        tasks.push(tokio::spawn(confirmer::run(
            confirmer_state.clone(),
            pipeline,
            token.clone(),
        )));
    }

    // ─── Retention sweep ──────────────────────────────────
    let chain: Arc<dyn ChainNode> = Arc::new(ChainRpcClient::new(
        client,
        config.chain_rpc_url.clone(),
        config.chain_rpc_user.clone(),
        config.chain_rpc_password.clone(),
    ));
    tasks.push(tokio::spawn(retention::run(
        pool.clone(),
        chain.clone(),
        config.retention,
        Duration::from_secs(config.trim_interval_secs),
        token.clone(),
    )));

    // ─── Health monitor ───────────────────────────────────
    tasks.push(tokio::spawn(health::run(
        pool.clone(),
        chain,
        Duration::from_secs(config.health_interval_secs),
        token.clone(),
    )));

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(api::ApiState {
        pool,
        gossip: publisher,
        limits: config.limits,
    }));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    token.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Engine stopped");
    Ok(())
}
