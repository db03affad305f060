use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use rxeth_proxy::config::{Opts, ProxyConfig};
use rxeth_proxy::server::StratumServer;
use rxeth_proxy::stats;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    let cfg = ProxyConfig::from(&opts);

    let default_level = if cfg.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    tracing::info!("🚀 rxeth stratum proxy — RandomX mining bridge (xmrig compatible)");
    tracing::info!("🔗 chain node: {}", cfg.geth_rpc);
    tracing::info!("⚙ algo={} initial_diff={}", cfg.algo, cfg.initial_diff);
    tracing::info!(
        "⚙ vardiff: target {:.1}s, window {} shares",
        cfg.vardiff_target_secs,
        cfg.vardiff_window
    );
    if cfg.max_invalid_streak > 0 {
        tracing::info!("🛡 ban after {} consecutive invalid shares", cfg.max_invalid_streak);
    } else {
        tracing::info!("🛡 ban system disabled");
    }
    match &cfg.pool_addr {
        Some(addr) => tracing::info!("💰 pool address {addr} (fee {:.2}%)", cfg.pool_fee),
        None => tracing::warn!("no pool address configured, using miner addresses directly"),
    }

    let server = StratumServer::new(cfg.clone());

    // Fail fast when the node is unreachable rather than serving dead jobs.
    server
        .rpc()
        .check_connection()
        .await
        .context("chain node RPC check failed")?;
    tracing::info!("✅ chain node RPC reachable");

    let addr = server.start().await?;
    tracing::info!("⛏ stratum ready on {addr}");

    tokio::spawn(stats::run_reporter(Arc::clone(&server)));

    let api_listener = tokio::net::TcpListener::bind(&cfg.api_listen)
        .await
        .with_context(|| format!("failed to bind stats API on {}", cfg.api_listen))?;
    tracing::info!("📡 stats API on {}", cfg.api_listen);
    let api = stats::router(Arc::clone(&server));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(api_listener, api).await {
            tracing::error!("stats API error: {e}");
        }
    });

    shutdown_signal().await;
    tracing::info!("🛑 shutting down");
    server.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to register Ctrl+C handler");
    }
}
