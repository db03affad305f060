//! Pool counters, the periodic console report, and the HTTP stats API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;

use crate::server::StratumServer;

/// A miner counts as active if it spoke within this window.
const ACTIVE_WINDOW: Duration = Duration::from_secs(120);
/// Console report cadence.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

pub struct Stats {
    started_at: Instant,
    total_shares: AtomicU64,
    valid_shares: AtomicU64,
    invalid_shares: AtomicU64,
    blocks_found: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub total_shares: u64,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub blocks_found: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_shares: AtomicU64::new(0),
            valid_shares: AtomicU64::new(0),
            invalid_shares: AtomicU64::new(0),
            blocks_found: AtomicU64::new(0),
        }
    }

    pub fn record_share(&self, valid: bool) {
        self.total_shares.fetch_add(1, Ordering::Relaxed);
        if valid {
            self.valid_shares.fetch_add(1, Ordering::Relaxed);
        } else {
            self.invalid_shares.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_block(&self) {
        self.blocks_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.started_at.elapsed(),
            total_shares: self.total_shares.load(Ordering::Relaxed),
            valid_shares: self.valid_shares.load(Ordering::Relaxed),
            invalid_shares: self.invalid_shares.load(Ordering::Relaxed),
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic console report: miner counts, aggregate hashrate, share totals.
pub async fn run_reporter(server: Arc<StratumServer>) {
    let mut interval = tokio::time::interval(REPORT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the log starts quiet.
    interval.tick().await;

    loop {
        interval.tick().await;
        report_once(&server).await;
    }
}

async fn report_once(server: &Arc<StratumServer>) {
    let sessions = server.session_list().await;
    let now = Instant::now();

    let mut active = 0usize;
    let mut hashrate = 0.0f64;
    let mut contributions: Vec<(String, u64)> = Vec::new();
    let mut total_contribution: u64 = 0;

    for session in &sessions {
        let state = session.state.read().await;
        if now.duration_since(state.last_activity) < ACTIVE_WINDOW {
            active += 1;
            hashrate += state.hashrate;
        }
        if state.total_difficulty > 0 {
            contributions.push((state.address.clone(), state.total_difficulty));
            total_contribution = total_contribution.saturating_add(state.total_difficulty);
        }
    }

    let snap = server.stats().snapshot();
    tracing::info!(
        "📊 miners={}/{} hashrate={:.2} H/s shares={}/{}/{} blocks={} uptime={}s",
        active,
        sessions.len(),
        hashrate,
        snap.valid_shares,
        snap.invalid_shares,
        snap.total_shares,
        snap.blocks_found,
        snap.uptime.as_secs()
    );

    if server.config().verbose && total_contribution > 0 {
        for (address, contributed) in contributions {
            let percent = contributed as f64 / total_contribution as f64 * 100.0;
            tracing::info!("  ⛏ {address}: {percent:.1}% of pool work");
        }
    }
}

/// HTTP surface: a single JSON stats endpoint.
pub fn router(server: Arc<StratumServer>) -> Router {
    Router::new()
        .route("/stats", get(api_stats))
        .with_state(server)
}

async fn api_stats(State(server): State<Arc<StratumServer>>) -> Json<serde_json::Value> {
    let sessions = server.session_list().await;
    let now = Instant::now();
    let mut active = 0usize;
    let mut hashrate = 0.0f64;
    for session in &sessions {
        let state = session.state.read().await;
        if now.duration_since(state.last_activity) < ACTIVE_WINDOW {
            active += 1;
            hashrate += state.hashrate;
        }
    }
    let snap = server.stats().snapshot();
    Json(json!({
        "miners": { "connected": sessions.len(), "active": active },
        "hashrate": hashrate,
        "shares": {
            "total": snap.total_shares,
            "valid": snap.valid_shares,
            "invalid": snap.invalid_shares,
        },
        "blocks_found": snap.blocks_found,
        "uptime_secs": snap.uptime.as_secs(),
    }))
}
