//! Share validation pipeline: rejection checks in cost order, vardiff
//! control, and escalation of network-grade shares into block submissions.

use std::time::{Duration, Instant};

use thiserror::Error;

use rxeth_engine::codec;
use rxeth_engine::types::{h256_from_hex, H256};

use crate::config::ProxyConfig;
use crate::rpc::RpcClient;
use crate::session::Session;
use crate::stats::Stats;
use crate::translator;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShareError {
    #[error("Banned: {0}")]
    Banned(String),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    #[error("Stale share")]
    Stale,
    #[error("Invalid nonce length")]
    InvalidNonceLength,
    #[error("Invalid nonce hex")]
    InvalidNonceHex,
    #[error("Duplicate share")]
    Duplicate,
    #[error("Invalid result hash")]
    InvalidResult,
    #[error("Share difficulty too low")]
    BelowDifficulty,
}

impl ShareError {
    /// Errors after which the connection is torn down.
    pub fn closes_connection(&self) -> bool {
        matches!(self, ShareError::Banned(_))
    }
}

#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub job_id: String,
    /// Miner nonce, 8 hex chars, little-endian.
    pub nonce: String,
    /// RandomX hash claimed by the miner, 64 hex chars.
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareOutcome {
    /// Set when vardiff moved the miner's difficulty; the caller re-pushes
    /// the current job with the new target.
    pub new_difficulty: Option<u64>,
    /// The full 64-bit nonce as the chain will see it.
    pub nonce64: u64,
    pub share_difficulty: u64,
    /// Whether the share also satisfied network difficulty and was
    /// forwarded as a block.
    pub submitted_block: bool,
}

/// Run one submission through the pipeline.
///
/// Bookkeeping happens under the session state lock; the chain RPC for a
/// block candidate runs after the lock is released.
pub async fn process_submit(
    cfg: &ProxyConfig,
    stats: &Stats,
    rpc: &RpcClient,
    session: &Session,
    submit: &SubmitParams,
) -> Result<ShareOutcome, ShareError> {
    let now = Instant::now();

    // Everything up to the block check mutates miner state atomically.
    let (nonce64, share_diff, hash, job, new_difficulty) = {
        let mut state = session.state.write().await;
        state.last_activity = now;

        if state.banned {
            stats.record_share(false);
            return Err(ShareError::Banned(state.ban_reason.clone()));
        }

        if cfg.share_rate_limit > 0.0 {
            if let Some(last) = state.last_share_submit {
                let min_gap = Duration::from_secs_f64(1.0 / cfg.share_rate_limit);
                if now.duration_since(last) < min_gap {
                    // Deliberately no last_share_submit update here: a
                    // flooder must not keep resetting its own window.
                    stats.record_share(false);
                    return Err(ShareError::RateLimitExceeded);
                }
            }
        }

        let job = match &state.current_job {
            Some(job) if job.job_id == submit.job_id => job.clone(),
            _ => {
                state.shares_invalid += 1;
                stats.record_share(false);
                return Err(ShareError::Stale);
            }
        };

        if submit.nonce.len() != 8 {
            state.shares_invalid += 1;
            stats.record_share(false);
            return Err(ShareError::InvalidNonceLength);
        }
        let miner_nonce = match hex::decode(&submit.nonce) {
            Ok(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Err(_) => {
                state.shares_invalid += 1;
                stats.record_share(false);
                return Err(ShareError::InvalidNonceHex);
            }
        };
        let nonce64 = codec::join_nonce(state.extra_nonce, miner_nonce);

        if !state.seen_nonces.insert(miner_nonce) {
            state.shares_invalid += 1;
            stats.record_share(false);
            return Err(ShareError::Duplicate);
        }

        let hash = match parse_result_hash(&submit.result) {
            Some(hash) => hash,
            None => {
                state.shares_invalid += 1;
                stats.record_share(false);
                return Err(ShareError::InvalidResult);
            }
        };

        let share_diff = codec::share_difficulty(&hash);
        if share_diff < state.difficulty {
            state.shares_invalid += 1;
            state.invalid_streak += 1;
            stats.record_share(false);
            if cfg.max_invalid_streak > 0 && state.invalid_streak >= cfg.max_invalid_streak {
                state.banned = true;
                state.ban_reason = format!(
                    "{} consecutive invalid shares",
                    state.invalid_streak
                );
                tracing::warn!(miner = %state.id, peer = %session.peer, "banned: {}", state.ban_reason);
            }
            return Err(ShareError::BelowDifficulty);
        }

        // Accepted.
        state.shares_valid += 1;
        state.invalid_streak = 0;
        state.total_difficulty = state.total_difficulty.saturating_add(state.difficulty);
        state.last_share_submit = Some(now);
        state.push_share_time(now);
        stats.record_share(true);

        if state.share_times.len() >= 2 {
            let first = *state.share_times.front().expect("non-empty");
            let last = *state.share_times.back().expect("non-empty");
            let span = last.duration_since(first).as_secs_f64();
            state.hashrate = translator::estimate_hashrate(
                state.difficulty.saturating_mul(state.share_times.len() as u64),
                span,
            );
        }

        // Vardiff: every `window` accepted shares, steer towards the target
        // share rate using the actual rate over the last window.
        let mut new_difficulty = None;
        let window = cfg.vardiff_window as usize;
        if window > 0
            && state.shares_valid % cfg.vardiff_window == 0
            && state.share_times.len() >= window
        {
            let window_start = state.share_times[state.share_times.len() - window];
            let minutes = now.duration_since(window_start).as_secs_f64() / 60.0;
            let rate_spm = window as f64 / minutes.max(1.0 / 600.0);
            let adjusted =
                translator::adjust_difficulty(state.difficulty, rate_spm, cfg.vardiff_target_spm());
            if adjusted != state.difficulty {
                tracing::debug!(
                    miner = %state.id,
                    "vardiff {} -> {} ({:.2} shares/min)",
                    state.difficulty,
                    adjusted,
                    rate_spm
                );
                state.difficulty = adjusted;
                new_difficulty = Some(adjusted);
            }
        }

        (nonce64, share_diff, hash, job, new_difficulty)
    };

    // Block candidate: the share also beats the network target.
    let mut submitted_block = false;
    if codec::meets_difficulty(&hash, job.difficulty) {
        let nonce_hex = format!("{nonce64:#018x}");
        let mix_hex = with_0x(&submit.result);
        match rpc.submit_work(&nonce_hex, &job.header_hash, &mix_hex).await {
            Ok(true) => {
                submitted_block = true;
                stats.record_block();
                let mut state = session.state.write().await;
                state.blocks_found += 1;
                tracing::info!(miner = %state.id, height = job.height, "🎉 block found");
            }
            Ok(false) => {
                // Pool-valid share, chain said no (usually a race with a
                // competing block). The share stays accepted.
                tracing::warn!(height = job.height, "chain rejected block candidate");
            }
            Err(e) => {
                tracing::warn!("block submission failed: {e:#}");
            }
        }
    }

    Ok(ShareOutcome {
        new_difficulty,
        nonce64,
        share_difficulty: share_diff,
        submitted_block,
    })
}

fn parse_result_hash(result: &str) -> Option<H256> {
    let trimmed = result.strip_prefix("0x").unwrap_or(result);
    if trimmed.len() != 64 {
        return None;
    }
    h256_from_hex(trimmed)
}

fn with_0x(hex_str: &str) -> String {
    if hex_str.starts_with("0x") {
        hex_str.to_string()
    } else {
        format!("0x{hex_str}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Opts;
    use crate::protocol::Job;
    use crate::session::MinerState;
    use clap::Parser;
    use rxeth_engine::U256;
    use std::time::Instant;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_session(initial_diff: u64) -> Session {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (_server_side, _) = listener.accept().await.unwrap();
        // Keep the server side alive by leaking it into the test runtime.
        tokio::spawn(async move {
            let _keep = _server_side;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let (_read, write) = client.into_split();
        let peer = addr;
        Session::new(peer, write, MinerState::new("test-miner".into(), initial_diff))
    }

    fn test_job(network_difficulty: u64) -> Job {
        Job {
            job_id: "1".into(),
            blob: "00".repeat(43),
            algo: "rx/0".into(),
            height: 1,
            seed_hash: format!("0x{}", "ab".repeat(32)),
            header_hash: format!("0x{}", "12".repeat(32)),
            difficulty: U256::from(network_difficulty),
            created_at: Instant::now(),
        }
    }

    fn cfg(max_invalid_streak: u64, share_rate_limit: f64) -> ProxyConfig {
        let opts = Opts::parse_from(["rxeth-proxy"]);
        let mut cfg = ProxyConfig::from(&opts);
        cfg.max_invalid_streak = max_invalid_streak;
        cfg.share_rate_limit = share_rate_limit;
        cfg
    }

    /// 64 hex chars whose big-endian value yields a share difficulty of
    /// roughly 2^256 / hash.
    fn low_diff_result() -> String {
        // Leading byte 0x02 -> share difficulty ~127, far below 10_000.
        format!("02{}", "00".repeat(31))
    }

    fn high_diff_result() -> String {
        // 2^16 leading zero bits -> share difficulty ~2^16 = 65536.
        format!("0000{}", "ff".repeat(30))
    }

    #[tokio::test]
    async fn stale_and_malformed_shares_are_rejected() {
        let cfg = cfg(0, 0.0);
        let stats = Stats::new();
        let rpc = RpcClient::new("http://127.0.0.1:1");
        let session = test_session(10_000).await;
        session.state.write().await.current_job = Some(test_job(u64::MAX));

        let stale = SubmitParams {
            job_id: "999".into(),
            nonce: "00000001".into(),
            result: high_diff_result(),
        };
        assert_eq!(
            process_submit(&cfg, &stats, &rpc, &session, &stale).await,
            Err(ShareError::Stale)
        );

        let short_nonce = SubmitParams {
            job_id: "1".into(),
            nonce: "0001".into(),
            result: high_diff_result(),
        };
        assert_eq!(
            process_submit(&cfg, &stats, &rpc, &session, &short_nonce).await,
            Err(ShareError::InvalidNonceLength)
        );

        let bad_hex = SubmitParams {
            job_id: "1".into(),
            nonce: "zzzzzzzz".into(),
            result: high_diff_result(),
        };
        assert_eq!(
            process_submit(&cfg, &stats, &rpc, &session, &bad_hex).await,
            Err(ShareError::InvalidNonceHex)
        );

        let state = session.state.read().await;
        assert_eq!(state.shares_invalid, 3);
        assert_eq!(state.invalid_streak, 0, "only difficulty failures streak");
    }

    #[tokio::test]
    async fn low_difficulty_streak_leads_to_ban() {
        let cfg = cfg(3, 0.0);
        let stats = Stats::new();
        let rpc = RpcClient::new("http://127.0.0.1:1");
        let session = test_session(10_000).await;
        session.state.write().await.current_job = Some(test_job(u64::MAX));

        let weak = |nonce: &str| SubmitParams {
            job_id: "1".into(),
            nonce: nonce.into(),
            result: low_diff_result(),
        };

        for nonce in ["00000001", "00000002"] {
            assert_eq!(
                process_submit(&cfg, &stats, &rpc, &session, &weak(nonce)).await,
                Err(ShareError::BelowDifficulty)
            );
            assert!(!session.state.read().await.banned);
        }

        // Third strike bans but still reports the difficulty error.
        assert_eq!(
            process_submit(&cfg, &stats, &rpc, &session, &weak("00000003")).await,
            Err(ShareError::BelowDifficulty)
        );
        assert!(session.state.read().await.banned);

        // Further submissions are refused outright.
        match process_submit(&cfg, &stats, &rpc, &session, &weak("00000004")).await {
            Err(ShareError::Banned(reason)) => assert!(reason.contains("invalid shares")),
            other => panic!("expected ban, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_nonce_per_job_is_rejected_once() {
        let cfg = cfg(0, 0.0);
        let stats = Stats::new();
        let rpc = RpcClient::new("http://127.0.0.1:1");
        let session = test_session(1_000).await;
        session.state.write().await.current_job = Some(test_job(u64::MAX));

        let good = SubmitParams {
            job_id: "1".into(),
            nonce: "00000001".into(),
            result: high_diff_result(),
        };
        process_submit(&cfg, &stats, &rpc, &session, &good)
            .await
            .unwrap();
        assert_eq!(
            process_submit(&cfg, &stats, &rpc, &session, &good).await,
            Err(ShareError::Duplicate)
        );
    }

    #[tokio::test]
    async fn valid_share_updates_bookkeeping_and_streak_resets() {
        let cfg = cfg(3, 0.0);
        let stats = Stats::new();
        let rpc = RpcClient::new("http://127.0.0.1:1");
        // Pool difficulty 1000; network difficulty far out of reach so no
        // RPC is attempted.
        let session = test_session(1_000).await;
        session.state.write().await.current_job = Some(test_job(u64::MAX));

        let weak = SubmitParams {
            job_id: "1".into(),
            nonce: "00000001".into(),
            result: low_diff_result(),
        };
        let good = SubmitParams {
            job_id: "1".into(),
            nonce: "78563412".into(),
            result: high_diff_result(),
        };

        process_submit(&cfg, &stats, &rpc, &session, &weak)
            .await
            .unwrap_err();
        let outcome = process_submit(&cfg, &stats, &rpc, &session, &good)
            .await
            .unwrap();
        assert!(!outcome.submitted_block);
        assert!(outcome.share_difficulty >= 1_000);

        let state = session.state.read().await;
        let extra = state.extra_nonce;
        assert_eq!(outcome.nonce64, ((extra as u64) << 32) | 0x1234_5678);
        assert_eq!(state.shares_valid, 1);
        assert_eq!(state.invalid_streak, 0);
        assert_eq!(state.total_difficulty, 1_000);
        assert_eq!(state.share_times.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_refuses_fast_resubmission_without_resetting_window() {
        // One share per 1000 seconds allowed.
        let cfg = cfg(0, 0.001);
        let stats = Stats::new();
        let rpc = RpcClient::new("http://127.0.0.1:1");
        let session = test_session(1_000).await;
        session.state.write().await.current_job = Some(test_job(u64::MAX));

        let good = SubmitParams {
            job_id: "1".into(),
            nonce: "00000001".into(),
            result: high_diff_result(),
        };

        process_submit(&cfg, &stats, &rpc, &session, &good)
            .await
            .unwrap();
        let before = session.state.read().await.last_share_submit;

        assert_eq!(
            process_submit(&cfg, &stats, &rpc, &session, &good).await,
            Err(ShareError::RateLimitExceeded)
        );
        let after = session.state.read().await.last_share_submit;
        assert_eq!(before, after, "refusal must not move the window");
    }
}
