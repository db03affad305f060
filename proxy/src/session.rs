//! Per-miner session state and the framed writer.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Mutex, RwLock};

use crate::protocol::Job;

/// Rolling window of accepted-share timestamps kept per miner.
pub const SHARE_TIMES_CAP: usize = 100;

/// Mutable miner state, guarded by the session's state lock.
#[derive(Debug)]
pub struct MinerState {
    pub id: String,
    pub agent: String,
    pub worker: String,
    pub address: String,
    pub difficulty: u64,
    pub current_job: Option<Job>,
    /// Random per-session value occupying the high 32 bits of every nonce
    /// this miner produces; keeps concurrent miners out of each other's
    /// search space on a shared seal hash.
    pub extra_nonce: u32,
    /// Miner nonces already submitted against the current job; cleared on
    /// every job change so a nonce can reach the chain at most once per job.
    pub seen_nonces: HashSet<u32>,
    pub last_activity: Instant,
    pub last_share_submit: Option<Instant>,
    pub share_times: VecDeque<Instant>,
    pub shares_valid: u64,
    pub shares_invalid: u64,
    pub invalid_streak: u64,
    pub total_difficulty: u64,
    pub blocks_found: u64,
    pub banned: bool,
    pub ban_reason: String,
    pub hashrate: f64,
}

impl MinerState {
    pub fn new(id: String, initial_difficulty: u64) -> Self {
        Self {
            id,
            agent: String::new(),
            worker: String::new(),
            address: String::new(),
            difficulty: initial_difficulty.max(1),
            current_job: None,
            extra_nonce: rand::random::<u32>(),
            seen_nonces: HashSet::new(),
            last_activity: Instant::now(),
            last_share_submit: None,
            share_times: VecDeque::with_capacity(SHARE_TIMES_CAP),
            shares_valid: 0,
            shares_invalid: 0,
            invalid_streak: 0,
            total_difficulty: 0,
            blocks_found: 0,
            banned: false,
            ban_reason: String::new(),
            hashrate: 0.0,
        }
    }

    /// Reset the per-job duplicate-nonce tracker when `job_id` differs from
    /// the job currently assigned. Call before installing a new job.
    pub fn job_changed(&mut self, job_id: &str) {
        let changed = self
            .current_job
            .as_ref()
            .map(|job| job.job_id != job_id)
            .unwrap_or(true);
        if changed {
            self.seen_nonces.clear();
        }
    }

    /// Record an accepted share's timestamp, keeping the last
    /// [`SHARE_TIMES_CAP`] entries.
    pub fn push_share_time(&mut self, at: Instant) {
        if self.share_times.len() == SHARE_TIMES_CAP {
            self.share_times.pop_front();
        }
        self.share_times.push_back(at);
    }
}

/// One live miner connection.
///
/// Two locks, never held together in the other order: the state lock guards
/// [`MinerState`]; the writer lock guards the outbound half so responses and
/// pushed jobs interleave at line granularity. Release state before taking
/// the writer.
pub struct Session {
    pub peer: SocketAddr,
    pub connected_at: Instant,
    pub state: RwLock<MinerState>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    /// Latest-job mailbox. The broker deposits here without blocking; the
    /// connection's pusher task delivers in order, coalescing intermediate
    /// jobs when the socket is slow.
    job_offer: watch::Sender<Option<Job>>,
}

impl Session {
    pub fn new(peer: SocketAddr, write_half: OwnedWriteHalf, state: MinerState) -> Self {
        let (job_offer, _) = watch::channel(None);
        Self {
            peer,
            connected_at: Instant::now(),
            state: RwLock::new(state),
            writer: Mutex::new(BufWriter::new(write_half)),
            job_offer,
        }
    }

    /// Deposit a job for delivery; overwrites any undelivered predecessor.
    pub fn offer_job(&self, job: Job) {
        self.job_offer.send_replace(Some(job));
    }

    /// Subscribe to the job mailbox (used by the per-connection pusher).
    pub fn job_offers(&self) -> watch::Receiver<Option<Job>> {
        self.job_offer.subscribe()
    }

    /// Serialise `value` and send it as one newline-terminated line.
    pub async fn send_line(&self, value: &Value) -> std::io::Result<()> {
        let mut encoded = serde_json::to_vec(value)?;
        encoded.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await
    }
}
