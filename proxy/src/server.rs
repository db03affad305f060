//! Stratum server and job broker.
//!
//! One tokio task per miner connection, a 1 s work poller against the chain
//! node, and fan-out of fresh jobs to every live session. Each session's
//! socket writer is guarded by its own lock so server-pushed jobs and
//! request responses interleave cleanly (see [`crate::session::Session`]).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use uuid::Uuid;

use rxeth_engine::codec;
use rxeth_engine::WorkPackage;

use crate::config::ProxyConfig;
use crate::protocol::{job_notification, Job, JobResponse, StratumRequest, StratumResponse};
use crate::rpc::RpcClient;
use crate::session::{MinerState, Session};
use crate::shares::{self, SubmitParams};
use crate::stats::Stats;
use crate::translator;

/// Absolute lifetime of a connection.
const CONNECTION_TTL: Duration = Duration::from_secs(3600);
/// Per-read deadline.
const READ_DEADLINE: Duration = Duration::from_secs(300);
/// Work polling cadence.
const WORK_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Aggregate hashrate reporting cadence.
const HASHRATE_REPORT_INTERVAL: Duration = Duration::from_secs(60);

struct CurrentWork {
    work: WorkPackage,
    job: Job,
}

pub struct StratumServer {
    cfg: ProxyConfig,
    rpc: Arc<RpcClient>,
    stats: Stats,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    current: RwLock<Option<CurrentWork>>,
    job_counter: AtomicU64,
    connection_count: Mutex<usize>,
    /// Guards against overlapping work polls when the node is slow.
    poll_in_flight: AtomicBool,
    shutdown: watch::Sender<bool>,
}

struct RequestOutcome {
    response: Option<StratumResponse>,
    close: bool,
    /// Job to re-push after the response goes out (vardiff retarget).
    push_after: Option<Job>,
}

impl RequestOutcome {
    fn reply(response: StratumResponse) -> Self {
        Self {
            response: Some(response),
            close: false,
            push_after: None,
        }
    }
}

impl StratumServer {
    pub fn new(cfg: ProxyConfig) -> Arc<Self> {
        let rpc = Arc::new(RpcClient::new(cfg.geth_rpc.clone()));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            rpc,
            stats: Stats::new(),
            sessions: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            job_counter: AtomicU64::new(0),
            connection_count: Mutex::new(0),
            poll_in_flight: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.cfg
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub async fn session_list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Bind the stratum listener, prime the first work package, and spawn
    /// the accept loop plus background pollers. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.cfg.listen)
            .await
            .with_context(|| format!("failed to listen on {}", self.cfg.listen))?;
        let addr = listener.local_addr()?;

        // Prime the job so the first login does not race the poller.
        self.update_work().await;

        tokio::spawn(Arc::clone(self).accept_loop(listener));
        tokio::spawn(Arc::clone(self).work_updater());
        tokio::spawn(Arc::clone(self).hashrate_reporter());

        tracing::info!("⛏ stratum listening on {addr}");
        Ok(addr)
    }

    /// Signal every background task and connection loop to wind down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("accept error: {e}");
                            continue;
                        }
                    };

                    if self.cfg.max_connections > 0 {
                        let mut count = self.connection_count.lock().await;
                        if *count >= self.cfg.max_connections {
                            tracing::warn!("connection limit reached, dropping {peer}");
                            continue;
                        }
                        *count += 1;
                    }

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                        if server.cfg.max_connections > 0 {
                            *server.connection_count.lock().await -= 1;
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let session_id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(
            peer,
            write_half,
            MinerState::new(session_id.clone(), self.cfg.initial_diff),
        ));

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::clone(&session));
        tracing::debug!("🔌 connection from {peer} ({session_id})");

        // Single pusher per connection: jobs offered by the broker reach the
        // miner in order, newest-wins when the socket lags.
        let pusher = {
            let session = Arc::clone(&session);
            let mut offers = session.job_offers();
            tokio::spawn(async move {
                while offers.changed().await.is_ok() {
                    let job = offers.borrow_and_update().clone();
                    let Some(job) = job else { continue };
                    if session.state.read().await.banned {
                        continue;
                    }
                    if let Err(e) = push_job(&session, &job).await {
                        tracing::debug!("job push to {} failed: {e}", session.peer);
                        break;
                    }
                }
            })
        };

        let deadline = Instant::now() + CONNECTION_TTL;
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => left.min(READ_DEADLINE),
                _ => {
                    tracing::debug!("connection deadline reached for {peer}");
                    break;
                }
            };

            line.clear();
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = timeout(remaining, reader.read_line(&mut line)) => read,
            };

            match read {
                Err(_) => {
                    tracing::debug!("read deadline exceeded for {peer}");
                    break;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::debug!("read error from {peer}: {e}");
                    break;
                }
            }

            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }

            let request: StratumRequest = match serde_json::from_str(raw) {
                Ok(request) => request,
                Err(e) => {
                    // Malformed frame; the connection itself stays usable.
                    tracing::warn!("invalid json from {peer}: {e}");
                    continue;
                }
            };

            let outcome = self.handle_request(&session, &request).await;

            if let Some(response) = outcome.response {
                let encoded = match serde_json::to_value(&response) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::error!("response encoding failed: {e}");
                        break;
                    }
                };
                if self.cfg.verbose {
                    tracing::debug!("📤 [{peer}] {encoded}");
                }
                if session.send_line(&encoded).await.is_err() {
                    break;
                }
            }

            if let Some(job) = outcome.push_after {
                if push_job(&session, &job).await.is_err() {
                    break;
                }
            }

            if outcome.close {
                break;
            }
        }

        pusher.abort();
        self.sessions.write().await.remove(&session_id);
        tracing::debug!("👋 {peer} disconnected ({session_id})");
    }

    async fn handle_request(
        self: &Arc<Self>,
        session: &Arc<Session>,
        request: &StratumRequest,
    ) -> RequestOutcome {
        if self.cfg.verbose {
            tracing::debug!("📩 [{}] {} {}", session.peer, request.method, request.params);
        }
        session.state.write().await.last_activity = Instant::now();

        match request.method.as_str() {
            "login" => self.handle_login(session, request).await,
            "submit" => self.handle_submit(session, request).await,
            "keepalived" => RequestOutcome::reply(StratumResponse::ok(
                request.id.clone(),
                json!({"status": "KEEPALIVED"}),
            )),
            other => RequestOutcome::reply(StratumResponse::err(
                request.id.clone(),
                format!("Unknown method: {other}"),
            )),
        }
    }

    async fn handle_login(
        self: &Arc<Self>,
        session: &Arc<Session>,
        request: &StratumRequest,
    ) -> RequestOutcome {
        let params = match request.params_object() {
            Some(params) => params,
            None => {
                return RequestOutcome::reply(StratumResponse::err(
                    request.id.clone(),
                    "Missing login parameters",
                ))
            }
        };

        let login = params.get("login").and_then(Value::as_str).unwrap_or("");
        let pass = params.get("pass").and_then(Value::as_str).unwrap_or("");
        let agent = params.get("agent").and_then(Value::as_str).unwrap_or("");

        let job = self
            .current
            .read()
            .await
            .as_ref()
            .map(|current| current.job.clone());
        let Some(job) = job else {
            return RequestOutcome::reply(StratumResponse::err(
                request.id.clone(),
                "No work available",
            ));
        };

        let (session_id, job_response) = {
            let mut state = session.state.write().await;
            state.address = login.to_string();
            state.worker = pass.to_string();
            state.agent = agent.to_string();
            state.job_changed(&job.job_id);
            state.current_job = Some(job.clone());
            let response = match job_response_for(&job, state.extra_nonce, state.difficulty) {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!("blob construction failed: {e:#}");
                    return RequestOutcome::reply(StratumResponse::err(
                        request.id.clone(),
                        "Internal error",
                    ));
                }
            };
            (state.id.clone(), response)
        };

        tracing::info!("✅ miner login {login} ({agent}) from {}", session.peer);

        RequestOutcome::reply(StratumResponse::ok(
            request.id.clone(),
            json!({
                "id": session_id,
                "job": job_response,
                "status": "OK",
                "extensions": ["keepalive", "algo"],
            }),
        ))
    }

    async fn handle_submit(
        self: &Arc<Self>,
        session: &Arc<Session>,
        request: &StratumRequest,
    ) -> RequestOutcome {
        let params = match request.params_object() {
            Some(params) => params,
            None => {
                return RequestOutcome::reply(StratumResponse::err(
                    request.id.clone(),
                    "Missing submit parameters",
                ))
            }
        };

        let field = |name: &str| {
            params
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let (Some(job_id), Some(nonce), Some(result)) =
            (field("job_id"), field("nonce"), field("result"))
        else {
            return RequestOutcome::reply(StratumResponse::err(
                request.id.clone(),
                "Missing submit parameters",
            ));
        };

        let submit = SubmitParams {
            job_id,
            nonce,
            result,
        };

        match shares::process_submit(&self.cfg, &self.stats, &self.rpc, session, &submit).await {
            Ok(outcome) => {
                if self.cfg.verbose {
                    tracing::debug!(
                        "share accepted from {} (diff {}, nonce {:#018x})",
                        session.peer,
                        outcome.share_difficulty,
                        outcome.nonce64
                    );
                }

                // A retarget re-aims the miner immediately rather than
                // waiting for the next block.
                let push_after = if outcome.new_difficulty.is_some() {
                    session.state.read().await.current_job.clone()
                } else {
                    None
                };

                RequestOutcome {
                    response: Some(StratumResponse::ok(
                        request.id.clone(),
                        json!({"status": "OK"}),
                    )),
                    close: false,
                    push_after,
                }
            }
            Err(share_error) => RequestOutcome {
                response: Some(StratumResponse::err(
                    request.id.clone(),
                    share_error.to_string(),
                )),
                close: share_error.closes_connection(),
                push_after: None,
            },
        }
    }

    async fn work_updater(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(WORK_POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    // Never queue polls behind a slow node.
                    if self
                        .poll_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.update_work().await;
                        self.poll_in_flight.store(false, Ordering::Release);
                    }
                }
            }
        }
    }

    async fn update_work(self: &Arc<Self>) {
        let work = match self.rpc.get_work().await {
            Ok(work) => work,
            Err(e) => {
                if self.cfg.verbose {
                    tracing::debug!("getWork failed: {e:#}");
                }
                return;
            }
        };

        {
            let current = self.current.read().await;
            if let Some(current) = current.as_ref() {
                if current.work.header_hash == work.header_hash {
                    return;
                }
            }
        }

        let job_id = self
            .job_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
            .to_string();
        let job = match translator::work_to_job(&work, job_id, &self.cfg.algo) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("failed to build job: {e:#}");
                return;
            }
        };

        tracing::info!(
            "📦 new job {} for block {} (seed {}…)",
            job.job_id,
            job.height,
            &job.seed_hash[..job.seed_hash.len().min(18)]
        );

        *self.current.write().await = Some(CurrentWork {
            work,
            job: job.clone(),
        });

        self.broadcast_job(job).await;
    }

    /// Fan a job out by depositing it into every session's mailbox. Never
    /// blocks on a slow socket; each session's pusher task takes it from
    /// there.
    async fn broadcast_job(self: &Arc<Self>, job: Job) {
        for session in self.session_list().await {
            session.offer_job(job.clone());
        }
    }

    /// Periodically report the pool's aggregate hashrate to the node.
    async fn hashrate_reporter(self: Arc<Self>) {
        let id = format!("0x{}", hex::encode(rand::random::<[u8; 32]>()));
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(HASHRATE_REPORT_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let mut total = 0.0f64;
                    for session in self.session_list().await {
                        total += session.state.read().await.hashrate;
                    }
                    if total > 0.0 {
                        if let Err(e) = self.rpc.submit_hashrate(total as u64, &id).await {
                            tracing::debug!("hashrate report failed: {e:#}");
                        }
                    }
                }
            }
        }
    }
}

/// Deliver `job` to one session: record it as the miner's current job, build
/// the per-session blob and target, then write the notification. State lock
/// is released before the writer lock is taken.
pub async fn push_job(session: &Arc<Session>, job: &Job) -> std::io::Result<()> {
    let (extra_nonce, difficulty) = {
        let mut state = session.state.write().await;
        state.job_changed(&job.job_id);
        state.current_job = Some(job.clone());
        (state.extra_nonce, state.difficulty)
    };

    let response = job_response_for(job, extra_nonce, difficulty)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    session.send_line(&job_notification(&response)).await
}

/// Render a job for one miner: its own extra nonce in the blob, its own
/// pool difficulty as the target (never the network target).
fn job_response_for(job: &Job, extra_nonce: u32, difficulty: u64) -> Result<JobResponse> {
    let blob = translator::create_blob_rxeth(&job.header_hash, extra_nonce)?;
    let seed_hash = job
        .seed_hash
        .strip_prefix("0x")
        .unwrap_or(&job.seed_hash)
        .to_string();
    Ok(JobResponse {
        job_id: job.job_id.clone(),
        algo: job.algo.clone(),
        seed_hash,
        height: job.height,
        blob,
        target: codec::stratum_target_hex(difficulty),
        clean_jobs: true,
    })
}
