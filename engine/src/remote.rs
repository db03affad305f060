//! Remote sealer: the work queue between the engine and external miners.
//!
//! A single actor task owns all mutable state (pending works, reported
//! hashrates, the current head) and serialises access through a command
//! channel, so sessions and RPC handlers never hold a reference to the
//! engine itself -- they hold a cheap cloneable handle to this queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::codec;
use crate::engine::Engine;
use crate::error::PowError;
use crate::types::{h256_from_hex, h256_to_hex, ChainContext, Header, WorkPackage, H256};

/// Pending works older than this many heights behind the head are dropped.
const STALE_WORK_DEPTH: u64 = 10;
/// Reported hashrates older than this are dropped.
const HASHRATE_TTL: Duration = Duration::from_secs(10);
/// Housekeeping interval.
const TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Command queue depth.
const COMMAND_BUFFER: usize = 64;
/// Per-subscriber notification buffer; overflow drops the notification.
const SUBSCRIBER_BUFFER: usize = 4;

enum Command {
    NewWork {
        header: Header,
    },
    FetchWork {
        reply: oneshot::Sender<Option<WorkPackage>>,
    },
    SubmitSolution {
        nonce: u64,
        mix_digest: H256,
        header_hash: H256,
        reply: oneshot::Sender<Result<(), PowError>>,
    },
    SubmitHashrate {
        id: H256,
        rate: u64,
    },
    FetchHashrate {
        reply: oneshot::Sender<u64>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::Receiver<WorkPackage>>,
    },
    Exit,
}

/// Cloneable handle to the sealer actor.
#[derive(Clone)]
pub struct RemoteSealer {
    commands: mpsc::Sender<Command>,
}

struct SealerState {
    engine: Arc<Engine>,
    chain: Arc<dyn ChainContext>,
    /// Sealed blocks flow back to the node through this channel.
    results: mpsc::Sender<Header>,
    current: Option<(Header, WorkPackage)>,
    works: HashMap<H256, Header>,
    rates: HashMap<H256, (u64, Instant)>,
    subscribers: Vec<mpsc::Sender<WorkPackage>>,
}

impl RemoteSealer {
    /// Spawn the actor. `results` receives fully sealed headers.
    pub fn start(
        engine: Arc<Engine>,
        chain: Arc<dyn ChainContext>,
        results: mpsc::Sender<Header>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let state = SealerState {
            engine,
            chain,
            results,
            current: None,
            works: HashMap::new(),
            rates: HashMap::new(),
            subscribers: Vec::new(),
        };
        tokio::spawn(run(state, rx));
        Self { commands: tx }
    }

    /// Feed a new pending block in from the node's miner.
    pub async fn new_work(&self, header: Header) {
        let _ = self.commands.send(Command::NewWork { header }).await;
    }

    /// Current work package for getWork, if any.
    pub async fn fetch_work(&self) -> Option<WorkPackage> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::FetchWork { reply: tx })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Verify and hand off an external miner's solution.
    pub async fn submit_solution(
        &self,
        nonce: u64,
        mix_digest: H256,
        header_hash: H256,
    ) -> Result<(), PowError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SubmitSolution {
                nonce,
                mix_digest,
                header_hash,
                reply: tx,
            })
            .await
            .map_err(|_| PowError::UnknownWork)?;
        rx.await.map_err(|_| PowError::UnknownWork)?
    }

    /// Record a miner-reported hashrate under `id`.
    pub async fn submit_hashrate(&self, id: H256, rate: u64) {
        let _ = self.commands.send(Command::SubmitHashrate { id, rate }).await;
    }

    /// Sum of live reported hashrates.
    pub async fn fetch_hashrate(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::FetchHashrate { reply: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Subscribe to new-work notifications. Slow subscribers lose
    /// intermediate packages; the next new work re-attempts delivery.
    pub async fn subscribe(&self) -> Option<mpsc::Receiver<WorkPackage>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { reply: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Stop the actor.
    pub async fn exit(&self) {
        let _ = self.commands.send(Command::Exit).await;
    }
}

async fn run(mut state: SealerState, mut commands: mpsc::Receiver<Command>) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::NewWork { header }) => state.on_new_work(header),
                    Some(Command::FetchWork { reply }) => {
                        let _ = reply.send(state.current.as_ref().map(|(_, w)| w.clone()));
                    }
                    Some(Command::SubmitSolution { nonce, mix_digest, header_hash, reply }) => {
                        let _ = reply.send(state.on_submit(nonce, mix_digest, header_hash).await);
                    }
                    Some(Command::SubmitHashrate { id, rate }) => {
                        state.rates.insert(id, (rate, Instant::now()));
                    }
                    Some(Command::FetchHashrate { reply }) => {
                        let now = Instant::now();
                        let total = state
                            .rates
                            .values()
                            .filter(|(_, at)| now.duration_since(*at) < HASHRATE_TTL)
                            .map(|(rate, _)| rate)
                            .sum();
                        let _ = reply.send(total);
                    }
                    Some(Command::Subscribe { reply }) => {
                        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                        state.subscribers.push(tx);
                        let _ = reply.send(rx);
                    }
                    Some(Command::Exit) | None => break,
                }
            }
            _ = tick.tick() => state.evict_stale(),
        }
    }
}

impl SealerState {
    fn on_new_work(&mut self, header: Header) {
        // A sibling of stale ancestry must not displace the current head's
        // work; a descendant (higher number) always may.
        if let Some((current, _)) = &self.current {
            if header.parent_hash != current.parent_hash && header.number <= current.number {
                log::debug!(
                    "discarding stale work for block {} (head {})",
                    header.number,
                    current.number
                );
                return;
            }
        }

        let package = match self.make_package(&header) {
            Ok(package) => package,
            Err(e) => {
                log::warn!("cannot package work for block {}: {e}", header.number);
                return;
            }
        };

        let seal_hash = self.chain.seal_hash(&header);
        self.works.insert(seal_hash, header.clone());
        self.current = Some((header, package.clone()));

        self.subscribers.retain(|subscriber| {
            match subscriber.try_send(package.clone()) {
                Ok(()) => true,
                // Full buffer: drop this notification, keep the subscriber.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn make_package(&self, header: &Header) -> Result<WorkPackage, PowError> {
        let seal_hash = self.chain.seal_hash(header);
        let seed = self.chain.seed_hash(header.number)?;
        let target =
            codec::target_from_difficulty(header.difficulty).ok_or(PowError::ZeroDifficulty)?;
        let mut target_bytes = [0u8; 32];
        target.to_big_endian(&mut target_bytes);

        Ok(WorkPackage {
            header_hash: h256_to_hex(&seal_hash),
            seed_hash: h256_to_hex(&seed),
            target: format!("0x{}", hex::encode(target_bytes)),
            block_number: format!("{:#x}", header.number),
        })
    }

    async fn on_submit(
        &mut self,
        nonce: u64,
        mix_digest: H256,
        header_hash: H256,
    ) -> Result<(), PowError> {
        let header = self.works.get(&header_hash).ok_or(PowError::UnknownWork)?;

        let mut sealed = header.clone();
        sealed.nonce = nonce;
        sealed.mix_digest = mix_digest;

        // Full verification; blocks the actor for one RandomX hash, which is
        // fine at the rate real solutions arrive.
        self.engine.verify(self.chain.as_ref(), header_hash, &sealed)?;

        log::info!(
            "accepted external seal for block {} (nonce {:#018x})",
            sealed.number,
            nonce
        );
        let _ = self.results.send(sealed).await;
        self.works.remove(&header_hash);
        Ok(())
    }

    fn evict_stale(&mut self) {
        let head = match &self.current {
            Some((header, _)) => header.number,
            None => return,
        };
        self.works
            .retain(|_, header| header.number + STALE_WORK_DEPTH >= head);
        let now = Instant::now();
        self.rates
            .retain(|_, (_, at)| now.duration_since(*at) < HASHRATE_TTL);
    }
}

/// Parse the wire form of a submitted solution (`eth_submitWork` params).
pub fn parse_submission(
    nonce_hex: &str,
    header_hash_hex: &str,
    mix_hex: &str,
) -> Option<(u64, H256, H256)> {
    let nonce_hex = nonce_hex.strip_prefix("0x").unwrap_or(nonce_hex);
    if nonce_hex.len() != 16 {
        return None;
    }
    let nonce = u64::from_str_radix(nonce_hex, 16).ok()?;
    let header_hash = h256_from_hex(header_hash_hex)?;
    let mix = h256_from_hex(mix_hex)?;
    Some((nonce, header_hash, mix))
}
