//! The proof-of-work engine: header verification and local sealing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::cache::BoundedCache;
use crate::codec;
use crate::epoch::EpochManager;
use crate::error::PowError;
use crate::types::{ChainContext, Header, H256, U256};
use crate::vm_pool::{self, VmPool};

/// Number of recently verified seals remembered by the DoS guard.
const SEEN_CACHE_SIZE: usize = 1024;
/// Number of recently rejected seals remembered by the DoS guard.
const FAIL_CACHE_SIZE: usize = 256;
/// Hashes between stop-signal polls in the mining loop.
const STOP_POLL_INTERVAL: u64 = 1024;

/// Operating mode of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowMode {
    /// Production: probed flags, dataset permitted.
    Normal,
    /// Tests: cache-only, no dataset build.
    Test,
}

/// Seal/verify behaviour injected for tests and development tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowBehaviour {
    /// Real proof-of-work.
    Normal,
    /// Accept every seal and emit zero-nonce blocks instantly.
    FakeAllValid,
    /// As `FakeAllValid`, but fail for one specific block number.
    FakeFailAt(u64),
    /// As `FakeAllValid`, with an artificial delay before answering.
    FakeDelay(Duration),
    /// Accept absolutely everything, skipping even the cheap checks.
    FakeFullBypass,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: PowMode,
    /// Never build the dataset; mine and verify against the cache alone.
    pub light_mode: bool,
    /// Bounded size of the mining VM pool.
    pub vm_pool_size: usize,
    pub behaviour: PowBehaviour,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: PowMode::Normal,
            light_mode: false,
            vm_pool_size: num_cpus::get(),
            behaviour: PowBehaviour::Normal,
        }
    }
}

type SealKey = (H256, u64);

pub struct Engine {
    config: EngineConfig,
    epoch: Arc<EpochManager>,
    pool: VmPool,
    seen: Mutex<BoundedCache<SealKey, ()>>,
    failed: Mutex<BoundedCache<SealKey, PowError>>,
    aborted: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let dataset_wanted = config.mode == PowMode::Normal && !config.light_mode;
        Self {
            epoch: EpochManager::new(dataset_wanted),
            pool: VmPool::new(config.vm_pool_size),
            seen: Mutex::new(BoundedCache::new(SEEN_CACHE_SIZE)),
            failed: Mutex::new(BoundedCache::new(FAIL_CACHE_SIZE)),
            aborted: AtomicBool::new(false),
            config,
        }
    }

    fn with_behaviour(behaviour: PowBehaviour) -> Self {
        Self::new(EngineConfig {
            mode: PowMode::Test,
            light_mode: true,
            vm_pool_size: 1,
            behaviour,
        })
    }

    /// Engine that accepts every seal as valid.
    pub fn faker() -> Self {
        Self::with_behaviour(PowBehaviour::FakeAllValid)
    }

    /// Engine that accepts everything except block `number`.
    pub fn fake_failer(number: u64) -> Self {
        Self::with_behaviour(PowBehaviour::FakeFailAt(number))
    }

    /// Engine that accepts everything after sleeping `delay`.
    pub fn fake_delayer(delay: Duration) -> Self {
        Self::with_behaviour(PowBehaviour::FakeDelay(delay))
    }

    /// Engine that bypasses every check whatsoever.
    pub fn full_faker() -> Self {
        Self::with_behaviour(PowBehaviour::FakeFullBypass)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether dataset acceleration has been permanently disabled.
    pub fn dataset_disabled(&self) -> bool {
        self.epoch.dataset_disabled()
    }

    /// Abort in-flight seal loops and drop pooled VMs. The epoch cache is
    /// released when the last outstanding snapshot goes away.
    pub fn close(&self) {
        self.aborted.store(true, Ordering::Relaxed);
        self.pool.close();
    }

    /// Verify that `header`'s nonce and mix digest are a valid RandomX seal
    /// of `seal_hash` at the header's difficulty.
    pub fn verify(
        &self,
        chain: &dyn ChainContext,
        seal_hash: H256,
        header: &Header,
    ) -> Result<(), PowError> {
        match self.config.behaviour {
            PowBehaviour::FakeFullBypass => return Ok(()),
            PowBehaviour::FakeAllValid => return Ok(()),
            PowBehaviour::FakeFailAt(number) => {
                if header.number == number {
                    return Err(PowError::FakeFail);
                }
                return Ok(());
            }
            PowBehaviour::FakeDelay(delay) => {
                std::thread::sleep(delay);
                return Ok(());
            }
            PowBehaviour::Normal => {}
        }

        if header.difficulty.is_zero() {
            return Err(PowError::ZeroDifficulty);
        }

        let key = (seal_hash, header.nonce);
        if self.seen.lock().contains(&key) {
            return Ok(());
        }
        if let Some(err) = self.failed.lock().get(&key).cloned() {
            return Err(err);
        }

        let seed = chain.seed_hash(header.number)?;
        self.epoch.ensure_cache(seed)?;
        let snapshot = self.epoch.snapshot()?;

        // Verification is rare next to mining; a per-call VM keeps it off
        // the mining pool.
        let vm = vm_pool::create_vm(&snapshot)?;
        let (extra_nonce, miner_nonce) = codec::split_nonce(header.nonce);
        let preimage = codec::seal_preimage(&seal_hash, extra_nonce, miner_nonce);
        let hash = vm
            .calculate_hash(&preimage)
            .map(|out| H256::from_slice(&out))
            .map_err(|e| PowError::HashFailed(e.to_string()))?;
        drop(vm);

        if hash != header.mix_digest {
            self.failed.lock().insert(key, PowError::MixDigestMismatch);
            return Err(PowError::MixDigestMismatch);
        }
        if !codec::meets_difficulty(&hash, header.difficulty) {
            self.failed.lock().insert(key, PowError::PowBelowTarget);
            return Err(PowError::PowBelowTarget);
        }

        self.seen.lock().insert(key, ());
        Ok(())
    }

    /// Search for a seal of `header` and emit the sealed copy on `results`.
    ///
    /// Runs on the calling thread until a solution is found or a signal
    /// arrives; callers dedicate one thread per seal worker. Both the
    /// engine-wide abort (see [`Engine::close`]) and the caller's `stop`
    /// channel are polled every [`STOP_POLL_INTERVAL`] hashes.
    pub fn seal(
        &self,
        chain: &dyn ChainContext,
        header: &Header,
        results: &Sender<Header>,
        stop: &Receiver<()>,
    ) -> Result<(), PowError> {
        match self.config.behaviour {
            PowBehaviour::FakeAllValid | PowBehaviour::FakeFullBypass => {
                return self.seal_fake(header, results, None);
            }
            PowBehaviour::FakeFailAt(number) => {
                if header.number == number {
                    return Err(PowError::FakeFail);
                }
                return self.seal_fake(header, results, None);
            }
            PowBehaviour::FakeDelay(delay) => {
                return self.seal_fake(header, results, Some(delay));
            }
            PowBehaviour::Normal => {}
        }

        let target = codec::target_from_difficulty(header.difficulty)
            .ok_or(PowError::ZeroDifficulty)?;

        let seed = chain.seed_hash(header.number)?;
        self.epoch.ensure_cache(seed)?;
        let snapshot = self.epoch.snapshot()?;
        let vm = self.pool.get(&snapshot)?;

        let seal_hash = chain.seal_hash(header);
        let mut preimage = codec::seal_preimage(&seal_hash, 0, 0);

        // Wall-clock nanoseconds as the starting nonce keeps sibling seal
        // workers (and restarted nodes) out of each other's search space.
        let mut nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut attempts: u64 = 0;

        let outcome = loop {
            codec::patch_nonce(&mut preimage, nonce);
            let hash = match vm.calculate_hash(&preimage) {
                Ok(out) => H256::from_slice(&out),
                Err(e) => break Err(PowError::HashFailed(e.to_string())),
            };

            if U256::from_big_endian(hash.as_bytes()) <= target {
                let mut sealed = header.clone();
                sealed.nonce = nonce;
                sealed.mix_digest = hash;
                let _ = results.send(sealed);
                log::debug!(
                    "sealed block {} after {} attempts (nonce {:#018x})",
                    header.number,
                    attempts + 1,
                    nonce
                );
                break Ok(());
            }

            nonce = nonce.wrapping_add(1);
            attempts += 1;
            if attempts % STOP_POLL_INTERVAL == 0 && self.should_stop(stop) {
                break Ok(());
            }
        };

        self.pool.put(vm, snapshot.generation);
        outcome
    }

    fn should_stop(&self, stop: &Receiver<()>) -> bool {
        if self.aborted.load(Ordering::Relaxed) {
            return true;
        }
        match stop.try_recv() {
            Ok(()) => true,
            Err(TryRecvError::Disconnected) => true,
            Err(TryRecvError::Empty) => false,
        }
    }

    fn seal_fake(
        &self,
        header: &Header,
        results: &Sender<Header>,
        delay: Option<Duration>,
    ) -> Result<(), PowError> {
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut sealed = header.clone();
        sealed.nonce = 0;
        sealed.mix_digest = H256::zero();
        let _ = results.try_send(sealed);
        Ok(())
    }
}
