//! Epoch-keyed RandomX cache and dataset lifecycle.
//!
//! One cache serves all headers of a 2048-block epoch. Rotation happens
//! under the write lock; consumers take an [`EpochSnapshot`] under the read
//! lock. Snapshot handles are reference-counted clones of the native
//! cache/dataset, so a VM built from a snapshot keeps the underlying memory
//! alive for exactly as long as the snapshot lives -- dropping the cache out
//! of the manager can never free memory a VM still references.
//!
//! The ~2 GiB dataset is built from the cache on a background thread so that
//! sealing and verification of in-flight blocks keep running in light mode
//! meanwhile. A failed build latches `dataset_disabled` and the engine stays
//! in light mode for the rest of its life.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use randomx_rs::{RandomXCache, RandomXDataset, RandomXFlag};

use crate::error::PowError;
use crate::flags;
use crate::types::H256;

/// Blocks per RandomX seed epoch.
pub const EPOCH_LENGTH: u64 = 2048;

/// Epoch index for a block number.
pub fn epoch_of(number: u64) -> u64 {
    number / EPOCH_LENGTH
}

struct EpochInner {
    seed: Option<H256>,
    cache: Option<RandomXCache>,
    dataset: Option<RandomXDataset>,
}

/// Handles for hashing against the current epoch. `dataset` is present only
/// when the latest background build completed for this seed.
pub struct EpochSnapshot {
    pub cache: RandomXCache,
    pub dataset: Option<RandomXDataset>,
    pub generation: u64,
}

pub struct EpochManager {
    inner: RwLock<EpochInner>,
    /// Datasets are used at all only in normal (non-light) operation.
    dataset_wanted: bool,
    /// Latched after a failed dataset build; never cleared.
    dataset_disabled: AtomicBool,
    /// Bumped on every cache rotation and dataset arrival so VM pools can
    /// detect that their VMs are stale.
    generation: AtomicU64,
}

impl EpochManager {
    pub fn new(dataset_wanted: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(EpochInner {
                seed: None,
                cache: None,
                dataset: None,
            }),
            dataset_wanted,
            dataset_disabled: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    pub fn dataset_disabled(&self) -> bool {
        self.dataset_disabled.load(Ordering::Relaxed)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Make the cache for `seed` current, rotating out any previous epoch.
    ///
    /// Returns immediately when the seed is already loaded. Otherwise the
    /// old cache and dataset are dropped, a fresh cache is allocated and
    /// initialised (seconds), and a dataset build is kicked off in the
    /// background when permitted.
    pub fn ensure_cache(self: &Arc<Self>, seed: H256) -> Result<(), PowError> {
        {
            let inner = self.inner.read();
            if inner.cache.is_some() && inner.seed == Some(seed) {
                return Ok(());
            }
        }

        let mut inner = self.inner.write();
        // Lost the race to another caller.
        if inner.cache.is_some() && inner.seed == Some(seed) {
            return Ok(());
        }

        inner.dataset = None;
        inner.cache = None;
        inner.seed = None;

        let started = Instant::now();
        let cache = RandomXCache::new(flags::base_flags(), seed.as_bytes())
            .map_err(|e| PowError::CacheAllocFailed(e.to_string()))?;
        log::info!(
            "randomx cache rotated to seed {} in {:.1}s",
            hex::encode(&seed.as_bytes()[..8]),
            started.elapsed().as_secs_f64()
        );

        inner.cache = Some(cache.clone());
        inner.seed = Some(seed);
        self.generation.fetch_add(1, Ordering::Release);

        if self.dataset_wanted && !self.dataset_disabled() {
            self.spawn_dataset_build(seed, cache)?;
        }

        Ok(())
    }

    fn spawn_dataset_build(self: &Arc<Self>, seed: H256, cache: RandomXCache) -> Result<(), PowError> {
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("rx-dataset-build".into())
            .spawn(move || {
                let started = Instant::now();
                let flags = flags::base_flags() | RandomXFlag::FLAG_FULL_MEM;
                match RandomXDataset::new(flags, cache, 0) {
                    Ok(dataset) => {
                        let mut inner = manager.inner.write();
                        // The epoch may have rotated again while we built.
                        if inner.seed == Some(seed) {
                            inner.dataset = Some(dataset);
                            manager.generation.fetch_add(1, Ordering::Release);
                            log::info!(
                                "randomx dataset ready in {:.1}s, switching to full mode",
                                started.elapsed().as_secs_f64()
                            );
                        } else {
                            log::debug!("discarding dataset for superseded epoch");
                        }
                    }
                    Err(e) => {
                        manager.dataset_disabled.store(true, Ordering::Relaxed);
                        log::warn!("randomx dataset build failed, staying in light mode: {e}");
                    }
                }
            })
            .map_err(|e| PowError::Spawn(e.to_string()))?;
        Ok(())
    }

    /// Current cache and (if built) dataset handles.
    pub fn snapshot(&self) -> Result<EpochSnapshot, PowError> {
        let inner = self.inner.read();
        let cache = inner.cache.clone().ok_or(PowError::CacheUninitialised)?;
        Ok(EpochSnapshot {
            cache,
            dataset: inner.dataset.clone(),
            generation: self.generation(),
        })
    }
}
