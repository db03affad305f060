//! Process-wide RandomX flag selection.
//!
//! Flags are probed once: each tier is tried with a throwaway cache
//! allocation and the first tier that succeeds wins. Large pages need
//! kernel configuration and privileges, hardware AES needs CPU support;
//! both degrade gracefully through the tiers.

use once_cell::sync::Lazy;
use randomx_rs::{RandomXCache, RandomXFlag};

static PROBED_FLAGS: Lazy<RandomXFlag> = Lazy::new(probe);

const PROBE_KEY: &[u8] = b"rxeth flag probe";

fn probe() -> RandomXFlag {
    let tiers = [
        RandomXFlag::FLAG_JIT | RandomXFlag::FLAG_HARD_AES | RandomXFlag::FLAG_LARGE_PAGES,
        RandomXFlag::FLAG_JIT | RandomXFlag::FLAG_HARD_AES,
        RandomXFlag::FLAG_HARD_AES,
    ];

    for flags in tiers {
        match RandomXCache::new(flags, PROBE_KEY) {
            Ok(_) => {
                log::info!("randomx flags selected: 0x{:x}", flags.bits());
                return flags;
            }
            Err(e) => {
                log::debug!("randomx flags 0x{:x} unavailable: {}", flags.bits(), e);
            }
        }
    }

    log::warn!("all randomx flag tiers failed, falling back to interpreter defaults");
    RandomXFlag::FLAG_DEFAULT
}

/// Flags used for cache allocation and light-mode VMs.
pub fn base_flags() -> RandomXFlag {
    *PROBED_FLAGS
}

/// Flags for VM creation; FULL_MEM is OR'd in when a dataset is attached.
pub fn vm_flags(with_dataset: bool) -> RandomXFlag {
    let flags = base_flags();
    if with_dataset {
        flags | RandomXFlag::FLAG_FULL_MEM
    } else {
        flags
    }
}
