//! Translation between the chain's 256-bit work domain and the 32-bit
//! little-endian CryptoNote domain xmrig expects.

use std::time::Instant;

use anyhow::{anyhow, Result};

use rxeth_engine::codec;
use rxeth_engine::types::{h256_from_hex, U256};
use rxeth_engine::WorkPackage;

use crate::protocol::Job;

/// Minimum per-miner difficulty after vardiff adjustment.
pub const MIN_POOL_DIFFICULTY: u64 = 1_000;
/// Maximum per-miner difficulty after vardiff adjustment.
pub const MAX_POOL_DIFFICULTY: u64 = 1_000_000_000;

/// Convert a getWork package into a broker job.
pub fn work_to_job(work: &WorkPackage, job_id: String, algo: &str) -> Result<Job> {
    let number_hex = work.block_number.strip_prefix("0x").unwrap_or(&work.block_number);
    let height =
        u64::from_str_radix(number_hex, 16).map_err(|e| anyhow!("bad block number: {e}"))?;

    let target_hex = work.target.strip_prefix("0x").unwrap_or(&work.target);
    let target = U256::from_str_radix(target_hex, 16).map_err(|e| anyhow!("bad target: {e}"))?;
    if target.is_zero() {
        return Err(anyhow!("work target is zero"));
    }
    let difficulty = codec::difficulty_from_target(target);

    Ok(Job {
        job_id,
        // Placeholder blob; sessions rebuild it with their own extra nonce.
        blob: create_blob_rxeth(&work.header_hash, 0)?,
        algo: algo.to_string(),
        height,
        seed_hash: work.seed_hash.clone(),
        header_hash: work.header_hash.clone(),
        difficulty,
        created_at: Instant::now(),
    })
}

/// Build the 86-hex-char rx-eth-v1 blob: header hash, little-endian extra
/// nonce, three zero bytes, and a zeroed miner nonce slot for xmrig to fill.
pub fn create_blob_rxeth(header_hash: &str, extra_nonce: u32) -> Result<String> {
    let seal = h256_from_hex(header_hash)
        .ok_or_else(|| anyhow!("bad header hash: {header_hash:?}"))?;
    let preimage = codec::seal_preimage(&seal, extra_nonce, 0);
    Ok(hex::encode(preimage))
}

/// Pull the 8-hex-char miner nonce back out of an rx-eth-v1 blob.
pub fn extract_nonce_from_blob(blob: &str) -> Result<String> {
    let blob = blob.trim();
    if blob.len() < 2 * codec::PREIMAGE_LEN {
        return Err(anyhow!("blob too short: {} hex chars", blob.len()));
    }
    let nonce_hex = &blob[2 * codec::MINER_NONCE_OFFSET..2 * codec::PREIMAGE_LEN];
    let bytes = hex::decode(nonce_hex).map_err(|e| anyhow!("bad nonce hex: {e}"))?;
    debug_assert_eq!(bytes.len(), 4);
    Ok(nonce_hex.to_string())
}

/// Vardiff step: scale the miner's difficulty towards the target share rate.
/// Rates are in shares per minute.
pub fn adjust_difficulty(current: u64, rate_spm: f64, target_spm: f64) -> u64 {
    let adjusted = if target_spm > 0.0 && rate_spm > 2.0 * target_spm {
        (current as f64 * 1.5) as u64
    } else if target_spm > 0.0 && rate_spm < target_spm / 2.0 {
        (current as f64 * 0.75) as u64
    } else {
        current
    };
    adjusted.clamp(MIN_POOL_DIFFICULTY, MAX_POOL_DIFFICULTY)
}

/// Hashrate implied by finding shares of `difficulty` every `seconds`.
pub fn estimate_hashrate(difficulty: u64, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return 0.0;
    }
    difficulty as f64 / seconds
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn work(target: &str) -> WorkPackage {
        WorkPackage {
            header_hash: format!("0x{}", "12".repeat(32)),
            seed_hash: format!("0x{}", "ab".repeat(32)),
            target: target.to_string(),
            block_number: "0x2a".to_string(),
        }
    }

    #[test]
    fn blob_layout() {
        let header_hash = format!("0x{}", "cd".repeat(32));
        let blob = create_blob_rxeth(&header_hash, 0xDEAD_BEEF).unwrap();
        assert_eq!(blob.len(), 86);
        assert_eq!(&blob[..64], "cd".repeat(32));
        assert_eq!(&blob[64..72], "efbeadde");
        assert_eq!(&blob[72..78], "000000");
        assert_eq!(&blob[78..86], "00000000");
    }

    #[test]
    fn blob_nonce_extraction() {
        let blob = format!("{}{}{}{}", "cd".repeat(32), "efbeadde", "000000", "78563412");
        assert_eq!(extract_nonce_from_blob(&blob).unwrap(), "78563412");
        assert!(extract_nonce_from_blob("1234").is_err());
    }

    #[test]
    fn work_conversion_decodes_height_and_difficulty() {
        // Target with 8 leading zero nibbles: difficulty ~ 2^32.
        let target = format!("0x{}{}", "00000000", "f".repeat(56));
        let job = work_to_job(&work(&target), "7".into(), "rx/0").unwrap();
        assert_eq!(job.height, 42);
        assert_eq!(job.job_id, "7");
        assert_eq!(job.blob.len(), 86);
        assert!(job.difficulty > U256::from(u32::MAX as u64));
        assert!(job.difficulty < U256::from(1u64 << 33));

        assert!(work_to_job(&work("0x0"), "8".into(), "rx/0").is_err());
    }

    #[test]
    fn difficulty_adjustment_direction() {
        // Too many shares: difficulty rises.
        assert_eq!(adjust_difficulty(10_000, 5.0, 2.0), 15_000);
        // Too few: difficulty drops.
        assert_eq!(adjust_difficulty(10_000, 0.5, 2.0), 7_500);
        // In band: unchanged.
        assert_eq!(adjust_difficulty(10_000, 2.0, 2.0), 10_000);
        // Clamps.
        assert_eq!(adjust_difficulty(1_000, 0.1, 2.0), MIN_POOL_DIFFICULTY);
        assert_eq!(
            adjust_difficulty(MAX_POOL_DIFFICULTY, 100.0, 2.0),
            MAX_POOL_DIFFICULTY
        );
    }

    #[test]
    fn hashrate_estimation() {
        assert_eq!(estimate_hashrate(30_000, 30.0), 1_000.0);
        assert_eq!(estimate_hashrate(30_000, 0.0), 0.0);
    }

    proptest! {
        /// Holding the share rate at target is a fixed point of the
        /// controller, and the output always stays inside the clamp band.
        #[test]
        fn vardiff_fixed_point(start in 1u64..10_000_000_000u64, target_spm in 0.1f64..60.0) {
            let mut diff = adjust_difficulty(start, target_spm, target_spm);
            for _ in 0..10 {
                let next = adjust_difficulty(diff, target_spm, target_spm);
                prop_assert_eq!(next, diff);
                diff = next;
            }
            prop_assert!((MIN_POOL_DIFFICULTY..=MAX_POOL_DIFFICULTY).contains(&diff));
        }
    }
}
