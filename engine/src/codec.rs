//! Target/nonce codec and the rx-eth-v1 preimage.
//!
//! A hash is always interpreted as a big-endian 256-bit integer, matching
//! on-chain verification. The rx-eth-v1 preimage binds a 64-bit header nonce
//! to a 43-byte RandomX input:
//!
//! ```text
//! offset  0..32   seal hash
//! offset 32..36   extra nonce, u32 little-endian
//! offset 36..39   constant 0x00 0x00 0x00
//! offset 39..43   miner nonce, u32 little-endian
//! header.nonce == (extra as u64) << 32 | miner as u64
//! ```

use crate::types::{u256_to_u512, u512_to_u256_saturating, H256, U256, U512};

/// Length of the rx-eth-v1 RandomX input.
pub const PREIMAGE_LEN: usize = 43;
/// Byte offset of the little-endian extra nonce inside the preimage.
pub const EXTRA_NONCE_OFFSET: usize = 32;
/// Byte offset of the little-endian miner nonce inside the preimage.
pub const MINER_NONCE_OFFSET: usize = 39;

/// `floor((2^256 - 1) / difficulty)`. `None` for zero difficulty.
pub fn target_from_difficulty(difficulty: U256) -> Option<U256> {
    if difficulty.is_zero() {
        return None;
    }
    Some(U256::MAX / difficulty)
}

/// Whether `hash`, read big-endian, satisfies `difficulty`.
pub fn meets_difficulty(hash: &H256, difficulty: U256) -> bool {
    match target_from_difficulty(difficulty) {
        Some(target) => U256::from_big_endian(hash.as_bytes()) <= target,
        None => false,
    }
}

fn two_pow_256() -> U512 {
    U512::one() << 256
}

/// `floor(2^256 / hash)` saturated to u64. Zero hash saturates.
pub fn share_difficulty(hash: &H256) -> u64 {
    let h = U256::from_big_endian(hash.as_bytes());
    if h.is_zero() {
        return u64::MAX;
    }
    let q = two_pow_256() / u256_to_u512(h);
    if q > U512::from(u64::MAX) {
        u64::MAX
    } else {
        q.low_u64()
    }
}

/// Decode a 256-bit target into full-precision difficulty,
/// `floor(2^256 / target)`, saturated to `U256::MAX`.
pub fn difficulty_from_target(target: U256) -> U256 {
    if target.is_zero() {
        return U256::MAX;
    }
    u512_to_u256_saturating(two_pow_256() / u256_to_u512(target))
}

/// Stratum difficulty decode: `floor(2^256 / target)` truncated to 64 bits.
pub fn difficulty_from_target_u64(target: U256) -> u64 {
    difficulty_from_target(target).low_u64()
}

/// CryptoNote-style stratum target: `0xFFFFFFFF / pool_difficulty` clamped
/// into `[1, 0xFFFFFFFF]`, emitted as 4 little-endian bytes (8 hex chars).
pub fn stratum_target_hex(pool_difficulty: u64) -> String {
    let max = u32::MAX as u64;
    let target = if pool_difficulty == 0 {
        u32::MAX
    } else if pool_difficulty > max {
        1
    } else {
        (max / pool_difficulty).max(1) as u32
    };
    hex::encode(target.to_le_bytes())
}

/// Split a 64-bit header nonce into `(extra_nonce, miner_nonce)`.
pub fn split_nonce(nonce: u64) -> (u32, u32) {
    ((nonce >> 32) as u32, nonce as u32)
}

/// Recombine `(extra_nonce, miner_nonce)` into the 64-bit header nonce.
pub fn join_nonce(extra_nonce: u32, miner_nonce: u32) -> u64 {
    ((extra_nonce as u64) << 32) | miner_nonce as u64
}

/// Assemble the 43-byte rx-eth-v1 preimage.
pub fn seal_preimage(seal_hash: &H256, extra_nonce: u32, miner_nonce: u32) -> [u8; PREIMAGE_LEN] {
    let mut buf = [0u8; PREIMAGE_LEN];
    buf[..32].copy_from_slice(seal_hash.as_bytes());
    buf[EXTRA_NONCE_OFFSET..EXTRA_NONCE_OFFSET + 4].copy_from_slice(&extra_nonce.to_le_bytes());
    buf[MINER_NONCE_OFFSET..MINER_NONCE_OFFSET + 4].copy_from_slice(&miner_nonce.to_le_bytes());
    buf
}

/// Patch both nonce slots of a preimage in place. The mining loop keeps one
/// persistent buffer and rewrites only the two nonce slots per attempt.
pub fn patch_nonce(buf: &mut [u8; PREIMAGE_LEN], nonce: u64) {
    let (extra, miner) = split_nonce(nonce);
    buf[EXTRA_NONCE_OFFSET..EXTRA_NONCE_OFFSET + 4].copy_from_slice(&extra.to_le_bytes());
    buf[MINER_NONCE_OFFSET..MINER_NONCE_OFFSET + 4].copy_from_slice(&miner.to_le_bytes());
}
