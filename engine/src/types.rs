//! Chain-facing types: 256-bit hashes and integers, the sealed header view,
//! the getWork package, and the `ChainContext` seam to the node.

use fixed_hash::construct_fixed_hash;
use uint::construct_uint;

use crate::error::PowError;

construct_fixed_hash! {
    /// 32-byte hash (header hashes, seeds, mix digests).
    pub struct H256(32);
}

construct_uint! {
    /// 256-bit unsigned integer (difficulties, targets).
    pub struct U256(4);
}

construct_uint! {
    /// 512-bit unsigned integer. Used where 2^256 itself appears as a
    /// dividend and for LWMA accumulators that overflow 256 bits.
    pub struct U512(8);
}

/// Widen a U256 into the low half of a U512.
pub fn u256_to_u512(v: U256) -> U512 {
    let mut bytes = [0u8; 32];
    v.to_big_endian(&mut bytes);
    let mut wide = [0u8; 64];
    wide[32..].copy_from_slice(&bytes);
    U512::from_big_endian(&wide)
}

/// Narrow a U512 to U256, saturating at `U256::MAX`.
pub fn u512_to_u256_saturating(v: U512) -> U256 {
    let mut bytes = [0u8; 64];
    v.to_big_endian(&mut bytes);
    if bytes[..32].iter().any(|b| *b != 0) {
        return U256::MAX;
    }
    U256::from_big_endian(&bytes[32..])
}

/// Parse a 32-byte hash from hex, with or without a `0x` prefix.
pub fn h256_from_hex(s: &str) -> Option<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() != 64 {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    Some(H256::from_slice(&bytes))
}

/// Render a hash as `0x`-prefixed lowercase hex.
pub fn h256_to_hex(h: &H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// The header fields the PoW engine consumes. Everything else about a block
/// is opaque to this crate; the node computes the seal hash (keccak of the
/// header with nonce and mix digest zeroed) and hands it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub parent_hash: H256,
    pub number: u64,
    pub timestamp: u64,
    pub difficulty: U256,
    pub nonce: u64,
    pub mix_digest: H256,
}

/// Work package handed to external miners, mirroring the getWork RPC shape:
/// `[header_hash, seed_hash, target_256, block_number]`, all 0x-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPackage {
    pub header_hash: String,
    pub seed_hash: String,
    pub target: String,
    pub block_number: String,
}

/// RandomX section of the chain configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RandomXConfig {
    /// Block at which LWMA retargeting activates. `None` means active from
    /// genesis.
    pub lwma_activation_block: Option<u64>,
}

/// The slice of chain configuration the engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainConfig {
    pub randomx: Option<RandomXConfig>,
}

/// Read-only view of the chain supplied by the node.
///
/// `seal_hash` and `seed_hash` are computed node-side (keccak of the
/// truncated header, and the deterministic per-epoch seed respectively);
/// the engine never re-derives them.
pub trait ChainContext: Send + Sync {
    fn config(&self) -> &ChainConfig;

    /// Keccak-256 of `header` with nonce and mix digest zeroed.
    fn seal_hash(&self, header: &Header) -> H256;

    /// RandomX seed for the epoch containing `number`.
    fn seed_hash(&self, number: u64) -> Result<H256, PowError>;

    /// Header lookup by (hash, number), used by the retarget walk.
    fn header_by_hash(&self, hash: &H256, number: u64) -> Option<Header>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u512_roundtrip_saturates() {
        let v = U256::from(123_456_789u64);
        assert_eq!(u512_to_u256_saturating(u256_to_u512(v)), v);

        let wide = u256_to_u512(U256::MAX) + U512::one();
        assert_eq!(u512_to_u256_saturating(wide), U256::MAX);
    }

    #[test]
    fn h256_hex_roundtrip() {
        let h = h256_from_hex("0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
            .unwrap();
        assert_eq!(
            h256_to_hex(&h),
            "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        );
        // Unprefixed input is accepted too.
        assert_eq!(
            h256_from_hex("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"),
            Some(h)
        );
        assert_eq!(h256_from_hex("0x1234"), None);
    }
}
