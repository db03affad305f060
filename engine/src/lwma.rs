//! LWMA-3 difficulty retargeting over a 60-block window.
//!
//! Recent solve times carry linearly increasing weight, which makes the
//! difficulty respond within a handful of blocks to hashrate swings -- the
//! behaviour a CPU-minable chain needs when a large miner joins or leaves.
//! Reference: Zawy's LWMA family of difficulty algorithms.

use crate::types::{u256_to_u512, u512_to_u256_saturating, ChainConfig, ChainContext, Header, U256, U512};

/// Number of parent headers in the averaging window.
pub const WINDOW_SIZE: u64 = 60;
/// Target seconds between blocks.
pub const TARGET_BLOCK_TIME: u64 = 13;
/// Difficulty floor, also returned while the chain is shorter than the window.
pub const MIN_DIFFICULTY: u64 = 1;
/// Per-block clamp: at most double.
pub const MAX_ADJUSTMENT_UP: u64 = 2;
/// Per-block clamp: at most halve.
pub const MAX_ADJUSTMENT_DOWN: u64 = 2;
/// Maximum tolerated future timestamp drift, seconds.
pub const TIMESTAMP_MAX_FUTURE_DRIFT: u64 = 15;
/// Maximum tolerated past timestamp drift, seconds.
pub const TIMESTAMP_MAX_PAST_DRIFT: u64 = 91;

/// Whether LWMA retargeting applies to block `number` under `config`.
pub fn lwma_active(config: &ChainConfig, number: u64) -> bool {
    match &config.randomx {
        Some(rx) => match rx.lwma_activation_block {
            Some(activation) => number >= activation,
            None => true,
        },
        None => false,
    }
}

/// Difficulty for the child of `parent`.
///
/// Walks `WINDOW_SIZE` headers back through `chain`; a walk that reaches
/// genesis (or a missing header) falls back to `MIN_DIFFICULTY`. All
/// arithmetic runs in 512 bits: the weighted difficulty sum overflows 64-bit
/// and can overflow 256-bit intermediates for difficulties near the ceiling.
pub fn next_difficulty(chain: &dyn ChainContext, parent: &Header) -> U256 {
    let n = WINDOW_SIZE as usize;
    if parent.number < WINDOW_SIZE {
        return U256::from(MIN_DIFFICULTY);
    }

    let mut times = vec![0u64; n];
    let mut difficulties = vec![U256::zero(); n];

    // Collect the window oldest-first, ending at the parent.
    let mut current = parent.clone();
    for i in (0..n).rev() {
        if current.number == 0 {
            return U256::from(MIN_DIFFICULTY);
        }
        times[i] = current.timestamp;
        difficulties[i] = current.difficulty;
        if i > 0 {
            current = match chain.header_by_hash(&current.parent_hash, current.number - 1) {
                Some(header) => header,
                None => return U256::from(MIN_DIFFICULTY),
            };
        }
    }

    let mut weighted_solve_sum: u64 = 0;
    let mut weighted_diff_sum = U512::zero();

    for i in 0..n - 1 {
        let solve_time = times[i + 1]
            .saturating_sub(times[i])
            .clamp(1, 6 * TARGET_BLOCK_TIME);
        let weight = (i + 1) as u64;

        weighted_solve_sum += solve_time * weight;
        weighted_diff_sum += U512::from(solve_time * weight) * u256_to_u512(difficulties[i]);
    }

    // weighted_diff_sum <= max(difficulty) * weighted_solve_sum, so the
    // quotient always fits back into 256 bits.
    let mut next = u512_to_u256_saturating(weighted_diff_sum / U512::from(weighted_solve_sum));

    let min = U256::from(MIN_DIFFICULTY);
    if next < min {
        next = min;
    }

    let (max_increase, overflow) = parent
        .difficulty
        .overflowing_mul(U256::from(MAX_ADJUSTMENT_UP));
    if !overflow && next > max_increase {
        next = max_increase;
    }

    let max_decrease = parent.difficulty / U256::from(MAX_ADJUSTMENT_DOWN);
    if next < max_decrease {
        next = max_decrease;
    }

    next
}
