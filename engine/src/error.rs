//! Error taxonomy for the PoW engine.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PowError {
    #[error("difficulty must be greater than zero")]
    ZeroDifficulty,

    #[error("randomx cache allocation failed: {0}")]
    CacheAllocFailed(String),

    #[error("randomx cache not initialised")]
    CacheUninitialised,

    #[error("randomx vm creation failed: {0}")]
    VmCreateFailed(String),

    #[error("randomx hash failed: {0}")]
    HashFailed(String),

    #[error("invalid mix digest")]
    MixDigestMismatch,

    #[error("invalid proof-of-work")]
    PowBelowTarget,

    #[error("seed lookup failed for block {0}")]
    SeedLookupFailed(u64),

    #[error("no pending work for header hash")]
    UnknownWork,

    #[error("invalid proof-of-work (fake failure injected)")]
    FakeFail,

    #[error("background task spawn failed: {0}")]
    Spawn(String),
}
