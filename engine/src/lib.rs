//! RandomX proof-of-work engine for an Ethereum-style chain.
//!
//! The engine owns the epoch-keyed RandomX cache/dataset lifecycle, a bounded
//! VM pool, header sealing and verification against the 43-byte rx-eth-v1
//! preimage, and the LWMA-3 difficulty retarget. The surrounding chain node
//! (block assembly, header hashing, seed derivation) stays behind the
//! [`types::ChainContext`] trait.

pub mod cache;
pub mod codec;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod flags;
pub mod lwma;
pub mod remote;
pub mod types;
pub mod vm_pool;

pub use engine::{Engine, EngineConfig, PowBehaviour, PowMode};
pub use error::PowError;
pub use remote::RemoteSealer;
pub use types::{ChainConfig, ChainContext, Header, RandomXConfig, WorkPackage, H256, U256, U512};
