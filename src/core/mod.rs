//! Core deterministic primitives.
//!
//! Seeded shuffling and state hashing. Nothing in here reads the clock.

pub mod rng;
pub mod hash;

// Re-export core types
pub use rng::{DeterministicRng, derive_match_seed};
pub use hash::{compute_state_hash, StateHash, StateHasher};
