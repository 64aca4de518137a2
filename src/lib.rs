//! # Tricktable Server
//!
//! Authoritative match server for a four-player, two-team trick-taking
//! card game played with a 32-card deck.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TRICKTABLE SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Seeded Xorshift128+ shuffling             │
//! │  └── hash.rs     - State hashing for desync detection        │
//! │                                                              │
//! │  game/           - Game logic (deterministic)                │
//! │  ├── cards.rs    - Colors, cards, dealing                    │
//! │  ├── rules.rs    - Bidding, legal plays, tricks, scoring     │
//! │  ├── state.rs    - Match, player and round state             │
//! │  ├── timer.rs    - Turn durations and deadlines              │
//! │  ├── events.rs   - Events emitted by transitions             │
//! │  └── machine.rs  - Action/timeout state machine              │
//! │                                                              │
//! │  history/        - Round and game records                    │
//! │                                                              │
//! │  network/        - Networking (non-deterministic)            │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── protocol.rs - Message types and snapshots               │
//! │  ├── session.rs  - Identities and reconnect tokens           │
//! │  ├── actor.rs    - One task per match                        │
//! │  └── registry.rs - Running matches                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `game/` modules never read the clock or an unseeded
//! random source. Deals come from a seed derived from the match id and the
//! round number, and time enters the state machine only as an `Instant`
//! argument, so a replay of the same actions produces the same state hash.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod history;
pub mod logging;
pub mod metrics;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, ServerConfig};
pub use core::rng::DeterministicRng;
pub use game::machine::{Action, MatchConfig, StateMachine};
pub use game::state::{MatchId, MatchState, PlayerName, Team};
pub use network::server::{GameServer, GameServerError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
