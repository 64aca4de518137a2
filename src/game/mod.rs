//! Game Logic Module
//!
//! Everything that decides what happens at the table. No I/O, no clock
//! reads; time comes in as an `Instant` argument.
//!
//! ## Module Structure
//!
//! - `cards`: Colors, cards, deck and dealing
//! - `rules`: Bidding, legal plays, trick resolution, scoring
//! - `state`: Match state, players, rounds
//! - `timer`: Turn durations and deadlines
//! - `events`: Events emitted by transitions
//! - `machine`: The state machine that applies actions and timeouts

pub mod cards;
pub mod rules;
pub mod state;
pub mod timer;
pub mod events;
pub mod machine;

// Re-export key types
pub use cards::{Card, Color};
pub use rules::{Bid, Contract, ScoringRules};
pub use state::{MatchId, MatchPhase, MatchState, PlayerName, Team};
pub use timer::{TimerKey, TurnTimerConfig};
pub use events::{GameEvent, GameEventData};
pub use machine::{
    Action, ActionError, DisconnectPolicy, ErrorKind, MatchConfig, StateMachine, Transition,
};
