//! Game Events
//!
//! Everything the state machine decides is reported as an event. The
//! match actor turns them into client messages, history records and
//! metrics, and forwards them unchanged to lifecycle observers.

use serde::{Serialize, Deserialize};

use crate::game::cards::{Card, Color};
use crate::game::rules::{Bid, Contract};
use crate::game::state::{MatchPhase, PlayerName, RoundRecord, Team, TeamScores};

/// Game event data.
#[allow(missing_docs)] // field names are the wire format
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEventData {
    /// A player took a seat.
    PlayerJoined {
        player: PlayerName,
        seat: usize,
        team: Team,
        is_bot: bool,
    },

    /// A player switched team during team selection.
    TeamChosen {
        player: PlayerName,
        team: Team,
    },

    /// A player left the match for good.
    PlayerLeft {
        player: PlayerName,
    },

    /// Seats were arranged and the first round is about to be dealt.
    GameStarted {
        seating: Vec<PlayerName>,
    },

    /// Cards dealt, bidding opens.
    RoundStarted {
        round: u32,
        dealer: PlayerName,
    },

    /// A bid was accepted.
    BidPlaced {
        player: PlayerName,
        bid: Bid,
    },

    /// Bidding closed with a contract.
    BiddingClosed {
        contract: Contract,
    },

    /// The first card of a trump contract fixed the trump color.
    TrumpSet {
        color: Color,
    },

    /// A card was played.
    CardPlayed {
        player: PlayerName,
        card: Card,
    },

    /// A trick was completed.
    TrickResolved {
        trick: u32,
        winner: PlayerName,
        points: i32,
    },

    /// A round was scored.
    RoundEnded {
        record: RoundRecord,
    },

    /// The game finished.
    GameOver {
        winning_team: Team,
        scores: TeamScores,
    },

    /// A player confirmed the next round.
    ReadyForNextRound {
        player: PlayerName,
    },

    /// A player voted for a rematch.
    RematchVoted {
        player: PlayerName,
    },

    /// Rematch quorum reached, back to team selection.
    RematchStarted,

    /// Connection lost.
    PlayerDisconnected {
        player: PlayerName,
    },

    /// Connection restored.
    PlayerReconnected {
        player: PlayerName,
    },

    /// The timer acted for a player (or the whole table in scoring).
    AutoActionTaken {
        player: Option<PlayerName>,
        phase: MatchPhase,
    },

    /// A player missed a turn.
    AfkWarning {
        player: PlayerName,
        warnings: u8,
    },

    /// A seat was handed to a bot.
    PlayerReplacedByBot {
        player: PlayerName,
    },

    /// No humans left.
    MatchAbandoned,
}

/// An event with its position in the match's event order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    /// Monotonic per match.
    pub seq: u64,

    /// Event data
    #[serde(flatten)]
    pub data: GameEventData,
}

impl GameEvent {
    /// Create a new event.
    pub fn new(seq: u64, data: GameEventData) -> Self {
        Self { seq, data }
    }

    /// Player the event is about, if any.
    pub fn player(&self) -> Option<&PlayerName> {
        match &self.data {
            GameEventData::PlayerJoined { player, .. }
            | GameEventData::TeamChosen { player, .. }
            | GameEventData::PlayerLeft { player }
            | GameEventData::BidPlaced { player, .. }
            | GameEventData::CardPlayed { player, .. }
            | GameEventData::TrickResolved { winner: player, .. }
            | GameEventData::ReadyForNextRound { player }
            | GameEventData::RematchVoted { player }
            | GameEventData::PlayerDisconnected { player }
            | GameEventData::PlayerReconnected { player }
            | GameEventData::AfkWarning { player, .. }
            | GameEventData::PlayerReplacedByBot { player } => Some(player),
            GameEventData::AutoActionTaken { player, .. } => player.as_ref(),
            _ => None,
        }
    }

    /// Events that external wagering resolves against.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self.data,
            GameEventData::TrickResolved { .. }
                | GameEventData::RoundEnded { .. }
                | GameEventData::GameOver { .. }
        )
    }
}
