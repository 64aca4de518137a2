//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON text frames tagged by `type`.

use std::time::Duration;

use serde::{Serialize, Deserialize};
use tokio::time::Instant;

use crate::game::cards::{Card, Color};
use crate::game::events::{GameEvent, GameEventData};
use crate::game::machine::{Action, ActionError, ErrorKind};
use crate::game::rules::{Bid, Contract, PlacedBid, TrickPlay};
use crate::game::state::{
    ConnectionStatus, MatchId, MatchPhase, MatchState, PlayerName, RoundRecord, Team, TeamScores,
};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[allow(missing_docs)] // field names are the wire format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Claim a player identity for this connection.
    Hello { player_id: String },

    /// Create a match and take its first seat.
    CreateGame {
        #[serde(default)]
        relaxed: bool,
    },

    /// Take a seat in an existing match.
    JoinGame {
        match_id: MatchId,
        #[serde(default)]
        relaxed: bool,
    },

    /// Switch team before the game starts.
    ChooseTeam { team: Team },

    /// Fill an empty seat with a bot.
    AddBot,

    /// Start the game.
    StartGame,

    /// Bid.
    PlaceBet {
        amount: u8,
        #[serde(default)]
        without_trump: bool,
    },

    /// Pass on bidding.
    SkipBet,

    /// Play a card.
    PlayCard { card: Card },

    /// Confirm the next round.
    Ready,

    /// Ask for a rematch.
    VoteRematch,

    /// Give up the seat.
    Leave,

    /// Resume a seat after losing the connection.
    Reconnect { player_id: String, token: String },

    /// Watch a match without a seat.
    Spectate { match_id: MatchId },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

impl ClientMessage {
    /// Game action carried by this message, if it is one.
    pub fn to_action(&self) -> Option<Action> {
        let action = match self {
            ClientMessage::ChooseTeam { team } => Action::ChooseTeam { team: *team },
            ClientMessage::AddBot => Action::AddBot,
            ClientMessage::StartGame => Action::Start,
            ClientMessage::PlaceBet { amount, without_trump } => Action::Bid(Bid::Bet {
                amount: *amount,
                without_trump: *without_trump,
            }),
            ClientMessage::SkipBet => Action::Bid(Bid::Skip),
            ClientMessage::PlayCard { card } => Action::PlayCard(*card),
            ClientMessage::Ready => Action::Ready,
            ClientMessage::VoteRematch => Action::VoteRematch,
            _ => return None,
        };
        Some(action)
    }

    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "hello",
            ClientMessage::CreateGame { .. } => "create_game",
            ClientMessage::JoinGame { .. } => "join_game",
            ClientMessage::ChooseTeam { .. } => "choose_team",
            ClientMessage::AddBot => "add_bot",
            ClientMessage::StartGame => "start_game",
            ClientMessage::PlaceBet { .. } => "place_bet",
            ClientMessage::SkipBet => "skip_bet",
            ClientMessage::PlayCard { .. } => "play_card",
            ClientMessage::Ready => "ready",
            ClientMessage::VoteRematch => "vote_rematch",
            ClientMessage::Leave => "leave",
            ClientMessage::Reconnect { .. } => "reconnect",
            ClientMessage::Spectate { .. } => "spectate",
            ClientMessage::Ping { .. } => "ping",
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[allow(missing_docs)] // field names are the wire format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Identity accepted.
    Welcome { player_id: PlayerName, server_version: String },

    /// Match created; the creator is seated.
    GameCreated { match_id: MatchId },

    /// Token to present on `reconnect`. Replaces any earlier one.
    SessionToken { match_id: MatchId, token: String },

    /// Seat taken.
    PlayerJoined { player: PlayerName, seat: usize, team: Team, is_bot: bool },

    /// Team switched.
    TeamChosen { player: PlayerName, team: Team },

    /// Seat freed or handed over.
    PlayerLeft { player: PlayerName },

    /// Seats arranged.
    GameStarted { seating: Vec<PlayerName> },

    /// Cards dealt.
    RoundStarted { round: u32, dealer: PlayerName },

    /// Bid accepted.
    BidPlaced { player: PlayerName, bid: Bid },

    /// Bidding closed.
    BiddingClosed { contract: Contract },

    /// Trump color fixed.
    TrumpSet { color: Color },

    /// Card played.
    CardPlayed { player: PlayerName, card: Card },

    /// Trick complete.
    TrickResolved { trick: u32, winner: PlayerName, points: i32, state: MatchSnapshot },

    /// Round scored.
    RoundEnded { record: RoundRecord, state: MatchSnapshot },

    /// Game finished.
    GameOver { winning_team: Team, scores: TeamScores, state: MatchSnapshot },

    /// Player confirmed the next round.
    ReadyForNextRound { player: PlayerName },

    /// Player voted for a rematch.
    RematchVoted { player: PlayerName },

    /// Back to team selection.
    RematchStarted,

    /// A seated player lost the connection.
    PlayerDisconnected {
        player_id: PlayerName,
        waiting_for_reconnection: bool,
        reconnect_time_left: u64,
    },

    /// A seated player came back.
    PlayerReconnected { player_id: PlayerName },

    /// Seat restored on this connection.
    ReconnectionSuccessful { match_id: MatchId, token: String },

    /// Reconnect refused.
    ReconnectionFailed { message: String },

    /// Turn about to time out.
    TimeoutWarning { player: Option<PlayerName>, seconds_remaining: u64 },

    /// The server acted for someone.
    AutoActionTaken { player: Option<PlayerName>, phase: MatchPhase },

    /// Missed turn counted.
    AfkWarning { player: PlayerName, warnings: u8 },

    /// Seat now played by a bot.
    PlayerReplacedByBot { player: PlayerName },

    /// Match closed because no humans remain.
    MatchAbandoned,

    /// Full snapshot for this viewer.
    State { snapshot: MatchSnapshot },

    /// Illegal move.
    InvalidMove { message: String },

    /// Refused bid.
    InvalidBet { message: String },

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server or match is shutting down.
    Shutdown { reason: String },
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unparseable message.
    InvalidInput,
    /// `hello` not sent yet.
    NotIdentified,
    /// Identity bound to another live connection.
    IdentityInUse,
    /// Action refused by the game.
    InvalidAction,
    /// Match or player not found.
    NotFound,
    /// Already seated in a match.
    AlreadyInMatch,
    /// Not seated in any match.
    NotInMatch,
    /// Reconnect token refused.
    ReconnectionRejected,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::InvalidAction => ErrorCode::InvalidAction,
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::ReconnectionRejected => ErrorCode::ReconnectionRejected,
            ErrorKind::Fatal => ErrorCode::InternalError,
        }
    }
}

impl ServerError {
    /// Error with a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// One seat as seen by a particular viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatView {
    /// Seat index.
    pub seat: usize,
    /// Player identity.
    pub player: PlayerName,
    /// Team.
    pub team: Team,
    /// Bot-controlled.
    pub is_bot: bool,
    /// Connection status.
    pub connection: ConnectionStatus,
    /// Relaxed mode.
    pub relaxed: bool,
    /// Cards held.
    pub card_count: usize,
    /// Only present for the viewer's own seat.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hand: Option<Vec<Card>>,
    /// Tricks taken this round.
    pub tricks_won: u32,
    /// Points taken this round.
    pub points_won: i32,
}

/// Viewer-specific picture of a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    /// Match identifier.
    pub match_id: MatchId,
    /// Phase.
    pub phase: MatchPhase,
    /// Seats in play order.
    pub seats: Vec<SeatView>,
    /// Dealer seat.
    pub dealer_seat: usize,
    /// Seat whose action is due.
    pub current_seat: Option<usize>,
    /// Current round number.
    pub round: Option<u32>,
    /// Bids of the current round.
    pub bids: Vec<PlacedBid>,
    /// Contract, once bidding closed.
    pub contract: Option<Contract>,
    /// Trump color, once fixed.
    pub trump: Option<Color>,
    /// Trick on the table.
    pub current_trick: Vec<TrickPlay>,
    /// Tricks completed this round.
    pub tricks_played: usize,
    /// Cumulative scores.
    pub scores: TeamScores,
    /// Rounds completed this game.
    pub rounds_played: usize,
    /// Players who confirmed the next round.
    pub ready: Vec<PlayerName>,
    /// Players who voted for a rematch.
    pub rematch_votes: Vec<PlayerName>,
    /// Winner of the finished game.
    pub winner: Option<Team>,
    /// Seconds left on the turn timer.
    pub turn_seconds_left: Option<u64>,
    /// Actions applied so far.
    pub action_seq: u64,
    /// Hex SHA-256 of the authoritative state.
    pub state_hash: String,
}

/// Whole seconds shown to clients, rounded up so a countdown never
/// reads one second short.
pub fn seconds_left(remaining: Duration) -> u64 {
    remaining.saturating_add(Duration::from_nanos(999_999_999)).as_secs()
}

impl MatchSnapshot {
    /// Build the snapshot `viewer` is allowed to see. `None` is a spectator.
    pub fn build(state: &MatchState, viewer: Option<&PlayerName>, now: Instant) -> Self {
        let seats = state
            .players
            .iter()
            .enumerate()
            .map(|(seat, p)| SeatView {
                seat,
                player: p.name.clone(),
                team: p.team,
                is_bot: p.is_bot,
                connection: p.connection,
                relaxed: p.relaxed,
                card_count: p.hand.len(),
                hand: (Some(&p.name) == viewer).then(|| p.hand.clone()),
                tricks_won: p.tricks_won,
                points_won: p.points_won,
            })
            .collect();

        let round = state.round.as_ref();
        Self {
            match_id: state.id,
            phase: state.phase,
            seats,
            dealer_seat: state.dealer_seat,
            current_seat: state.current_seat,
            round: round.map(|r| r.number),
            bids: state.bidding.bids.clone(),
            contract: round.and_then(|r| r.contract.clone()),
            trump: round.and_then(|r| r.trump),
            current_trick: round.map(|r| r.current_trick.clone()).unwrap_or_default(),
            tricks_played: round.map_or(0, |r| r.completed_tricks.len()),
            scores: state.scores,
            rounds_played: state.history.len(),
            ready: state.ready.iter().cloned().collect(),
            rematch_votes: state.rematch_votes.iter().cloned().collect(),
            winner: state.winner,
            turn_seconds_left: state.turn_timer.map(|t| seconds_left(t.remaining(now))),
            action_seq: state.action_seq,
            state_hash: hex::encode(state.compute_hash()),
        }
    }
}

// =============================================================================
// EVENT TRANSLATION
// =============================================================================

impl ServerMessage {
    /// Client message for a game event.
    ///
    /// `snapshot` is attached to the events that carry state; `reconnect_window`
    /// is reported with disconnect notices.
    pub fn from_event(event: &GameEvent, snapshot: &MatchSnapshot, reconnect_window: Duration) -> Self {
        match event.data.clone() {
            GameEventData::PlayerJoined { player, seat, team, is_bot } => {
                ServerMessage::PlayerJoined { player, seat, team, is_bot }
            }
            GameEventData::TeamChosen { player, team } => ServerMessage::TeamChosen { player, team },
            GameEventData::PlayerLeft { player } => ServerMessage::PlayerLeft { player },
            GameEventData::GameStarted { seating } => ServerMessage::GameStarted { seating },
            GameEventData::RoundStarted { round, dealer } => ServerMessage::RoundStarted { round, dealer },
            GameEventData::BidPlaced { player, bid } => ServerMessage::BidPlaced { player, bid },
            GameEventData::BiddingClosed { contract } => ServerMessage::BiddingClosed { contract },
            GameEventData::TrumpSet { color } => ServerMessage::TrumpSet { color },
            GameEventData::CardPlayed { player, card } => ServerMessage::CardPlayed { player, card },
            GameEventData::TrickResolved { trick, winner, points } => ServerMessage::TrickResolved {
                trick,
                winner,
                points,
                state: snapshot.clone(),
            },
            GameEventData::RoundEnded { record } => ServerMessage::RoundEnded {
                record,
                state: snapshot.clone(),
            },
            GameEventData::GameOver { winning_team, scores } => ServerMessage::GameOver {
                winning_team,
                scores,
                state: snapshot.clone(),
            },
            GameEventData::ReadyForNextRound { player } => ServerMessage::ReadyForNextRound { player },
            GameEventData::RematchVoted { player } => ServerMessage::RematchVoted { player },
            GameEventData::RematchStarted => ServerMessage::RematchStarted,
            GameEventData::PlayerDisconnected { player } => ServerMessage::PlayerDisconnected {
                player_id: player,
                waiting_for_reconnection: true,
                reconnect_time_left: reconnect_window.as_secs(),
            },
            GameEventData::PlayerReconnected { player } => {
                ServerMessage::PlayerReconnected { player_id: player }
            }
            GameEventData::AutoActionTaken { player, phase } => {
                ServerMessage::AutoActionTaken { player, phase }
            }
            GameEventData::AfkWarning { player, warnings } => ServerMessage::AfkWarning { player, warnings },
            GameEventData::PlayerReplacedByBot { player } => ServerMessage::PlayerReplacedByBot { player },
            GameEventData::MatchAbandoned => ServerMessage::MatchAbandoned,
        }
    }

    /// Message telling the acting client why its action was refused.
    pub fn for_action_error(err: &ActionError) -> Self {
        if err.is_bet_error() {
            return ServerMessage::InvalidBet { message: err.to_string() };
        }
        match err.kind() {
            ErrorKind::InvalidAction => ServerMessage::InvalidMove { message: err.to_string() },
            kind => ServerMessage::error(kind.into(), err.to_string()),
        }
    }

    /// Error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError::new(code, message))
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
