//! History Records
//!
//! Finalized records of completed rounds and games, handed to the
//! persistence layer. Compact bincode encoding for storage, serde for
//! anything else.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::game::state::{MatchId, MatchState, PlayerName, RoundRecord, Team, TeamScores};

/// Current record format version.
pub const HISTORY_VERSION: u8 = 1;

/// One completed round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundHistory {
    /// Version for forward compatibility.
    pub version: u8,
    /// Match the round belongs to.
    pub match_id: MatchId,
    /// 1-based game number within the match (rematches increment it).
    pub game_number: u32,
    /// The round itself.
    pub round: RoundRecord,
    /// When the round was scored.
    pub recorded_at: DateTime<Utc>,
}

/// One completed game.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameHistory {
    /// Version for forward compatibility.
    pub version: u8,
    /// Match the game belongs to.
    pub match_id: MatchId,
    /// 1-based game number within the match.
    pub game_number: u32,
    /// Seats in play order, with team and bot flag at game end.
    pub seats: Vec<SeatSummary>,
    /// Rounds played.
    pub rounds_played: u32,
    /// Final cumulative scores.
    pub final_scores: TeamScores,
    /// Winning team.
    pub winning_team: Team,
    /// When the first round was dealt.
    pub started_at: DateTime<Utc>,
    /// When the game ended.
    pub finished_at: DateTime<Utc>,
}

/// Seat as recorded in a [`GameHistory`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatSummary {
    /// Player identity.
    pub player: PlayerName,
    /// Team.
    pub team: Team,
    /// Seat ended the game under bot control.
    pub is_bot: bool,
}

/// Anything a sink can receive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HistoryRecord {
    /// Round scored.
    Round(RoundHistory),
    /// Game finished.
    Game(GameHistory),
}

/// Errors that can occur with history records.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Encoding failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Decoding failed.
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Record written by an incompatible version.
    #[error("Version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Version this build understands.
        expected: u8,
        /// Version found.
        got: u8,
    },
}

impl RoundHistory {
    /// Record a round that was just scored.
    pub fn new(match_id: MatchId, game_number: u32, round: RoundRecord) -> Self {
        Self {
            version: HISTORY_VERSION,
            match_id,
            game_number,
            round,
            recorded_at: Utc::now(),
        }
    }
}

impl GameHistory {
    /// Record the game that just ended in `state`.
    ///
    /// Returns `None` unless the state holds a finished game.
    pub fn from_state(state: &MatchState, started_at: DateTime<Utc>) -> Option<Self> {
        let winning_team = state.winner?;
        let seats = state
            .players
            .iter()
            .map(|p| SeatSummary { player: p.name.clone(), team: p.team, is_bot: p.is_bot })
            .collect();

        Some(Self {
            version: HISTORY_VERSION,
            match_id: state.id,
            game_number: state.games_played,
            seats,
            rounds_played: state.history.len() as u32,
            final_scores: state.scores,
            winning_team,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

impl HistoryRecord {
    /// Match the record belongs to.
    pub fn match_id(&self) -> MatchId {
        match self {
            HistoryRecord::Round(r) => r.match_id,
            HistoryRecord::Game(g) => g.match_id,
        }
    }

    /// Serialize to bytes using bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, HistoryError> {
        bincode::serialize(self).map_err(|e| HistoryError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HistoryError> {
        let record: Self = bincode::deserialize(data)
            .map_err(|e| HistoryError::Deserialization(e.to_string()))?;

        let got = match &record {
            HistoryRecord::Round(r) => r.version,
            HistoryRecord::Game(g) => g.version,
        };
        if got != HISTORY_VERSION {
            return Err(HistoryError::VersionMismatch { expected: HISTORY_VERSION, got });
        }
        Ok(record)
    }
}
