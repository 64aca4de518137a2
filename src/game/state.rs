//! Match State
//!
//! The authoritative data for one match. Only the state machine holds a
//! mutable reference; everything else reads through `StateMachine::state`.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Serialize, Deserialize};

use crate::core::hash::{compute_state_hash, StateHash};
use crate::game::cards::{Card, Color, DECK_SIZE};
use crate::game::rules::{Contract, PlacedBid, RoundOutcome, TrickOutcome, TrickPlay};
use crate::game::timer::TurnTimer;

/// Number of seats at a table.
pub const PLAYER_COUNT: usize = 4;

/// Cards dealt to each seat.
pub const HAND_SIZE: usize = DECK_SIZE / PLAYER_COUNT;

/// Players per team.
pub const TEAM_SIZE: usize = PLAYER_COUNT / 2;

/// Unique match identifier.
pub type MatchId = uuid::Uuid;

// =============================================================================
// PLAYER
// =============================================================================

/// Stable player identity.
///
/// All game bookkeeping is keyed by name; connection ids come and go.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerName(String);

impl PlayerName {
    /// Wrap a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PlayerName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PlayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Team membership. Serialized as `1` or `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Team {
    /// Team 1, even seats once the game starts.
    One,
    /// Team 2, odd seats once the game starts.
    Two,
}

impl Team {
    /// Team sitting at `seat` after seats have been arranged.
    pub fn for_seat(seat: usize) -> Self {
        if seat % 2 == 0 { Team::One } else { Team::Two }
    }

    /// The opposing team.
    pub fn other(self) -> Self {
        match self {
            Team::One => Team::Two,
            Team::Two => Team::One,
        }
    }

    /// Index into per-team arrays.
    pub fn index(self) -> usize {
        match self {
            Team::One => 0,
            Team::Two => 1,
        }
    }
}

impl From<Team> for u8 {
    fn from(team: Team) -> u8 {
        team.index() as u8 + 1
    }
}

impl TryFrom<u8> for Team {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Team::One),
            2 => Ok(Team::Two),
            other => Err(format!("invalid team {}", other)),
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Connection status of a seated player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Live connection.
    Connected,
    /// Connection lost; the seat waits for a reconnect.
    Disconnected,
    /// Token accepted, new connection being attached.
    Reconnecting,
}

/// A seated player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    /// Stable identity.
    pub name: PlayerName,
    /// Team.
    pub team: Team,
    /// Cards currently held.
    pub hand: Vec<Card>,
    /// Tricks taken this round.
    pub tricks_won: u32,
    /// Points taken this round.
    pub points_won: i32,
    /// Connection status.
    pub connection: ConnectionStatus,
    /// Seat is driven by the fallback policy.
    pub is_bot: bool,
    /// Reduced-pressure mode: longer turn timers.
    pub relaxed: bool,
    /// Consecutive timeouts without a voluntary action.
    pub afk_warnings: u8,
}

impl Player {
    /// A freshly joined human.
    pub fn human(name: PlayerName, team: Team, relaxed: bool) -> Self {
        Self {
            name,
            team,
            hand: Vec::new(),
            tricks_won: 0,
            points_won: 0,
            connection: ConnectionStatus::Connected,
            is_bot: false,
            relaxed,
            afk_warnings: 0,
        }
    }

    /// A bot filling an empty seat.
    pub fn bot(name: PlayerName, team: Team) -> Self {
        Self { is_bot: true, ..Self::human(name, team, false) }
    }

    /// Human with a live connection.
    pub fn is_active_human(&self) -> bool {
        !self.is_bot && self.connection == ConnectionStatus::Connected
    }
}

// =============================================================================
// PHASES & ROUNDS
// =============================================================================

/// Match phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// Seating and team choice.
    TeamSelection,
    /// Bidding for the contract.
    Betting,
    /// Playing tricks.
    Playing,
    /// Round scored, waiting for the next one.
    Scoring,
    /// A team has won.
    GameOver,
    /// Every human left.
    Abandoned,
}

impl MatchPhase {
    /// Stable numeric index, used for hashing.
    pub fn index(self) -> u8 {
        match self {
            MatchPhase::TeamSelection => 0,
            MatchPhase::Betting => 1,
            MatchPhase::Playing => 2,
            MatchPhase::Scoring => 3,
            MatchPhase::GameOver => 4,
            MatchPhase::Abandoned => 5,
        }
    }
}

impl fmt::Display for MatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchPhase::TeamSelection => "team_selection",
            MatchPhase::Betting => "betting",
            MatchPhase::Playing => "playing",
            MatchPhase::Scoring => "scoring",
            MatchPhase::GameOver => "game_over",
            MatchPhase::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Bids of the current round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BiddingState {
    /// Bids in the order they were placed.
    pub bids: Vec<PlacedBid>,
    /// Window still accepting bids.
    pub open: bool,
}

/// A trick that has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTrick {
    /// Plays in order.
    pub plays: Vec<TrickPlay>,
    /// Who took it and for how much.
    pub outcome: TrickOutcome,
}

/// The round in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundState {
    /// 1-based round number within the game.
    pub number: u32,
    /// Dealer seat for this round.
    pub dealer_seat: usize,
    /// Winning bid, once bidding closes.
    pub contract: Option<Contract>,
    /// Trump color, fixed by the first card of a trump contract.
    pub trump: Option<Color>,
    /// Trick being played.
    pub current_trick: Vec<TrickPlay>,
    /// Tricks already resolved.
    pub completed_tricks: Vec<CompletedTrick>,
}

impl RoundState {
    /// A freshly dealt round.
    pub fn new(number: u32, dealer_seat: usize) -> Self {
        Self {
            number,
            dealer_seat,
            contract: None,
            trump: None,
            current_trick: Vec::new(),
            completed_tricks: Vec::new(),
        }
    }
}

/// Cumulative score per team.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamScores {
    /// Team 1.
    pub team1: i32,
    /// Team 2.
    pub team2: i32,
}

impl TeamScores {
    /// Score of `team`.
    pub fn get(&self, team: Team) -> i32 {
        match team {
            Team::One => self.team1,
            Team::Two => self.team2,
        }
    }

    /// Add `delta` to `team`.
    pub fn add(&mut self, team: Team, delta: i32) {
        match team {
            Team::One => self.team1 += delta,
            Team::Two => self.team2 += delta,
        }
    }

    /// Team strictly ahead, if any.
    pub fn leader(&self) -> Option<Team> {
        match self.team1.cmp(&self.team2) {
            std::cmp::Ordering::Greater => Some(Team::One),
            std::cmp::Ordering::Less => Some(Team::Two),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Append-only record of a completed round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Round number within the game.
    pub number: u32,
    /// Dealer of the round.
    pub dealer: PlayerName,
    /// The contract played.
    pub contract: Contract,
    /// Offensive team.
    pub offense: Team,
    /// Trump color, if any.
    pub trump: Option<Color>,
    /// All tricks in order.
    pub tricks: Vec<CompletedTrick>,
    /// Scoring result.
    pub outcome: RoundOutcome,
    /// Cumulative scores after this round.
    pub scores_after: TeamScores,
}

// =============================================================================
// MATCH
// =============================================================================

/// Broken structural invariant. Fatal for the match that raised it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    /// Cards were created or lost.
    #[error("Card count mismatch: expected {expected}, found {found}")]
    CardCount {
        /// Deck size.
        expected: usize,
        /// Cards accounted for.
        found: usize,
    },

    /// The same card is in two places.
    #[error("Duplicate card {0}")]
    DuplicateCard(Card),

    /// Turn pointer is missing or points at an empty seat.
    #[error("Turn pointer invalid in {phase}: {seat:?}")]
    TurnPointer {
        /// Phase at the time.
        phase: MatchPhase,
        /// Offending seat.
        seat: Option<usize>,
    },

    /// Seat/team arrangement broken after the game started.
    #[error("Seat {0} is not on its team")]
    Seating(usize),

    /// Two seats share one identity.
    #[error("Identity {0} is seated twice")]
    DuplicateIdentity(PlayerName),
}

/// Full authoritative state for one match.
#[derive(Debug, Clone)]
pub struct MatchState {
    /// Match identifier.
    pub id: MatchId,
    /// Seed every deal is derived from.
    pub rng_seed: u64,
    /// Seats in play order.
    pub players: Vec<Player>,
    /// Current phase.
    pub phase: MatchPhase,
    /// Dealer seat.
    pub dealer_seat: usize,
    /// Seat whose action is due, only while betting or playing.
    pub current_seat: Option<usize>,
    /// Count of applied actions, including fallbacks.
    pub action_seq: u64,
    /// Count of emitted events.
    pub event_seq: u64,
    /// Rounds dealt over the lifetime of the match, across rematches.
    pub deals: u32,
    /// Games finished in this match.
    pub games_played: u32,
    /// Bidding of the current round.
    pub bidding: BiddingState,
    /// Round in progress.
    pub round: Option<RoundState>,
    /// Completed rounds of the current game.
    pub history: Vec<RoundRecord>,
    /// Cumulative scores of the current game.
    pub scores: TeamScores,
    /// Armed turn timer.
    pub turn_timer: Option<TurnTimer>,
    /// Players who confirmed the next round.
    pub ready: BTreeSet<PlayerName>,
    /// Players who asked for a rematch.
    pub rematch_votes: BTreeSet<PlayerName>,
    /// Winner of the last finished game.
    pub winner: Option<Team>,
}

impl MatchState {
    /// Empty match in team selection.
    pub fn new(id: MatchId, rng_seed: u64) -> Self {
        Self {
            id,
            rng_seed,
            players: Vec::with_capacity(PLAYER_COUNT),
            phase: MatchPhase::TeamSelection,
            dealer_seat: 0,
            current_seat: None,
            action_seq: 0,
            event_seq: 0,
            deals: 0,
            games_played: 0,
            bidding: BiddingState::default(),
            round: None,
            history: Vec::new(),
            scores: TeamScores::default(),
            turn_timer: None,
            ready: BTreeSet::new(),
            rematch_votes: BTreeSet::new(),
            winner: None,
        }
    }

    /// Seat of a player.
    pub fn seat_of(&self, name: &PlayerName) -> Option<usize> {
        self.players.iter().position(|p| &p.name == name)
    }

    /// Player by identity.
    pub fn player(&self, name: &PlayerName) -> Option<&Player> {
        self.players.iter().find(|p| &p.name == name)
    }

    /// Player whose action is due.
    pub fn current_player(&self) -> Option<&Player> {
        self.current_seat.and_then(|seat| self.players.get(seat))
    }

    /// Humans still holding a seat.
    pub fn human_count(&self) -> usize {
        self.players.iter().filter(|p| !p.is_bot).count()
    }

    /// Humans with a live connection.
    pub fn active_humans(&self) -> impl Iterator<Item = &Player> {
        self.players.iter().filter(|p| p.is_active_human())
    }

    /// Members of `team`.
    pub fn team_members(&self, team: Team) -> impl Iterator<Item = &Player> {
        self.players.iter().filter(move |p| p.team == team)
    }

    /// Whether a round has been dealt and not yet cleared.
    pub fn cards_in_play(&self) -> bool {
        matches!(self.phase, MatchPhase::Betting | MatchPhase::Playing | MatchPhase::Scoring)
    }

    /// Cards in hands, completed tricks and the current trick.
    pub fn card_count(&self) -> usize {
        let in_hands: usize = self.players.iter().map(|p| p.hand.len()).sum();
        let on_table = self.round.as_ref().map_or(0, |r| {
            r.current_trick.len() + r.completed_tricks.iter().map(|t| t.plays.len()).sum::<usize>()
        });
        in_hands + on_table
    }

    /// Verify structural invariants.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut names = BTreeSet::new();
        for player in &self.players {
            if !names.insert(&player.name) {
                return Err(InvariantViolation::DuplicateIdentity(player.name.clone()));
            }
        }

        if self.cards_in_play() {
            let found = self.card_count();
            if found != DECK_SIZE {
                return Err(InvariantViolation::CardCount { expected: DECK_SIZE, found });
            }

            let mut seen = BTreeSet::new();
            let hands = self.players.iter().flat_map(|p| p.hand.iter().copied());
            let table = self.round.iter().flat_map(|r| {
                r.current_trick
                    .iter()
                    .chain(r.completed_tricks.iter().flat_map(|t| t.plays.iter()))
                    .map(|p| p.card)
            });
            for card in hands.chain(table) {
                if !seen.insert(card) {
                    return Err(InvariantViolation::DuplicateCard(card));
                }
            }

            for (seat, player) in self.players.iter().enumerate() {
                if player.team != Team::for_seat(seat) {
                    return Err(InvariantViolation::Seating(seat));
                }
            }
        }

        let needs_turn = matches!(self.phase, MatchPhase::Betting | MatchPhase::Playing);
        let turn_ok = match self.current_seat {
            Some(seat) => needs_turn && seat < self.players.len(),
            None => !needs_turn,
        };
        if !turn_ok {
            return Err(InvariantViolation::TurnPointer {
                phase: self.phase,
                seat: self.current_seat,
            });
        }

        Ok(())
    }

    /// Deterministic hash of the authoritative fields.
    pub fn compute_hash(&self) -> StateHash {
        compute_state_hash(self.action_seq, self.rng_seed, |h| {
            h.update_bytes(self.id.as_bytes());
            h.update_u8(self.phase.index());
            h.update_u32(self.dealer_seat as u32);
            h.update_u32(self.current_seat.map_or(u32::MAX, |s| s as u32));

            for player in &self.players {
                h.update_str(player.name.as_str());
                h.update_u8(u8::from(player.team));
                h.update_bool(player.is_bot);
                h.update_u32(player.tricks_won);
                h.update_i32(player.points_won);
                h.update_u32(player.hand.len() as u32);
                for card in &player.hand {
                    h.update_u8(card.color.index());
                    h.update_u8(card.value);
                }
            }

            if let Some(round) = &self.round {
                h.update_u32(round.number);
                h.update_u8(round.trump.map_or(u8::MAX, |c| c.index()));
                for play in &round.current_trick {
                    h.update_u32(play.seat as u32);
                    h.update_u8(play.card.color.index());
                    h.update_u8(play.card.value);
                }
                h.update_u32(round.completed_tricks.len() as u32);
            }

            h.update_i32(self.scores.team1);
            h.update_i32(self.scores.team2);
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::cards::full_deck;

    fn seated_state() -> MatchState {
        let mut state = MatchState::new(MatchId::nil(), 7);
        for (seat, name) in ["a", "b", "c", "d"].iter().enumerate() {
            state.players.push(Player::human(PlayerName::from(*name), Team::for_seat(seat), false));
        }
        state
    }

    fn dealt_state() -> MatchState {
        let mut state = seated_state();
        let deck = full_deck();
        for (seat, chunk) in deck.chunks(HAND_SIZE).enumerate() {
            state.players[seat].hand = chunk.to_vec();
        }
        state.phase = MatchPhase::Betting;
        state.current_seat = Some(1);
        state.round = Some(RoundState::new(1, 0));
        state
    }

    #[test]
    fn test_team_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Team::Two).unwrap(), "2");
        assert_eq!(serde_json::from_str::<Team>("1").unwrap(), Team::One);
        assert!(serde_json::from_str::<Team>("3").is_err());
    }

    #[test]
    fn test_team_for_seat_alternates() {
        assert_eq!(Team::for_seat(0), Team::One);
        assert_eq!(Team::for_seat(1), Team::Two);
        assert_eq!(Team::for_seat(2), Team::One);
        assert_eq!(Team::for_seat(3).other(), Team::One);
    }

    #[test]
    fn test_new_match_is_valid() {
        let state = MatchState::new(MatchId::nil(), 1);
        assert_eq!(state.phase, MatchPhase::TeamSelection);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_card_conservation_detected() {
        let mut state = dealt_state();
        assert!(state.check_invariants().is_ok());

        state.players[0].hand.pop();
        assert_eq!(
            state.check_invariants(),
            Err(InvariantViolation::CardCount { expected: 32, found: 31 })
        );
    }

    #[test]
    fn test_duplicate_card_detected() {
        let mut state = dealt_state();
        let card = state.players[0].hand[0];
        state.players[1].hand[0] = card;
        assert_eq!(state.check_invariants(), Err(InvariantViolation::DuplicateCard(card)));
    }

    #[test]
    fn test_turn_pointer_required_while_betting() {
        let mut state = dealt_state();
        state.current_seat = None;
        assert!(matches!(
            state.check_invariants(),
            Err(InvariantViolation::TurnPointer { phase: MatchPhase::Betting, .. })
        ));
    }

    #[test]
    fn test_hash_tracks_hands() {
        let state = dealt_state();
        let mut other = state.clone();
        assert_eq!(state.compute_hash(), other.compute_hash());

        other.players[0].hand.swap(0, 1);
        assert_ne!(state.compute_hash(), other.compute_hash());
    }

    #[test]
    fn test_team_scores_leader() {
        let mut scores = TeamScores::default();
        assert_eq!(scores.leader(), None);
        scores.add(Team::Two, 12);
        assert_eq!(scores.leader(), Some(Team::Two));
        assert_eq!(scores.get(Team::One), 0);
    }
}
