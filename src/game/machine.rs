//! State Machine
//!
//! Applies player actions and timer expiries to a [`MatchState`].
//! Every mutation of a match goes through [`StateMachine`]; callers get
//! back a [`Transition`] listing the events that happened, in order.
//!
//! ## Phases
//!
//! ```text
//! team_selection -> betting -> playing -> scoring -> betting ...
//!                                            \-> game_over -> team_selection
//! (any) -> abandoned
//! ```

use std::str::FromStr;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::rng::{derive_match_seed, DeterministicRng};
use crate::game::cards::{deal, Card, Color};
use crate::game::events::{GameEvent, GameEventData};
use crate::game::rules::{
    fallback_bid, fallback_card, led_color, legal_plays, resolve_bidding_round, resolve_trick,
    score_round, trump_for, validate_bet, BetRejection, Bid, PlacedBid, ScoringRules, TrickPlay,
    MAX_BET,
};
use crate::game::state::{
    BiddingState, CompletedTrick, ConnectionStatus, MatchId, MatchPhase, MatchState, Player,
    PlayerName, RoundRecord, RoundState, Team, TeamScores, HAND_SIZE, PLAYER_COUNT, TEAM_SIZE,
};
use crate::game::timer::{TimerKey, TurnTimer, TurnTimerConfig};

/// Upper bound on automatic actions chained after one input.
const MAX_AUTO_STEPS: usize = 128;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// What happens to a seat whose player never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Seat becomes a permanent bot.
    Bot,
    /// Match is abandoned.
    Terminate,
}

impl FromStr for DisconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bot" => Ok(DisconnectPolicy::Bot),
            "terminate" => Ok(DisconnectPolicy::Terminate),
            other => Err(format!("unknown disconnect policy '{}'", other)),
        }
    }
}

impl std::fmt::Display for DisconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectPolicy::Bot => f.write_str("bot"),
            DisconnectPolicy::Terminate => f.write_str("terminate"),
        }
    }
}

/// Per-match rules and timing.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Round scoring parameters.
    pub scoring: ScoringRules,
    /// Cumulative score that ends the game.
    pub win_threshold: i32,
    /// Rounds per game, 0 for no limit.
    pub max_rounds: u32,
    /// Turn durations.
    pub timers: TurnTimerConfig,
    /// Consecutive timeouts before the seat goes to a bot.
    pub max_afk_warnings: u8,
    /// Fate of a seat whose reconnect window runs out.
    pub disconnect_policy: DisconnectPolicy,
    /// How long a disconnected player may come back.
    pub reconnect_window: Duration,
    /// How long a finished game waits for a rematch before the match closes.
    pub game_over_grace: Duration,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringRules::default(),
            win_threshold: 41,
            max_rounds: 16,
            timers: TurnTimerConfig::default(),
            max_afk_warnings: 3,
            disconnect_policy: DisconnectPolicy::Bot,
            reconnect_window: Duration::from_secs(90),
            game_over_grace: Duration::from_secs(120),
        }
    }
}

// =============================================================================
// ACTIONS & ERRORS
// =============================================================================

/// Something a seated player asks to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Switch team during team selection.
    ChooseTeam {
        /// Target team.
        team: Team,
    },
    /// Fill an empty seat with a bot.
    AddBot,
    /// Arrange seats and deal the first round.
    Start,
    /// Bid or skip.
    Bid(Bid),
    /// Play a card.
    PlayCard(Card),
    /// Confirm the next round.
    Ready,
    /// Ask for a rematch.
    VoteRematch,
}

/// Error categories shared by every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Wrong turn, illegal card, malformed bet.
    InvalidAction,
    /// Unknown match or player.
    NotFound,
    /// Expired, consumed or mismatched reconnect token.
    ReconnectionRejected,
    /// Broken invariant; the match halts.
    Fatal,
}

/// Why an action was refused. State is unchanged whenever one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// Someone else's turn.
    #[error("Not your turn")]
    NotYourTurn,

    /// Action does not exist in this phase.
    #[error("Not allowed during {0}")]
    WrongPhase(MatchPhase),

    /// Bet refused by the rules.
    #[error("{0}")]
    InvalidBet(#[from] BetRejection),

    /// Card not held.
    #[error("Card {0} is not in your hand")]
    CardNotInHand(Card),

    /// Led color must be followed.
    #[error("Card {card} does not follow {led}")]
    MustFollow {
        /// Card attempted.
        card: Card,
        /// Color led.
        led: Color,
    },

    /// Not seated in this match.
    #[error("Player {0} is not seated in this match")]
    UnknownPlayer(PlayerName),

    /// Already seated.
    #[error("Player {0} is already seated")]
    AlreadySeated(PlayerName),

    /// No free seat.
    #[error("All seats are taken")]
    SeatsFull,

    /// Target team already complete.
    #[error("Team {0} is full")]
    TeamFull(Team),

    /// Start needs four players, two per team.
    #[error("Need four players, two per team")]
    TeamsUnbalanced,

    /// Seat was handed to a bot.
    #[error("Seat of {0} is now played by a bot")]
    SeatForfeited(PlayerName),

    /// Match abandoned.
    #[error("Match is closed")]
    MatchClosed,
}

impl ActionError {
    /// Error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::UnknownPlayer(_) => ErrorKind::NotFound,
            _ => ErrorKind::InvalidAction,
        }
    }

    /// Whether the client should see this as `invalid_bet`.
    pub fn is_bet_error(&self) -> bool {
        matches!(self, ActionError::InvalidBet(_))
    }
}

/// Events produced by one call into the state machine.
#[derive(Debug, Default, Clone)]
pub struct Transition {
    /// Events in the order they happened.
    pub events: Vec<GameEvent>,
}

impl Transition {
    /// Nothing happened.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether any event matches `pred`.
    pub fn any(&self, pred: impl Fn(&GameEventData) -> bool) -> bool {
        self.events.iter().any(|e| pred(&e.data))
    }
}

/// Imminent-timeout notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutWarning {
    /// Turn concerned.
    pub key: TimerKey,
    /// Player who owes the action, `None` for a table-wide wait.
    pub player: Option<PlayerName>,
    /// Time left.
    pub remaining: Duration,
}

fn next_seat(seat: usize) -> usize {
    (seat + 1) % PLAYER_COUNT
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Sole owner of a match's state.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: MatchState,
    config: MatchConfig,
}

impl StateMachine {
    /// New match seeded from its id.
    pub fn new(id: MatchId, config: MatchConfig) -> Self {
        Self::with_seed(id, derive_match_seed(id.as_bytes()), config)
    }

    /// New match with an explicit deal seed (replays and tests).
    pub fn with_seed(id: MatchId, seed: u64, config: MatchConfig) -> Self {
        Self { state: MatchState::new(id, seed), config }
    }

    /// Read-only view of the state.
    pub fn state(&self) -> &MatchState {
        &self.state
    }

    /// Match configuration.
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Next instant the owner must wake up for (warning or expiry).
    pub fn next_deadline(&self) -> Option<Instant> {
        let lead = self.config.timers.warning_lead;
        self.state.turn_timer.map(|t| t.next_wakeup(lead))
    }

    fn emit(&mut self, t: &mut Transition, data: GameEventData) {
        t.events.push(GameEvent::new(self.state.event_seq, data));
        self.state.event_seq += 1;
    }

    fn require_phase(&self, phase: MatchPhase) -> Result<(), ActionError> {
        if self.state.phase == MatchPhase::Abandoned {
            return Err(ActionError::MatchClosed);
        }
        if self.state.phase != phase {
            return Err(ActionError::WrongPhase(self.state.phase));
        }
        Ok(())
    }

    fn require_turn(&self, seat: usize) -> Result<(), ActionError> {
        if self.state.current_seat != Some(seat) {
            return Err(ActionError::NotYourTurn);
        }
        Ok(())
    }

    fn seat_for(&self, name: &PlayerName) -> Result<usize, ActionError> {
        self.state
            .seat_of(name)
            .ok_or_else(|| ActionError::UnknownPlayer(name.clone()))
    }

    // =========================================================================
    // SEATING
    // =========================================================================

    /// Seat a new player. Only during team selection.
    pub fn join(&mut self, name: PlayerName, relaxed: bool) -> Result<Transition, ActionError> {
        self.require_phase(MatchPhase::TeamSelection)?;
        if self.state.seat_of(&name).is_some() {
            return Err(ActionError::AlreadySeated(name));
        }
        if self.state.players.len() >= PLAYER_COUNT {
            return Err(ActionError::SeatsFull);
        }

        let team = self.open_team();
        let seat = self.state.players.len();
        self.state.players.push(Player::human(name.clone(), team, relaxed));

        let mut t = Transition::default();
        self.emit(&mut t, GameEventData::PlayerJoined { player: name, seat, team, is_bot: false });
        Ok(t)
    }

    /// Team with fewer members, team 1 on ties.
    fn open_team(&self) -> Team {
        let ones = self.state.team_members(Team::One).count();
        let twos = self.state.team_members(Team::Two).count();
        if twos < ones { Team::Two } else { Team::One }
    }

    fn add_bot(&mut self, t: &mut Transition) -> Result<(), ActionError> {
        if self.state.players.len() >= PLAYER_COUNT {
            return Err(ActionError::SeatsFull);
        }
        let name = (1..=PLAYER_COUNT + 1)
            .map(|n| PlayerName::new(format!("bot-{}", n)))
            .find(|n| self.state.seat_of(n).is_none())
            .ok_or(ActionError::SeatsFull)?;

        let team = self.open_team();
        let seat = self.state.players.len();
        self.state.players.push(Player::bot(name.clone(), team));
        self.emit(t, GameEventData::PlayerJoined { player: name, seat, team, is_bot: true });
        Ok(())
    }

    fn choose_team(&mut self, seat: usize, team: Team, t: &mut Transition) -> Result<(), ActionError> {
        let taken = self
            .state
            .players
            .iter()
            .enumerate()
            .filter(|(i, p)| *i != seat && p.team == team)
            .count();
        if taken >= TEAM_SIZE {
            return Err(ActionError::TeamFull(team));
        }

        self.state.players[seat].team = team;
        let player = self.state.players[seat].name.clone();
        self.emit(t, GameEventData::TeamChosen { player, team });
        Ok(())
    }

    fn start(&mut self, t: &mut Transition) -> Result<(), ActionError> {
        let balanced = self.state.players.len() == PLAYER_COUNT
            && self.state.team_members(Team::One).count() == TEAM_SIZE;
        if !balanced {
            return Err(ActionError::TeamsUnbalanced);
        }

        // Alternate teams around the table, keeping join order within a team
        let (ones, twos): (Vec<Player>, Vec<Player>) = std::mem::take(&mut self.state.players)
            .into_iter()
            .partition(|p| p.team == Team::One);
        self.state.players = ones.into_iter().zip(twos).flat_map(|(a, b)| [a, b]).collect();

        let seating = self.state.players.iter().map(|p| p.name.clone()).collect();
        self.emit(t, GameEventData::GameStarted { seating });
        self.start_round(t);
        Ok(())
    }

    // =========================================================================
    // ROUNDS
    // =========================================================================

    fn start_round(&mut self, t: &mut Transition) {
        self.state.deals += 1;
        let number = self.state.history.len() as u32 + 1;

        let mut rng = DeterministicRng::for_round(self.state.rng_seed, self.state.deals);
        let hands = deal(&mut rng, PLAYER_COUNT);
        for (player, hand) in self.state.players.iter_mut().zip(hands) {
            player.hand = hand;
            player.tricks_won = 0;
            player.points_won = 0;
        }

        let dealer_seat = self.state.dealer_seat;
        self.state.round = Some(RoundState::new(number, dealer_seat));
        self.state.bidding = BiddingState { bids: Vec::new(), open: true };
        self.state.ready.clear();
        self.state.phase = MatchPhase::Betting;
        self.state.current_seat = Some(next_seat(dealer_seat));

        let dealer = self.state.players[dealer_seat].name.clone();
        self.emit(t, GameEventData::RoundStarted { round: number, dealer });
    }

    fn place_bid(&mut self, seat: usize, bid: Bid, t: &mut Transition) -> Result<(), ActionError> {
        validate_bet(&self.state.bidding.bids, &bid, self.state.bidding.open)?;

        let player = self.state.players[seat].name.clone();
        self.state.bidding.bids.push(PlacedBid { player: player.clone(), seat, bid });
        self.state.action_seq += 1;
        self.emit(t, GameEventData::BidPlaced { player, bid });

        let closes = bid.amount() == Some(MAX_BET) || self.state.bidding.bids.len() >= PLAYER_COUNT;
        if closes {
            self.close_bidding(t);
        } else {
            self.state.current_seat = Some(next_seat(seat));
        }
        Ok(())
    }

    fn close_bidding(&mut self, t: &mut Transition) {
        let dealer_seat = self.state.dealer_seat;
        let dealer = self.state.players[dealer_seat].name.clone();
        let contract = resolve_bidding_round(&self.state.bidding.bids, &dealer, dealer_seat);
        if contract.forced {
            debug!("All players skipped, {} forced to {}", dealer, contract.amount);
        }

        self.state.bidding.open = false;
        self.state.current_seat = Some(contract.seat);
        self.state.phase = MatchPhase::Playing;
        if let Some(round) = self.state.round.as_mut() {
            round.contract = Some(contract.clone());
        }
        self.emit(t, GameEventData::BiddingClosed { contract });
    }

    fn play_card(&mut self, seat: usize, card: Card, t: &mut Transition) -> Result<(), ActionError> {
        let phase = self.state.phase;
        let round = self.state.round.as_ref().ok_or(ActionError::WrongPhase(phase))?;
        let hand = &self.state.players[seat].hand;

        let pos = hand
            .iter()
            .position(|c| *c == card)
            .ok_or(ActionError::CardNotInHand(card))?;
        if !legal_plays(hand, &round.current_trick).contains(&card) {
            let led = led_color(&round.current_trick).unwrap_or(card.color);
            return Err(ActionError::MustFollow { card, led });
        }

        // Validated; mutate from here on
        let player = self.state.players[seat].name.clone();
        self.state.players[seat].hand.remove(pos);
        self.state.action_seq += 1;

        let mut trump_set = None;
        let mut completed = None;
        if let Some(round) = self.state.round.as_mut() {
            if round.current_trick.is_empty() && round.completed_tricks.is_empty() {
                if let Some(contract) = &round.contract {
                    round.trump = trump_for(contract, card);
                    trump_set = round.trump;
                }
            }

            round.current_trick.push(TrickPlay { player: player.clone(), seat, card });

            if round.current_trick.len() == PLAYER_COUNT {
                if let Some(outcome) = resolve_trick(&round.current_trick, round.trump) {
                    let plays = std::mem::take(&mut round.current_trick);
                    round.completed_tricks.push(CompletedTrick { plays, outcome: outcome.clone() });
                    completed = Some((round.completed_tricks.len(), outcome));
                }
            }
        }

        self.emit(t, GameEventData::CardPlayed { player, card });
        if let Some(color) = trump_set {
            self.emit(t, GameEventData::TrumpSet { color });
        }

        match completed {
            Some((trick_no, outcome)) => {
                let winner = &mut self.state.players[outcome.winner_seat];
                winner.tricks_won += 1;
                winner.points_won += outcome.points;

                self.emit(t, GameEventData::TrickResolved {
                    trick: trick_no as u32,
                    winner: outcome.winner,
                    points: outcome.points,
                });

                if trick_no >= HAND_SIZE {
                    self.finish_round(t);
                } else {
                    self.state.current_seat = Some(outcome.winner_seat);
                }
            }
            None => self.state.current_seat = Some(next_seat(seat)),
        }
        Ok(())
    }

    fn play_fallback_card(&mut self, seat: usize, t: &mut Transition) -> bool {
        let Some(round) = self.state.round.as_ref() else {
            return false;
        };
        match fallback_card(&self.state.players[seat].hand, &round.current_trick) {
            Some(card) => self.play_card(seat, card, t).is_ok(),
            None => false,
        }
    }

    fn finish_round(&mut self, t: &mut Transition) {
        let Some(round) = self.state.round.as_ref() else {
            return;
        };
        let Some(contract) = round.contract.clone() else {
            return;
        };
        let number = round.number;
        let dealer = self.state.players[round.dealer_seat].name.clone();
        let trump = round.trump;
        let tricks = round.completed_tricks.clone();

        let offense = Team::for_seat(contract.seat);
        let offense_points: i32 = self.state.team_members(offense).map(|p| p.points_won).sum();
        let outcome = score_round(&contract, offense_points, &self.config.scoring);

        self.state.scores.add(offense, outcome.offense_delta);
        self.state.scores.add(offense.other(), outcome.defense_delta);
        self.state.current_seat = None;

        let record = RoundRecord {
            number,
            dealer,
            contract,
            offense,
            trump,
            tricks,
            outcome,
            scores_after: self.state.scores,
        };
        self.state.history.push(record.clone());
        self.emit(t, GameEventData::RoundEnded { record });

        match self.game_winner(offense) {
            Some(winning_team) => {
                self.state.phase = MatchPhase::GameOver;
                self.state.winner = Some(winning_team);
                self.state.games_played += 1;
                self.state.rematch_votes.clear();
                let scores = self.state.scores;
                self.emit(t, GameEventData::GameOver { winning_team, scores });
            }
            None => {
                self.state.phase = MatchPhase::Scoring;
                self.state.ready.clear();
            }
        }
    }

    /// Winner if the game is over. Ties go to the last offensive team.
    fn game_winner(&self, last_offense: Team) -> Option<Team> {
        let scores = self.state.scores;
        let threshold = self.config.win_threshold;
        let threshold_hit = scores.team1 >= threshold || scores.team2 >= threshold;
        let limit_hit =
            self.config.max_rounds > 0 && self.state.history.len() as u32 >= self.config.max_rounds;

        (threshold_hit || limit_hit).then(|| scores.leader().unwrap_or(last_offense))
    }

    fn next_round(&mut self, t: &mut Transition) {
        self.state.dealer_seat = next_seat(self.state.dealer_seat);
        self.start_round(t);
    }

    fn ready_quorum(&self) -> bool {
        self.state.active_humans().all(|p| self.state.ready.contains(&p.name))
    }

    fn rematch_quorum(&self) -> bool {
        !self.state.rematch_votes.is_empty()
            && self.state.active_humans().all(|p| self.state.rematch_votes.contains(&p.name))
    }

    fn start_rematch(&mut self, t: &mut Transition) {
        for player in &mut self.state.players {
            player.hand.clear();
            player.tricks_won = 0;
            player.points_won = 0;
            player.afk_warnings = 0;
        }
        self.state.phase = MatchPhase::TeamSelection;
        self.state.dealer_seat = next_seat(self.state.dealer_seat);
        self.state.current_seat = None;
        self.state.bidding = BiddingState::default();
        self.state.round = None;
        self.state.history.clear();
        self.state.scores = TeamScores::default();
        self.state.ready.clear();
        self.state.rematch_votes.clear();
        self.state.winner = None;
        self.emit(t, GameEventData::RematchStarted);
    }

    fn abandon(&mut self, t: &mut Transition) {
        if self.state.phase == MatchPhase::Abandoned {
            return;
        }
        self.state.phase = MatchPhase::Abandoned;
        self.state.current_seat = None;
        self.state.turn_timer = None;
        self.emit(t, GameEventData::MatchAbandoned);
    }

    fn convert_to_bot(&mut self, seat: usize, t: &mut Transition) {
        let player = &mut self.state.players[seat];
        if player.is_bot {
            return;
        }
        player.is_bot = true;
        let name = player.name.clone();
        self.state.ready.remove(&name);
        self.state.rematch_votes.remove(&name);
        self.emit(t, GameEventData::PlayerReplacedByBot { player: name });

        if self.state.human_count() == 0 {
            self.abandon(t);
        }
    }

    fn record_afk(&mut self, seat: usize, t: &mut Transition) {
        let player = &mut self.state.players[seat];
        player.afk_warnings = player.afk_warnings.saturating_add(1);
        let warnings = player.afk_warnings;
        let name = player.name.clone();
        self.emit(t, GameEventData::AfkWarning { player: name.clone(), warnings });

        if warnings >= self.config.max_afk_warnings {
            warn!("Player {} missed {} turns in a row, handing seat to a bot", name, warnings);
            self.convert_to_bot(seat, t);
        }
    }

    // =========================================================================
    // AUTOMATIC PROGRESS
    // =========================================================================

    /// Run bot turns and quorum checks, then re-arm the turn timer.
    fn settle(&mut self, now: Instant, t: &mut Transition) {
        let mut steps = 0;
        while self.auto_step(t) {
            steps += 1;
            if steps >= MAX_AUTO_STEPS {
                warn!("Match {} exceeded {} automatic steps", self.state.id, MAX_AUTO_STEPS);
                break;
            }
        }
        self.rearm_timer(now);
    }

    /// Take one automatic action if one is due.
    fn auto_step(&mut self, t: &mut Transition) -> bool {
        match self.state.phase {
            MatchPhase::Betting => {
                let Some(seat) = self.state.current_seat else {
                    return false;
                };
                let player = &self.state.players[seat];
                // Absent humans pass straight away instead of holding up the bidding
                if player.is_bot || player.connection != ConnectionStatus::Connected {
                    self.place_bid(seat, fallback_bid(), t).is_ok()
                } else {
                    false
                }
            }
            MatchPhase::Playing => match self.state.current_seat {
                Some(seat) if self.state.players[seat].is_bot => self.play_fallback_card(seat, t),
                _ => false,
            },
            MatchPhase::Scoring if self.ready_quorum() => {
                self.next_round(t);
                true
            }
            MatchPhase::GameOver if self.rematch_quorum() => {
                self.start_rematch(t);
                true
            }
            _ => false,
        }
    }

    fn timer_target(&self) -> Option<(TimerKey, Duration)> {
        let phase = self.state.phase;
        let turn = self.state.action_seq;
        match phase {
            MatchPhase::Betting | MatchPhase::Playing => {
                let seat = self.state.current_seat?;
                let player = self.state.players.get(seat)?;
                if player.is_bot {
                    return None;
                }
                let duration = self.config.timers.duration_for(phase, player.relaxed)?;
                Some((TimerKey { phase, seat: Some(seat), turn }, duration))
            }
            MatchPhase::Scoring => {
                let duration = self.config.timers.duration_for(phase, false)?;
                Some((TimerKey { phase, seat: None, turn }, duration))
            }
            _ => None,
        }
    }

    /// Keep the running timer if it still guards the current turn,
    /// otherwise replace or clear it.
    fn rearm_timer(&mut self, now: Instant) {
        match (self.timer_target(), self.state.turn_timer) {
            (Some((key, _)), Some(timer)) if timer.key == key => {}
            (Some((key, duration)), _) => {
                self.state.turn_timer = Some(TurnTimer::arm(key, duration, now));
            }
            (None, _) => self.state.turn_timer = None,
        }
    }

    // =========================================================================
    // INPUTS
    // =========================================================================

    /// Apply a player's action.
    pub fn apply(
        &mut self,
        player: &PlayerName,
        action: Action,
        now: Instant,
    ) -> Result<Transition, ActionError> {
        if self.state.phase == MatchPhase::Abandoned {
            return Err(ActionError::MatchClosed);
        }
        let seat = self.seat_for(player)?;
        if self.state.players[seat].is_bot {
            return Err(ActionError::SeatForfeited(player.clone()));
        }

        let mut t = Transition::default();
        match action {
            Action::ChooseTeam { team } => {
                self.require_phase(MatchPhase::TeamSelection)?;
                self.choose_team(seat, team, &mut t)?;
            }
            Action::AddBot => {
                self.require_phase(MatchPhase::TeamSelection)?;
                self.add_bot(&mut t)?;
            }
            Action::Start => {
                self.require_phase(MatchPhase::TeamSelection)?;
                self.start(&mut t)?;
            }
            Action::Bid(bid) => {
                self.require_phase(MatchPhase::Betting)?;
                self.require_turn(seat)?;
                self.place_bid(seat, bid, &mut t)?;
            }
            Action::PlayCard(card) => {
                self.require_phase(MatchPhase::Playing)?;
                self.require_turn(seat)?;
                self.play_card(seat, card, &mut t)?;
            }
            Action::Ready => {
                self.require_phase(MatchPhase::Scoring)?;
                if self.state.ready.insert(player.clone()) {
                    self.emit(&mut t, GameEventData::ReadyForNextRound { player: player.clone() });
                }
            }
            Action::VoteRematch => {
                self.require_phase(MatchPhase::GameOver)?;
                if self.state.rematch_votes.insert(player.clone()) {
                    self.emit(&mut t, GameEventData::RematchVoted { player: player.clone() });
                }
            }
        }

        // Seats may have moved on start, so look the player up again
        if let Some(p) = self.state.players.iter_mut().find(|p| &p.name == player) {
            p.afk_warnings = 0;
        }

        self.settle(now, &mut t);
        Ok(t)
    }

    /// Act for whoever let the timer run out.
    ///
    /// Returns `None` when `key` no longer matches the armed timer or the
    /// timer has not expired; such a firing is stale and ignored.
    pub fn on_timeout(&mut self, key: TimerKey, now: Instant) -> Option<Transition> {
        let timer = self.state.turn_timer?;
        if timer.key != key || !timer.is_expired(now) {
            return None;
        }
        self.state.turn_timer = None;

        let mut t = Transition::default();
        match key.phase {
            MatchPhase::Betting | MatchPhase::Playing => {
                if let Some(seat) = key.seat.filter(|s| *s < self.state.players.len()) {
                    let player = self.state.players[seat].name.clone();
                    self.emit(&mut t, GameEventData::AutoActionTaken {
                        player: Some(player),
                        phase: key.phase,
                    });

                    let acted = if key.phase == MatchPhase::Betting {
                        self.place_bid(seat, fallback_bid(), &mut t).is_ok()
                    } else {
                        self.play_fallback_card(seat, &mut t)
                    };
                    if acted {
                        self.record_afk(seat, &mut t);
                    }
                }
            }
            MatchPhase::Scoring => {
                let pending: Vec<PlayerName> = self
                    .state
                    .active_humans()
                    .map(|p| p.name.clone())
                    .filter(|name| !self.state.ready.contains(name))
                    .collect();
                self.state.ready.extend(pending);
                self.emit(&mut t, GameEventData::AutoActionTaken { player: None, phase: key.phase });
            }
            _ => {}
        }

        self.settle(now, &mut t);
        Some(t)
    }

    /// Warning for the armed timer, once, when it is due.
    pub fn due_warning(&mut self, now: Instant) -> Option<TimeoutWarning> {
        let lead = self.config.timers.warning_lead;
        let timer = self.state.turn_timer.as_mut()?;
        if timer.warned || now < timer.warning_at(lead) || timer.is_expired(now) {
            return None;
        }
        timer.warned = true;

        let player = timer
            .key
            .seat
            .and_then(|seat| self.state.players.get(seat))
            .map(|p| p.name.clone());
        Some(TimeoutWarning { key: timer.key, player, remaining: timer.remaining(now) })
    }

    /// Give up a seat voluntarily.
    pub fn leave(&mut self, name: &PlayerName, now: Instant) -> Result<Transition, ActionError> {
        if self.state.phase == MatchPhase::Abandoned {
            return Err(ActionError::MatchClosed);
        }
        let seat = self.seat_for(name)?;
        let mut t = Transition::default();

        if self.state.phase == MatchPhase::TeamSelection {
            self.state.players.remove(seat);
            self.emit(&mut t, GameEventData::PlayerLeft { player: name.clone() });
            if self.state.human_count() == 0 {
                self.abandon(&mut t);
            }
        } else {
            self.emit(&mut t, GameEventData::PlayerLeft { player: name.clone() });
            self.convert_to_bot(seat, &mut t);
        }

        self.settle(now, &mut t);
        Ok(t)
    }

    /// Connection lost. Hand, score and seat stay as they are.
    pub fn mark_disconnected(&mut self, name: &PlayerName, now: Instant) -> Result<Transition, ActionError> {
        let seat = self.seat_for(name)?;
        let mut t = Transition::default();
        if self.state.players[seat].connection == ConnectionStatus::Disconnected {
            return Ok(t);
        }

        self.state.players[seat].connection = ConnectionStatus::Disconnected;
        self.emit(&mut t, GameEventData::PlayerDisconnected { player: name.clone() });
        self.settle(now, &mut t);
        Ok(t)
    }

    /// A redeemed token is being attached to a new connection.
    pub fn begin_reconnect(&mut self, name: &PlayerName) -> Result<(), ActionError> {
        if self.state.phase == MatchPhase::Abandoned {
            return Err(ActionError::MatchClosed);
        }
        let seat = self.seat_for(name)?;
        let player = &mut self.state.players[seat];
        if player.is_bot {
            return Err(ActionError::SeatForfeited(name.clone()));
        }
        player.connection = ConnectionStatus::Reconnecting;
        Ok(())
    }

    /// The new connection has the snapshot; the player is back.
    pub fn complete_reconnect(&mut self, name: &PlayerName, now: Instant) -> Result<Transition, ActionError> {
        let seat = self.seat_for(name)?;
        let player = &mut self.state.players[seat];
        player.connection = ConnectionStatus::Connected;
        player.afk_warnings = 0;

        let mut t = Transition::default();
        self.emit(&mut t, GameEventData::PlayerReconnected { player: name.clone() });
        self.settle(now, &mut t);
        Ok(t)
    }

    /// The new connection went away before the handoff finished.
    pub fn abort_reconnect(&mut self, name: &PlayerName) {
        if let Some(seat) = self.state.seat_of(name) {
            self.state.players[seat].connection = ConnectionStatus::Disconnected;
        }
    }

    /// Reconnect window ran out.
    pub fn expire_disconnected(&mut self, name: &PlayerName, now: Instant) -> Result<Transition, ActionError> {
        let seat = self.seat_for(name)?;
        let mut t = Transition::default();
        let player = &self.state.players[seat];
        if player.is_bot || player.connection == ConnectionStatus::Connected {
            return Ok(t);
        }

        match (self.state.phase, self.config.disconnect_policy) {
            (MatchPhase::Abandoned, _) => return Ok(t),
            (MatchPhase::TeamSelection, _) => {
                self.state.players.remove(seat);
                self.emit(&mut t, GameEventData::PlayerLeft { player: name.clone() });
                if self.state.human_count() == 0 {
                    self.abandon(&mut t);
                }
            }
            (_, DisconnectPolicy::Bot) => self.convert_to_bot(seat, &mut t),
            (_, DisconnectPolicy::Terminate) => self.abandon(&mut t),
        }

        self.settle(now, &mut t);
        Ok(t)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::cards::full_deck;
    use crate::game::rules::MIN_BET;
    use proptest::prelude::*;

    fn name(s: &str) -> PlayerName {
        PlayerName::from(s)
    }

    fn bet(amount: u8, without_trump: bool) -> Action {
        Action::Bid(Bid::Bet { amount, without_trump })
    }

    fn skip() -> Action {
        Action::Bid(Bid::Skip)
    }

    /// Four humans a, b, c, d seated in that order; d deals so a bids first.
    fn started(config: MatchConfig) -> (StateMachine, Instant) {
        let now = Instant::now();
        let mut machine = StateMachine::with_seed(MatchId::nil(), 42, config);
        for n in ["a", "b", "c", "d"] {
            machine.join(name(n), false).unwrap();
        }
        machine.state.dealer_seat = 3;
        machine.apply(&name("a"), Action::Start, now).unwrap();
        (machine, now)
    }

    fn set_hands(machine: &mut StateMachine, hands: [Vec<Card>; 4]) {
        for (player, hand) in machine.state.players.iter_mut().zip(hands) {
            player.hand = hand;
        }
    }

    fn color_hand(color: Color) -> Vec<Card> {
        (0..8).map(|value| Card { color, value }).collect()
    }

    fn current(machine: &StateMachine) -> PlayerName {
        machine.state().current_player().unwrap().name.clone()
    }

    /// Current player plays their fallback card voluntarily.
    fn play_first_legal(machine: &mut StateMachine, now: Instant) -> Transition {
        let who = current(machine);
        let seat = machine.state().seat_of(&who).unwrap();
        let round = machine.state().round.as_ref().unwrap();
        let card = fallback_card(&machine.state().players[seat].hand, &round.current_trick).unwrap();
        machine.apply(&who, Action::PlayCard(card), now).unwrap()
    }

    #[test]
    fn test_start_arranges_alternating_teams() {
        let (machine, _) = started(MatchConfig::default());
        let state = machine.state();
        let teams: Vec<Team> = state.players.iter().map(|p| p.team).collect();
        assert_eq!(teams, vec![Team::One, Team::Two, Team::One, Team::Two]);
        assert_eq!(state.phase, MatchPhase::Betting);
        assert_eq!(state.current_seat, Some(0));
        assert!(state.players.iter().all(|p| p.hand.len() == HAND_SIZE));
        assert!(state.check_invariants().is_ok());
        assert!(state.turn_timer.is_some());
    }

    #[test]
    fn test_team_selection_guards() {
        let now = Instant::now();
        let mut machine = StateMachine::new(MatchId::new_v4(), MatchConfig::default());
        machine.join(name("a"), false).unwrap();
        machine.join(name("b"), false).unwrap();

        assert_eq!(machine.join(name("a"), false).unwrap_err(), ActionError::AlreadySeated(name("a")));
        assert_eq!(machine.apply(&name("a"), Action::Start, now).unwrap_err(), ActionError::TeamsUnbalanced);

        machine.join(name("c"), false).unwrap();
        machine.join(name("d"), false).unwrap();
        assert_eq!(machine.join(name("e"), false).unwrap_err(), ActionError::SeatsFull);

        // a and c are on team 1, so b cannot switch over
        assert_eq!(
            machine.apply(&name("b"), Action::ChooseTeam { team: Team::One }, now).unwrap_err(),
            ActionError::TeamFull(Team::One)
        );
        assert_eq!(
            machine.apply(&name("zed"), Action::Start, now).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_add_bot_fills_seat() {
        let now = Instant::now();
        let mut machine = StateMachine::new(MatchId::new_v4(), MatchConfig::default());
        machine.join(name("a"), false).unwrap();
        machine.join(name("b"), false).unwrap();
        machine.join(name("c"), false).unwrap();
        let t = machine.apply(&name("a"), Action::AddBot, now).unwrap();
        assert!(t.any(|e| matches!(e, GameEventData::PlayerJoined { is_bot: true, .. })));

        machine.apply(&name("a"), Action::Start, now).unwrap();
        let state = machine.state();
        // Bot seat bids on its own when its turn comes
        assert!(state.players.iter().any(|p| p.is_bot && p.name == name("bot-1")));
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_not_your_turn_leaves_state_unchanged() {
        let (mut machine, now) = started(MatchConfig::default());
        let before = machine.state().compute_hash();

        let err = machine.apply(&name("b"), bet(8, false), now).unwrap_err();
        assert_eq!(err, ActionError::NotYourTurn);
        assert_eq!(machine.state().compute_hash(), before);
    }

    #[test]
    fn test_bet_must_increase() {
        let (mut machine, now) = started(MatchConfig::default());
        machine.apply(&name("a"), bet(9, false), now).unwrap();

        let err = machine.apply(&name("b"), bet(8, false), now).unwrap_err();
        assert!(err.is_bet_error());
        assert_eq!(current(&machine), name("b"));
    }

    #[test]
    fn test_max_bet_closes_bidding() {
        let (mut machine, now) = started(MatchConfig::default());
        machine.apply(&name("a"), bet(12, false), now).unwrap();
        assert_eq!(machine.state().phase, MatchPhase::Playing);
        assert_eq!(current(&machine), name("a"));
    }

    #[test]
    fn test_round_scenario_contract_fulfilled() {
        let config = MatchConfig {
            scoring: ScoringRules { without_trump_multiplier: 1 },
            ..MatchConfig::default()
        };
        let (mut machine, now) = started(config);
        set_hands(&mut machine, [
            color_hand(Color::Red),
            color_hand(Color::Brown),
            color_hand(Color::Blue),
            color_hand(Color::Green),
        ]);

        machine.apply(&name("a"), bet(8, false), now).unwrap();
        machine.apply(&name("b"), skip(), now).unwrap();
        machine.apply(&name("c"), bet(9, true), now).unwrap();
        let t = machine.apply(&name("d"), skip(), now).unwrap();

        let contract = machine.state().round.as_ref().unwrap().contract.clone().unwrap();
        assert_eq!(contract.player, name("c"));
        assert_eq!(contract.amount, 9);
        assert!(contract.without_trump);
        assert!(t.any(|e| matches!(e, GameEventData::BiddingClosed { .. })));
        assert_eq!(current(&machine), name("c"));

        // c leads blue every trick; nobody else holds blue
        while machine.state().phase == MatchPhase::Playing {
            play_first_legal(&mut machine, now);
            assert!(machine.state().check_invariants().is_ok());
        }

        let state = machine.state();
        assert_eq!(state.phase, MatchPhase::Scoring);
        assert_eq!(state.round.as_ref().unwrap().trump, None);
        let record = state.history.last().unwrap();
        assert!(record.outcome.fulfilled);
        assert_eq!(record.outcome.offense_points, 10);
        assert_eq!(record.outcome.offense_delta, 10);
        assert_eq!(record.outcome.defense_delta, -10);
        assert_eq!(state.scores.get(Team::One), 10);
        assert_eq!(state.scores.get(Team::Two), -10);
        assert_eq!(state.players[2].tricks_won, 8);
    }

    #[test]
    fn test_all_skip_forces_dealer() {
        let (mut machine, now) = started(MatchConfig::default());
        for n in ["a", "b", "c", "d"] {
            machine.apply(&name(n), skip(), now).unwrap();
        }

        let state = machine.state();
        assert_eq!(state.phase, MatchPhase::Playing);
        let contract = state.round.as_ref().unwrap().contract.clone().unwrap();
        assert_eq!(contract.player, name("d"));
        assert_eq!(contract.amount, MIN_BET);
        assert!(contract.forced);
        assert_eq!(current(&machine), name("d"));
    }

    #[test]
    fn test_trump_fixed_by_first_card() {
        let (mut machine, now) = started(MatchConfig::default());
        set_hands(&mut machine, [
            color_hand(Color::Red),
            color_hand(Color::Brown),
            color_hand(Color::Blue),
            color_hand(Color::Green),
        ]);
        machine.apply(&name("a"), bet(7, false), now).unwrap();
        for n in ["b", "c", "d"] {
            machine.apply(&name(n), skip(), now).unwrap();
        }

        let t = play_first_legal(&mut machine, now);
        assert!(t.any(|e| matches!(e, GameEventData::TrumpSet { color: Color::Red })));
        assert_eq!(machine.state().round.as_ref().unwrap().trump, Some(Color::Red));
    }

    #[test]
    fn test_must_follow_led_color() {
        let (mut machine, now) = started(MatchConfig::default());
        let deck = full_deck();
        // a: red 0-3 + brown 0-3, b: red 4-7 + brown 4-7, c/d: the rest
        set_hands(&mut machine, [
            [&deck[0..4], &deck[8..12]].concat(),
            [&deck[4..8], &deck[12..16]].concat(),
            deck[16..24].to_vec(),
            deck[24..32].to_vec(),
        ]);
        machine.apply(&name("a"), bet(7, true), now).unwrap();
        for n in ["b", "c", "d"] {
            machine.apply(&name(n), skip(), now).unwrap();
        }

        machine.apply(&name("a"), Action::PlayCard(Card { color: Color::Red, value: 0 }), now).unwrap();
        let brown = Card { color: Color::Brown, value: 5 };
        assert_eq!(
            machine.apply(&name("b"), Action::PlayCard(brown), now).unwrap_err(),
            ActionError::MustFollow { card: brown, led: Color::Red }
        );
        let missing = Card { color: Color::Blue, value: 1 };
        assert_eq!(
            machine.apply(&name("b"), Action::PlayCard(missing), now).unwrap_err(),
            ActionError::CardNotInHand(missing)
        );
    }

    #[test]
    fn test_timeout_plays_fallback_and_warns() {
        let (mut machine, now) = started(MatchConfig::default());
        let timer = machine.state().turn_timer.unwrap();
        assert_eq!(timer.key.seat, Some(0));

        // Not expired yet
        assert!(machine.on_timeout(timer.key, now + Duration::from_secs(30)).is_none());

        let later = now + Duration::from_secs(60);
        let t = machine.on_timeout(timer.key, later).unwrap();
        assert!(t.any(|e| matches!(e, GameEventData::AutoActionTaken { phase: MatchPhase::Betting, .. })));
        assert!(t.any(|e| matches!(e, GameEventData::BidPlaced { bid: Bid::Skip, .. })));
        assert_eq!(machine.state().players[0].afk_warnings, 1);
        assert_eq!(current(&machine), name("b"));

        // Old key is stale now
        assert!(machine.on_timeout(timer.key, later + Duration::from_secs(120)).is_none());

        // Other seats acting leave a's counter alone
        machine.apply(&name("b"), skip(), later).unwrap();
        machine.apply(&name("c"), skip(), later).unwrap();
        machine.apply(&name("d"), skip(), later).unwrap();
        assert_eq!(machine.state().players[0].afk_warnings, 1);
        assert_eq!(machine.state().players[1].afk_warnings, 0);
    }

    #[test]
    fn test_warning_fires_once_before_expiry() {
        let (mut machine, now) = started(MatchConfig::default());
        assert!(machine.due_warning(now + Duration::from_secs(10)).is_none());

        let warning = machine.due_warning(now + Duration::from_secs(52)).unwrap();
        assert_eq!(warning.player, Some(name("a")));
        assert_eq!(warning.remaining, Duration::from_secs(8));
        assert!(machine.due_warning(now + Duration::from_secs(53)).is_none());
        assert_eq!(machine.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_three_timeouts_hand_seat_to_bot() {
        let (mut machine, mut now) = started(MatchConfig::default());
        for n in ["a", "b", "c", "d"] {
            machine.apply(&name(n), skip(), now).unwrap();
        }

        // b never plays; everyone else plays immediately
        let b = name("b");
        while !machine.state().player(&b).unwrap().is_bot {
            assert_eq!(machine.state().phase, MatchPhase::Playing);
            if current(&machine) == b {
                let key = machine.state().turn_timer.unwrap().key;
                now += Duration::from_secs(61);
                machine.on_timeout(key, now).unwrap();
            } else {
                play_first_legal(&mut machine, now);
            }
        }

        let state = machine.state();
        assert_eq!(state.player(&b).unwrap().afk_warnings, 3);
        assert!(state.check_invariants().is_ok());
        assert_eq!(
            machine.clone().apply(&b, Action::Ready, now).unwrap_err(),
            ActionError::SeatForfeited(b)
        );
    }

    #[test]
    fn test_disconnect_mid_trick_then_reconnect() {
        let (mut machine, now) = started(MatchConfig::default());
        for n in ["a", "b", "c", "d"] {
            machine.apply(&name(n), skip(), now).unwrap();
        }
        // d leads, then a, then b holds the turn
        play_first_legal(&mut machine, now);
        play_first_legal(&mut machine, now);
        assert_eq!(current(&machine), name("b"));

        let b = name("b");
        machine.mark_disconnected(&b, now).unwrap();
        assert_eq!(machine.state().player(&b).unwrap().connection, ConnectionStatus::Disconnected);

        let hand_before = machine.state().player(&b).unwrap().hand.clone();
        let round = machine.state().round.as_ref().unwrap();
        let expected = fallback_card(&hand_before, &round.current_trick).unwrap();

        let key = machine.state().turn_timer.unwrap().key;
        let t = machine.on_timeout(key, now + Duration::from_secs(60)).unwrap();
        assert!(t.any(|e| matches!(e, GameEventData::CardPlayed { card, .. } if *card == expected)));
        assert_eq!(current(&machine), name("c"));

        // Others keep playing while b is away
        play_first_legal(&mut machine, now);
        let hand_left: Vec<Card> = hand_before.into_iter().filter(|c| *c != expected).collect();
        let points_left = machine.state().player(&b).unwrap().points_won;

        machine.begin_reconnect(&b).unwrap();
        assert_eq!(machine.state().player(&b).unwrap().connection, ConnectionStatus::Reconnecting);
        machine.complete_reconnect(&b, now).unwrap();

        let player = machine.state().player(&b).unwrap();
        assert_eq!(player.connection, ConnectionStatus::Connected);
        assert_eq!(player.hand, hand_left);
        assert_eq!(player.points_won, points_left);
        assert_eq!(player.afk_warnings, 0);
    }

    #[test]
    fn test_disconnected_bidder_is_skipped() {
        let (mut machine, now) = started(MatchConfig::default());
        machine.mark_disconnected(&name("b"), now).unwrap();
        machine.apply(&name("a"), bet(8, false), now).unwrap();
        assert_eq!(current(&machine), name("c"));
    }

    #[test]
    fn test_expired_disconnect_policies() {
        let (mut machine, now) = started(MatchConfig::default());
        machine.mark_disconnected(&name("c"), now).unwrap();
        machine.expire_disconnected(&name("c"), now).unwrap();
        assert!(machine.state().player(&name("c")).unwrap().is_bot);
        assert_eq!(
            machine.begin_reconnect(&name("c")).unwrap_err(),
            ActionError::SeatForfeited(name("c"))
        );

        let config = MatchConfig { disconnect_policy: DisconnectPolicy::Terminate, ..MatchConfig::default() };
        let (mut machine, now) = started(config);
        machine.mark_disconnected(&name("c"), now).unwrap();
        let t = machine.expire_disconnected(&name("c"), now).unwrap();
        assert!(t.any(|e| matches!(e, GameEventData::MatchAbandoned)));
        assert_eq!(machine.state().phase, MatchPhase::Abandoned);
    }

    #[test]
    fn test_everyone_leaving_abandons() {
        let (mut machine, now) = started(MatchConfig::default());
        for n in ["a", "b", "c"] {
            machine.leave(&name(n), now).unwrap();
            assert!(machine.state().check_invariants().is_ok());
        }
        assert_ne!(machine.state().phase, MatchPhase::Abandoned);
        let t = machine.leave(&name("d"), now).unwrap();
        assert!(t.any(|e| matches!(e, GameEventData::MatchAbandoned)));
        assert_eq!(machine.apply(&name("d"), skip(), now).unwrap_err(), ActionError::MatchClosed);
    }

    #[test]
    fn test_scoring_waits_for_ready_then_deals() {
        let (mut machine, now) = started(MatchConfig::default());
        for n in ["a", "b", "c", "d"] {
            machine.apply(&name(n), skip(), now).unwrap();
        }
        while machine.state().phase == MatchPhase::Playing {
            play_first_legal(&mut machine, now);
        }
        assert_eq!(machine.state().phase, MatchPhase::Scoring);
        let timer = machine.state().turn_timer.unwrap();
        assert_eq!(timer.key.seat, None);

        for n in ["a", "b", "c"] {
            machine.apply(&name(n), Action::Ready, now).unwrap();
        }
        assert_eq!(machine.state().phase, MatchPhase::Scoring);
        let t = machine.apply(&name("d"), Action::Ready, now).unwrap();
        assert!(t.any(|e| matches!(e, GameEventData::RoundStarted { round: 2, .. })));
        assert_eq!(machine.state().dealer_seat, 0);
        assert_eq!(current(&machine), name("b"));
        assert!(machine.state().check_invariants().is_ok());
    }

    #[test]
    fn test_scoring_timeout_readies_everyone() {
        let (mut machine, now) = started(MatchConfig::default());
        for n in ["a", "b", "c", "d"] {
            machine.apply(&name(n), skip(), now).unwrap();
        }
        while machine.state().phase == MatchPhase::Playing {
            play_first_legal(&mut machine, now);
        }
        let key = machine.state().turn_timer.unwrap().key;
        let t = machine.on_timeout(key, now + Duration::from_secs(60)).unwrap();
        assert!(t.any(|e| matches!(e, GameEventData::AutoActionTaken { player: None, .. })));
        assert_eq!(machine.state().phase, MatchPhase::Betting);
    }

    #[test]
    fn test_game_over_and_rematch() {
        let config = MatchConfig { win_threshold: 1, ..MatchConfig::default() };
        let (mut machine, now) = started(config);
        for n in ["a", "b", "c", "d"] {
            machine.apply(&name(n), skip(), now).unwrap();
        }
        let mut ended = false;
        while machine.state().phase == MatchPhase::Playing {
            let t = play_first_legal(&mut machine, now);
            ended |= t.any(|e| matches!(e, GameEventData::GameOver { .. }));
        }
        assert!(ended);
        assert_eq!(machine.state().phase, MatchPhase::GameOver);
        assert!(machine.state().winner.is_some());
        assert!(machine.state().turn_timer.is_none());

        for n in ["a", "b", "c"] {
            machine.apply(&name(n), Action::VoteRematch, now).unwrap();
        }
        let t = machine.apply(&name("d"), Action::VoteRematch, now).unwrap();
        assert!(t.any(|e| matches!(e, GameEventData::RematchStarted)));

        let state = machine.state();
        assert_eq!(state.phase, MatchPhase::TeamSelection);
        assert_eq!(state.scores, TeamScores::default());
        assert!(state.history.is_empty());
        assert_eq!(state.games_played, 1);

        machine.apply(&name("a"), Action::Start, now).unwrap();
        assert_eq!(machine.state().phase, MatchPhase::Betting);
    }

    #[test]
    fn test_round_limit_ends_game() {
        let config = MatchConfig { max_rounds: 1, win_threshold: 1000, ..MatchConfig::default() };
        let (mut machine, now) = started(config);
        for n in ["a", "b", "c", "d"] {
            machine.apply(&name(n), skip(), now).unwrap();
        }
        while machine.state().phase == MatchPhase::Playing {
            play_first_legal(&mut machine, now);
        }
        assert_eq!(machine.state().phase, MatchPhase::GameOver);
    }

    #[test]
    fn test_relaxed_player_gets_longer_timer() {
        let now = Instant::now();
        let mut machine = StateMachine::with_seed(MatchId::nil(), 1, MatchConfig::default());
        machine.join(name("a"), true).unwrap();
        for n in ["b", "c", "d"] {
            machine.join(name(n), false).unwrap();
        }
        machine.state.dealer_seat = 3;
        machine.apply(&name("a"), Action::Start, now).unwrap();
        assert_eq!(machine.state().turn_timer.unwrap().duration, Duration::from_secs(120));

        machine.apply(&name("a"), skip(), now).unwrap();
        assert_eq!(machine.state().turn_timer.unwrap().duration, Duration::from_secs(60));
    }

    /// What a random client does on its turn.
    #[derive(Debug, Clone)]
    enum Move {
        Bid(u8, bool),
        Skip,
        Card(usize),
        Timeout,
        WrongSeat,
    }

    fn arb_move() -> impl Strategy<Value = Move> {
        prop_oneof![
            (5u8..13, any::<bool>()).prop_map(|(a, w)| Move::Bid(a, w)),
            Just(Move::Skip),
            (0usize..8).prop_map(Move::Card),
            Just(Move::Timeout),
            Just(Move::WrongSeat),
        ]
    }

    proptest! {
        /// Cards are conserved and only the current seat is ever accepted,
        /// whatever the clients send.
        #[test]
        fn prop_random_play_keeps_invariants(seed in any::<u64>(), moves in proptest::collection::vec(arb_move(), 1..200)) {
            let mut now = Instant::now();
            let mut machine = StateMachine::with_seed(MatchId::nil(), seed, MatchConfig::default());
            for n in ["a", "b", "c", "d"] {
                machine.join(name(n), false).unwrap();
            }
            machine.apply(&name("a"), Action::Start, now).unwrap();

            for mv in moves {
                let phase = machine.state().phase;
                if phase == MatchPhase::Scoring {
                    for n in ["a", "b", "c", "d"] {
                        let _ = machine.apply(&name(n), Action::Ready, now);
                    }
                    continue;
                }
                if phase != MatchPhase::Betting && phase != MatchPhase::Playing {
                    break;
                }

                let seat = machine.state().current_seat.unwrap();
                let who = machine.state().players[seat].name.clone();
                let seq_before = (machine.state().action_seq, machine.state().event_seq);
                let result = match mv {
                    Move::Bid(amount, without_trump) => machine.apply(&who, bet(amount, without_trump), now).map(|_| ()),
                    Move::Skip => machine.apply(&who, skip(), now).map(|_| ()),
                    Move::Card(i) => {
                        let hand = &machine.state().players[seat].hand;
                        match hand.get(i % hand.len().max(1)).copied() {
                            Some(card) => machine.apply(&who, Action::PlayCard(card), now).map(|_| ()),
                            None => Ok(()),
                        }
                    }
                    Move::Timeout => {
                        let key = machine.state().turn_timer.unwrap().key;
                        now += Duration::from_secs(61);
                        machine.on_timeout(key, now);
                        Ok(())
                    }
                    Move::WrongSeat => {
                        let other = machine.state().players[(seat + 1) % 4].name.clone();
                        let before = machine.state().compute_hash();
                        let err = machine.apply(&other, skip(), now);
                        prop_assert!(err.is_err());
                        prop_assert_eq!(machine.state().compute_hash(), before);
                        Ok(())
                    }
                };
                if let Err(err) = result {
                    prop_assert_eq!(err.kind(), ErrorKind::InvalidAction);
                }

                prop_assert!(machine.state().check_invariants().is_ok(), "{:?}", machine.state().check_invariants());

                let amounts: Vec<u8> = machine.state().bidding.bids.iter().filter_map(|b| b.bid.amount()).collect();
                prop_assert!(amounts.windows(2).all(|w| w[0] < w[1]));
                prop_assert!(machine.state().action_seq >= seq_before.0);
                prop_assert!(machine.state().event_seq >= seq_before.1);
            }
        }
    }
}
