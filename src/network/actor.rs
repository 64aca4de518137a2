//! Match Actor
//!
//! One task per match owns its [`StateMachine`]. Commands arrive over a
//! bounded inbox and are applied one at a time; the turn timer is a
//! `sleep_until` branch of the same `select!`, so player actions and
//! timeouts share a single order. Every transition is fanned out to the
//! seated connections and spectators, each with its own snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::game::events::{GameEvent, GameEventData};
use crate::game::machine::{Action, ActionError, StateMachine, Transition};
use crate::game::state::{MatchId, MatchPhase, PlayerName};
use crate::history::{GameHistory, HistoryRecord, RoundHistory, SharedSink};
use crate::metrics;
use crate::network::protocol::{seconds_left, ErrorCode, MatchSnapshot, ServerMessage};
use crate::network::registry::RegistryError;
use crate::network::session::ConnectionId;

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outbound queue of one connection.
pub type Outbox = mpsc::Sender<ServerMessage>;

type Reply<T> = oneshot::Sender<T>;

/// Messages that can be sent to a [`MatchActor`].
#[allow(missing_docs)]
#[derive(Debug)]
pub enum MatchCommand {
    /// Take a seat.
    Join {
        player: PlayerName,
        relaxed: bool,
        connection: ConnectionId,
        outbox: Outbox,
        reply: Reply<Result<(), ActionError>>,
    },

    /// Game action from a seated player.
    Act {
        player: PlayerName,
        action: Action,
        reply: Reply<Result<(), ActionError>>,
    },

    /// Give up a seat.
    Leave {
        player: PlayerName,
        reply: Reply<Result<(), ActionError>>,
    },

    /// Connection of a seated player dropped.
    Disconnected {
        player: PlayerName,
        connection: ConnectionId,
    },

    /// Attach a new connection to a seat after a redeemed token.
    Reconnect {
        player: PlayerName,
        connection: ConnectionId,
        outbox: Outbox,
        reply: Reply<Result<(), RegistryError>>,
    },

    /// Watch without a seat.
    Spectate {
        connection: ConnectionId,
        outbox: Outbox,
    },

    /// Stop watching.
    StopSpectating {
        connection: ConnectionId,
    },

    /// Current snapshot for a viewer.
    Snapshot {
        viewer: Option<PlayerName>,
        reply: Reply<MatchSnapshot>,
    },

    /// Shut the match down.
    Close {
        reason: String,
    },
}

impl MatchCommand {
    fn label(&self) -> &'static str {
        match self {
            MatchCommand::Join { .. } => "join",
            MatchCommand::Act { .. } => "act",
            MatchCommand::Leave { .. } => "leave",
            MatchCommand::Disconnected { .. } => "disconnected",
            MatchCommand::Reconnect { .. } => "reconnect",
            MatchCommand::Spectate { .. } => "spectate",
            MatchCommand::StopSpectating { .. } => "stop_spectating",
            MatchCommand::Snapshot { .. } => "snapshot",
            MatchCommand::Close { .. } => "close",
        }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cheap, cloneable handle for talking to a match actor.
#[derive(Debug, Clone)]
pub struct MatchHandle {
    id: MatchId,
    sender: mpsc::Sender<MatchCommand>,
    events: broadcast::Sender<GameEvent>,
}

impl MatchHandle {
    /// Match id.
    pub fn id(&self) -> MatchId {
        self.id
    }

    /// Whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Lifecycle events of this match, for read-only observers.
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: MatchCommand) -> Result<(), RegistryError> {
        self.sender.send(command).await.map_err(|_| RegistryError::Closed(self.id))
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> MatchCommand) -> Result<T, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply)).await?;
        response.await.map_err(|_| RegistryError::Closed(self.id))
    }

    /// Take a seat.
    pub async fn join(
        &self,
        player: PlayerName,
        relaxed: bool,
        connection: ConnectionId,
        outbox: Outbox,
    ) -> Result<(), RegistryError> {
        Ok(self
            .request(|reply| MatchCommand::Join { player, relaxed, connection, outbox, reply })
            .await??)
    }

    /// Apply a game action.
    pub async fn act(&self, player: PlayerName, action: Action) -> Result<(), RegistryError> {
        Ok(self.request(|reply| MatchCommand::Act { player, action, reply }).await??)
    }

    /// Give up a seat.
    pub async fn leave(&self, player: PlayerName) -> Result<(), RegistryError> {
        Ok(self.request(|reply| MatchCommand::Leave { player, reply }).await??)
    }

    /// Report a dropped connection.
    pub async fn disconnected(&self, player: PlayerName, connection: ConnectionId) -> Result<(), RegistryError> {
        self.send(MatchCommand::Disconnected { player, connection }).await
    }

    /// Attach a new connection to an existing seat.
    pub async fn reconnect(
        &self,
        player: PlayerName,
        connection: ConnectionId,
        outbox: Outbox,
    ) -> Result<(), RegistryError> {
        self.request(|reply| MatchCommand::Reconnect { player, connection, outbox, reply })
            .await?
    }

    /// Watch the match.
    pub async fn spectate(&self, connection: ConnectionId, outbox: Outbox) -> Result<(), RegistryError> {
        self.send(MatchCommand::Spectate { connection, outbox }).await
    }

    /// Stop watching the match.
    pub async fn stop_spectating(&self, connection: ConnectionId) -> Result<(), RegistryError> {
        self.send(MatchCommand::StopSpectating { connection }).await
    }

    /// Snapshot as `viewer` sees it.
    pub async fn snapshot(&self, viewer: Option<PlayerName>) -> Result<MatchSnapshot, RegistryError> {
        self.request(|reply| MatchCommand::Snapshot { viewer, reply }).await
    }

    /// Shut the match down.
    pub async fn close(&self, reason: impl Into<String>) -> Result<(), RegistryError> {
        self.send(MatchCommand::Close { reason: reason.into() }).await
    }
}

// =============================================================================
// ACTOR
// =============================================================================

#[derive(Debug)]
struct SeatLink {
    connection: ConnectionId,
    outbox: Outbox,
}

/// Task owning one match.
pub struct MatchActor {
    id: MatchId,
    machine: StateMachine,
    inbox: mpsc::Receiver<MatchCommand>,
    events: broadcast::Sender<GameEvent>,
    sink: SharedSink,
    seats: BTreeMap<PlayerName, SeatLink>,
    spectators: BTreeMap<ConnectionId, Outbox>,
    reconnect_deadlines: BTreeMap<PlayerName, Instant>,
    game_over_deadline: Option<Instant>,
    game_started_at: Option<DateTime<Utc>>,
    closed: bool,
}

/// Queue a message without waiting. Returns `false` once the receiver is gone.
fn deliver(outbox: &Outbox, message: ServerMessage) -> bool {
    match outbox.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Outbox full, dropping message");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl MatchActor {
    /// Create an actor around `machine` and the handle to reach it.
    pub fn new(machine: StateMachine, inbox_capacity: usize, sink: SharedSink) -> (Self, MatchHandle) {
        let id = machine.state().id;
        let (sender, inbox) = mpsc::channel(inbox_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let actor = Self {
            id,
            machine,
            inbox,
            events: events.clone(),
            sink,
            seats: BTreeMap::new(),
            spectators: BTreeMap::new(),
            reconnect_deadlines: BTreeMap::new(),
            game_over_deadline: None,
            game_started_at: None,
            closed: false,
        };
        (actor, MatchHandle { id, sender, events })
    }

    /// Run until the match closes or every handle is dropped.
    pub async fn run(mut self) {
        info!("Match {} starting", self.id);

        while !self.closed {
            let wakeup = self.next_wakeup();
            tokio::select! {
                biased;

                command = self.inbox.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                _ = sleep_until_opt(wakeup) => self.on_wakeup(Instant::now()),
            }
        }

        info!("Match {} closed", self.id);
    }

    fn next_wakeup(&self) -> Option<Instant> {
        [
            self.machine.next_deadline(),
            self.reconnect_deadlines.values().min().copied(),
            self.game_over_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn handle_command(&mut self, command: MatchCommand) {
        let now = Instant::now();
        let label = command.label();

        match command {
            MatchCommand::Join { player, relaxed, connection, outbox, reply } => {
                let result = self.machine.join(player.clone(), relaxed).map(|t| {
                    self.seats.insert(player, SeatLink { connection, outbox });
                    self.publish(t, now);
                });
                let _ = reply.send(result);
            }

            MatchCommand::Act { player, action, reply } => {
                let result = self.machine.apply(&player, action, now).map(|t| self.publish(t, now));
                let _ = reply.send(result);
            }

            MatchCommand::Leave { player, reply } => {
                let result = self.machine.leave(&player, now).map(|t| {
                    self.publish(t, now);
                    self.seats.remove(&player);
                    self.reconnect_deadlines.remove(&player);
                });
                let _ = reply.send(result);
            }

            MatchCommand::Disconnected { player, connection } => {
                let current = self.seats.get(&player).map(|link| link.connection);
                if current != Some(connection) {
                    debug!("Ignoring stale disconnect of {} in match {}", player, self.id);
                    return;
                }
                self.seats.remove(&player);
                match self.machine.mark_disconnected(&player, now) {
                    Ok(t) => self.publish(t, now),
                    Err(e) => debug!("Disconnect of {} ignored: {}", player, e),
                }
            }

            MatchCommand::Reconnect { player, connection, outbox, reply } => {
                let result = self.reconnect(player, connection, outbox, now);
                let _ = reply.send(result);
            }

            MatchCommand::Spectate { connection, outbox } => {
                let snapshot = MatchSnapshot::build(self.machine.state(), None, now);
                if deliver(&outbox, ServerMessage::State { snapshot }) {
                    self.spectators.insert(connection, outbox);
                }
            }

            MatchCommand::StopSpectating { connection } => {
                self.spectators.remove(&connection);
            }

            MatchCommand::Snapshot { viewer, reply } => {
                let _ = reply.send(MatchSnapshot::build(self.machine.state(), viewer.as_ref(), now));
            }

            MatchCommand::Close { reason } => self.close(&reason),
        }

        metrics::command_duration_seconds(label, now.elapsed());
    }

    fn reconnect(
        &mut self,
        player: PlayerName,
        connection: ConnectionId,
        outbox: Outbox,
        now: Instant,
    ) -> Result<(), RegistryError> {
        self.machine.begin_reconnect(&player)?;

        // Snapshot first so the client has state before any further event
        let snapshot = MatchSnapshot::build(self.machine.state(), Some(&player), now);
        if !deliver(&outbox, ServerMessage::State { snapshot }) {
            debug!("Connection of {} closed during reconnect", player);
            self.machine.abort_reconnect(&player);
            return Err(RegistryError::HandoffFailed(self.id));
        }

        self.seats.insert(player.clone(), SeatLink { connection, outbox });
        self.reconnect_deadlines.remove(&player);
        let t = self.machine.complete_reconnect(&player, now)?;
        self.publish(t, now);
        info!("Player {} reconnected to match {}", player, self.id);
        Ok(())
    }

    fn on_wakeup(&mut self, now: Instant) {
        if let Some(warning) = self.machine.due_warning(now) {
            self.broadcast(&ServerMessage::TimeoutWarning {
                player: warning.player,
                seconds_remaining: seconds_left(warning.remaining),
            });
        }

        let armed = self.machine.state().turn_timer;
        if let Some(timer) = armed {
            if timer.is_expired(now) {
                if let Some(t) = self.machine.on_timeout(timer.key, now) {
                    debug!("Match {} turn timed out: {:?}", self.id, timer.key);
                    self.publish(t, now);
                }
            }
        }

        let expired: Vec<PlayerName> = self
            .reconnect_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(player, _)| player.clone())
            .collect();
        for player in expired {
            self.reconnect_deadlines.remove(&player);
            info!("Reconnect window of {} in match {} expired", player, self.id);
            match self.machine.expire_disconnected(&player, now) {
                Ok(t) => self.publish(t, now),
                Err(e) => debug!("Expiry of {} ignored: {}", player, e),
            }
        }

        if self.game_over_deadline.is_some_and(|deadline| deadline <= now) {
            self.close("Game over");
        }
    }

    /// Record, check and fan out one transition.
    fn publish(&mut self, transition: Transition, now: Instant) {
        if transition.is_empty() {
            return;
        }

        let game_ended = transition.any(|e| matches!(e, GameEventData::GameOver { .. }));
        for event in &transition.events {
            metrics::observe_event(event);
            self.record_history(event, game_ended);
            self.track_lifecycle(event, now);
            // No subscribers is fine
            let _ = self.events.send(event.clone());
        }

        if let Err(violation) = self.machine.state().check_invariants() {
            error!(match_id = %self.id, "Invariant violated, halting match: {}", violation);
            self.broadcast(&ServerMessage::error(
                ErrorCode::InternalError,
                "Match halted after an internal error",
            ));
            self.closed = true;
            return;
        }

        self.fan_out(&transition.events, now);

        if self.machine.state().phase == MatchPhase::Abandoned {
            info!("Match {} abandoned", self.id);
            self.closed = true;
        }
    }

    fn record_history(&self, event: &GameEvent, game_ended: bool) {
        let state = self.machine.state();
        match &event.data {
            GameEventData::RoundEnded { record } => {
                let game_number = state.games_played + u32::from(!game_ended);
                let history = RoundHistory::new(self.id, game_number, record.clone());
                self.sink.record(HistoryRecord::Round(history));
            }
            GameEventData::GameOver { .. } => {
                let started_at = self.game_started_at.unwrap_or_else(Utc::now);
                if let Some(history) = GameHistory::from_state(state, started_at) {
                    self.sink.record(HistoryRecord::Game(history));
                }
            }
            _ => {}
        }
    }

    fn track_lifecycle(&mut self, event: &GameEvent, now: Instant) {
        let config = self.machine.config();
        match &event.data {
            GameEventData::GameStarted { .. } => {
                self.game_started_at = Some(Utc::now());
                self.game_over_deadline = None;
            }
            GameEventData::PlayerDisconnected { player } => {
                self.reconnect_deadlines.insert(player.clone(), now + config.reconnect_window);
            }
            GameEventData::PlayerReconnected { player }
            | GameEventData::PlayerReplacedByBot { player }
            | GameEventData::PlayerLeft { player } => {
                self.reconnect_deadlines.remove(player);
            }
            GameEventData::GameOver { winning_team, .. } => {
                info!("Match {} game over, team {} wins", self.id, winning_team);
                self.game_over_deadline = Some(now + config.game_over_grace);
            }
            GameEventData::RematchStarted => self.game_over_deadline = None,
            _ => {}
        }
    }

    /// Send the events to every viewer, followed by their fresh snapshot.
    fn fan_out(&mut self, events: &[GameEvent], now: Instant) {
        let window = self.machine.config().reconnect_window;
        let state = self.machine.state();

        for (player, link) in &self.seats {
            let snapshot = MatchSnapshot::build(state, Some(player), now);
            for event in events {
                deliver(&link.outbox, ServerMessage::from_event(event, &snapshot, window));
            }
            deliver(&link.outbox, ServerMessage::State { snapshot });
        }

        if self.spectators.is_empty() {
            return;
        }
        let snapshot = MatchSnapshot::build(state, None, now);
        self.spectators.retain(|connection, outbox| {
            let open = events
                .iter()
                .all(|event| deliver(outbox, ServerMessage::from_event(event, &snapshot, window)))
                && deliver(outbox, ServerMessage::State { snapshot: snapshot.clone() });
            if !open {
                debug!("Spectator {} gone", connection);
            }
            open
        });
    }

    fn broadcast(&self, message: &ServerMessage) {
        for link in self.seats.values() {
            deliver(&link.outbox, message.clone());
        }
        for outbox in self.spectators.values() {
            deliver(outbox, message.clone());
        }
    }

    fn close(&mut self, reason: &str) {
        info!("Closing match {}: {}", self.id, reason);
        self.broadcast(&ServerMessage::Shutdown { reason: reason.to_string() });
        self.closed = true;
    }
}
