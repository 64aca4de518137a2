//! WebSocket Game Server
//!
//! Accepts WebSocket connections, ties them to player identities and routes
//! their messages to match actors. No game rules live here.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::game::state::{MatchId, PlayerName};
use crate::history::SharedSink;
use crate::logging;
use crate::metrics::{self, ReconnectOutcome};
use crate::network::actor::{MatchHandle, Outbox};
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::network::registry::{MatchRegistry, RegistryError};
use crate::network::session::{ConnectionId, IdentityManager, ReconnectToken, SessionError};

/// Queue depth per connection. Bots can finish a whole round in one
/// transition, so this is sized well above one round of events.
const OUTBOX_CAPACITY: usize = 256;

/// Longest accepted player identity.
const MAX_IDENTITY_LEN: usize = 64;

/// How often expired reconnect tokens are purged.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connected client state.
struct ConnectedClient {
    /// Remote address.
    addr: SocketAddr,
    /// Match being watched, if any.
    spectating: Option<MatchId>,
    /// Message sender (for direct messaging to client).
    sender: Outbox,
}

/// State shared by every connection task.
#[derive(Clone)]
struct ServerContext {
    config: Arc<ServerConfig>,
    identities: Arc<IdentityManager>,
    registry: MatchRegistry,
    clients: Arc<RwLock<BTreeMap<ConnectionId, ConnectedClient>>>,
}

fn reject(code: ErrorCode, message: impl Into<String>) -> ServerMessage {
    ServerMessage::error(code, message)
}

fn session_rejection(err: &SessionError) -> ServerMessage {
    let code = match err {
        SessionError::IdentityInUse(_) => ErrorCode::IdentityInUse,
        SessionError::NotIdentified => ErrorCode::NotIdentified,
        other => ErrorCode::from(other.kind()),
    };
    reject(code, err.to_string())
}

fn registry_rejection(err: &RegistryError) -> ServerMessage {
    match err {
        RegistryError::Action(e) => ServerMessage::for_action_error(e),
        other => reject(ErrorCode::from(other.kind()), other.to_string()),
    }
}

impl ServerContext {
    async fn register(&self, connection: ConnectionId, addr: SocketAddr, sender: Outbox) {
        self.clients.write().await.insert(connection, ConnectedClient {
            addr,
            spectating: None,
            sender,
        });
    }

    /// Route one client message. Anything refused is answered on `outbox`.
    #[instrument(skip(self, outbox), fields(kind = msg.kind()))]
    async fn handle_client_message(&self, connection: ConnectionId, msg: ClientMessage, outbox: &Outbox) {
        if let Err(rejection) = self.dispatch(connection, msg, outbox).await {
            let _ = outbox.send(rejection).await;
        }
    }

    async fn dispatch(
        &self,
        connection: ConnectionId,
        msg: ClientMessage,
        outbox: &Outbox,
    ) -> Result<(), ServerMessage> {
        match msg {
            ClientMessage::Ping { timestamp } => {
                let server_time = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
                let _ = outbox.send(ServerMessage::Pong { timestamp, server_time }).await;
                Ok(())
            }
            ClientMessage::Hello { player_id } => self.handle_hello(connection, player_id, outbox).await,
            ClientMessage::Reconnect { player_id, token } => {
                self.handle_reconnect(connection, PlayerName::new(player_id), token.into(), outbox)
                    .await;
                Ok(())
            }
            ClientMessage::Spectate { match_id } => self.handle_spectate(connection, match_id, outbox).await,
            other => {
                let player = self
                    .identities
                    .identity_for(connection)
                    .await
                    .ok_or_else(|| session_rejection(&SessionError::NotIdentified))?;

                match other {
                    ClientMessage::CreateGame { relaxed } => {
                        self.handle_create(connection, player, relaxed, outbox).await
                    }
                    ClientMessage::JoinGame { match_id, relaxed } => {
                        self.handle_join(connection, player, match_id, relaxed, outbox).await
                    }
                    ClientMessage::Leave => self.handle_leave(player).await,
                    action_msg => match action_msg.to_action() {
                        Some(action) => {
                            let handle = self.seated_match(&player).await?;
                            handle.act(player.clone(), action).await.map_err(|e| {
                                debug!("Action from {} refused: {}", player, e);
                                registry_rejection(&e)
                            })
                        }
                        None => Err(reject(ErrorCode::InvalidInput, "Unexpected message")),
                    },
                }
            }
        }
    }

    async fn handle_hello(
        &self,
        connection: ConnectionId,
        player_id: String,
        outbox: &Outbox,
    ) -> Result<(), ServerMessage> {
        let player_id = player_id.trim();
        if player_id.is_empty() || player_id.len() > MAX_IDENTITY_LEN {
            return Err(reject(ErrorCode::InvalidInput, "Player id must be 1 to 64 characters"));
        }

        let player = PlayerName::new(player_id);
        self.identities
            .bind(player.clone(), connection)
            .await
            .map_err(|e| session_rejection(&e))?;

        info!("Connection {} identified as {}", connection, player);
        let _ = outbox
            .send(ServerMessage::Welcome {
                player_id: player,
                server_version: self.config.version.clone(),
            })
            .await;
        Ok(())
    }

    /// Match `player` is seated in. Forgets seats in matches that have ended.
    async fn current_match(&self, player: &PlayerName) -> Option<MatchHandle> {
        let match_id = self.identities.match_for(player).await?;
        match self.registry.get(&match_id).await {
            Ok(handle) if !handle.is_closed() => Some(handle),
            _ => {
                self.identities.clear_match(player).await;
                None
            }
        }
    }

    async fn seated_match(&self, player: &PlayerName) -> Result<MatchHandle, ServerMessage> {
        self.current_match(player)
            .await
            .ok_or_else(|| reject(ErrorCode::NotInMatch, "Not seated in a match"))
    }

    async fn ensure_unseated(&self, player: &PlayerName) -> Result<(), ServerMessage> {
        match self.current_match(player).await {
            Some(handle) => Err(reject(
                ErrorCode::AlreadyInMatch,
                format!("Already seated in match {}", handle.id()),
            )),
            None => Ok(()),
        }
    }

    async fn seat(
        &self,
        connection: ConnectionId,
        player: PlayerName,
        handle: &MatchHandle,
        relaxed: bool,
        outbox: &Outbox,
    ) -> Result<(), RegistryError> {
        handle.join(player.clone(), relaxed, connection, outbox.clone()).await?;
        self.identities.set_match(&player, handle.id()).await;

        let token = self.identities.issue_token(&player, handle.id(), Instant::now()).await;
        let _ = outbox
            .send(ServerMessage::SessionToken {
                match_id: handle.id(),
                token: token.as_str().to_string(),
            })
            .await;
        info!("Player {} seated in match {}", player, handle.id());
        Ok(())
    }

    async fn handle_create(
        &self,
        connection: ConnectionId,
        player: PlayerName,
        relaxed: bool,
        outbox: &Outbox,
    ) -> Result<(), ServerMessage> {
        self.ensure_unseated(&player).await?;

        let handle = self.registry.create().await;
        let _ = outbox.send(ServerMessage::GameCreated { match_id: handle.id() }).await;

        if let Err(e) = self.seat(connection, player, &handle, relaxed, outbox).await {
            error!("Creator could not join match {}: {}", handle.id(), e);
            let _ = handle.close("Creator could not join").await;
            return Err(registry_rejection(&e));
        }
        Ok(())
    }

    async fn handle_join(
        &self,
        connection: ConnectionId,
        player: PlayerName,
        match_id: MatchId,
        relaxed: bool,
        outbox: &Outbox,
    ) -> Result<(), ServerMessage> {
        self.ensure_unseated(&player).await?;

        let handle = self.registry.get(&match_id).await.map_err(|e| registry_rejection(&e))?;
        self.seat(connection, player, &handle, relaxed, outbox)
            .await
            .map_err(|e| registry_rejection(&e))
    }

    async fn handle_leave(&self, player: PlayerName) -> Result<(), ServerMessage> {
        let handle = self.seated_match(&player).await?;
        match handle.leave(player.clone()).await {
            Ok(()) | Err(RegistryError::Closed(_)) => {
                self.identities.clear_match(&player).await;
                info!("Player {} left match {}", player, handle.id());
                Ok(())
            }
            Err(e) => Err(registry_rejection(&e)),
        }
    }

    async fn handle_spectate(
        &self,
        connection: ConnectionId,
        match_id: MatchId,
        outbox: &Outbox,
    ) -> Result<(), ServerMessage> {
        let handle = self.registry.get(&match_id).await.map_err(|e| registry_rejection(&e))?;

        let previous = {
            let mut clients = self.clients.write().await;
            clients
                .get_mut(&connection)
                .and_then(|client| client.spectating.replace(match_id))
        };
        if let Some(previous) = previous.filter(|id| *id != match_id) {
            if let Ok(old) = self.registry.get(&previous).await {
                let _ = old.stop_spectating(connection).await;
            }
        }

        handle
            .spectate(connection, outbox.clone())
            .await
            .map_err(|e| registry_rejection(&e))
    }

    async fn handle_reconnect(
        &self,
        connection: ConnectionId,
        player: PlayerName,
        token: ReconnectToken,
        outbox: &Outbox,
    ) {
        let result = self.try_reconnect(connection, &player, &token, outbox).await;
        match result {
            Ok(match_id) => {
                metrics::reconnections_total(ReconnectOutcome::Success);
                let token = self.identities.issue_token(&player, match_id, Instant::now()).await;
                let _ = outbox
                    .send(ServerMessage::ReconnectionSuccessful {
                        match_id,
                        token: token.as_str().to_string(),
                    })
                    .await;
            }
            Err(reason) => {
                metrics::reconnections_total(ReconnectOutcome::Failure);
                logging::log_reconnect_rejected(player.as_str(), &reason);
                let _ = outbox.send(ServerMessage::ReconnectionFailed { message: reason }).await;
            }
        }
    }

    async fn try_reconnect(
        &self,
        connection: ConnectionId,
        player: &PlayerName,
        token: &ReconnectToken,
        outbox: &Outbox,
    ) -> Result<MatchId, String> {
        let redeemed = self
            .identities
            .redeem_token(token, player, connection, Instant::now())
            .await
            .map_err(|e| e.to_string())?;

        if let Some(old) = redeemed.replaced {
            // Previous connection is still open; tell it the session moved
            if let Some(client) = self.clients.read().await.get(&old) {
                let _ = client.sender.try_send(ServerMessage::Shutdown {
                    reason: "Session resumed on another connection".to_string(),
                });
            }
        }

        let handle = match self.registry.get(&redeemed.match_id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.identities.clear_match(player).await;
                return Err(e.to_string());
            }
        };

        match handle.reconnect(player.clone(), connection, outbox.clone()).await {
            Ok(()) => Ok(redeemed.match_id),
            Err(e @ RegistryError::HandoffFailed(_)) => {
                // Seat is still waiting for its owner
                self.identities
                    .reinstate_token(token.clone(), player, connection, &redeemed, Instant::now())
                    .await;
                Err(e.to_string())
            }
            Err(e) => {
                self.identities.clear_match(player).await;
                Err(e.to_string())
            }
        }
    }

    /// Tear down everything tied to a closed connection.
    async fn disconnect(&self, connection: ConnectionId) {
        let client = self.clients.write().await.remove(&connection);

        if let Some(match_id) = client.as_ref().and_then(|c| c.spectating) {
            if let Ok(handle) = self.registry.get(&match_id).await {
                let _ = handle.stop_spectating(connection).await;
            }
        }

        let Some((player, match_id)) = self.identities.unbind_connection(connection, Instant::now()).await
        else {
            return;
        };
        let Some(match_id) = match_id else {
            return;
        };

        match self.registry.get(&match_id).await {
            Ok(handle) => {
                if handle.disconnected(player.clone(), connection).await.is_err() {
                    self.identities.clear_match(&player).await;
                }
            }
            Err(_) => self.identities.clear_match(&player).await,
        }

        if let Some(client) = client {
            debug!("Player {} at {} dropped from match {}", player, client.addr, match_id);
        }
    }
}

/// The game server.
pub struct GameServer {
    /// Shared connection state.
    ctx: ServerContext,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server writing history to `sink`.
    pub fn new(config: ServerConfig, sink: SharedSink) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = MatchRegistry::new(config.match_defaults.clone(), config.inbox_capacity, sink);
        let identities = IdentityManager::new(config.match_defaults.reconnect_window);

        Self {
            ctx: ServerContext {
                config: Arc::new(config),
                identities: Arc::new(identities),
                registry,
                clients: Arc::new(RwLock::new(BTreeMap::new())),
            },
            shutdown_tx,
        }
    }

    /// Run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        info!("Game server listening on {}", self.ctx.config.bind_addr);

        let cleanup_identities = self.ctx.identities.clone();
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_identities).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.ctx.clients.read().await.len();
                            if clients_count >= self.ctx.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.ctx.registry.close_all("Server shutting down").await;
        cleanup_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = self.ctx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let connection = ConnectionId::new();
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOX_CAPACITY);

            ctx.register(connection, addr, msg_tx.clone()).await;

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let closing = matches!(msg, ServerMessage::Shutdown { .. });
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() || closing {
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            });

            let idle_timeout = ctx.config.idle_timeout;
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => {
                                        ctx.handle_client_message(connection, client_msg, &msg_tx).await;
                                    }
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx
                                            .send(reject(ErrorCode::InvalidInput, "Invalid message format"))
                                            .await;
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let _ = msg_tx
                                    .send(reject(ErrorCode::InvalidInput, "Binary frames are not supported"))
                                    .await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = tokio::time::sleep(idle_timeout) => {
                        info!("Closing idle connection {}", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            ctx.disconnect(connection).await;
            drop(msg_tx);
            sender_task.abort();

            info!("Client {} cleaned up", addr);
        });
    }

    /// Run cleanup loop.
    async fn run_cleanup_loop(identities: Arc<IdentityManager>) {
        let mut interval = interval(CLEANUP_INTERVAL);

        loop {
            interval.tick().await;

            let purged = identities.purge_expired(Instant::now()).await;
            if purged > 0 {
                debug!("Purged {} expired reconnect tokens", purged);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.ctx.clients.read().await.len()
    }

    /// Get running match count.
    pub async fn match_count(&self) -> usize {
        self.ctx.registry.count().await
    }
}
