//! Identity & Reconnection
//!
//! Maps stable player identities to their current volatile connection and
//! handles reconnect tokens. Game logic never sees connection ids; this is
//! the only place they are tied to a name.
//!
//! Everything sits behind one mutex so a token redemption and the
//! connection swap it causes are a single step.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::game::machine::ErrorKind;
use crate::game::state::{MatchId, PlayerName};

/// Volatile per-connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Opaque single-use reconnect token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReconnectToken(String);

impl ReconnectToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Token as sent over the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ReconnectToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Connection has not claimed an identity.
    #[error("Send hello first")]
    NotIdentified,

    /// Connection already has an identity.
    #[error("Connection is already identified as {0}")]
    AlreadyIdentified(PlayerName),

    /// Identity held by another live connection.
    #[error("Player {0} is already connected")]
    IdentityInUse(PlayerName),

    /// Token unknown or already used.
    #[error("Reconnect token is not valid")]
    UnknownToken,

    /// Reconnect window elapsed.
    #[error("Reconnect window has expired")]
    TokenExpired,

    /// Token belongs to someone else.
    #[error("Reconnect token does not belong to {0}")]
    IdentityMismatch(PlayerName),
}

impl SessionError {
    /// Error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::UnknownToken
            | SessionError::TokenExpired
            | SessionError::IdentityMismatch(_) => ErrorKind::ReconnectionRejected,
            _ => ErrorKind::InvalidAction,
        }
    }
}

/// Result of a successful token redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redeemed {
    /// Match the identity is seated in.
    pub match_id: MatchId,
    /// Previous connection of the identity, now detached.
    pub replaced: Option<ConnectionId>,
    /// When the identity's last connection dropped.
    pub disconnected_at: Option<Instant>,
}

#[derive(Debug)]
struct TokenRecord {
    identity: PlayerName,
    match_id: MatchId,
    issued_at: Instant,
    /// Set when the connection drops; the window counts from here.
    disconnected_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    bindings: BTreeMap<PlayerName, ConnectionId>,
    connections: BTreeMap<ConnectionId, PlayerName>,
    matches: BTreeMap<PlayerName, MatchId>,
    tokens: BTreeMap<ReconnectToken, TokenRecord>,
}

impl Inner {
    fn revoke_tokens(&mut self, identity: &PlayerName) {
        self.tokens.retain(|_, record| &record.identity != identity);
    }
}

/// Identity/connection table and reconnect tokens.
#[derive(Debug)]
pub struct IdentityManager {
    inner: Mutex<Inner>,
    reconnect_window: Duration,
}

impl IdentityManager {
    /// Create a manager whose tokens stay valid `reconnect_window` after a disconnect.
    pub fn new(reconnect_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            reconnect_window,
        }
    }

    /// Claim `identity` for `connection`.
    pub async fn bind(&self, identity: PlayerName, connection: ConnectionId) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if let Some(current) = inner.connections.get(&connection) {
            return Err(SessionError::AlreadyIdentified(current.clone()));
        }
        if inner.bindings.contains_key(&identity) {
            return Err(SessionError::IdentityInUse(identity));
        }
        if inner.tokens.values().any(|t| t.identity == identity && t.disconnected_at.is_some()) {
            // Seat is waiting for a reconnect; only the token may claim it
            return Err(SessionError::IdentityInUse(identity));
        }

        inner.bindings.insert(identity.clone(), connection);
        inner.connections.insert(connection, identity);
        Ok(())
    }

    /// Identity bound to `connection`.
    pub async fn identity_for(&self, connection: ConnectionId) -> Option<PlayerName> {
        self.inner.lock().await.connections.get(&connection).cloned()
    }

    /// Match `identity` is seated in.
    pub async fn match_for(&self, identity: &PlayerName) -> Option<MatchId> {
        self.inner.lock().await.matches.get(identity).copied()
    }

    /// Record that `identity` took a seat in `match_id`.
    pub async fn set_match(&self, identity: &PlayerName, match_id: MatchId) {
        self.inner.lock().await.matches.insert(identity.clone(), match_id);
    }

    /// Forget `identity`'s seat and any tokens for it.
    pub async fn clear_match(&self, identity: &PlayerName) {
        let mut inner = self.inner.lock().await;
        inner.matches.remove(identity);
        inner.revoke_tokens(identity);
    }

    /// Detach `connection`.
    ///
    /// Only removes the identity binding if it still points at this
    /// connection, so a late disconnect cannot evict a newer connection.
    /// Returns the identity and its match when the binding was removed.
    pub async fn unbind_connection(
        &self,
        connection: ConnectionId,
        now: Instant,
    ) -> Option<(PlayerName, Option<MatchId>)> {
        let mut inner = self.inner.lock().await;
        let identity = inner.connections.remove(&connection)?;
        if inner.bindings.get(&identity) != Some(&connection) {
            return None;
        }
        inner.bindings.remove(&identity);

        for record in inner.tokens.values_mut().filter(|r| r.identity == identity) {
            record.disconnected_at = Some(now);
        }

        let match_id = inner.matches.get(&identity).copied();
        Some((identity, match_id))
    }

    /// Issue a fresh token for `identity`, revoking older ones.
    pub async fn issue_token(&self, identity: &PlayerName, match_id: MatchId, now: Instant) -> ReconnectToken {
        let mut inner = self.inner.lock().await;
        inner.revoke_tokens(identity);

        let token = ReconnectToken::generate();
        inner.tokens.insert(token.clone(), TokenRecord {
            identity: identity.clone(),
            match_id,
            issued_at: now,
            disconnected_at: None,
        });
        token
    }

    /// Redeem `token` for `claimed` on `connection`.
    ///
    /// The token is consumed and the identity rebound in one step. A
    /// mismatched claim leaves the token for its owner.
    pub async fn redeem_token(
        &self,
        token: &ReconnectToken,
        claimed: &PlayerName,
        connection: ConnectionId,
        now: Instant,
    ) -> Result<Redeemed, SessionError> {
        let mut inner = self.inner.lock().await;

        if let Some(current) = inner.connections.get(&connection) {
            if current != claimed {
                return Err(SessionError::AlreadyIdentified(current.clone()));
            }
        }

        let record = inner.tokens.get(token).ok_or(SessionError::UnknownToken)?;
        if &record.identity != claimed {
            return Err(SessionError::IdentityMismatch(claimed.clone()));
        }
        let expired = record
            .disconnected_at
            .is_some_and(|at| now.saturating_duration_since(at) > self.reconnect_window);
        let match_id = record.match_id;
        let disconnected_at = record.disconnected_at;
        let token_age = now.saturating_duration_since(record.issued_at);

        inner.tokens.remove(token);
        if expired {
            return Err(SessionError::TokenExpired);
        }

        let replaced = inner
            .bindings
            .insert(claimed.clone(), connection)
            .filter(|old| *old != connection);
        if let Some(old) = replaced {
            inner.connections.remove(&old);
        }
        inner.connections.insert(connection, claimed.clone());
        inner.matches.insert(claimed.clone(), match_id);
        debug!("Token for {} redeemed {}s after issue", claimed, token_age.as_secs());

        Ok(Redeemed { match_id, replaced, disconnected_at })
    }

    /// Undo a redemption whose connection closed before the seat was
    /// handed over. `token` becomes valid again with its original window.
    pub async fn reinstate_token(
        &self,
        token: ReconnectToken,
        identity: &PlayerName,
        connection: ConnectionId,
        redeemed: &Redeemed,
        now: Instant,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.bindings.get(identity) == Some(&connection) {
            inner.bindings.remove(identity);
            inner.connections.remove(&connection);
        }
        inner.tokens.insert(token, TokenRecord {
            identity: identity.clone(),
            match_id: redeemed.match_id,
            issued_at: now,
            disconnected_at: Some(redeemed.disconnected_at.unwrap_or(now)),
        });
    }

    /// Drop tokens whose reconnect window has passed. Returns how many.
    pub async fn purge_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.tokens.len();
        let window = self.reconnect_window;
        inner.tokens.retain(|_, record| {
            record
                .disconnected_at
                .map_or(true, |at| now.saturating_duration_since(at) <= window)
        });
        before - inner.tokens.len()
    }

    /// Number of bound connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }
}

#[cfg(test)]
impl IdentityManager {
    async fn connection_for(&self, identity: &PlayerName) -> Option<ConnectionId> {
        self.inner.lock().await.bindings.get(identity).copied()
    }
}
