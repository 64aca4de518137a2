//! Match Registry
//!
//! Maps match ids to the handles of their running actors. An entry is
//! removed as soon as its actor task ends.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::game::machine::{ActionError, ErrorKind, MatchConfig, StateMachine};
use crate::game::state::MatchId;
use crate::history::SharedSink;
use crate::metrics;
use crate::network::actor::{MatchActor, MatchHandle};

/// Registry and match handle errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No running match with this id.
    #[error("Match not found: {0}")]
    NotFound(MatchId),

    /// The match actor has stopped.
    #[error("Match {0} is closed")]
    Closed(MatchId),

    /// The new connection closed before the seat was handed over.
    #[error("Connection closed before rejoining match {0}")]
    HandoffFailed(MatchId),

    /// The match refused the action.
    #[error(transparent)]
    Action(#[from] ActionError),
}

impl RegistryError {
    /// Client-facing category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NotFound(_) | RegistryError::Closed(_) => ErrorKind::NotFound,
            RegistryError::HandoffFailed(_) => ErrorKind::ReconnectionRejected,
            RegistryError::Action(e) => e.kind(),
        }
    }
}

/// All running matches.
#[derive(Clone)]
pub struct MatchRegistry {
    matches: Arc<RwLock<BTreeMap<MatchId, MatchHandle>>>,
    defaults: MatchConfig,
    inbox_capacity: usize,
    sink: SharedSink,
}

impl MatchRegistry {
    /// Create an empty registry. New matches use `defaults`.
    pub fn new(defaults: MatchConfig, inbox_capacity: usize, sink: SharedSink) -> Self {
        Self {
            matches: Arc::new(RwLock::new(BTreeMap::new())),
            defaults,
            inbox_capacity,
            sink,
        }
    }

    /// Start a fresh match with a random id.
    pub async fn create(&self) -> MatchHandle {
        self.spawn(StateMachine::new(Uuid::new_v4(), self.defaults.clone())).await
    }

    /// Run `machine` in its own actor task and register it.
    pub async fn spawn(&self, machine: StateMachine) -> MatchHandle {
        let id = machine.state().id;
        let (actor, handle) = MatchActor::new(machine, self.inbox_capacity, self.sink.clone());

        {
            let mut matches = self.matches.write().await;
            matches.insert(id, handle.clone());
            metrics::active_matches(matches.len());
        }
        info!("Created match {}", id);

        let matches = self.matches.clone();
        tokio::spawn(async move {
            actor.run().await;
            let mut matches = matches.write().await;
            matches.remove(&id);
            metrics::active_matches(matches.len());
            debug!("Match {} removed from registry", id);
        });

        handle
    }

    /// Handle of a running match.
    pub async fn get(&self, id: &MatchId) -> Result<MatchHandle, RegistryError> {
        self.matches
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound(*id))
    }

    /// Number of running matches.
    pub async fn count(&self) -> usize {
        self.matches.read().await.len()
    }

    /// Ask every match to close.
    pub async fn close_all(&self, reason: &str) {
        let handles: Vec<MatchHandle> = self.matches.read().await.values().cloned().collect();
        for handle in handles {
            let _ = handle.close(reason).await;
        }
    }
}
