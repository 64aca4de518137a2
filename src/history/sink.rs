//! History Sinks
//!
//! Where finished rounds and games go. The match actor calls
//! [`HistorySink::record`] synchronously, so implementations must not
//! block; storage writes happen behind a channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::history::record::HistoryRecord;

/// Receiver of finalized history records.
pub trait HistorySink: Send + Sync {
    /// Accept one record. Must not block.
    fn record(&self, record: HistoryRecord);
}

/// Shared sink handle.
pub type SharedSink = Arc<dyn HistorySink>;

/// Logs every record and keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl HistorySink for TracingSink {
    fn record(&self, record: HistoryRecord) {
        match &record {
            HistoryRecord::Round(r) => info!(
                match_id = %r.match_id,
                game = r.game_number,
                round = r.round.number,
                fulfilled = r.round.outcome.fulfilled,
                offense_delta = r.round.outcome.offense_delta,
                "Round recorded"
            ),
            HistoryRecord::Game(g) => info!(
                match_id = %g.match_id,
                game = g.game_number,
                rounds = g.rounds_played,
                winner = %g.winning_team,
                "Game recorded"
            ),
        }
    }
}

/// Write-behind sink: records are queued for a storage task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<HistoryRecord>,
}

impl ChannelSink {
    /// Create the sink and the receiving end for the writer task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HistoryRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl HistorySink for ChannelSink {
    fn record(&self, record: HistoryRecord) {
        let match_id = record.match_id();
        if self.sender.send(record).is_err() {
            warn!("History writer is gone, dropping record for match {}", match_id);
        }
    }
}
