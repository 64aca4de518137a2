//! Game metrics.
//!
//! Counters and histograms recorded through the `metrics` facade. No
//! exporter is installed by this crate; without one every call is a no-op.
//!
//! # Example
//!
//! ```rust
//! use tricktable::metrics;
//!
//! metrics::bets_placed_total(false);
//! metrics::reconnections_total(metrics::ReconnectOutcome::Success);
//! ```

use std::time::Duration;

use crate::game::events::{GameEvent, GameEventData};

/// Result of a reconnection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Token accepted and seat restored.
    Success,
    /// Token rejected.
    Failure,
}

impl ReconnectOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ReconnectOutcome::Success => "success",
            ReconnectOutcome::Failure => "failure",
        }
    }
}

// ============================================================================
// Game Metrics
// ============================================================================

/// Record a scored round.
pub fn rounds_completed_total(fulfilled: bool) {
    metrics::counter!("rounds_completed_total",
        "fulfilled" => fulfilled.to_string()
    )
    .increment(1);
}

/// Record a resolved trick.
pub fn tricks_resolved_total() {
    metrics::counter!("tricks_resolved_total").increment(1);
}

/// Record an accepted bid.
pub fn bets_placed_total(skip: bool) {
    let kind = if skip { "skip" } else { "bet" };
    metrics::counter!("bets_placed_total", "kind" => kind).increment(1);
}

/// Record a turn the timer had to act for.
pub fn turn_timeouts_total(phase: &str) {
    metrics::counter!("turn_timeouts_total", "phase" => phase.to_string()).increment(1);
}

/// Update the number of live matches.
pub fn active_matches(count: usize) {
    metrics::gauge!("active_matches").set(count as f64);
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Record a reconnection attempt.
pub fn reconnections_total(outcome: ReconnectOutcome) {
    metrics::counter!("reconnections_total", "outcome" => outcome.as_str()).increment(1);
}

/// Record how long a match command took to process.
pub fn command_duration_seconds(command: &'static str, elapsed: Duration) {
    metrics::histogram!("command_duration_seconds", "command" => command)
        .record(elapsed.as_secs_f64());
}

/// Record the metric counterpart of a game event, if it has one.
pub fn observe_event(event: &GameEvent) {
    match &event.data {
        GameEventData::BidPlaced { bid, .. } => bets_placed_total(bid.is_skip()),
        GameEventData::TrickResolved { .. } => tricks_resolved_total(),
        GameEventData::RoundEnded { record } => rounds_completed_total(record.outcome.fulfilled),
        GameEventData::AutoActionTaken { phase, .. } => turn_timeouts_total(&phase.to_string()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::rules::Bid;
    use crate::game::state::PlayerName;

    #[test]
    fn test_metric_functions_without_recorder() {
        rounds_completed_total(true);
        tricks_resolved_total();
        bets_placed_total(true);
        turn_timeouts_total("playing");
        active_matches(3);
        reconnections_total(ReconnectOutcome::Failure);
        command_duration_seconds("action", Duration::from_millis(2));
    }

    #[test]
    fn test_observe_event() {
        let event = GameEvent::new(0, GameEventData::BidPlaced {
            player: PlayerName::from("ann"),
            bid: Bid::Skip,
        });
        observe_event(&event);
        assert_eq!(ReconnectOutcome::Success.as_str(), "success");
    }
}
