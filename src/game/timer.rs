//! Turn Timer
//!
//! The value type for the single armed timer of a match. Scheduling lives
//! in the match actor; this module only decides durations and deadlines.

use std::time::Duration;

use serde::{Serialize, Deserialize};
use tokio::time::Instant;

use crate::game::state::MatchPhase;

/// Turn durations per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnTimerConfig {
    /// Time to bid.
    pub betting: Duration,
    /// Time to play a card.
    pub playing: Duration,
    /// Time for everyone to confirm the next round.
    pub scoring: Duration,
    /// Multiplier for players in relaxed mode.
    pub relaxed_factor: u32,
    /// How long before expiry the warning goes out.
    pub warning_lead: Duration,
}

impl Default for TurnTimerConfig {
    fn default() -> Self {
        Self {
            betting: Duration::from_secs(60),
            playing: Duration::from_secs(60),
            scoring: Duration::from_secs(60),
            relaxed_factor: 2,
            warning_lead: Duration::from_secs(10),
        }
    }
}

impl TurnTimerConfig {
    /// Duration for a turn in `phase`, or `None` if the phase is untimed.
    pub fn duration_for(&self, phase: MatchPhase, relaxed: bool) -> Option<Duration> {
        let base = match phase {
            MatchPhase::Betting => self.betting,
            MatchPhase::Playing => self.playing,
            MatchPhase::Scoring => self.scoring,
            _ => return None,
        };
        Some(if relaxed { base * self.relaxed_factor.max(1) } else { base })
    }
}

/// Identifies which turn a timer was armed for.
///
/// `turn` is the match's action counter, so two consecutive turns of the
/// same seat still get distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerKey {
    /// Phase the timer belongs to.
    pub phase: MatchPhase,
    /// Seat that owes the action; `None` for table-wide waits.
    pub seat: Option<usize>,
    /// Action counter when armed.
    pub turn: u64,
}

/// An armed turn timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTimer {
    /// Turn this timer guards.
    pub key: TimerKey,
    /// When it was armed.
    pub armed_at: Instant,
    /// Total time allowed.
    pub duration: Duration,
    /// Warning already sent.
    pub warned: bool,
}

impl TurnTimer {
    /// Arm a timer at `now`.
    pub fn arm(key: TimerKey, duration: Duration, now: Instant) -> Self {
        Self { key, armed_at: now, duration, warned: false }
    }

    /// Expiry instant.
    pub fn deadline(&self) -> Instant {
        self.armed_at + self.duration
    }

    /// Time left before expiry.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }

    /// Whether the timer has run out.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// When the imminent-timeout warning is due.
    pub fn warning_at(&self, lead: Duration) -> Instant {
        self.armed_at + self.duration.saturating_sub(lead)
    }

    /// Next instant the owner of this timer must wake up for.
    pub fn next_wakeup(&self, lead: Duration) -> Instant {
        if self.warned {
            self.deadline()
        } else {
            self.warning_at(lead)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relaxed_mode_doubles_duration() {
        let config = TurnTimerConfig::default();
        assert_eq!(config.duration_for(MatchPhase::Playing, false), Some(Duration::from_secs(60)));
        assert_eq!(config.duration_for(MatchPhase::Playing, true), Some(Duration::from_secs(120)));
        assert_eq!(config.duration_for(MatchPhase::TeamSelection, false), None);
        assert_eq!(config.duration_for(MatchPhase::GameOver, true), None);
    }

    #[test]
    fn test_deadline_and_warning() {
        let now = Instant::now();
        let key = TimerKey { phase: MatchPhase::Betting, seat: Some(1), turn: 4 };
        let mut timer = TurnTimer::arm(key, Duration::from_secs(60), now);

        assert_eq!(timer.deadline(), now + Duration::from_secs(60));
        assert_eq!(timer.next_wakeup(Duration::from_secs(10)), now + Duration::from_secs(50));
        assert!(!timer.is_expired(now + Duration::from_secs(59)));
        assert!(timer.is_expired(now + Duration::from_secs(60)));
        assert_eq!(timer.remaining(now + Duration::from_secs(45)), Duration::from_secs(15));

        timer.warned = true;
        assert_eq!(timer.next_wakeup(Duration::from_secs(10)), timer.deadline());
    }

    #[test]
    fn test_warning_lead_longer_than_duration() {
        let now = Instant::now();
        let key = TimerKey { phase: MatchPhase::Scoring, seat: None, turn: 0 };
        let timer = TurnTimer::arm(key, Duration::from_secs(5), now);
        assert_eq!(timer.warning_at(Duration::from_secs(10)), now);
    }
}
