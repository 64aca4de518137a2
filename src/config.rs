//! Server configuration management.
//!
//! Every setting comes from a `TRICKTABLE_*` environment variable with a
//! default fallback. Unparseable values fall back to the default as well;
//! [`ServerConfig::validate`] catches values that parse but make no sense.

use std::net::SocketAddr;
use std::time::Duration;

use crate::game::machine::{DisconnectPolicy, MatchConfig};
use crate::game::rules::ScoringRules;
use crate::game::timer::TurnTimerConfig;

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Close connections that send nothing for this long.
    pub idle_timeout: Duration,
    /// Capacity of each match actor's inbox.
    pub inbox_capacity: usize,
    /// Rules and timing applied to new matches.
    pub match_defaults: MatchConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            inbox_capacity: 64,
            match_defaults: MatchConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let m = &defaults.match_defaults;
        let t = &m.timers;

        let timers = TurnTimerConfig {
            betting: secs_env_or("TRICKTABLE_BETTING_TIMEOUT_SECS", t.betting),
            playing: secs_env_or("TRICKTABLE_PLAYING_TIMEOUT_SECS", t.playing),
            scoring: secs_env_or("TRICKTABLE_SCORING_TIMEOUT_SECS", t.scoring),
            relaxed_factor: parse_env_or("TRICKTABLE_RELAXED_FACTOR", t.relaxed_factor),
            warning_lead: secs_env_or("TRICKTABLE_WARNING_LEAD_SECS", t.warning_lead),
        };

        let match_defaults = MatchConfig {
            scoring: ScoringRules {
                without_trump_multiplier: parse_env_or(
                    "TRICKTABLE_WITHOUT_TRUMP_MULTIPLIER",
                    m.scoring.without_trump_multiplier,
                ),
            },
            win_threshold: parse_env_or("TRICKTABLE_WIN_THRESHOLD", m.win_threshold),
            max_rounds: parse_env_or("TRICKTABLE_MAX_ROUNDS", m.max_rounds),
            timers,
            max_afk_warnings: parse_env_or("TRICKTABLE_MAX_AFK_WARNINGS", m.max_afk_warnings),
            disconnect_policy: parse_env_or("TRICKTABLE_DISCONNECT_POLICY", m.disconnect_policy),
            reconnect_window: secs_env_or("TRICKTABLE_RECONNECT_WINDOW_SECS", m.reconnect_window),
            game_over_grace: secs_env_or("TRICKTABLE_GAME_OVER_GRACE_SECS", m.game_over_grace),
        };

        Self {
            bind_addr: parse_env_or("TRICKTABLE_BIND", defaults.bind_addr),
            max_connections: parse_env_or("TRICKTABLE_MAX_CONNECTIONS", defaults.max_connections),
            idle_timeout: secs_env_or("TRICKTABLE_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            inbox_capacity: parse_env_or("TRICKTABLE_INBOX_CAPACITY", defaults.inbox_capacity),
            match_defaults,
            version: defaults.version,
        }
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.match_defaults;

        if self.max_connections == 0 {
            return Err(invalid("TRICKTABLE_MAX_CONNECTIONS", "Must be greater than 0"));
        }

        if self.inbox_capacity == 0 {
            return Err(invalid("TRICKTABLE_INBOX_CAPACITY", "Must be greater than 0"));
        }

        for (var, value) in [
            ("TRICKTABLE_BETTING_TIMEOUT_SECS", m.timers.betting),
            ("TRICKTABLE_PLAYING_TIMEOUT_SECS", m.timers.playing),
            ("TRICKTABLE_SCORING_TIMEOUT_SECS", m.timers.scoring),
        ] {
            if value.is_zero() {
                return Err(invalid(var, "Must be at least 1 second"));
            }
            if m.timers.warning_lead >= value {
                return Err(ConfigError::Invalid {
                    var: "TRICKTABLE_WARNING_LEAD_SECS".to_string(),
                    reason: format!("Must be shorter than {} ({}s)", var, value.as_secs()),
                });
            }
        }

        if m.timers.relaxed_factor == 0 {
            return Err(invalid("TRICKTABLE_RELAXED_FACTOR", "Must be at least 1"));
        }

        if m.win_threshold <= 0 {
            return Err(invalid("TRICKTABLE_WIN_THRESHOLD", "Must be greater than 0"));
        }

        if m.scoring.without_trump_multiplier < 1 {
            return Err(invalid("TRICKTABLE_WITHOUT_TRUMP_MULTIPLIER", "Must be at least 1"));
        }

        if m.max_afk_warnings == 0 {
            return Err(invalid("TRICKTABLE_MAX_AFK_WARNINGS", "Must be at least 1"));
        }

        if m.reconnect_window.is_zero() {
            return Err(invalid("TRICKTABLE_RECONNECT_WINDOW_SECS", "Must be at least 1 second"));
        }

        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Value parsed but is out of range.
    #[error("Invalid configuration for {var}: {reason}")]
    Invalid {
        /// Environment variable.
        var: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn invalid(var: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { var: var.to_string(), reason: reason.to_string() }
}

/// Parse an environment variable, falling back to `default`.
fn parse_env_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Whole seconds from an environment variable.
fn secs_env_or(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_env_or(key, default.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.match_defaults.win_threshold, 41);
        assert_eq!(config.match_defaults.timers.betting, Duration::from_secs(60));
    }

    #[test]
    fn test_from_env_reads_overrides() {
        // Variable names unique to this test so parallel tests do not interfere
        std::env::set_var("TRICKTABLE_WIN_THRESHOLD", "61");
        std::env::set_var("TRICKTABLE_DISCONNECT_POLICY", "terminate");
        std::env::set_var("TRICKTABLE_MAX_ROUNDS", "not-a-number");

        let config = ServerConfig::from_env();
        assert_eq!(config.match_defaults.win_threshold, 61);
        assert_eq!(config.match_defaults.disconnect_policy, DisconnectPolicy::Terminate);
        assert_eq!(config.match_defaults.max_rounds, 16);

        std::env::remove_var("TRICKTABLE_WIN_THRESHOLD");
        std::env::remove_var("TRICKTABLE_DISCONNECT_POLICY");
        std::env::remove_var("TRICKTABLE_MAX_ROUNDS");
    }

    #[test]
    fn test_warning_lead_must_fit() {
        let mut config = ServerConfig::default();
        config.match_defaults.timers.warning_lead = Duration::from_secs(60);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("TRICKTABLE_WARNING_LEAD_SECS"));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = ServerConfig::default();
        config.match_defaults.win_threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_disconnect_policy_display_round_trips() {
        for policy in [DisconnectPolicy::Bot, DisconnectPolicy::Terminate] {
            assert_eq!(policy.to_string().parse::<DisconnectPolicy>().unwrap(), policy);
        }
    }
}
