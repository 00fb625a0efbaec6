//! Runtime configuration
//!
//! A [`Config`] gathers the game rules, the optimistic concurrency bound and
//! the client cadences. Every field has a default from
//! [`crate::constants`]; a TOML document only needs to name what it changes.
//!
//! ```toml
//! [game]
//! max_players = 8
//!
//! [client]
//! poll_interval = 2000
//! ```

use std::{path::Path, time::Duration};

use garde::Validate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    client::{self, MAX_POLL_INTERVAL_MS, MIN_CADENCE_MS, POLL_INTERVAL_MS},
    concurrency, game,
};

/// Validates that a duration falls within specified millisecond bounds.
///
/// # Generics
///
/// * `MIN_MS` - The minimum allowed duration in milliseconds (inclusive).
/// * `MAX_MS` - The maximum allowed duration in milliseconds (inclusive).
///
/// # Errors
///
/// Returns a `garde::Error` if the duration is outside the specified bounds.
fn validate_duration<const MIN_MS: u64, const MAX_MS: u64>(
    val: &Duration,
    _ctx: &(),
) -> garde::Result {
    let millis = u64::try_from(val.as_millis()).unwrap_or(u64::MAX);
    if (MIN_MS..=MAX_MS).contains(&millis) {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "outside of bounds [{MIN_MS}ms,{MAX_MS}ms]",
        )))
    }
}

/// Errors that can occur while loading a configuration
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration file could not be read
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The document is not valid TOML or has fields of the wrong type
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A field is outside its accepted range
    #[error("invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
    /// The player bounds contradict each other
    #[error("min_players ({min}) is greater than max_players ({max})")]
    PlayerBounds {
        /// Configured lower bound
        min: usize,
        /// Configured upper bound
        max: usize,
    },
}

/// Rules of the table that the state machine enforces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GameRules {
    /// Fewest players a table may have
    #[garde(range(min = 1))]
    pub min_players: usize,
    /// Most players a table may have
    #[garde(range(min = 1))]
    pub max_players: usize,
    /// Countdown used when a count-down mode change does not name one
    #[garde(range(min = 1))]
    pub default_countdown_seconds: u32,
    /// Maximum length of a player name in characters
    #[garde(range(min = 1))]
    pub max_name_length: usize,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            min_players: game::MIN_PLAYERS,
            max_players: game::MAX_PLAYERS,
            default_countdown_seconds: game::DEFAULT_COUNTDOWN_SECONDS,
            max_name_length: game::MAX_NAME_LENGTH,
        }
    }
}

impl GameRules {
    /// Whether `count` players is an acceptable table size
    pub fn accepts_player_count(&self, count: usize) -> bool {
        (self.min_players..=self.max_players).contains(&count)
    }
}

/// Bound on the compare-and-swap retry loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Attempts before a write conflict is reported as permanent
    #[garde(range(min = 1, max = concurrency::MAX_ATTEMPTS_LIMIT))]
    pub max_attempts: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_attempts: concurrency::MAX_ATTEMPTS,
        }
    }
}

/// Cadences of an observing client
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// How often the display clocks are recomputed
    #[garde(custom(validate_duration::<MIN_CADENCE_MS, POLL_INTERVAL_MS>))]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub tick: Duration,
    /// How often the full state is fetched as a consistency backstop
    #[garde(custom(validate_duration::<MIN_CADENCE_MS, MAX_POLL_INTERVAL_MS>))]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// Window within which refresh requests collapse into one fetch
    #[garde(custom(validate_duration::<MIN_CADENCE_MS, POLL_INTERVAL_MS>))]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub debounce: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(client::TICK_MS),
            poll_interval: Duration::from_millis(client::POLL_INTERVAL_MS),
            debounce: Duration::from_millis(client::DEBOUNCE_MS),
        }
    }
}

/// Complete configuration of the authoritative side and its clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Table rules
    #[garde(dive)]
    pub game: GameRules,
    /// Compare-and-swap bound
    #[garde(dive)]
    pub concurrency: ConcurrencyConfig,
    /// Client cadences
    #[garde(dive)]
    pub client: ClientConfig,
}

impl Config {
    /// Parses and validates a TOML document
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] for malformed documents and
    /// [`Error::Invalid`] or [`Error::PlayerBounds`] for out of range values.
    pub fn from_toml_str(document: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(document)?;
        config.check()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise the same
    /// errors as [`Config::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Validates field ranges and the relation between player bounds
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] or [`Error::PlayerBounds`].
    pub fn check(&self) -> Result<(), Error> {
        self.validate()?;
        if self.game.min_players > self.game.max_players {
            return Err(Error::PlayerBounds {
                min: self.game.min_players,
                max: self.game.max_players,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.check().is_ok());
        assert_eq!(config.game.min_players, 4);
        assert_eq!(config.game.max_players, 6);
        assert_eq!(config.concurrency.max_attempts, 3);
        assert_eq!(config.client.tick, Duration::from_millis(100));
        assert_eq!(config.client.poll_interval, Duration::from_secs(5));
        assert_eq!(config.client.debounce, Duration::from_millis(100));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_document_overrides() {
        let config = Config::from_toml_str(
            r#"
            [game]
            max_players = 8

            [client]
            poll_interval = 2000
            "#,
        )
        .unwrap();

        assert_eq!(config.game.max_players, 8);
        assert_eq!(config.game.min_players, 4);
        assert_eq!(config.client.poll_interval, Duration::from_secs(2));
        assert_eq!(config.client.tick, Duration::from_millis(100));
    }

    #[test]
    fn test_out_of_range_attempts_rejected() {
        let result = Config::from_toml_str("[concurrency]\nmax_attempts = 0\n");
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn test_out_of_range_cadence_rejected() {
        let result = Config::from_toml_str("[client]\ntick = 1\n");
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn test_inverted_player_bounds_rejected() {
        let result = Config::from_toml_str("[game]\nmin_players = 6\nmax_players = 4\n");
        assert!(matches!(
            result,
            Err(Error::PlayerBounds { min: 6, max: 4 })
        ));
    }

    #[test]
    fn test_malformed_document_rejected() {
        let result = Config::from_toml_str("[game\nmax_players = ");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_accepts_player_count() {
        let rules = GameRules::default();
        assert!(!rules.accepts_player_count(3));
        assert!(rules.accepts_player_count(4));
        assert!(rules.accepts_player_count(6));
        assert!(!rules.accepts_player_count(7));
    }
}
