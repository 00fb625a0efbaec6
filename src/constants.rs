//! Configuration constants for the turn timer
//!
//! This module contains the default limits and cadences used throughout
//! the crate. Every value here is the default of a field in
//! [`crate::config::Config`] and can be overridden there.

/// Game rule constants
pub mod game {
    /// Minimum number of players seated at the table
    pub const MIN_PLAYERS: usize = 4;
    /// Maximum number of players seated at the table
    pub const MAX_PLAYERS: usize = 6;
    /// Countdown per player, in seconds, when none is given
    pub const DEFAULT_COUNTDOWN_SECONDS: u32 = 300;
    /// Maximum length of a player name in characters
    pub const MAX_NAME_LENGTH: usize = 30;
    /// Prefix of generated player names (`Player 1`, `Player 2`, ...)
    pub const DEFAULT_NAME_PREFIX: &str = "Player";
}

/// Optimistic concurrency constants
pub mod concurrency {
    /// Number of compare-and-swap attempts before a conflict is permanent
    pub const MAX_ATTEMPTS: usize = 3;
    /// Upper bound accepted for a configured attempt count
    pub const MAX_ATTEMPTS_LIMIT: usize = 10;
}

/// Client scheduling constants, in milliseconds
pub mod client {
    /// Cadence of the display projection tick
    pub const TICK_MS: u64 = 100;
    /// Interval of the consistency backstop poll
    pub const POLL_INTERVAL_MS: u64 = 5_000;
    /// Window within which refresh requests are merged into one fetch
    pub const DEBOUNCE_MS: u64 = 100;
    /// Smallest accepted tick or debounce window
    pub const MIN_CADENCE_MS: u64 = 10;
    /// Largest accepted poll interval
    pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;
}

/// Notification channel constants
pub mod channel {
    /// Number of events buffered per subscriber before it lags
    pub const CAPACITY: usize = 64;
}
