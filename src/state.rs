//! Authoritative turn and timer state
//!
//! [`GameState`] is the single record every participant observes. It is
//! never mutated in place: each operation takes the current state and the
//! current wall-clock time and returns either a complete, internally
//! consistent successor with a new [`Version`] or an [`Error`], leaving the
//! original untouched. The optimistic concurrency layer in
//! [`crate::controller`] is the only caller that persists the successors.
//!
//! The machine has three phases, see [`Phase`]:
//!
//! * `NotStarted` - no active player (fresh game, reset, or timed out)
//! * `Running` - an active player whose clock is running
//! * `Paused` - an active player whose clock is stopped

use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::{TimestampMilliSeconds, serde_as};
use thiserror::Error;
use web_time::SystemTime;

use crate::{clock, config::GameRules, names};

/// Direction the per-player clocks move in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimerMode {
    /// Players accumulate the time they spend on their turns
    #[default]
    CountUp,
    /// Players spend down a fixed budget and time out at zero
    CountDown,
}

/// Token that changes on every successful mutation
///
/// Versions only ever increase for a given record, so a larger version is
/// always the newer snapshot.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version of a freshly created game
    pub const INITIAL: Self = Self(0);

    /// The version that follows this one
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The raw counter value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A seat at the table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Display name, unique at the table
    name: String,
    /// Accumulated time (count-up) or remaining time (count-down), in seconds
    elapsed_seconds: u64,
}

impl Player {
    /// Creates a player with the given name and clock value
    pub fn new(name: impl Into<String>, elapsed_seconds: u64) -> Self {
        Self {
            name: name.into(),
            elapsed_seconds,
        }
    }

    /// The player's display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accumulated time (count-up) or remaining time (count-down), in seconds
    ///
    /// For the active player this is the value as of the last
    /// synchronization point, see [`GameState::live_player_time`].
    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }
}

/// Coarse phase of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    /// No player is active
    NotStarted,
    /// A player is active and their clock is running
    Running,
    /// A player is active and the clock is stopped
    Paused,
}

/// Errors returned by state transitions
#[derive(Error, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed input such as a bad player count or a zero countdown
    #[error("invalid input: {0}")]
    Validation(String),
    /// The command references a seat that does not exist
    #[error("player {0} does not exist")]
    InvalidPlayerId(usize),
    /// A requested player name was rejected
    #[error("invalid name: {0}")]
    Name(#[from] names::Error),
}

impl Error {
    /// Whether the error stems from malformed input rather than from the
    /// current state of the table
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Name(_))
    }
}

/// Mutating operations accepted by the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Hand the turn to `target`, or to the next seat when `None`
    SwitchTurn {
        /// Seat to activate
        target: Option<usize>,
    },
    /// Stop the clock
    Pause,
    /// Restart the clock, excluding the paused interval
    Resume,
    /// Return to a fresh, stopped table
    Reset,
    /// Change the timer mode, restarting the game
    SetTimerMode {
        /// New mode
        mode: TimerMode,
        /// Countdown per player, defaults to the configured value
        countdown_seconds: Option<u32>,
    },
    /// Grow or shrink the table, restarting the game
    SetPlayerCount(usize),
    /// Report a player's clock value as observed by a client
    SyncTimer {
        /// Seat whose clock is reported
        player: usize,
        /// Observed seconds, clamped to the valid range
        elapsed_seconds: i64,
    },
    /// Advance the active player's clock from the authoritative timestamps
    Tick,
    /// Give a seat a new name
    RenamePlayer {
        /// Seat to rename
        player: usize,
        /// Requested name
        name: String,
    },
}

impl Command {
    /// Checks the parts of a command that do not depend on the current state
    ///
    /// Runs before the authoritative record is read, so malformed input never
    /// costs a round trip to the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for bad counts and countdowns and
    /// [`Error::Name`] for unacceptable names.
    pub fn validate(&self, rules: &GameRules) -> Result<(), Error> {
        match self {
            Self::SetTimerMode {
                countdown_seconds: Some(0),
                ..
            } => Err(Error::Validation(
                "countdown must be a positive number of seconds".to_owned(),
            )),
            Self::SetPlayerCount(count) if !rules.accepts_player_count(*count) => {
                Err(Error::Validation(format!(
                    "player count {count} outside of bounds [{},{}]",
                    rules.min_players, rules.max_players
                )))
            }
            Self::RenamePlayer { name, .. } => {
                names::validate(name, rules.max_name_length, [])?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// The authoritative state of one game
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    /// Seats in turn order
    players: Vec<Player>,
    /// Seat whose turn it is, if any
    active_player: Option<usize>,
    /// Direction of the clocks
    timer_mode: TimerMode,
    /// Budget per player in count-down mode
    countdown_seconds: u32,
    /// Start of the current turn, shifted forward by every pause
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    turn_started_at: Option<SystemTime>,
    /// Instant up to which the active player's `elapsed_seconds` is current
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    banked_at: Option<SystemTime>,
    /// When the clock was stopped
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    paused_at: Option<SystemTime>,
    /// Compare-and-swap token
    version: Version,
}

impl GameState {
    /// Creates a fresh game: default players, count-up, no active player
    pub fn new(rules: &GameRules) -> Self {
        Self {
            players: (0..rules.min_players)
                .map(|position| Player::new(names::default_name(position), 0))
                .collect_vec(),
            active_player: None,
            timer_mode: TimerMode::CountUp,
            countdown_seconds: rules.default_countdown_seconds,
            turn_started_at: None,
            banked_at: None,
            paused_at: None,
            version: Version::INITIAL,
        }
    }

    /// Seats in turn order
    pub fn players(&self) -> &[Player] {
        &self.players
    }

    /// Seat whose turn it is
    pub fn active_player(&self) -> Option<usize> {
        self.active_player
    }

    /// Direction of the clocks
    pub fn timer_mode(&self) -> TimerMode {
        self.timer_mode
    }

    /// Budget per player in count-down mode
    pub fn countdown_seconds(&self) -> u32 {
        self.countdown_seconds
    }

    /// Start of the current turn, shifted forward by every pause
    pub fn turn_started_at(&self) -> Option<SystemTime> {
        self.turn_started_at
    }

    /// When the clock was stopped
    pub fn paused_at(&self) -> Option<SystemTime> {
        self.paused_at
    }

    /// Whether the clock is stopped
    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Compare-and-swap token of this snapshot
    pub fn version(&self) -> Version {
        self.version
    }

    /// Coarse phase of the state machine
    pub fn phase(&self) -> Phase {
        match (self.active_player, self.is_paused()) {
            (None, _) => Phase::NotStarted,
            (Some(_), false) => Phase::Running,
            (Some(_), true) => Phase::Paused,
        }
    }

    /// Time spent in the current turn at `now`, excluding pauses
    pub fn current_turn_time(&self, now: SystemTime) -> Duration {
        self.turn_started_at
            .map(|started| clock::elapsed(self.effective_now(now), started))
            .unwrap_or_default()
    }

    /// Whole seconds spent in the current turn at `now`, excluding pauses
    pub fn current_turn_seconds(&self, now: SystemTime) -> u64 {
        self.turn_started_at
            .map(|started| clock::elapsed_since_turn_start(self.effective_now(now), started))
            .unwrap_or_default()
    }

    /// A player's clock value extrapolated to `now`
    ///
    /// Inactive players report their stored value. The active player adds
    /// (count-up) or subtracts (count-down) the time since the last
    /// synchronization point, frozen while paused.
    ///
    /// # Returns
    ///
    /// `None` if `index` is not a seat at the table
    pub fn live_player_time(&self, index: usize, now: SystemTime) -> Option<Duration> {
        let stored = Duration::from_secs(self.players.get(index)?.elapsed_seconds);
        if self.active_player != Some(index) {
            return Some(stored);
        }
        let since = self.time_since_banked(now);
        Some(match self.timer_mode {
            TimerMode::CountUp => stored + since,
            TimerMode::CountDown => stored.saturating_sub(since),
        })
    }

    /// Checks the structural invariants of the record
    ///
    /// * a turn start exists exactly when a player is active
    /// * the active seat exists
    /// * count-down clocks never exceed the countdown
    pub fn is_consistent(&self) -> bool {
        let active = self.active_player.is_some();
        active == self.turn_started_at.is_some()
            && active == self.banked_at.is_some()
            && self.active_player.is_none_or(|index| index < self.players.len())
            && (self.timer_mode == TimerMode::CountUp
                || self
                    .players
                    .iter()
                    .all(|player| player.elapsed_seconds <= u64::from(self.countdown_seconds)))
    }

    /// Applies a command at `now`
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying operation; `self` is unchanged.
    pub fn apply(&self, command: &Command, now: SystemTime, rules: &GameRules) -> Result<Self, Error> {
        command.validate(rules)?;
        match command {
            Command::SwitchTurn { target } => self.switch_turn(*target, now),
            Command::Pause => Ok(self.pause(now)),
            Command::Resume => Ok(self.resume(now)),
            Command::Reset => Ok(self.reset(now)),
            Command::SetTimerMode {
                mode,
                countdown_seconds,
            } => self.set_timer_mode(*mode, *countdown_seconds, rules),
            Command::SetPlayerCount(count) => self.set_player_count(*count, rules),
            Command::SyncTimer {
                player,
                elapsed_seconds,
            } => self.sync_timer(*player, *elapsed_seconds, now),
            Command::Tick => Ok(self.tick(now)),
            Command::RenamePlayer { player, name } => self.rename_player(*player, name, rules),
        }
    }

    /// Hands the turn to `target`, or to the next seat in rotation
    ///
    /// Without a target the turn wraps from the last seat to the first, and
    /// a game with no active player starts at seat 0. In count-up mode the
    /// outgoing player's running time is folded into their total; in
    /// count-down mode their remaining time is kept as last synchronized.
    ///
    /// Starting a game always starts the clock. Switching while paused keeps
    /// the game paused, with the incoming turn stopped at its first instant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPlayerId`] if `target` is not a seat.
    pub fn switch_turn(&self, target: Option<usize>, now: SystemTime) -> Result<Self, Error> {
        let seats = self.players.len();
        if let Some(target) = target.filter(|target| *target >= seats) {
            return Err(Error::InvalidPlayerId(target));
        }
        let incoming = target.unwrap_or_else(|| {
            self.active_player
                .map_or(0, |active| (active + 1) % seats)
        });

        let mut next = self.clone();
        if next.timer_mode == TimerMode::CountUp {
            next.bank_active(now);
        }
        next.active_player = Some(incoming);
        next.turn_started_at = Some(now);
        next.banked_at = Some(now);
        next.paused_at = match (self.active_player, self.paused_at) {
            (Some(_), Some(_)) => Some(now),
            _ => None,
        };
        Ok(next.commit())
    }

    /// Stops the clock
    ///
    /// Pausing an already paused game, or a game without an active player,
    /// succeeds without changing anything but the version.
    pub fn pause(&self, now: SystemTime) -> Self {
        let mut next = self.clone();
        if next.phase() == Phase::Running {
            next.paused_at = Some(now);
        }
        next.commit()
    }

    /// Restarts the clock
    ///
    /// The length of the pause is excluded by shifting the turn start and
    /// the synchronization point forward. Resuming a game that is not paused
    /// succeeds without changing anything but the version.
    pub fn resume(&self, now: SystemTime) -> Self {
        let mut next = self.clone();
        if let Some(paused_at) = next.paused_at.take() {
            let pause = clock::elapsed(now, paused_at);
            next.turn_started_at = next
                .turn_started_at
                .map(|started| clock::adjust_turn_start_for_pause(started, pause));
            next.banked_at = next
                .banked_at
                .map(|banked| clock::adjust_turn_start_for_pause(banked, pause));
        }
        next.commit()
    }

    /// Returns to a fresh table with the clock explicitly stopped
    ///
    /// The record is stopped rather than merely idle, so a stale client that
    /// still believes the game is running cannot resume a freshly reset game
    /// by accident.
    pub fn reset(&self, now: SystemTime) -> Self {
        let mut next = self.clone().restarted();
        next.paused_at = Some(now);
        next.commit()
    }

    /// Changes the timer mode and restarts the game
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `countdown_seconds` is zero.
    pub fn set_timer_mode(
        &self,
        mode: TimerMode,
        countdown_seconds: Option<u32>,
        rules: &GameRules,
    ) -> Result<Self, Error> {
        Command::SetTimerMode {
            mode,
            countdown_seconds,
        }
        .validate(rules)?;

        let mut next = self.clone();
        next.timer_mode = mode;
        next.countdown_seconds = match (mode, countdown_seconds) {
            (_, Some(countdown)) => countdown,
            (TimerMode::CountDown, None) => rules.default_countdown_seconds,
            (TimerMode::CountUp, None) => self.countdown_seconds,
        };
        Ok(next.restarted().commit())
    }

    /// Grows or shrinks the table and restarts the game
    ///
    /// Growing appends players with fresh default names, shrinking drops the
    /// last seats.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `count` is outside the configured
    /// bounds.
    pub fn set_player_count(&self, count: usize, rules: &GameRules) -> Result<Self, Error> {
        Command::SetPlayerCount(count).validate(rules)?;

        let mut next = self.clone();
        if count < next.players.len() {
            next.players.truncate(count);
        } else {
            let added = names::fresh_defaults(
                next.players.iter().map(Player::name),
                count - next.players.len(),
            );
            next.players
                .extend(added.into_iter().map(|name| Player::new(name, 0)));
        }
        Ok(next.restarted().commit())
    }

    /// Records a player's clock value as observed by a client
    ///
    /// The value is clamped at zero, and at the countdown in count-down mode.
    /// A report is whole seconds, so for the active player the synchronization
    /// point moves to `now` (or to the pause instant while paused) minus the
    /// sub-second part still pending. Reporting the value [`GameState::tick`]
    /// would bank therefore changes nothing, however often it happens. An
    /// active count-down player reaching zero times out, which leaves the
    /// game without an active player.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPlayerId`] if `player` is not a seat.
    pub fn sync_timer(&self, player: usize, elapsed_seconds: i64, now: SystemTime) -> Result<Self, Error> {
        if player >= self.players.len() {
            return Err(Error::InvalidPlayerId(player));
        }
        let mut value = u64::try_from(elapsed_seconds).unwrap_or_default();
        if self.timer_mode == TimerMode::CountDown {
            value = value.min(u64::from(self.countdown_seconds));
        }

        let mut next = self.clone();
        next.players[player].elapsed_seconds = value;
        if next.active_player == Some(player) {
            let effective = self.effective_now(now);
            let pending = Duration::from_nanos(u64::from(self.time_since_banked(now).subsec_nanos()));
            next.banked_at = Some(effective.checked_sub(pending).unwrap_or(effective));
        }
        next.expire_if_finished();
        Ok(next.commit())
    }

    /// Advances the active player's clock from the authoritative timestamps
    ///
    /// Whole elapsed seconds are moved into the player's stored value, the
    /// fractional remainder stays pending so repeated ticks never drift. A
    /// count-down player reaching zero times out exactly once: afterwards no
    /// player is active and further ticks change nothing but the version.
    pub fn tick(&self, now: SystemTime) -> Self {
        let mut next = self.clone();
        next.bank_active(now);
        next.expire_if_finished();
        next.commit()
    }

    /// Gives a seat a new name
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPlayerId`] for unknown seats and
    /// [`Error::Name`] if the name is rejected or used by another seat.
    pub fn rename_player(&self, player: usize, name: &str, rules: &GameRules) -> Result<Self, Error> {
        if player >= self.players.len() {
            return Err(Error::InvalidPlayerId(player));
        }
        let others = self
            .players
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != player)
            .map(|(_, other)| other.name());
        let name = names::validate(name, rules.max_name_length, others)?;

        let mut next = self.clone();
        next.players[player].name = name;
        Ok(next.commit())
    }
}

// Internal helpers
impl GameState {
    /// The instant clocks are measured at: frozen at the pause while paused
    fn effective_now(&self, now: SystemTime) -> SystemTime {
        self.paused_at.unwrap_or(now)
    }

    /// Time the active player's stored value is behind `now`
    fn time_since_banked(&self, now: SystemTime) -> Duration {
        self.banked_at
            .map(|banked| clock::elapsed(self.effective_now(now), banked))
            .unwrap_or_default()
    }

    /// Moves whole seconds of pending time into the active player's value
    fn bank_active(&mut self, now: SystemTime) {
        let (Some(active), Some(banked)) = (self.active_player, self.banked_at) else {
            return;
        };
        let whole = self.time_since_banked(now).as_secs();
        let player = &mut self.players[active];
        player.elapsed_seconds = match self.timer_mode {
            TimerMode::CountUp => player.elapsed_seconds.saturating_add(whole),
            TimerMode::CountDown => clock::countdown_remaining(player.elapsed_seconds, whole),
        };
        self.banked_at = Some(clock::adjust_turn_start_for_pause(
            banked,
            Duration::from_secs(whole),
        ));
    }

    /// Ends the active turn if its countdown has run out
    fn expire_if_finished(&mut self) {
        let expired = self.timer_mode == TimerMode::CountDown
            && self
                .active_player
                .is_some_and(|active| self.players[active].elapsed_seconds == 0);
        if expired {
            self.active_player = None;
            self.turn_started_at = None;
            self.banked_at = None;
        }
    }

    /// Clears turn and pause state and resets every clock for the mode
    fn restarted(mut self) -> Self {
        let initial = match self.timer_mode {
            TimerMode::CountUp => 0,
            TimerMode::CountDown => u64::from(self.countdown_seconds),
        };
        for player in &mut self.players {
            player.elapsed_seconds = initial;
        }
        self.active_player = None;
        self.turn_started_at = None;
        self.banked_at = None;
        self.paused_at = None;
        self
    }

    /// Stamps a new version on a finished successor
    fn commit(mut self) -> Self {
        self.version = self.version.next();
        debug_assert!(self.is_consistent());
        self
    }
}
