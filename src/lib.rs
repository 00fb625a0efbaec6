//! # Turnkeeper
//!
//! This library provides the state-synchronization core of a shared turn
//! timer for tabletop games: several participants watch the same timer while
//! exactly one player's clock runs at a time.
//!
//! The authoritative side keeps a single [`state::GameState`] record and
//! mutates it only through the compare-and-swap loop of
//! [`controller::Controller`]. Every committed change is broadcast as an
//! [`Event`] through [`channel`], and every observer in [`client`] both
//! consumes those events and polls the full state as a backstop, projecting
//! a smoothly ticking display clock between synchronization points.

#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]
use serde::{Deserialize, Serialize};

pub mod constants;

pub mod channel;
pub mod client;
pub mod clock;
pub mod config;
pub mod controller;
pub mod game_id;
pub mod names;
pub mod state;
pub mod store;

use game_id::GameId;
use state::{Command, GameState};

/// Notifications published after every committed mutation
///
/// Each variant names what happened and carries the complete snapshot that
/// resulted, never a diff, so applying the same event twice is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// The turn moved to another player, or the game started
    TurnSwitched(GameState),
    /// The clock was stopped
    Paused(GameState),
    /// The clock was restarted
    Resumed(GameState),
    /// The table was reset
    Reset(GameState),
    /// The timer mode changed
    TimerModeChanged(GameState),
    /// Players were added or removed
    PlayerCountChanged(GameState),
    /// A player's clock was synchronized
    TimerSynced(GameState),
    /// The active player's countdown ran out
    TimedOut(GameState),
    /// A player was renamed
    PlayerRenamed(GameState),
}

impl Event {
    /// Describes the transition from `previous` to `next` caused by `command`
    pub fn new(command: &Command, previous: &GameState, next: GameState) -> Self {
        match command {
            Command::SwitchTurn { .. } => Self::TurnSwitched(next),
            Command::Pause => Self::Paused(next),
            Command::Resume => Self::Resumed(next),
            Command::Reset => Self::Reset(next),
            Command::SetTimerMode { .. } => Self::TimerModeChanged(next),
            Command::SetPlayerCount(_) => Self::PlayerCountChanged(next),
            Command::SyncTimer { .. } | Command::Tick
                if previous.active_player().is_some() && next.active_player().is_none() =>
            {
                Self::TimedOut(next)
            }
            Command::SyncTimer { .. } | Command::Tick => Self::TimerSynced(next),
            Command::RenamePlayer { .. } => Self::PlayerRenamed(next),
        }
    }

    /// The snapshot carried by the event
    pub fn snapshot(&self) -> &GameState {
        match self {
            Self::TurnSwitched(state)
            | Self::Paused(state)
            | Self::Resumed(state)
            | Self::Reset(state)
            | Self::TimerModeChanged(state)
            | Self::PlayerCountChanged(state)
            | Self::TimerSynced(state)
            | Self::TimedOut(state)
            | Self::PlayerRenamed(state) => state,
        }
    }

    /// Consumes the event, returning its snapshot
    pub fn into_snapshot(self) -> GameState {
        match self {
            Self::TurnSwitched(state)
            | Self::Paused(state)
            | Self::Resumed(state)
            | Self::Reset(state)
            | Self::TimerModeChanged(state)
            | Self::PlayerCountChanged(state)
            | Self::TimerSynced(state)
            | Self::TimedOut(state)
            | Self::PlayerRenamed(state) => state,
        }
    }

    /// Converts the event to a JSON message addressed to `game`
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self, game: GameId) -> String {
        serde_json::to_string(&Envelope { game, event: self })
            .expect("default serializer cannot fail")
    }

    /// Reads a message produced by [`Event::to_message`]
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if the text is not such a message,
    /// including when its game identifier is malformed.
    pub fn from_message(message: &str) -> Result<(GameId, Self), serde_json::Error> {
        let Envelope { game, event } = serde_json::from_str(message)?;
        Ok((game, event))
    }
}

/// Wire form of an event: the game it belongs to and the event itself
#[derive(Serialize, Deserialize)]
struct Envelope<E> {
    game: GameId,
    event: E,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use web_time::SystemTime;

    use super::*;
    use crate::{config::GameRules, state::TimerMode};

    fn at(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn test_event_names_the_transition() {
        let rules = GameRules::default();
        let state = GameState::new(&rules);
        let started = state.switch_turn(None, at(0)).unwrap();

        let event = Event::new(&Command::SwitchTurn { target: None }, &state, started.clone());
        assert!(matches!(event, Event::TurnSwitched(_)));
        assert_eq!(event.snapshot(), &started);
    }

    #[test]
    fn test_event_detects_timeout() {
        let rules = GameRules::default();
        let started = GameState::new(&rules)
            .set_timer_mode(TimerMode::CountDown, Some(1), &rules)
            .unwrap()
            .switch_turn(None, at(0))
            .unwrap();

        let timed_out = started.tick(at(1));
        assert!(matches!(
            Event::new(&Command::Tick, &started, timed_out.clone()),
            Event::TimedOut(_)
        ));

        let idle = timed_out.tick(at(2));
        assert!(matches!(
            Event::new(&Command::Tick, &timed_out, idle),
            Event::TimerSynced(_)
        ));
    }

    #[test]
    fn test_event_message_is_addressed() {
        let game: GameId = "12345".parse().unwrap();
        let state = GameState::new(&GameRules::default()).reset(at(3));
        let message = Event::Reset(state.clone()).to_message(game);

        let json: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(json["game"], "12345");
        assert_eq!(json["event"]["Reset"]["paused_at"], 3_000);
        assert_eq!(json["event"]["Reset"]["players"][0]["name"], "Player 1");

        let (addressed, decoded) = Event::from_message(&message).unwrap();
        assert_eq!(addressed, game);
        assert_eq!(decoded.into_snapshot(), state);
    }

    #[test]
    fn test_event_message_rejects_bad_address() {
        let state = GameState::new(&GameRules::default());
        let message = Event::Reset(state)
            .to_message("12345".parse().unwrap())
            .replace("12345", "99");
        assert!(Event::from_message(&message).is_err());
    }
}
