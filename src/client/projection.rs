//! Display clock projection
//!
//! Between synchronization points a client extrapolates the active player's
//! clock locally. The projection keeps the newest authoritative snapshot, the
//! active player's clock value at the moment the snapshot was applied, and
//! that moment. Every frame is then derived from a single `now`:
//!
//! * the player clock adds (or, counting down, subtracts) the time since the
//!   snapshot was applied, frozen while paused or idle;
//! * the turn clock is computed straight from the snapshot's turn start.
//!
//! Because the base value is itself derived from the snapshot's
//! synchronization point, applying the same snapshot again at any later
//! instant produces exactly the same frames.

use std::time::Duration;

use serde::Serialize;
use web_time::SystemTime;

use crate::{
    clock,
    state::{GameState, Phase, TimerMode, Version},
};

/// Everything a client renders for one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Frame {
    /// Version of the snapshot the frame was projected from
    pub version: Version,
    /// Seat whose turn it is
    pub active_player: Option<usize>,
    /// The active player's clock, or the last projected value when idle
    pub display_time: Duration,
    /// Time spent in the current turn
    pub turn_time: Duration,
    /// Clock of every seat, the active one projected
    pub player_times: Vec<Duration>,
    /// Whether the clock is stopped
    pub paused: bool,
    /// Direction of the clocks
    pub timer_mode: TimerMode,
}

impl Frame {
    /// Whole seconds of [`Frame::display_time`]
    pub fn display_seconds(&self) -> u64 {
        self.display_time.as_secs()
    }

    /// Whole seconds of [`Frame::turn_time`]
    pub fn turn_seconds(&self) -> u64 {
        self.turn_time.as_secs()
    }
}

/// Client-side projection of the authoritative state
#[derive(Debug, Clone, Default)]
pub struct Projection {
    snapshot: Option<GameState>,
    server_time: Duration,
    last_sync: Option<SystemTime>,
}

impl Projection {
    /// The newest snapshot applied so far
    pub fn snapshot(&self) -> Option<&GameState> {
        self.snapshot.as_ref()
    }

    /// Version of the newest snapshot applied so far
    pub fn version(&self) -> Option<Version> {
        self.snapshot.as_ref().map(GameState::version)
    }

    /// Re-bases the projection on `snapshot` at `now`
    ///
    /// Snapshots older than the current one are discarded, whatever order
    /// they arrive in. An equal or newer snapshot always wins, even if its
    /// clock value is smaller than what is currently displayed. Without an
    /// active player the base value stays frozen.
    ///
    /// # Returns
    ///
    /// Whether the snapshot was applied
    pub fn apply(&mut self, snapshot: GameState, now: SystemTime) -> bool {
        if self
            .snapshot
            .as_ref()
            .is_some_and(|current| snapshot.version() < current.version())
        {
            return false;
        }
        if let Some(time) = snapshot
            .active_player()
            .and_then(|active| snapshot.live_player_time(active, now))
        {
            self.server_time = time;
        }
        self.last_sync = Some(now);
        self.snapshot = Some(snapshot);
        true
    }

    /// Projects the display clocks to `now`
    ///
    /// Both clocks are derived from the same instant so they always change
    /// together.
    pub fn frame(&self, now: SystemTime) -> Frame {
        let Some(snapshot) = &self.snapshot else {
            return Frame::default();
        };
        let delta = match (snapshot.phase(), self.last_sync) {
            (Phase::Running, Some(last_sync)) => clock::elapsed(now, last_sync),
            _ => Duration::ZERO,
        };
        let display_time = match snapshot.timer_mode() {
            TimerMode::CountUp => self.server_time + delta,
            TimerMode::CountDown => self.server_time.saturating_sub(delta),
        };
        let player_times = (0..snapshot.players().len())
            .map(|index| {
                if snapshot.active_player() == Some(index) {
                    display_time
                } else {
                    Duration::from_secs(snapshot.players()[index].elapsed_seconds())
                }
            })
            .collect();

        Frame {
            version: snapshot.version(),
            active_player: snapshot.active_player(),
            display_time,
            turn_time: snapshot.current_turn_time(now),
            player_times,
            paused: snapshot.is_paused(),
            timer_mode: snapshot.timer_mode(),
        }
    }
}
