//! A connected observer
//!
//! [`Client`] owns one [`Reconciler`] and feeds it from three sources: the
//! responses to its own mutations, the notification stream, and the backstop
//! poll. [`Client::run`] is the single scheduling loop: one tick recomputes
//! the frame from one clock read, one interval requests a poll, and fetches
//! are debounced and never overlap. Nothing in the loop holds the lock across
//! an await point, so mutations can be issued concurrently from other tasks.

use futures::future::{BoxFuture, OptionFuture};
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};
use web_time::SystemTime;

use super::{
    Remote,
    projection::Frame,
    reconcile::{FetchTicket, Reconciler, Source},
};
use crate::{
    channel::{Delivery, Subscription},
    clock::{Clock, SystemClock},
    config::ClientConfig,
    controller::UpdateError,
    state::{Command, GameState, TimerMode, Version},
    store::TransportError,
};

type Fetch<'a> = BoxFuture<'a, (InFlight<'a>, Result<GameState, TransportError>)>;

/// A started fetch
///
/// Dropping it before [`InFlight::finish`] abandons the fetch, so a cancelled
/// caller never leaves the client unable to fetch again.
struct InFlight<'a> {
    state: &'a Mutex<Reconciler>,
    ticket: Option<FetchTicket>,
}

impl InFlight<'_> {
    fn finish(mut self, result: Result<GameState, TransportError>, now: SystemTime) -> bool {
        match self.ticket.take() {
            Some(ticket) => self.state.lock().finish_fetch(ticket, result, now),
            None => false,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.state.lock().abandon_fetch(ticket);
        }
    }
}

/// One observer of a game
#[derive(Debug)]
pub struct Client<R, C = SystemClock> {
    remote: R,
    clock: C,
    config: ClientConfig,
    state: Mutex<Reconciler>,
}

impl<R: Remote, C: Clock> Client<R, C> {
    /// Creates a client that has not seen any state yet
    pub fn new(remote: R, clock: C, config: &ClientConfig) -> Self {
        Self {
            remote,
            clock,
            config: config.clone(),
            state: Mutex::new(Reconciler::new(config.debounce)),
        }
    }

    /// The display clocks as of now
    pub fn frame(&self) -> Frame {
        self.state.lock().frame(self.clock.now())
    }

    /// The newest snapshot this client has applied
    pub fn snapshot(&self) -> Option<GameState> {
        self.state.lock().projection().snapshot().cloned()
    }

    fn begin_fetch(&self) -> Option<InFlight<'_>> {
        let ticket = self.state.lock().begin_fetch()?;
        Some(InFlight {
            state: &self.state,
            ticket: Some(ticket),
        })
    }

    /// Asks the scheduling loop for a fetch within the debounce window
    pub fn request_refresh(&self) {
        self.state.lock().request_refresh(Instant::now());
    }

    /// Fetches the full state right away
    ///
    /// # Returns
    ///
    /// Whether a newer snapshot was applied; `false` as well when a fetch is
    /// already in flight
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the authoritative side is unreachable.
    pub async fn refresh(&self) -> Result<bool, TransportError> {
        let Some(in_flight) = self.begin_fetch() else {
            return Ok(false);
        };
        let result = self.remote.fetch().await;
        let failure = result.as_ref().err().cloned();
        let applied = in_flight.finish(result, self.clock.now());
        match failure {
            Some(error) => Err(error),
            None => Ok(applied),
        }
    }

    /// Submits `command` based on the newest known version
    ///
    /// A confirmed result is applied locally at once. A conflict applies the
    /// latest state it carries, so the caller can decide again without
    /// another round trip. Nothing is applied on any other failure.
    ///
    /// # Errors
    ///
    /// See [`UpdateError`].
    pub async fn submit(&self, command: Command) -> Result<GameState, UpdateError> {
        let expected = self.state.lock().known_version().unwrap_or(Version::INITIAL);
        let result = self.remote.submit(expected, command).await;
        let now = self.clock.now();
        match &result {
            Ok(state) => {
                self.state.lock().apply(state.clone(), Source::Local, now);
            }
            Err(error) => {
                debug!(%error, %expected, "update failed");
                if let Some(conflict) = error.conflict() {
                    self.state
                        .lock()
                        .apply(conflict.latest.clone(), Source::Fetch, now);
                }
            }
        }
        result
    }

    /// Hands the turn to `target`, or to the next seat
    ///
    /// # Errors
    ///
    /// See [`Client::submit`].
    pub async fn switch_turn(&self, target: Option<usize>) -> Result<GameState, UpdateError> {
        self.submit(Command::SwitchTurn { target }).await
    }

    /// Stops the clock
    ///
    /// # Errors
    ///
    /// See [`Client::submit`].
    pub async fn pause(&self) -> Result<GameState, UpdateError> {
        self.submit(Command::Pause).await
    }

    /// Restarts the clock
    ///
    /// # Errors
    ///
    /// See [`Client::submit`].
    pub async fn resume(&self) -> Result<GameState, UpdateError> {
        self.submit(Command::Resume).await
    }

    /// Returns the table to a fresh, stopped state
    ///
    /// # Errors
    ///
    /// See [`Client::submit`].
    pub async fn reset(&self) -> Result<GameState, UpdateError> {
        self.submit(Command::Reset).await
    }

    /// Changes the timer mode
    ///
    /// # Errors
    ///
    /// See [`Client::submit`].
    pub async fn set_timer_mode(
        &self,
        mode: TimerMode,
        countdown_seconds: Option<u32>,
    ) -> Result<GameState, UpdateError> {
        self.submit(Command::SetTimerMode {
            mode,
            countdown_seconds,
        })
        .await
    }

    /// Grows or shrinks the table
    ///
    /// # Errors
    ///
    /// See [`Client::submit`].
    pub async fn set_player_count(&self, count: usize) -> Result<GameState, UpdateError> {
        self.submit(Command::SetPlayerCount(count)).await
    }

    /// Reports a player's clock value
    ///
    /// # Errors
    ///
    /// See [`Client::submit`].
    pub async fn sync_timer(&self, player: usize, elapsed_seconds: i64) -> Result<GameState, UpdateError> {
        self.submit(Command::SyncTimer {
            player,
            elapsed_seconds,
        })
        .await
    }

    /// Gives a seat a new name
    ///
    /// # Errors
    ///
    /// See [`Client::submit`].
    pub async fn rename_player(&self, player: usize, name: impl Into<String>) -> Result<GameState, UpdateError> {
        self.submit(Command::RenamePlayer {
            player,
            name: name.into(),
        })
        .await
    }

    /// Reports the active player's projected clock to the authoritative side
    ///
    /// The clock is reported in whole seconds, rounded the way the
    /// authoritative side banks them: down when counting up, up when
    /// counting down. The pending fraction stays with the authoritative side.
    ///
    /// # Returns
    ///
    /// `None` without sending anything if no player is active
    ///
    /// # Errors
    ///
    /// See [`Client::submit`].
    pub async fn report_active_time(&self) -> Result<Option<GameState>, UpdateError> {
        let frame = self.frame();
        let Some(active) = frame.active_player else {
            return Ok(None);
        };
        let display = frame.display_time;
        let whole = match frame.timer_mode {
            TimerMode::CountUp => display.as_secs(),
            TimerMode::CountDown => display.as_secs() + u64::from(display.subsec_nanos() > 0),
        };
        let seconds = i64::try_from(whole).unwrap_or(i64::MAX);
        self.sync_timer(active, seconds).await.map(Some)
    }

    /// Drives the client until every receiver of `frames` is gone
    ///
    /// Publishes a new [`Frame`] whenever the projected clocks change, at
    /// the configured tick. Pushed snapshots are applied as they arrive; a
    /// lagging or closed notification stream falls back to the poll, which
    /// runs regardless. Failed fetches are skipped until the next poll.
    pub async fn run(&self, mut subscription: Option<Subscription>, frames: watch::Sender<Frame>) {
        let mut tick = time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll = time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fetch: Option<Fetch<'_>> = None;

        loop {
            let refresh_at = self.state.lock().next_fetch_at();
            tokio::select! {
                () = frames.closed() => break,
                _ = tick.tick() => {
                    let frame = self.frame();
                    frames.send_if_modified(|current| {
                        if *current == frame {
                            false
                        } else {
                            *current = frame;
                            true
                        }
                    });
                }
                _ = poll.tick() => self.request_refresh(),
                () = time::sleep_until(refresh_at.unwrap_or_else(Instant::now)),
                    if refresh_at.is_some() && fetch.is_none() =>
                {
                    if let Some(in_flight) = self.begin_fetch() {
                        fetch = Some(Box::pin(async move { (in_flight, self.remote.fetch().await) }));
                    }
                }
                Some((in_flight, result)) = OptionFuture::from(fetch.as_mut()), if fetch.is_some() => {
                    fetch = None;
                    if let Err(error) = &result {
                        warn!(%error, "poll failed");
                    }
                    in_flight.finish(result, self.clock.now());
                }
                Some(delivery) = OptionFuture::from(subscription.as_mut().map(|s| s.next())),
                    if subscription.is_some() =>
                {
                    match delivery {
                        Some(Delivery::Event(event)) => {
                            self.state
                                .lock()
                                .apply(event.into_snapshot(), Source::Push, self.clock.now());
                        }
                        Some(Delivery::Missed(missed)) => {
                            debug!(missed, "notifications missed, refreshing");
                            self.request_refresh();
                        }
                        None => {
                            warn!("notification stream closed, relying on polling");
                            subscription = None;
                        }
                    }
                }
            }
        }
        debug!("client stopped");
    }
}
