//! Optimistic concurrency controller
//!
//! Every mutation of the authoritative record goes through
//! [`Controller::compare_and_swap`]:
//!
//! 1. read the current record;
//! 2. on the first attempt, refuse with [`UpdateError::VersionMismatch`] if
//!    the caller's version is stale, attaching the current record;
//! 3. compute the successor with the state machine and write it
//!    conditionally on the version just read;
//! 4. if another writer got there in between, start over from the fresh
//!    record, up to the configured number of attempts, after which the
//!    conflict is reported as [`UpdateError::PermanentConflict`].
//!
//! No lock is held across I/O: contention is resolved by retrying, never by
//! blocking. Successful writes are published to the notification channel;
//! a failed publish is logged and left to the clients' polling to heal.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use web_time::SystemTime;

use crate::{
    Event,
    channel::Notifier,
    client::Remote,
    clock::{Clock, SystemClock},
    config::{Config, GameRules},
    game_id::GameId,
    state::{self, Command, GameState, TimerMode, Version},
    store::{Store, TransportError, WriteError},
};

/// What the caller should do after a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    /// Re-read the state and decide again; never retry blindly
    Reload,
}

/// Details of a rejected update, with the state the caller should reconcile to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    /// Human readable explanation
    pub message: String,
    /// Recommended recovery
    pub action: RecoveryAction,
    /// The latest authoritative state known to the controller
    pub latest: GameState,
}

impl Conflict {
    fn new(message: String, latest: GameState) -> Box<Self> {
        Box::new(Self {
            message,
            action: RecoveryAction::Reload,
            latest,
        })
    }
}

/// Errors returned by mutating operations
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UpdateError {
    /// The command was rejected by the state machine; nothing was written
    #[error(transparent)]
    Rejected(#[from] state::Error),
    /// The caller's version was already stale when the update arrived
    #[error("{}", .0.message)]
    VersionMismatch(Box<Conflict>),
    /// Concurrent writers kept winning until the attempts ran out
    #[error("{}", .0.message)]
    PermanentConflict(Box<Conflict>),
    /// The store could not be reached; nothing was committed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl UpdateError {
    /// The conflict details, if this is a conflict
    pub fn conflict(&self) -> Option<&Conflict> {
        match self {
            Self::VersionMismatch(conflict) | Self::PermanentConflict(conflict) => Some(conflict),
            Self::Rejected(_) | Self::Transport(_) => None,
        }
    }
}

/// Guards the authoritative record of one game
#[derive(Debug)]
pub struct Controller<S, N, C = SystemClock> {
    game: GameId,
    store: S,
    notifier: N,
    clock: C,
    rules: GameRules,
    max_attempts: usize,
}

impl<S: Store, N: Notifier, C: Clock> Controller<S, N, C> {
    /// Creates a controller for `game`
    ///
    /// # Arguments
    ///
    /// * `game` - Identifier used to key notifications
    /// * `store` - Conditional-write access to the record
    /// * `notifier` - Channel the committed changes are published on
    /// * `clock` - Source of the `now` handed to the state machine
    /// * `config` - Game rules and the attempt bound
    pub fn new(game: GameId, store: S, notifier: N, clock: C, config: &Config) -> Self {
        Self {
            game,
            store,
            notifier,
            clock,
            rules: config.game.clone(),
            max_attempts: config.concurrency.max_attempts.max(1),
        }
    }

    /// Identifier of the guarded game
    pub fn game(&self) -> GameId {
        self.game
    }

    /// Rules the state machine is run with
    pub fn rules(&self) -> &GameRules {
        &self.rules
    }

    /// Reads the authoritative state, as used by the backstop poll
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the store cannot be reached.
    pub async fn get_state(&self) -> Result<GameState, TransportError> {
        self.store.read().await
    }

    /// Applies `command` if the record is still at `expected`
    ///
    /// # Errors
    ///
    /// See [`UpdateError`]. Validation errors are returned before the store
    /// is touched.
    pub async fn execute(&self, expected: Version, command: Command) -> Result<GameState, UpdateError> {
        command.validate(&self.rules)?;
        self.compare_and_swap(expected, |current, now| {
            let next = current.apply(&command, now, &self.rules)?;
            Ok(Event::new(&command, current, next))
        })
        .await
    }

    /// Hands the turn to `target`, or to the next seat
    ///
    /// # Errors
    ///
    /// See [`Controller::execute`].
    pub async fn switch_turn(&self, expected: Version, target: Option<usize>) -> Result<GameState, UpdateError> {
        self.execute(expected, Command::SwitchTurn { target }).await
    }

    /// Stops the clock
    ///
    /// # Errors
    ///
    /// See [`Controller::execute`].
    pub async fn pause(&self, expected: Version) -> Result<GameState, UpdateError> {
        self.execute(expected, Command::Pause).await
    }

    /// Restarts the clock
    ///
    /// # Errors
    ///
    /// See [`Controller::execute`].
    pub async fn resume(&self, expected: Version) -> Result<GameState, UpdateError> {
        self.execute(expected, Command::Resume).await
    }

    /// Returns the table to a fresh, stopped state
    ///
    /// # Errors
    ///
    /// See [`Controller::execute`].
    pub async fn reset(&self, expected: Version) -> Result<GameState, UpdateError> {
        self.execute(expected, Command::Reset).await
    }

    /// Changes the timer mode
    ///
    /// # Errors
    ///
    /// See [`Controller::execute`].
    pub async fn set_timer_mode(
        &self,
        expected: Version,
        mode: TimerMode,
        countdown_seconds: Option<u32>,
    ) -> Result<GameState, UpdateError> {
        self.execute(
            expected,
            Command::SetTimerMode {
                mode,
                countdown_seconds,
            },
        )
        .await
    }

    /// Grows or shrinks the table
    ///
    /// # Errors
    ///
    /// See [`Controller::execute`].
    pub async fn set_player_count(&self, expected: Version, count: usize) -> Result<GameState, UpdateError> {
        self.execute(expected, Command::SetPlayerCount(count)).await
    }

    /// Records a player's clock as observed by a client
    ///
    /// # Errors
    ///
    /// See [`Controller::execute`].
    pub async fn sync_timer(
        &self,
        expected: Version,
        player: usize,
        elapsed_seconds: i64,
    ) -> Result<GameState, UpdateError> {
        self.execute(
            expected,
            Command::SyncTimer {
                player,
                elapsed_seconds,
            },
        )
        .await
    }

    /// Advances the active clock from the authoritative timestamps
    ///
    /// # Errors
    ///
    /// See [`Controller::execute`].
    pub async fn tick(&self, expected: Version) -> Result<GameState, UpdateError> {
        self.execute(expected, Command::Tick).await
    }

    /// Gives a seat a new name
    ///
    /// # Errors
    ///
    /// See [`Controller::execute`].
    pub async fn rename_player(
        &self,
        expected: Version,
        player: usize,
        name: impl Into<String>,
    ) -> Result<GameState, UpdateError> {
        self.execute(
            expected,
            Command::RenamePlayer {
                player,
                name: name.into(),
            },
        )
        .await
    }

    /// Runs `transition` under the bounded compare-and-swap protocol
    ///
    /// The transition receives the record as read and the current time and
    /// returns the event describing the successor. It may run once per
    /// attempt, each time against a fresher record.
    ///
    /// # Errors
    ///
    /// See [`UpdateError`].
    pub async fn compare_and_swap<F>(&self, expected: Version, transition: F) -> Result<GameState, UpdateError>
    where
        F: Fn(&GameState, SystemTime) -> Result<Event, state::Error> + Send + Sync,
    {
        for attempt in 1..=self.max_attempts {
            let current = self.store.read().await?;
            if attempt == 1 && current.version() != expected {
                debug!(game = %self.game, %expected, current = %current.version(), "stale update refused");
                return Err(UpdateError::VersionMismatch(Conflict::new(
                    format!(
                        "version {expected} is stale, the game is at version {}",
                        current.version()
                    ),
                    current,
                )));
            }

            let event = transition(&current, self.clock.now())?;
            match self
                .store
                .conditional_write(event.snapshot().clone(), current.version())
                .await
            {
                Ok(version) => {
                    debug!(game = %self.game, %version, attempt, "committed");
                    if let Event::TimedOut(_) = &event {
                        info!(game = %self.game, %version, "turn timed out");
                    }
                    if let Err(error) = self.notifier.publish(self.game, &event) {
                        warn!(game = %self.game, %version, %error, "publish failed");
                    }
                    return Ok(event.into_snapshot());
                }
                Err(WriteError::VersionConflict { expected, found }) => {
                    warn!(game = %self.game, %expected, %found, attempt, "write lost a race, retrying");
                }
                Err(WriteError::Transport(error)) => return Err(error.into()),
            }
        }

        let latest = self.store.read().await?;
        info!(game = %self.game, attempts = self.max_attempts, latest = %latest.version(), "giving up after conflicts");
        Err(UpdateError::PermanentConflict(Conflict::new(
            format!(
                "update failed after {} retries due to conflicts",
                self.max_attempts
            ),
            latest,
        )))
    }
}

#[async_trait]
impl<S: Store, N: Notifier, C: Clock> Remote for Controller<S, N, C> {
    async fn fetch(&self) -> Result<GameState, TransportError> {
        self.get_state().await
    }

    async fn submit(&self, expected: Version, command: Command) -> Result<GameState, UpdateError> {
        self.execute(expected, command).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;
    use crate::{
        channel::{BroadcastNotifier, Delivery},
        clock::ManualClock,
        store::MemoryStore,
    };

    type TestController<S> = Controller<S, Arc<BroadcastNotifier>, ManualClock>;

    fn clock() -> ManualClock {
        ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000))
    }

    fn controller<S: Store>(store: S) -> TestController<S> {
        Controller::new(
            GameId::new(),
            store,
            Arc::new(BroadcastNotifier::default()),
            clock(),
            &Config::default(),
        )
    }

    fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(GameState::new(&GameRules::default())))
    }

    /// Lets another writer commit between every read and write
    struct RacingStore {
        inner: MemoryStore,
        writes: AtomicUsize,
    }

    impl RacingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(GameState::new(&GameRules::default())),
                writes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Store for RacingStore {
        async fn read(&self) -> Result<GameState, TransportError> {
            self.inner.read().await
        }

        async fn conditional_write(&self, state: GameState, expected: Version) -> Result<Version, WriteError> {
            let rival = self.inner.snapshot();
            self.inner
                .conditional_write(rival.tick(SystemTime::UNIX_EPOCH), rival.version())
                .await?;
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.conditional_write(state, expected).await
        }
    }

    /// Fails every call
    struct DownStore;

    #[async_trait]
    impl Store for DownStore {
        async fn read(&self) -> Result<GameState, TransportError> {
            Err(TransportError("connection refused".to_owned()))
        }

        async fn conditional_write(&self, _: GameState, _: Version) -> Result<Version, WriteError> {
            Err(TransportError("connection refused".to_owned()).into())
        }
    }

    /// Records whether anything was published and always fails
    #[derive(Default)]
    struct DownNotifier {
        attempted: AtomicBool,
    }

    impl Notifier for DownNotifier {
        fn publish(&self, _: GameId, _: &Event) -> Result<(), TransportError> {
            self.attempted.store(true, Ordering::SeqCst);
            Err(TransportError("broker unreachable".to_owned()))
        }

        fn subscribe(&self, _: GameId) -> crate::channel::Subscription {
            crate::channel::Subscription::new(Box::pin(futures::stream::empty::<Delivery>()))
        }
    }

    #[tokio::test]
    async fn test_execute_commits_and_bumps_version() {
        let store = memory_store();
        let controller = controller(store.clone());

        let state = controller.switch_turn(Version::INITIAL, None).await.unwrap();

        assert_eq!(state.active_player(), Some(0));
        assert_eq!(state.version(), Version::from(1));
        assert_eq!(store.snapshot(), state);
    }

    #[tokio::test]
    async fn test_operations_chain_on_returned_versions() {
        let controller = controller(memory_store());

        let state = controller.switch_turn(Version::INITIAL, None).await.unwrap();
        controller.clock.advance(Duration::from_secs(4));
        let state = controller.pause(state.version()).await.unwrap();
        controller.clock.advance(Duration::from_secs(60));
        let state = controller.resume(state.version()).await.unwrap();
        controller.clock.advance(Duration::from_secs(2));
        let state = controller.switch_turn(state.version(), None).await.unwrap();

        assert_eq!(state.players()[0].elapsed_seconds(), 6);
        assert_eq!(state.active_player(), Some(1));

        let state = controller.rename_player(state.version(), 1, "Bea").await.unwrap();
        let state = controller
            .set_timer_mode(state.version(), TimerMode::CountDown, Some(30))
            .await
            .unwrap();
        let state = controller.set_player_count(state.version(), 5).await.unwrap();
        let state = controller.switch_turn(state.version(), Some(4)).await.unwrap();
        controller.clock.advance(Duration::from_secs(10));
        let state = controller.tick(state.version()).await.unwrap();
        assert_eq!(state.players()[4].elapsed_seconds(), 20);
        let state = controller.sync_timer(state.version(), 4, 0).await.unwrap();
        assert_eq!(state.active_player(), None);
        let state = controller.reset(state.version()).await.unwrap();
        assert!(state.is_paused());
        assert_eq!(state.players()[1].name(), "Bea");
    }

    #[tokio::test]
    async fn test_stale_version_is_refused_with_latest_state() {
        let store = memory_store();
        let writer_a = controller(store.clone());
        let writer_b = controller(store.clone());

        let observed = writer_a.get_state().await.unwrap().version();
        let committed = writer_a.switch_turn(observed, None).await.unwrap();

        let error = writer_b.pause(observed).await.unwrap_err();
        let UpdateError::VersionMismatch(conflict) = error else {
            panic!("expected a version mismatch, got {error:?}");
        };
        assert_eq!(conflict.latest, committed);
        assert_eq!(conflict.action, RecoveryAction::Reload);
        assert_eq!(store.snapshot(), committed);
    }

    #[tokio::test]
    async fn test_retries_exhausted_surface_permanent_conflict() {
        let store = Arc::new(RacingStore::new());
        let controller = controller(store.clone());

        let error = controller.switch_turn(Version::INITIAL, None).await.unwrap_err();

        let UpdateError::PermanentConflict(conflict) = &error else {
            panic!("expected a permanent conflict, got {error:?}");
        };
        assert_eq!(store.writes.load(Ordering::SeqCst), 3);
        assert_eq!(
            conflict.message,
            "update failed after 3 retries due to conflicts"
        );
        // the latest state, not the version the caller started from
        assert_eq!(conflict.latest.version(), Version::from(3));
        assert_eq!(conflict.latest, store.inner.snapshot());
        assert_eq!(error.to_string(), conflict.message);
    }

    #[tokio::test]
    async fn test_retry_rebases_on_fresh_record() {
        /// Loses exactly the first race
        struct OnceRacingStore {
            inner: MemoryStore,
            raced: AtomicBool,
        }

        #[async_trait]
        impl Store for OnceRacingStore {
            async fn read(&self) -> Result<GameState, TransportError> {
                self.inner.read().await
            }

            async fn conditional_write(&self, state: GameState, expected: Version) -> Result<Version, WriteError> {
                if !self.raced.swap(true, Ordering::SeqCst) {
                    let rival = self.inner.snapshot();
                    let renamed = rival.rename_player(3, "Dee", &GameRules::default()).unwrap();
                    self.inner.conditional_write(renamed, rival.version()).await?;
                }
                self.inner.conditional_write(state, expected).await
            }
        }

        let store = Arc::new(OnceRacingStore {
            inner: MemoryStore::new(GameState::new(&GameRules::default())),
            raced: AtomicBool::new(false),
        });
        let controller = controller(store.clone());

        let state = controller.switch_turn(Version::INITIAL, None).await.unwrap();

        assert_eq!(state.version(), Version::from(2));
        assert_eq!(state.active_player(), Some(0));
        assert_eq!(state.players()[3].name(), "Dee");
    }

    #[tokio::test]
    async fn test_validation_rejected_before_store() {
        let controller = controller(DownStore);
        let error = controller
            .set_player_count(Version::INITIAL, 9)
            .await
            .unwrap_err();
        assert!(matches!(error, UpdateError::Rejected(state::Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_invalid_player_is_rejected_without_write() {
        let store = memory_store();
        let controller = controller(store.clone());

        let error = controller
            .switch_turn(Version::INITIAL, Some(11))
            .await
            .unwrap_err();

        assert_eq!(error, UpdateError::Rejected(state::Error::InvalidPlayerId(11)));
        assert_eq!(store.snapshot().version(), Version::INITIAL);
        assert!(error.conflict().is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_fails_closed() {
        let controller = controller(DownStore);
        let error = controller.pause(Version::INITIAL).await.unwrap_err();
        assert!(matches!(error, UpdateError::Transport(_)));
        assert!(controller.get_state().await.is_err());
    }

    #[tokio::test]
    async fn test_commit_is_published() {
        let store = memory_store();
        let notifier = Arc::new(BroadcastNotifier::default());
        let game = GameId::new();
        let controller = Controller::new(game, store, notifier.clone(), clock(), &Config::default());
        let mut subscription = notifier.subscribe(game);

        let state = controller.switch_turn(Version::INITIAL, None).await.unwrap();

        let Some(Delivery::Event(Event::TurnSwitched(published))) = subscription.next().await else {
            panic!("expected a turn switch");
        };
        assert_eq!(published, state);
    }

    #[tokio::test]
    async fn test_failed_publish_still_commits() {
        let store = memory_store();
        let notifier = Arc::new(DownNotifier::default());
        let controller = Controller::new(
            GameId::new(),
            store.clone(),
            notifier.clone(),
            clock(),
            &Config::default(),
        );

        let state = controller.pause(Version::INITIAL).await.unwrap();

        assert!(notifier.attempted.load(Ordering::SeqCst));
        assert_eq!(store.snapshot(), state);
    }

    /// Gives other tasks a chance to run between every read and write
    struct YieldingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl Store for YieldingStore {
        async fn read(&self) -> Result<GameState, TransportError> {
            self.inner.read().await
        }

        async fn conditional_write(&self, state: GameState, expected: Version) -> Result<Version, WriteError> {
            tokio::task::yield_now().await;
            self.inner.conditional_write(state, expected).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let store = Arc::new(YieldingStore {
            inner: MemoryStore::new(GameState::new(&GameRules::default())),
        });
        let controller = Arc::new(controller(store.clone()));

        let tasks = (0..8)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    let current = controller.get_state().await.unwrap();
                    controller.tick(current.version()).await
                })
            })
            .collect::<Vec<_>>();

        let mut committed = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => committed += 1,
                Err(UpdateError::VersionMismatch(_) | UpdateError::PermanentConflict(_)) => conflicts += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert!(committed >= 1);
        assert!(conflicts >= 1, "writers never raced");
        assert_eq!(committed + conflicts, 8);
        assert_eq!(store.inner.snapshot().version(), Version::from(committed));
    }
}
