//! Change notification channel
//!
//! After every successful mutation the controller publishes an [`Event`]
//! carrying the complete new snapshot. Delivery is at-least-once and may be
//! reordered or lost; consumers stay correct because snapshots are
//! self-contained and ordered by version, and because every client also
//! polls the full state as a backstop.

use std::collections::HashMap;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{Event, constants, game_id::GameId, store::TransportError};

/// What a subscriber receives
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A change notification
    Event(Event),
    /// The subscriber fell behind and this many notifications were dropped
    Missed(u64),
}

/// A stream of notifications for one game
pub struct Subscription {
    deliveries: BoxStream<'static, Delivery>,
}

impl Subscription {
    /// Wraps any stream of deliveries
    pub fn new(deliveries: BoxStream<'static, Delivery>) -> Self {
        Self { deliveries }
    }

    /// Waits for the next delivery
    ///
    /// # Returns
    ///
    /// `None` once the channel is closed for good
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Publish/subscribe transport keyed by game instance
pub trait Notifier: Send + Sync {
    /// Sends `event` to every current subscriber of `game`
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the channel cannot be reached.
    fn publish(&self, game: GameId, event: &Event) -> Result<(), TransportError>;

    /// Starts receiving the notifications of `game`
    fn subscribe(&self, game: GameId) -> Subscription;
}

impl<N: Notifier + ?Sized> Notifier for std::sync::Arc<N> {
    fn publish(&self, game: GameId, event: &Event) -> Result<(), TransportError> {
        (**self).publish(game, event)
    }

    fn subscribe(&self, game: GameId) -> Subscription {
        (**self).subscribe(game)
    }
}

/// In-process notifier backed by one broadcast channel per game
///
/// A channel is created by the first subscription to its game and dropped
/// by the first publish that finds no subscriber left.
#[derive(Debug)]
pub struct BroadcastNotifier {
    capacity: usize,
    channels: Mutex<HashMap<GameId, broadcast::Sender<Event>>>,
}

impl BroadcastNotifier {
    /// Creates a notifier buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::default(),
        }
    }

    /// Ends every subscription of `game`
    ///
    /// Subscribers receive the notifications already buffered and then see
    /// the end of their stream.
    pub fn close(&self, game: GameId) {
        if self.channels.lock().remove(&game).is_some() {
            debug!(game = %game, "channel closed");
        }
    }

    /// Number of games with a live channel
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Number of live subscribers of `game`
    pub fn subscriber_count(&self, game: GameId) -> usize {
        self.channels
            .lock()
            .get(&game)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(constants::channel::CAPACITY)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, game: GameId, event: &Event) -> Result<(), TransportError> {
        let mut channels = self.channels.lock();
        let idle = channels
            .get(&game)
            .is_some_and(|sender| sender.receiver_count() == 0);
        let delivered = if idle {
            channels.remove(&game);
            0
        } else {
            channels
                .get(&game)
                .and_then(|sender| sender.send(event.clone()).ok())
                .unwrap_or_default()
        };
        drop(channels);
        debug!(game = %game, version = %event.snapshot().version(), delivered, "published");
        Ok(())
    }

    fn subscribe(&self, game: GameId) -> Subscription {
        let receiver = self
            .channels
            .lock()
            .entry(game)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        Subscription::new(
            stream::unfold(receiver, move |mut receiver| async move {
                match receiver.recv().await {
                    Ok(event) => Some((Delivery::Event(event), receiver)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(game = %game, missed, "subscriber lagged");
                        Some((Delivery::Missed(missed), receiver))
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            })
            .boxed(),
        )
    }
}
