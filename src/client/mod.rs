//! Observer side of the turn timer
//!
//! A client keeps a smoothly ticking local view of the authoritative state.
//! [`projection`] holds the display arithmetic, [`reconcile`] decides which
//! snapshots to apply and when to fetch, and [`session`] drives both from
//! one tick, one poll and the notification stream.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    controller::UpdateError,
    state::{Command, GameState, Version},
    store::TransportError,
};

pub mod projection;
pub mod reconcile;
pub mod session;

pub use projection::{Frame, Projection};
pub use reconcile::Reconciler;
pub use session::Client;

/// The operations a client can invoke on the authoritative side
#[async_trait]
pub trait Remote: Send + Sync {
    /// Fetches the full authoritative state
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the authoritative side is unreachable.
    async fn fetch(&self) -> Result<GameState, TransportError>;

    /// Applies `command` if the state is still at `expected`
    ///
    /// # Errors
    ///
    /// See [`UpdateError`].
    async fn submit(&self, expected: Version, command: Command) -> Result<GameState, UpdateError>;
}

#[async_trait]
impl<R: Remote + ?Sized> Remote for Arc<R> {
    async fn fetch(&self) -> Result<GameState, TransportError> {
        (**self).fetch().await
    }

    async fn submit(&self, expected: Version, command: Command) -> Result<GameState, UpdateError> {
        (**self).submit(expected, command).await
    }
}
