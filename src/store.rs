//! Persistence of the authoritative record
//!
//! The [`Store`] trait is the only thing the controller knows about storage:
//! read the record, and replace it if and only if it still carries the
//! version the writer based its change on. Any key-value store with
//! conditional writes (ETags, optimistic locks) can implement it.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::state::{GameState, Version};

/// The backing store or channel could not be reached
#[derive(Error, Serialize, Debug, Clone, PartialEq, Eq)]
#[error("transport unavailable: {0}")]
pub struct TransportError(pub String);

/// Reasons a conditional write did not happen
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Another writer replaced the record first
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict {
        /// Version the writer based its change on
        expected: Version,
        /// Version actually stored
        found: Version,
    },
    /// The store could not be reached
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Conditional-write access to a single authoritative record
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads the current record and, with it, its version
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the store cannot be reached.
    async fn read(&self) -> Result<GameState, TransportError>;

    /// Replaces the record if it is still at `expected`
    ///
    /// # Returns
    ///
    /// The version of the record now stored
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::VersionConflict`] if the stored version differs
    /// from `expected`, in which case nothing is written.
    async fn conditional_write(&self, state: GameState, expected: Version) -> Result<Version, WriteError>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn read(&self) -> Result<GameState, TransportError> {
        (**self).read().await
    }

    async fn conditional_write(&self, state: GameState, expected: Version) -> Result<Version, WriteError> {
        (**self).conditional_write(state, expected).await
    }
}

/// In-process store holding one record
///
/// The compare and the replace happen under one short lock that is never
/// held across an await point.
#[derive(Debug)]
pub struct MemoryStore {
    record: Mutex<GameState>,
}

impl MemoryStore {
    /// Creates a store holding `initial`
    pub fn new(initial: GameState) -> Self {
        Self {
            record: Mutex::new(initial),
        }
    }

    /// Copy of the stored record without going through the async interface
    pub fn snapshot(&self) -> GameState {
        self.record.lock().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self) -> Result<GameState, TransportError> {
        Ok(self.snapshot())
    }

    async fn conditional_write(&self, state: GameState, expected: Version) -> Result<Version, WriteError> {
        let mut record = self.record.lock();
        if record.version() != expected {
            return Err(WriteError::VersionConflict {
                expected,
                found: record.version(),
            });
        }
        let version = state.version();
        *record = state;
        Ok(version)
    }
}
