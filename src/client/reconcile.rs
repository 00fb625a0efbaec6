//! Reconciliation bookkeeping of one client
//!
//! Snapshots reach a client three ways: pushed by the notification channel,
//! fetched by the backstop poll, and returned by the client's own mutations.
//! [`Reconciler`] merges all three into one [`Projection`] and decides when
//! a fetch should happen. It performs no I/O and reads no clock, so every
//! decision it makes can be tested step by step.
//!
//! Refresh requests from the poll and from lost pushes are debounced: the
//! first request opens a window and later requests inside it are absorbed.
//! At most one fetch is in flight at a time.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use web_time::SystemTime;

use super::projection::{Frame, Projection};
use crate::{
    state::{GameState, Version},
    store::TransportError,
};

/// Where a snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Source {
    /// The notification channel
    Push,
    /// A fetch of the full state
    Fetch,
    /// The response to this client's own mutation
    Local,
}

/// Proof that a fetch was started, handed back when it completes
#[derive(Debug, PartialEq, Eq)]
pub struct FetchTicket(u64);

/// Merges snapshots and schedules fetches for one client
#[derive(Debug)]
pub struct Reconciler {
    projection: Projection,
    debounce: Duration,
    refresh_at: Option<Instant>,
    in_flight: Option<u64>,
    issued: u64,
}

impl Reconciler {
    /// Creates a reconciler that merges refresh requests within `debounce`
    pub fn new(debounce: Duration) -> Self {
        Self {
            projection: Projection::default(),
            debounce,
            refresh_at: None,
            in_flight: None,
            issued: 0,
        }
    }

    /// The merged projection
    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Version of the newest snapshot applied
    pub fn known_version(&self) -> Option<Version> {
        self.projection.version()
    }

    /// Asks for a fetch of the full state
    ///
    /// A pending request keeps its deadline, so a burst of requests results
    /// in a single fetch at most `debounce` after the first one.
    pub fn request_refresh(&mut self, now: Instant) {
        if self.refresh_at.is_none() {
            self.refresh_at = Some(now + self.debounce);
        }
    }

    /// Deadline of the pending refresh request
    pub fn refresh_at(&self) -> Option<Instant> {
        self.refresh_at
    }

    /// When the next fetch should start
    ///
    /// `None` while nothing is pending, and while a fetch is in flight even
    /// if a request is pending: that request waits for the fetch to end.
    pub fn next_fetch_at(&self) -> Option<Instant> {
        self.refresh_at.filter(|_| self.in_flight.is_none())
    }

    /// Whether a fetch should be started at `now`
    pub fn refresh_due(&self, now: Instant) -> bool {
        self.in_flight.is_none() && self.refresh_at.is_some_and(|deadline| deadline <= now)
    }

    /// Whether a fetch has been started and not finished
    pub fn fetch_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Starts a fetch, consuming the pending request
    ///
    /// # Returns
    ///
    /// `None` while another fetch is in flight; the request then stays
    /// pending until that fetch finishes
    pub fn begin_fetch(&mut self) -> Option<FetchTicket> {
        if self.in_flight.is_some() {
            return None;
        }
        self.issued += 1;
        self.in_flight = Some(self.issued);
        self.refresh_at = None;
        Some(FetchTicket(self.issued))
    }

    /// Completes a fetch
    ///
    /// A failed fetch is dropped silently; the next poll tries again. A
    /// successful one is applied like any other snapshot, so a response that
    /// was overtaken by a newer push or mutation is discarded.
    ///
    /// # Returns
    ///
    /// Whether a snapshot was applied
    pub fn finish_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<GameState, TransportError>,
        now: SystemTime,
    ) -> bool {
        if self.in_flight == Some(ticket.0) {
            self.in_flight = None;
        }
        match result {
            Ok(snapshot) => self.apply(snapshot, Source::Fetch, now),
            Err(error) => {
                debug!(%error, "fetch failed, waiting for the next poll");
                false
            }
        }
    }

    /// Gives up on a fetch whose response will never be delivered
    pub fn abandon_fetch(&mut self, ticket: FetchTicket) {
        if self.in_flight == Some(ticket.0) {
            debug!(ticket = ticket.0, "fetch abandoned");
            self.in_flight = None;
        }
    }

    /// Applies a snapshot unless a newer one is already known
    ///
    /// # Returns
    ///
    /// Whether the snapshot was applied
    pub fn apply(&mut self, snapshot: GameState, source: Source, now: SystemTime) -> bool {
        let version = snapshot.version();
        let applied = self.projection.apply(snapshot, now);
        if applied {
            debug!(%source, %version, "snapshot applied");
        } else {
            debug!(%source, %version, known = ?self.known_version(), "stale snapshot discarded");
        }
        applied
    }

    /// Projects the display clocks to `now`
    pub fn frame(&self, now: SystemTime) -> Frame {
        self.projection.frame(now)
    }
}
