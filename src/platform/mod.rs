//! Booking platform capability
//!
//! The orchestrator speaks to every reservation platform through this
//! capability: resolve a venue, attempt a booking, subscribe to availability
//! alerts. Adapters live behind it; the orchestrator never sees platform
//! wire formats.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::AgentResult;

pub use crate::db::PlatformKind;

mod resy;

pub use resy::{ResyCredentials, ResyPlatform, VenueHit};

#[cfg(test)]
pub mod mock;

/// Outcome of a single booking attempt.
///
/// `try_book` is at-most-once per call: an adapter must not silently
/// double-book. An ambiguous transport failure (connection dropped after the
/// request was sent) is reported as `TransportError` and treated upstream as
/// a potential success needing operator reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookResult {
    /// The platform confirmed a reservation.
    Booked {
        /// Platform confirmation token
        confirmation_id: Option<String>,
        /// Actual booked time, HH:MM; may differ from the preferred time
        booked_time: Option<String>,
        /// Raw platform response for audit
        raw: Option<String>,
    },
    /// No bookable slot for the requested criteria.
    NoAvailability,
    /// Platform credentials are stale; the adapter refreshes out-of-band.
    AuthExpired,
    /// Network failure with ambiguous outcome.
    TransportError(String),
}

/// A reservation platform adapter.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Which platform this adapter speaks to.
    fn kind(&self) -> PlatformKind;

    /// Look up the platform venue id for a restaurant name. Pure lookup,
    /// no side effect.
    async fn resolve_venue(&self, restaurant_name: &str) -> AgentResult<Option<String>>;

    /// Attempt to book the slot closest to `time_preferred` (absolute minute
    /// difference, ties toward the earlier slot).
    async fn try_book(
        &self,
        venue_id: &str,
        date: &str,
        time_preferred: &str,
        party_size: u32,
    ) -> AgentResult<BookResult>;

    /// Stand up a platform-side availability alert for the criteria.
    async fn subscribe_notify(
        &self,
        venue_id: &str,
        date: &str,
        time_preferred: &str,
        party_size: u32,
    ) -> AgentResult<bool>;
}

/// Registry of available platform adapters, keyed by kind.
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    platforms: HashMap<PlatformKind, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one of the same kind.
    pub fn register(&mut self, platform: Arc<dyn Platform>) {
        self.platforms.insert(platform.kind(), platform);
    }

    /// Get the adapter for a platform, if one is registered.
    pub fn get(&self, kind: PlatformKind) -> Option<Arc<dyn Platform>> {
        self.platforms.get(&kind).cloned()
    }
}
