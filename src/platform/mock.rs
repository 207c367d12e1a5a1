//! Scripted platform adapter for tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use super::{BookResult, Platform, PlatformKind};
use crate::AgentResult;

/// A platform whose responses are queued up front. Once the script is
/// exhausted, `try_book` keeps answering `NoAvailability`.
pub struct ScriptedPlatform {
    kind: PlatformKind,
    venue: Option<String>,
    results: Mutex<VecDeque<BookResult>>,
    subscribe_ok: bool,
    book_delay: Option<std::time::Duration>,
    book_calls: AtomicU32,
    subscribe_calls: AtomicU32,
}

impl ScriptedPlatform {
    /// A platform that resolves venue "123" and has nothing bookable.
    pub fn new(kind: PlatformKind) -> Self {
        Self {
            kind,
            venue: Some("123".to_string()),
            results: Mutex::new(VecDeque::new()),
            subscribe_ok: true,
            book_delay: None,
            book_calls: AtomicU32::new(0),
            subscribe_calls: AtomicU32::new(0),
        }
    }

    /// Override the venue lookup result.
    pub fn with_venue(mut self, venue: Option<&str>) -> Self {
        self.venue = venue.map(str::to_string);
        self
    }

    /// Control whether notify subscriptions are accepted.
    pub fn with_subscribe_ok(mut self, ok: bool) -> Self {
        self.subscribe_ok = ok;
        self
    }

    /// Make each `try_book` call stall, so tests can race other signals
    /// against an in-flight platform call.
    pub fn with_book_delay(mut self, delay: std::time::Duration) -> Self {
        self.book_delay = Some(delay);
        self
    }

    /// Queue the next `try_book` responses in order.
    pub fn script(self, results: impl IntoIterator<Item = BookResult>) -> Self {
        self.results.lock().unwrap().extend(results);
        self
    }

    /// Shorthand for a successful booking result.
    pub fn booked(confirmation: &str, time: &str) -> BookResult {
        BookResult::Booked {
            confirmation_id: Some(confirmation.to_string()),
            booked_time: Some(time.to_string()),
            raw: Some("{}".to_string()),
        }
    }

    /// How many times `try_book` was called.
    pub fn book_call_count(&self) -> u32 {
        self.book_calls.load(Ordering::SeqCst)
    }

    /// How many times `subscribe_notify` was called.
    pub fn subscribe_call_count(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for ScriptedPlatform {
    fn kind(&self) -> PlatformKind {
        self.kind
    }

    async fn resolve_venue(&self, _restaurant_name: &str) -> AgentResult<Option<String>> {
        Ok(self.venue.clone())
    }

    async fn try_book(
        &self,
        _venue_id: &str,
        _date: &str,
        _time_preferred: &str,
        _party_size: u32,
    ) -> AgentResult<BookResult> {
        self.book_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.book_delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.results.lock().unwrap().pop_front();
        Ok(next.unwrap_or(BookResult::NoAvailability))
    }

    async fn subscribe_notify(
        &self,
        _venue_id: &str,
        _date: &str,
        _time_preferred: &str,
        _party_size: u32,
    ) -> AgentResult<bool> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.subscribe_ok)
    }
}
