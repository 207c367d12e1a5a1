//! Database models and the request status machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Booking platform a request can be acquired on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Resy (JSON HTTP API)
    Resy,
    /// OpenTable
    OpenTable,
}

impl PlatformKind {
    /// Stable string tag used in the database and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Resy => "resy",
            PlatformKind::OpenTable => "opentable",
        }
    }

    /// Parse the database/log tag back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resy" => Some(PlatformKind::Resy),
            "opentable" => Some(PlatformKind::OpenTable),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a reservation request.
///
/// `booked`, `cancelled`, `failed` and `no_availability` are terminal.
/// The only sanctioned exits from a terminal state are the explicit retry
/// command (back to `pending`) and an availability notification
/// (`no_availability`/`failed` → `notify_received`); `booked` admits no
/// transition at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Created, not yet picked up by the orchestrator
    Pending,
    /// Acquisition attempt in progress
    Searching,
    /// Sniper armed, sleeping until booking open time
    Waiting,
    /// Sniper rapid-poll loop running
    Polling,
    /// An availability notification matched this request
    NotifyReceived,
    /// A confirmed booking exists
    Booked,
    /// No slots and no future booking open time
    NoAvailability,
    /// Acquisition gave up (sniper timeout or orchestration error)
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl RequestStatus {
    /// Stable string encoding used in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Searching => "searching",
            RequestStatus::Waiting => "waiting",
            RequestStatus::Polling => "polling",
            RequestStatus::NotifyReceived => "notify_received",
            RequestStatus::Booked => "booked",
            RequestStatus::NoAvailability => "no_availability",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a `status` column value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "searching" => Some(RequestStatus::Searching),
            "waiting" => Some(RequestStatus::Waiting),
            "polling" => Some(RequestStatus::Polling),
            "notify_received" => Some(RequestStatus::NotifyReceived),
            "booked" => Some(RequestStatus::Booked),
            "no_availability" => Some(RequestStatus::NoAvailability),
            "failed" => Some(RequestStatus::Failed),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this status ends the acquisition lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Booked
                | RequestStatus::Cancelled
                | RequestStatus::Failed
                | RequestStatus::NoAvailability
        )
    }

    /// Statuses the supervisor re-dispatches on startup.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RequestStatus::Searching
                | RequestStatus::Waiting
                | RequestStatus::Polling
                | RequestStatus::NotifyReceived
        )
    }

    /// The guarded transition table. Every status change goes through this;
    /// anything not listed is an `InvalidTransition`.
    pub fn can_transition(&self, to: RequestStatus) -> bool {
        use RequestStatus::*;

        // Retry: any non-booked state may be forced back to pending.
        if to == Pending {
            return *self != Booked;
        }

        match (*self, to) {
            (Pending, Searching) | (Pending, Cancelled) => true,
            (Searching, Booked)
            | (Searching, NoAvailability)
            | (Searching, Waiting)
            | (Searching, Polling)
            | (Searching, NotifyReceived)
            | (Searching, Failed)
            | (Searching, Cancelled) => true,
            (Waiting, Polling)
            | (Waiting, NotifyReceived)
            | (Waiting, Failed)
            | (Waiting, Cancelled) => true,
            (Polling, Booked)
            | (Polling, NotifyReceived)
            | (Polling, Failed)
            | (Polling, Cancelled) => true,
            (NotifyReceived, Booked)
            | (NotifyReceived, Failed)
            | (NotifyReceived, Cancelled) => true,
            (NoAvailability, NotifyReceived) => true,
            (Failed, NotifyReceived) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reservation request database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestModel {
    /// Request ID (store-assigned rowid)
    pub id: i64,
    /// User-facing restaurant name
    pub restaurant_name: String,
    /// Requested date, YYYY-MM-DD (venue-local)
    pub date: String,
    /// Preferred time, HH:MM (venue-local)
    pub time: String,
    /// Party size
    pub party_size: u32,
    /// Contact email for the reservation
    pub contact_email: String,
    /// Lifecycle status
    pub status: RequestStatus,
    /// Platform-side venue identifier; empty until first resolved, then write-once
    pub venue_id: String,
    /// Instant the venue releases inventory, if known
    pub booking_open_time: Option<DateTime<Utc>>,
    /// Sniper poll counter
    pub poll_attempts: u32,
    /// Sniper poll budget in seconds
    pub max_poll_duration_secs: u32,
    /// Platform that produced the booking; set atomically with `booked`
    pub platform: Option<PlatformKind>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the boundary when creating a request.
#[derive(Debug, Clone)]
pub struct NewRequest {
    /// Restaurant name as the user typed it
    pub restaurant_name: String,
    /// Requested date, YYYY-MM-DD
    pub date: String,
    /// Preferred time, HH:MM
    pub time: String,
    /// Party size
    pub party_size: u32,
    /// Contact email
    pub contact_email: String,
    /// Known venue ID, if the user picked one from search
    pub venue_id: Option<String>,
    /// Known inventory release instant
    pub booking_open_time: Option<DateTime<Utc>>,
    /// Sniper poll budget override, seconds
    pub max_poll_duration_secs: Option<u32>,
}

/// Notify subscription database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionModel {
    /// Subscription ID
    pub id: i64,
    /// Parent request ID
    pub request_id: i64,
    /// Platform the subscription lives on
    pub platform: PlatformKind,
    /// Restaurant name used for notification matching
    pub restaurant_name: String,
    /// Platform venue ID, if resolved at subscription time
    pub venue_id: Option<String>,
    /// Date criterion, YYYY-MM-DD
    pub search_date: String,
    /// Time criterion, HH:MM
    pub search_time: String,
    /// Party size criterion
    pub search_party_size: u32,
    /// Whether the subscription still matches notifications
    pub active: bool,
    /// Subscription time
    pub subscribed_at: DateTime<Utc>,
}

/// Booking database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingModel {
    /// Booking ID
    pub id: i64,
    /// Parent request ID
    pub request_id: i64,
    /// Platform the booking was made on
    pub platform: PlatformKind,
    /// Platform confirmation token
    pub confirmation_id: Option<String>,
    /// Restaurant name
    pub restaurant_name: String,
    /// Booked date, YYYY-MM-DD
    pub date: String,
    /// Actual booked time, HH:MM (may differ from the requested time)
    pub time: String,
    /// Party size
    pub party_size: u32,
    /// "confirmed" or "cancelled"
    pub status: String,
    /// Raw platform response for audit
    pub raw_response: Option<String>,
}

/// Activity log database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogModel {
    /// Log entry ID
    pub id: i64,
    /// Request the entry belongs to, if any
    pub request_id: Option<i64>,
    /// Entry time
    pub timestamp: DateTime<Utc>,
    /// Short action tag
    pub action: String,
    /// Platform the action concerns, if any
    pub platform: Option<PlatformKind>,
    /// JSON details blob
    pub details: Option<String>,
}
