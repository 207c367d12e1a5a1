//! Database queries
//!
//! One query struct per table, in the style of short-lived transactional
//! sessions: a status transition is a read, a table check, a mutation and a
//! log append inside a single transaction. Illegal transitions fail without
//! mutating.

use super::{
    ActivityLogModel, BookingModel, Database, NewRequest, PlatformKind, RequestModel,
    RequestStatus, SubscriptionModel,
};
use crate::{AgentError, AgentResult};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

const REQUEST_COLUMNS: &str = "id, restaurant_name, date, time, party_size, contact_email, \
     status, venue_id, booking_open_time, poll_attempts, max_poll_duration_secs, platform, \
     created_at, updated_at";

fn map_request(row: &Row<'_>) -> rusqlite::Result<RequestModel> {
    let status: String = row.get(6)?;
    let platform: Option<String> = row.get(11)?;
    Ok(RequestModel {
        id: row.get(0)?,
        restaurant_name: row.get(1)?,
        date: row.get(2)?,
        time: row.get(3)?,
        party_size: row.get(4)?,
        contact_email: row.get(5)?,
        status: RequestStatus::parse(&status).unwrap_or(RequestStatus::Failed),
        venue_id: row.get(7)?,
        booking_open_time: row.get(8)?,
        poll_attempts: row.get(9)?,
        max_poll_duration_secs: row.get(10)?,
        platform: platform.as_deref().and_then(PlatformKind::parse),
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn map_subscription(row: &Row<'_>) -> rusqlite::Result<SubscriptionModel> {
    let platform: String = row.get(2)?;
    Ok(SubscriptionModel {
        id: row.get(0)?,
        request_id: row.get(1)?,
        platform: PlatformKind::parse(&platform).unwrap_or(PlatformKind::Resy),
        restaurant_name: row.get(3)?,
        venue_id: row.get(4)?,
        search_date: row.get(5)?,
        search_time: row.get(6)?,
        search_party_size: row.get(7)?,
        active: row.get::<_, i64>(8)? != 0,
        subscribed_at: row.get(9)?,
    })
}

fn map_booking(row: &Row<'_>) -> rusqlite::Result<BookingModel> {
    let platform: String = row.get(2)?;
    Ok(BookingModel {
        id: row.get(0)?,
        request_id: row.get(1)?,
        platform: PlatformKind::parse(&platform).unwrap_or(PlatformKind::Resy),
        confirmation_id: row.get(3)?,
        restaurant_name: row.get(4)?,
        date: row.get(5)?,
        time: row.get(6)?,
        party_size: row.get(7)?,
        status: row.get(8)?,
        raw_response: row.get(9)?,
    })
}

fn map_log(row: &Row<'_>) -> rusqlite::Result<ActivityLogModel> {
    let platform: Option<String> = row.get(4)?;
    Ok(ActivityLogModel {
        id: row.get(0)?,
        request_id: row.get(1)?,
        timestamp: row.get(2)?,
        action: row.get(3)?,
        platform: platform.as_deref().and_then(PlatformKind::parse),
        details: row.get(5)?,
    })
}

/// Reservation request queries
pub struct RequestQueries<'a> {
    db: &'a Database,
}

impl<'a> RequestQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new request in `pending` state and return its id.
    pub async fn create(&self, new: &NewRequest) -> AgentResult<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO reservation_requests
                (restaurant_name, date, time, party_size, contact_email, status, venue_id,
                 booking_open_time, max_poll_duration_secs, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?9)
            "#,
            params![
                new.restaurant_name,
                new.date,
                new.time,
                new.party_size,
                new.contact_email,
                new.venue_id.as_deref().unwrap_or(""),
                new.booking_open_time.map(|t| t.to_rfc3339()),
                new.max_poll_duration_secs.unwrap_or(300),
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(
            "DB: Created request {}: restaurant={}, date={}, time={}, party_size={}",
            id, new.restaurant_name, new.date, new.time, new.party_size
        );
        Ok(id)
    }

    /// Get a request by ID
    pub async fn get_by_id(&self, id: i64) -> AgentResult<Option<RequestModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM reservation_requests WHERE id = ?1");
        let result = conn
            .query_row(&sql, [id], map_request)
            .optional()?;
        Ok(result)
    }

    /// List requests, newest first, optionally filtered by status.
    pub async fn list(&self, status: Option<RequestStatus>) -> AgentResult<Vec<RequestModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut requests = Vec::new();
        match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {REQUEST_COLUMNS} FROM reservation_requests WHERE status = ?1 \
                     ORDER BY created_at DESC, id DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([status.as_str()], map_request)?;
                for row in rows {
                    requests.push(row?);
                }
            }
            None => {
                let sql = format!(
                    "SELECT {REQUEST_COLUMNS} FROM reservation_requests \
                     ORDER BY created_at DESC, id DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], map_request)?;
                for row in rows {
                    requests.push(row?);
                }
            }
        }
        Ok(requests)
    }

    /// List requests in any of the given statuses, oldest first (the
    /// supervisor resumes in creation order).
    pub async fn list_by_statuses(
        &self,
        statuses: &[RequestStatus],
    ) -> AgentResult<Vec<RequestModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let placeholders = statuses
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM reservation_requests \
             WHERE status IN ({placeholders}) ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let values: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(values), map_request)?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    /// Perform a guarded status transition with its log append in one
    /// transaction. Returns the pre-transition status.
    pub async fn transition(
        &self,
        id: i64,
        to: RequestStatus,
        action: &str,
        platform: Option<PlatformKind>,
        details: Option<serde_json::Value>,
    ) -> AgentResult<RequestStatus> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM reservation_requests WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| AgentError::NotFound(format!("request {id}")))?;
        let from = RequestStatus::parse(&current)
            .ok_or_else(|| AgentError::Database(format!("unknown status '{current}'")))?;

        if !from.can_transition(to) {
            return Err(AgentError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE reservation_requests SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![to.as_str(), now, id],
        )?;
        tx.execute(
            "INSERT INTO activity_log (request_id, timestamp, action, platform, details) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                now,
                action,
                platform.map(|p| p.as_str()),
                details.map(|d| d.to_string()),
            ],
        )?;
        tx.commit()?;

        debug!("DB: Request {} status {} -> {} ({})", id, from, to, action);
        Ok(from)
    }

    /// Commit a successful booking: transition to `booked`, set the winning
    /// platform, insert the confirmed Booking row and the log entry, all in
    /// one transaction. Refuses (without mutating) when a booking already
    /// won — the caller logs `duplicate_booking_detected`.
    #[allow(clippy::too_many_arguments)]
    pub async fn confirm_booking(
        &self,
        id: i64,
        platform: PlatformKind,
        confirmation_id: Option<&str>,
        booked_time: Option<&str>,
        raw_response: Option<&str>,
        action: &str,
        details: Option<serde_json::Value>,
    ) -> AgentResult<()> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;

        let row: Option<(String, String, String, String, u32)> = tx
            .query_row(
                "SELECT status, restaurant_name, date, time, party_size \
                 FROM reservation_requests WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        let (current, restaurant_name, date, time, party_size) =
            row.ok_or_else(|| AgentError::NotFound(format!("request {id}")))?;
        let from = RequestStatus::parse(&current)
            .ok_or_else(|| AgentError::Database(format!("unknown status '{current}'")))?;

        if !from.can_transition(RequestStatus::Booked) {
            return Err(AgentError::InvalidTransition {
                from: from.as_str().to_string(),
                to: RequestStatus::Booked.as_str().to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE reservation_requests SET status = 'booked', platform = ?1, updated_at = ?2 \
             WHERE id = ?3",
            params![platform.as_str(), now, id],
        )?;
        tx.execute(
            r#"
            INSERT INTO bookings
                (request_id, platform, confirmation_id, restaurant_name, date, time,
                 party_size, status, raw_response)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'confirmed', ?8)
            "#,
            params![
                id,
                platform.as_str(),
                confirmation_id,
                restaurant_name,
                date,
                booked_time.unwrap_or(&time),
                party_size,
                raw_response,
            ],
        )?;
        tx.execute(
            "INSERT INTO activity_log (request_id, timestamp, action, platform, details) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                now,
                action,
                platform.as_str(),
                details.map(|d| d.to_string()),
            ],
        )?;
        tx.commit()?;

        info!(
            "DB: Request {} booked on {}: confirmation={:?}, time={}",
            id,
            platform,
            confirmation_id,
            booked_time.unwrap_or(&time)
        );
        Ok(())
    }

    /// Record the resolved venue. Write-once: a non-empty venue_id is never
    /// overwritten.
    pub async fn set_venue_id(&self, id: i64, venue_id: &str) -> AgentResult<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE reservation_requests SET venue_id = ?1, updated_at = ?2 \
             WHERE id = ?3 AND venue_id = ''",
            params![venue_id, Utc::now().to_rfc3339(), id],
        )?;
        if updated > 0 {
            debug!("DB: Request {} venue_id set to {}", id, venue_id);
        }
        Ok(())
    }

    /// Bump the sniper poll counter. Single-column update, own transaction.
    pub async fn increment_poll_attempts(&self, id: i64) -> AgentResult<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE reservation_requests SET poll_attempts = poll_attempts + 1, updated_at = ?1 \
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Total number of requests
    pub async fn count(&self) -> AgentResult<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let count = conn.query_row("SELECT COUNT(*) FROM reservation_requests", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Number of requests currently in any of the given statuses
    pub async fn count_in_statuses(&self, statuses: &[RequestStatus]) -> AgentResult<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let placeholders = statuses
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM reservation_requests WHERE status IN ({placeholders})"
        );
        let values: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let count = conn.query_row(&sql, rusqlite::params_from_iter(values), |row| row.get(0))?;
        Ok(count)
    }
}

/// Notify subscription queries
pub struct SubscriptionQueries<'a> {
    db: &'a Database,
}

impl<'a> SubscriptionQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert an active subscription unless one already exists for this
    /// (request, platform). Returns whether a row was inserted.
    pub async fn insert_if_absent(&self, sub: &SubscriptionModel) -> AgentResult<bool> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM notification_subscriptions \
             WHERE request_id = ?1 AND platform = ?2 AND active = 1",
            params![sub.request_id, sub.platform.as_str()],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Ok(false);
        }

        tx.execute(
            r#"
            INSERT INTO notification_subscriptions
                (request_id, platform, restaurant_name, venue_id, search_date, search_time,
                 search_party_size, active, subscribed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)
            "#,
            params![
                sub.request_id,
                sub.platform.as_str(),
                sub.restaurant_name,
                sub.venue_id,
                sub.search_date,
                sub.search_time,
                sub.search_party_size,
                sub.subscribed_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        info!(
            "DB: Subscription created for request {} on {}",
            sub.request_id, sub.platform
        );
        Ok(true)
    }

    /// All active subscriptions on a platform (notification matching input).
    pub async fn list_active_by_platform(
        &self,
        platform: PlatformKind,
    ) -> AgentResult<Vec<SubscriptionModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, request_id, platform, restaurant_name, venue_id, search_date, \
                    search_time, search_party_size, active, subscribed_at \
             FROM notification_subscriptions WHERE active = 1 AND platform = ?1",
        )?;
        let rows = stmt.query_map([platform.as_str()], map_subscription)?;
        let mut subs = Vec::new();
        for row in rows {
            subs.push(row?);
        }
        Ok(subs)
    }

    /// All subscriptions belonging to a request.
    pub async fn list_for_request(&self, request_id: i64) -> AgentResult<Vec<SubscriptionModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, request_id, platform, restaurant_name, venue_id, search_date, \
                    search_time, search_party_size, active, subscribed_at \
             FROM notification_subscriptions WHERE request_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([request_id], map_subscription)?;
        let mut subs = Vec::new();
        for row in rows {
            subs.push(row?);
        }
        Ok(subs)
    }

    /// Deactivate every subscription for a request in one statement.
    pub async fn deactivate_for_request(&self, request_id: i64) -> AgentResult<usize> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE notification_subscriptions SET active = 0 WHERE request_id = ?1 AND active = 1",
            [request_id],
        )?;
        if updated > 0 {
            info!(
                "DB: Deactivated {} subscription(s) for request {}",
                updated, request_id
            );
        }
        Ok(updated)
    }
}

/// Booking queries
pub struct BookingQueries<'a> {
    db: &'a Database,
}

impl<'a> BookingQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// All bookings, newest first
    pub async fn list(&self) -> AgentResult<Vec<BookingModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, request_id, platform, confirmation_id, restaurant_name, date, time, \
                    party_size, status, raw_response \
             FROM bookings ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], map_booking)?;
        let mut bookings = Vec::new();
        for row in rows {
            bookings.push(row?);
        }
        Ok(bookings)
    }

    /// Bookings belonging to a request
    pub async fn list_for_request(&self, request_id: i64) -> AgentResult<Vec<BookingModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, request_id, platform, confirmation_id, restaurant_name, date, time, \
                    party_size, status, raw_response \
             FROM bookings WHERE request_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([request_id], map_booking)?;
        let mut bookings = Vec::new();
        for row in rows {
            bookings.push(row?);
        }
        Ok(bookings)
    }

    /// Total number of bookings
    pub async fn count(&self) -> AgentResult<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let count = conn.query_row("SELECT COUNT(*) FROM bookings", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Activity log queries
pub struct ActivityLogQueries<'a> {
    db: &'a Database,
}

impl<'a> ActivityLogQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append an entry. The log is never mutated after insert.
    pub async fn append(
        &self,
        request_id: Option<i64>,
        action: &str,
        platform: Option<PlatformKind>,
        details: Option<serde_json::Value>,
    ) -> AgentResult<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO activity_log (request_id, timestamp, action, platform, details) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request_id,
                Utc::now().to_rfc3339(),
                action,
                platform.map(|p| p.as_str()),
                details.map(|d| d.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Recent entries, newest first, optionally scoped to one request.
    pub async fn list(
        &self,
        request_id: Option<i64>,
        limit: u32,
    ) -> AgentResult<Vec<ActivityLogModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut entries = Vec::new();
        match request_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, request_id, timestamp, action, platform, details \
                     FROM activity_log WHERE request_id = ?1 \
                     ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![id, limit], map_log)?;
                for row in rows {
                    entries.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, request_id, timestamp, action, platform, details \
                     FROM activity_log ORDER BY timestamp DESC, id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit], map_log)?;
                for row in rows {
                    entries.push(row?);
                }
            }
        }
        Ok(entries)
    }

    /// All entries for a request in insertion order.
    pub async fn list_for_request(&self, request_id: i64) -> AgentResult<Vec<ActivityLogModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, request_id, timestamp, action, platform, details \
             FROM activity_log WHERE request_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([request_id], map_log)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}
