//! Notification-driven auto-booking
//!
//! Consumes availability notifications parsed out of the mailbox, matches
//! them against live subscriptions under fuzzy restaurant-name identity, and
//! re-enters the orchestrator through its auto-book entry point. Duplicate
//! notifications are absorbed by the status machine, not deduplicated here.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{
    Database, PlatformKind, RequestQueries, RequestStatus, SubscriptionModel, SubscriptionQueries,
};
use crate::orchestrator::Orchestrator;
use crate::{AgentError, AgentResult};

pub mod mailbox;

/// An availability alert delivered by the mailbox pipeline.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Platform the alert came from
    pub platform: PlatformKind,
    /// Restaurant name extracted from the email
    pub restaurant_name: String,
    /// Email subject, kept for the activity log
    pub subject: String,
    /// Mailbox message id
    pub email_id: String,
}

/// Matches notifications to subscriptions and triggers auto-booking.
pub struct NotificationRouter {
    db: Arc<Database>,
    orchestrator: Arc<Orchestrator>,
}

impl NotificationRouter {
    /// Create a new router
    pub fn new(db: Arc<Database>, orchestrator: Arc<Orchestrator>) -> Self {
        Self { db, orchestrator }
    }

    /// Process a batch of notifications. Failures on one notification never
    /// block the rest.
    pub async fn handle_notifications(&self, notifications: &[Notification]) {
        for notification in notifications {
            if notification.restaurant_name.is_empty() {
                continue;
            }
            if let Err(e) = self.handle(notification).await {
                warn!(
                    "Failed to process notification for {}: {}",
                    notification.restaurant_name, e
                );
            }
        }
    }

    async fn handle(&self, notification: &Notification) -> AgentResult<()> {
        let subscriptions = SubscriptionQueries::new(&self.db);
        let active = subscriptions
            .list_active_by_platform(notification.platform)
            .await?;

        let matched: Vec<SubscriptionModel> = active
            .into_iter()
            .filter(|sub| names_match(&notification.restaurant_name, &sub.restaurant_name))
            .collect();

        if matched.is_empty() {
            info!(
                "No matching subscription for notification: platform={} restaurant={}",
                notification.platform, notification.restaurant_name
            );
            return Ok(());
        }

        for sub in matched {
            if let Err(e) = self.process_match(&sub, notification).await {
                warn!(
                    "Failed to process matched subscription {} for request {}: {}",
                    sub.id, sub.request_id, e
                );
            }
        }
        Ok(())
    }

    /// Process one matched subscription: record `notify_received`, then
    /// attempt the auto-book outside any transaction.
    async fn process_match(
        &self,
        sub: &SubscriptionModel,
        notification: &Notification,
    ) -> AgentResult<()> {
        let requests = RequestQueries::new(&self.db);
        let transition = requests
            .transition(
                sub.request_id,
                RequestStatus::NotifyReceived,
                "notification_received",
                Some(sub.platform),
                Some(serde_json::json!({
                    "restaurant": notification.restaurant_name,
                    "subject": notification.subject,
                    "email_id": notification.email_id,
                })),
            )
            .await;
        match transition {
            Ok(_) => {}
            Err(AgentError::InvalidTransition { from, .. }) => {
                // booked, cancelled, or a duplicate of a notification we are
                // already acting on
                debug!(
                    "Skipping notification for request {}: status {}",
                    sub.request_id, from
                );
                return Ok(());
            }
            Err(AgentError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        info!(
            "Auto-booking triggered for request {} via {} notification",
            sub.request_id, sub.platform
        );
        let booked = self
            .orchestrator
            .auto_book(sub.request_id, sub.platform)
            .await?;
        if booked {
            info!("Auto-booking succeeded for request {}", sub.request_id);
        } else {
            warn!("Auto-booking failed for request {}", sub.request_id);
        }
        Ok(())
    }
}

/// Fuzzy restaurant-name identity: case-insensitive substring containment in
/// either direction, to survive the name variance between platforms and
/// notification emails.
pub(crate) fn names_match(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::db::{ActivityLogQueries, BookingQueries, NewRequest};
    use crate::platform::mock::ScriptedPlatform;
    use crate::platform::PlatformRegistry;
    use chrono::Utc;

    #[test]
    fn name_matching_is_fuzzy_both_directions() {
        assert!(names_match("carbone", "Carbone"));
        assert!(names_match("Carbone NYC", "Carbone"));
        assert!(names_match("Carbone", "Carbone NYC"));
        assert!(!names_match("Carbone", "Don Angie"));
        assert!(!names_match("", "Carbone"));
        assert!(!names_match("Carbone", ""));
    }

    struct Harness {
        db: Arc<Database>,
        router: NotificationRouter,
        platform: Arc<ScriptedPlatform>,
    }

    async fn harness(platform: ScriptedPlatform) -> Harness {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let platform = Arc::new(platform);
        let mut platforms = PlatformRegistry::new();
        platforms.register(platform.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            platforms,
            Arc::new(SystemClock),
        ));
        Harness {
            db: db.clone(),
            router: NotificationRouter::new(db, orchestrator),
            platform,
        }
    }

    /// Seed a request in `no_availability` with an active subscription, the
    /// state a notification normally finds.
    async fn seed_subscribed_request(db: &Database, restaurant: &str) -> i64 {
        let requests = RequestQueries::new(db);
        let id = requests
            .create(&NewRequest {
                restaurant_name: restaurant.to_string(),
                date: "2025-06-01".to_string(),
                time: "19:00".to_string(),
                party_size: 2,
                contact_email: "diner@example.com".to_string(),
                venue_id: Some("123".to_string()),
                booking_open_time: None,
                max_poll_duration_secs: None,
            })
            .await
            .unwrap();
        requests
            .transition(id, RequestStatus::Searching, "search_started", None, None)
            .await
            .unwrap();
        requests
            .transition(id, RequestStatus::NoAvailability, "no_availability", None, None)
            .await
            .unwrap();
        SubscriptionQueries::new(db)
            .insert_if_absent(&SubscriptionModel {
                id: 0,
                request_id: id,
                platform: PlatformKind::Resy,
                restaurant_name: restaurant.to_string(),
                venue_id: Some("123".to_string()),
                search_date: "2025-06-01".to_string(),
                search_time: "19:00".to_string(),
                search_party_size: 2,
                active: true,
                subscribed_at: Utc::now(),
            })
            .await
            .unwrap();
        id
    }

    fn notification(restaurant: &str) -> Notification {
        Notification {
            platform: PlatformKind::Resy,
            restaurant_name: restaurant.to_string(),
            subject: format!("A table at {restaurant} is now available"),
            email_id: "42".to_string(),
        }
    }

    #[tokio::test]
    async fn notification_drives_request_to_booked() {
        let h = harness(
            ScriptedPlatform::new(PlatformKind::Resy)
                .script([ScriptedPlatform::booked("R-abc", "19:30")]),
        )
        .await;
        let id = seed_subscribed_request(&h.db, "Carbone").await;

        // lowercase name from the email still matches the subscription
        h.router.handle_notifications(&[notification("carbone")]).await;

        let request = RequestQueries::new(&h.db).get_by_id(id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Booked);

        let subs = SubscriptionQueries::new(&h.db).list_for_request(id).await.unwrap();
        assert!(subs.iter().all(|s| !s.active));

        let actions: Vec<String> = ActivityLogQueries::new(&h.db)
            .list_for_request(id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.action)
            .collect();
        assert!(actions.contains(&"notification_received".to_string()));
        assert!(actions.contains(&"booking_confirmed".to_string()));
    }

    #[tokio::test]
    async fn duplicate_notification_is_absorbed() {
        let h = harness(
            ScriptedPlatform::new(PlatformKind::Resy)
                .script([ScriptedPlatform::booked("R-abc", "19:30")]),
        )
        .await;
        let id = seed_subscribed_request(&h.db, "Carbone").await;

        h.router.handle_notifications(&[notification("Carbone")]).await;
        h.router.handle_notifications(&[notification("Carbone")]).await;

        // still exactly one booking; subscriptions are inactive so the
        // second pass matched nothing
        let bookings = BookingQueries::new(&h.db).list_for_request(id).await.unwrap();
        assert_eq!(bookings.len(), 1);
        assert_eq!(h.platform.book_call_count(), 1);
    }

    #[tokio::test]
    async fn unmatched_notification_changes_nothing() {
        let h = harness(ScriptedPlatform::new(PlatformKind::Resy)).await;
        let id = seed_subscribed_request(&h.db, "Carbone").await;

        h.router.handle_notifications(&[notification("Don Angie")]).await;

        let request = RequestQueries::new(&h.db).get_by_id(id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::NoAvailability);
        assert_eq!(h.platform.book_call_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_request_is_skipped() {
        let h = harness(
            ScriptedPlatform::new(PlatformKind::Resy)
                .script([ScriptedPlatform::booked("R-abc", "19:30")]),
        )
        .await;
        let id = seed_subscribed_request(&h.db, "Carbone").await;

        // cancel leaves the subscription rows but deactivates them; put one
        // back to active to prove the status guard alone is enough
        let requests = RequestQueries::new(&h.db);
        requests
            .transition(id, RequestStatus::Pending, "retry_requested", None, None)
            .await
            .unwrap();
        requests
            .transition(id, RequestStatus::Cancelled, "cancelled", None, None)
            .await
            .unwrap();

        h.router.handle_notifications(&[notification("Carbone")]).await;

        let request = requests.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Cancelled);
        assert_eq!(h.platform.book_call_count(), 0);
    }

    #[tokio::test]
    async fn failed_auto_book_leaves_failed_status() {
        let h = harness(ScriptedPlatform::new(PlatformKind::Resy)).await;
        let id = seed_subscribed_request(&h.db, "Carbone").await;

        h.router.handle_notifications(&[notification("Carbone")]).await;

        let request = RequestQueries::new(&h.db).get_by_id(id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
    }
}
