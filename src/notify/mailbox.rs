//! Mailbox notification parsing and polling
//!
//! Turns raw notification emails into [`Notification`] events: identify the
//! platform from the sender, gate on availability keywords so marketing mail
//! is dropped, then extract the restaurant name from the subject or the
//! start of the body. The mail transport itself sits behind [`MailSource`];
//! the monitor polls whatever source it is given.

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Notification, NotificationRouter};
use crate::db::PlatformKind;
use crate::AgentResult;

/// Sender addresses that mark a Resy notification.
const RESY_SENDERS: [&str; 2] = ["notify@resy.com", "no-reply@resy.com"];

/// Sender addresses that mark an OpenTable notification.
const OPENTABLE_SENDERS: [&str; 2] = ["notifications@opentable.com", "no-reply@opentable.com"];

/// An email is only a notification if one of these appears in the subject
/// or body.
const NOTIFY_KEYWORDS: [&str; 8] = [
    "table available",
    "reservation available",
    "opening",
    "notify",
    "spot just opened",
    "now available",
    "a table is available",
    "good news",
];

/// How much of the body participates in name extraction.
const BODY_SCAN_CHARS: usize = 500;

// Restaurant name extraction, tried in order against the subject and then
// the body head. Resy subjects read "Good news! A table at X is now
// available"; OpenTable's read "X - A table is now available".
static NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"table at (.+?)(?:\s+is|\s+has|\s+—|\s*-|\.|!)").unwrap(),
        Regex::new(r"(.+?)\s*[-—]\s*[Aa] table").unwrap(),
        Regex::new(r"at (.+?) (?:on|for)").unwrap(),
        Regex::new(r"news.*?(?:at|from)\s+(.+?)(?:\s+is|\.|!)").unwrap(),
    ]
});

/// A raw email as fetched from the mailbox.
#[derive(Debug, Clone)]
pub struct RawEmail {
    /// Mailbox message id
    pub id: String,
    /// From header
    pub from: String,
    /// Subject header
    pub subject: String,
    /// Plain-text body
    pub body: String,
}

/// Source of unread notification emails. Implementations own the mail
/// transport and credentials; fetching marks messages as read.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Fetch and consume unread emails from the notification senders.
    async fn fetch_unread(&self) -> AgentResult<Vec<RawEmail>>;
}

/// Identify the platform from a From header.
pub fn identify_platform(from_addr: &str) -> Option<PlatformKind> {
    let from_lower = from_addr.to_lowercase();
    if RESY_SENDERS.iter().any(|s| from_lower.contains(s)) {
        return Some(PlatformKind::Resy);
    }
    if OPENTABLE_SENDERS.iter().any(|s| from_lower.contains(s)) {
        return Some(PlatformKind::OpenTable);
    }
    None
}

/// Parse a raw email into a notification. `None` when the sender is not a
/// notification sender, the keywords gate it out, or no restaurant name can
/// be extracted.
pub fn parse_notification(email: &RawEmail) -> Option<Notification> {
    let platform = identify_platform(&email.from)?;

    let subject_lower = email.subject.to_lowercase();
    let body_lower = email.body.to_lowercase();
    let is_notify = NOTIFY_KEYWORDS
        .iter()
        .any(|kw| subject_lower.contains(kw) || body_lower.contains(kw));
    if !is_notify {
        return None;
    }

    let restaurant_name = extract_restaurant_name(&email.subject).or_else(|| {
        let head: String = email.body.chars().take(BODY_SCAN_CHARS).collect();
        extract_restaurant_name(&head)
    })?;

    Some(Notification {
        platform,
        restaurant_name,
        subject: email.subject.clone(),
        email_id: email.id.clone(),
    })
}

fn extract_restaurant_name(text: &str) -> Option<String> {
    for pattern in NAME_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            let name = captures.get(1)?.as_str().trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Polls a [`MailSource`] and feeds parsed notifications to the router.
pub struct MailboxMonitor {
    source: Arc<dyn MailSource>,
    router: Arc<NotificationRouter>,
    poll_interval: Duration,
}

impl MailboxMonitor {
    /// Create a new monitor
    pub fn new(
        source: Arc<dyn MailSource>,
        router: Arc<NotificationRouter>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            router,
            poll_interval,
        }
    }

    /// Poll until the token fires. Fetch errors are logged and the loop
    /// keeps going.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Mailbox monitor started, polling every {:?}",
            self.poll_interval
        );
        loop {
            match self.source.fetch_unread().await {
                Ok(emails) => {
                    let notifications: Vec<Notification> =
                        emails.iter().filter_map(parse_notification).collect();
                    if !notifications.is_empty() {
                        info!(
                            "Mailbox poll produced {} notification(s)",
                            notifications.len()
                        );
                        self.router.handle_notifications(&notifications).await;
                    } else {
                        debug!("Mailbox poll produced no notifications");
                    }
                }
                Err(e) => {
                    warn!("Error checking mailbox: {}", e);
                }
            }

            tokio::select! {
                _ = token.cancelled() => {
                    info!("Mailbox monitor stopped");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::db::{
        Database, NewRequest, PlatformKind, RequestQueries, RequestStatus, SubscriptionModel,
        SubscriptionQueries,
    };
    use crate::orchestrator::Orchestrator;
    use crate::platform::mock::ScriptedPlatform;
    use crate::platform::PlatformRegistry;
    use chrono::Utc;
    use std::sync::Mutex;

    fn email(from: &str, subject: &str, body: &str) -> RawEmail {
        RawEmail {
            id: "msg-1".to_string(),
            from: from.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn identifies_platform_from_sender() {
        assert_eq!(
            identify_platform("Resy <notify@resy.com>"),
            Some(PlatformKind::Resy)
        );
        assert_eq!(
            identify_platform("OpenTable <NOTIFICATIONS@OPENTABLE.COM>"),
            Some(PlatformKind::OpenTable)
        );
        assert_eq!(identify_platform("friend@example.com"), None);
    }

    #[test]
    fn parses_resy_notification_subject() {
        let parsed = parse_notification(&email(
            "notify@resy.com",
            "Good news! A table at Carbone is now available",
            "",
        ))
        .unwrap();
        assert_eq!(parsed.platform, PlatformKind::Resy);
        assert_eq!(parsed.restaurant_name, "Carbone");
        assert_eq!(parsed.email_id, "msg-1");
    }

    #[test]
    fn parses_opentable_notification_subject() {
        let parsed = parse_notification(&email(
            "no-reply@opentable.com",
            "Don Angie - A table is now available",
            "",
        ))
        .unwrap();
        assert_eq!(parsed.platform, PlatformKind::OpenTable);
        assert_eq!(parsed.restaurant_name, "Don Angie");
    }

    #[test]
    fn falls_back_to_body_extraction() {
        let parsed = parse_notification(&email(
            "notify@resy.com",
            "Your Resy update",
            "Good news! A table at Via Carota is now available for your party.",
        ))
        .unwrap();
        assert_eq!(parsed.restaurant_name, "Via Carota");
    }

    #[test]
    fn marketing_mail_is_gated_out() {
        assert!(parse_notification(&email(
            "notify@resy.com",
            "Your receipt from last night",
            "Thanks for dining with us.",
        ))
        .is_none());
    }

    #[test]
    fn unknown_sender_is_ignored() {
        assert!(parse_notification(&email(
            "friend@example.com",
            "A table at Carbone is now available",
            "",
        ))
        .is_none());
    }

    #[test]
    fn unextractable_name_yields_nothing() {
        assert!(parse_notification(&email(
            "notify@resy.com",
            "A table is now available",
            "",
        ))
        .is_none());
    }

    /// Hands out its queued emails once, then nothing.
    struct OneShotSource {
        emails: Mutex<Vec<RawEmail>>,
    }

    #[async_trait]
    impl MailSource for OneShotSource {
        async fn fetch_unread(&self) -> AgentResult<Vec<RawEmail>> {
            Ok(self.emails.lock().unwrap().drain(..).collect())
        }
    }

    #[tokio::test]
    async fn monitor_drives_notification_to_booking() {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let platform = Arc::new(
            ScriptedPlatform::new(PlatformKind::Resy)
                .script([ScriptedPlatform::booked("R-abc", "19:30")]),
        );
        let mut platforms = PlatformRegistry::new();
        platforms.register(platform.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            platforms,
            Arc::new(SystemClock),
        ));
        let router = Arc::new(NotificationRouter::new(db.clone(), orchestrator));

        // a request already in no_availability with its live subscription
        let requests = RequestQueries::new(&db);
        let id = requests
            .create(&NewRequest {
                restaurant_name: "Carbone".to_string(),
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
        SubscriptionQueries::new(&db)
            .insert_if_absent(&SubscriptionModel {
                id: 0,
                request_id: id,
                platform: PlatformKind::Resy,
                restaurant_name: "Carbone".to_string(),
                venue_id: Some("123".to_string()),
                search_date: "2025-06-01".to_string(),
                search_time: "19:00".to_string(),
                search_party_size: 2,
                active: true,
                subscribed_at: Utc::now(),
            })
            .await
            .unwrap();

        let source = Arc::new(OneShotSource {
            emails: Mutex::new(vec![email(
                "notify@resy.com",
                "Good news! A table at Carbone is now available",
                "",
            )]),
        });
        let monitor = MailboxMonitor::new(source, router, Duration::from_millis(10));
        let token = CancellationToken::new();
        let monitor_token = token.clone();
        let handle = tokio::spawn(async move { monitor.run(monitor_token).await });

        let mut booked = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let request = requests.get_by_id(id).await.unwrap().unwrap();
            if request.status == RequestStatus::Booked {
                booked = true;
                break;
            }
        }
        token.cancel();
        handle.await.unwrap();
        assert!(booked, "monitor never drove the request to booked");
    }
}
