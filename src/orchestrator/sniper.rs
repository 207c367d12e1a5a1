//! Sniper: timed burst of rapid polls around a booking open time
//!
//! Waits until the venue's inventory release instant, then polls the
//! primary platform on a fixed cadence until it books, the poll budget runs
//! out, or the request is cancelled. Both sleeps wake early on the
//! request's cancellation token; the sniper re-reads status after every
//! wake and never runs two attempts at once.

use serde_json::json;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Orchestrator, TryOutcome};
use crate::db::{ActivityLogQueries, PlatformKind, RequestQueries, RequestStatus};
use crate::{AgentError, AgentResult};

/// Run the sniper for one request.
pub(crate) async fn run(
    orchestrator: &Orchestrator,
    request_id: i64,
    token: &CancellationToken,
) -> AgentResult<()> {
    let requests = RequestQueries::new(&orchestrator.db);
    let logs = ActivityLogQueries::new(&orchestrator.db);

    let Some(request) = requests.get_by_id(request_id).await? else {
        return Ok(());
    };
    if request.status.is_terminal() {
        debug!(
            "Sniper not starting for request {}: status {}",
            request_id, request.status
        );
        return Ok(());
    }

    // A missing open time can only come from a resumed row; treat it as
    // already released and poll right away.
    let wait = request
        .booking_open_time
        .map(|open_time| {
            (open_time - orchestrator.clock.now_utc())
                .num_milliseconds()
                .max(0) as u64
        })
        .unwrap_or(0);

    if wait > 0 {
        let wait_seconds = (wait as f64 / 100.0).round() / 10.0;
        if request.status == RequestStatus::Waiting {
            // resumed mid-wait; the transition already happened before the
            // restart, but the recomputed wait is worth recording
            logs.append(
                Some(request_id),
                "sniper_waiting",
                None,
                Some(json!({ "wait_seconds": wait_seconds })),
            )
            .await?;
        } else {
            match requests
                .transition(
                    request_id,
                    RequestStatus::Waiting,
                    "sniper_waiting",
                    None,
                    Some(json!({ "wait_seconds": wait_seconds })),
                )
                .await
            {
                Ok(_) => {}
                Err(AgentError::InvalidTransition { from, .. }) => {
                    debug!(
                        "Sniper yielding for request {}: status {}",
                        request_id, from
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Sniper armed for request {}: waiting {:.1}s until booking opens",
            request_id, wait_seconds
        );
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Sniper wait cancelled for request {}", request_id);
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
        }
    }

    // Re-read after the wait: a cancel may have landed while we slept.
    let Some(request) = requests.get_by_id(request_id).await? else {
        return Ok(());
    };
    if request.status.is_terminal() {
        return Ok(());
    }

    if request.status != RequestStatus::Polling {
        match requests
            .transition(
                request_id,
                RequestStatus::Polling,
                "sniper_polling_started",
                None,
                None,
            )
            .await
        {
            Ok(_) => {}
            Err(AgentError::InvalidTransition { from, .. }) => {
                debug!(
                    "Sniper yielding for request {}: status {}",
                    request_id, from
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }

    let poll_interval = orchestrator.poll_interval;
    let budget = Duration::from_secs(u64::from(request.max_poll_duration_secs));
    let deadline = Instant::now() + budget;
    info!(
        "Sniper polling request {} every {:?} for up to {:?}",
        request_id, poll_interval, budget
    );

    while Instant::now() < deadline {
        let attempt_started = Instant::now();

        let Some(request) = requests.get_by_id(request_id).await? else {
            return Ok(());
        };
        if request.status.is_terminal() {
            // cancelled, or a racing notification already booked it
            return Ok(());
        }

        match orchestrator
            .try_platform(request_id, PlatformKind::Resy)
            .await?
        {
            TryOutcome::Booked => {
                info!("Sniper booked request {}", request_id);
                return Ok(());
            }
            TryOutcome::Aborted => return Ok(()),
            TryOutcome::Unavailable => {}
        }

        requests.increment_poll_attempts(request_id).await?;

        // Cadence holds against slow attempts: an attempt that overruns the
        // interval is followed immediately, never by a backlog of sleeps.
        let elapsed = attempt_started.elapsed();
        if elapsed < poll_interval {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Sniper poll loop cancelled for request {}", request_id);
                    return Ok(());
                }
                _ = tokio::time::sleep(poll_interval - elapsed) => {}
            }
        }
    }

    // Budget exhausted without a booking.
    let Some(request) = requests.get_by_id(request_id).await? else {
        return Ok(());
    };
    if !request.status.is_terminal() {
        match requests
            .transition(
                request_id,
                RequestStatus::Failed,
                "sniper_timeout",
                None,
                Some(json!({
                    "poll_attempts": request.poll_attempts,
                    "duration_secs": request.max_poll_duration_secs,
                })),
            )
            .await
        {
            Ok(_) => {
                info!(
                    "Sniper timed out for request {} after {} attempts",
                    request_id, request.poll_attempts
                );
            }
            Err(AgentError::InvalidTransition { from, .. }) => {
                debug!(
                    "Sniper timeout transition skipped for request {} (status {})",
                    request_id, from
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::db::{BookingQueries, Database, NewRequest, SubscriptionQueries};
    use crate::platform::mock::ScriptedPlatform;
    use crate::platform::{BookResult, PlatformRegistry};
    use chrono::Utc;
    use std::sync::Arc;

    async fn orchestrator_with(platform: Arc<ScriptedPlatform>) -> Arc<Orchestrator> {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let mut platforms = PlatformRegistry::new();
        platforms.register(platform);
        Arc::new(
            Orchestrator::new(db, platforms, Arc::new(SystemClock))
                .with_poll_interval(Duration::from_millis(20)),
        )
    }

    async fn create_request(
        orchestrator: &Orchestrator,
        booking_open_time: Option<chrono::DateTime<Utc>>,
        max_poll_duration_secs: u32,
    ) -> i64 {
        RequestQueries::new(&orchestrator.db)
            .create(&NewRequest {
                restaurant_name: "Carbone".to_string(),
                date: "2025-06-01".to_string(),
                time: "19:00".to_string(),
                party_size: 2,
                contact_email: "diner@example.com".to_string(),
                venue_id: None,
                booking_open_time,
                max_poll_duration_secs: Some(max_poll_duration_secs),
            })
            .await
            .unwrap()
    }

    async fn status_of(orchestrator: &Orchestrator, id: i64) -> RequestStatus {
        RequestQueries::new(&orchestrator.db)
            .get_by_id(id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    async fn actions_for(orchestrator: &Orchestrator, id: i64) -> Vec<String> {
        ActivityLogQueries::new(&orchestrator.db)
            .list_for_request(id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.action)
            .collect()
    }

    #[tokio::test]
    async fn sniper_waits_then_books_on_third_poll() {
        let platform = Arc::new(ScriptedPlatform::new(PlatformKind::Resy).script([
            BookResult::NoAvailability,
            BookResult::NoAvailability,
            ScriptedPlatform::booked("R-abc", "19:00"),
        ]));
        let orchestrator = orchestrator_with(platform.clone()).await;
        let open_time = Utc::now() + chrono::Duration::milliseconds(300);
        let id = create_request(&orchestrator, Some(open_time), 10).await;

        let token = CancellationToken::new();
        orchestrator.submit(id, &token).await.unwrap();

        assert_eq!(status_of(&orchestrator, id).await, RequestStatus::Booked);

        let request = RequestQueries::new(&orchestrator.db)
            .get_by_id(id)
            .await
            .unwrap()
            .unwrap();
        assert!(request.poll_attempts >= 2, "attempts: {}", request.poll_attempts);

        let actions = actions_for(&orchestrator, id).await;
        assert_eq!(actions[0], "search_started");
        assert!(actions.contains(&"sniper_waiting".to_string()));
        assert!(actions.contains(&"sniper_polling_started".to_string()));
        assert!(actions.contains(&"resy_booked".to_string()));

        let bookings = BookingQueries::new(&orchestrator.db)
            .list_for_request(id)
            .await
            .unwrap();
        assert_eq!(bookings.len(), 1);
    }

    #[tokio::test]
    async fn sniper_times_out_to_failed() {
        let platform = Arc::new(ScriptedPlatform::new(PlatformKind::Resy));
        let orchestrator = orchestrator_with(platform.clone()).await;
        // open time already passed: no wait, straight to polling
        let open_time = Utc::now() - chrono::Duration::seconds(5);
        let id = create_request(&orchestrator, Some(open_time), 1).await;

        let requests = RequestQueries::new(&orchestrator.db);
        requests
            .transition(id, RequestStatus::Searching, "search_started", None, None)
            .await
            .unwrap();

        let token = CancellationToken::new();
        run(&orchestrator, id, &token).await.unwrap();

        assert_eq!(status_of(&orchestrator, id).await, RequestStatus::Failed);

        let request = requests.get_by_id(id).await.unwrap().unwrap();
        assert!(request.poll_attempts >= 2, "attempts: {}", request.poll_attempts);

        let actions = actions_for(&orchestrator, id).await;
        assert!(!actions.contains(&"sniper_waiting".to_string()));
        assert!(actions.contains(&"sniper_polling_started".to_string()));
        assert!(actions.contains(&"sniper_timeout".to_string()));
    }

    #[tokio::test]
    async fn cancel_during_wait_never_calls_the_platform() {
        let platform = Arc::new(ScriptedPlatform::new(PlatformKind::Resy));
        let orchestrator = orchestrator_with(platform.clone()).await;
        let open_time = Utc::now() + chrono::Duration::seconds(60);
        let id = create_request(&orchestrator, Some(open_time), 10).await;

        orchestrator.spawn_submit(id);

        // let the task persist the waiting state, then cancel
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if status_of(&orchestrator, id).await == RequestStatus::Waiting {
                break;
            }
        }
        assert_eq!(status_of(&orchestrator, id).await, RequestStatus::Waiting);

        orchestrator.cancel(id).await.unwrap();
        assert_eq!(status_of(&orchestrator, id).await, RequestStatus::Cancelled);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(platform.book_call_count(), 0);

        let subs = SubscriptionQueries::new(&orchestrator.db)
            .list_for_request(id)
            .await
            .unwrap();
        assert!(subs.iter().all(|s| !s.active));
    }

    #[tokio::test]
    async fn cancel_during_poll_loop_stops_within_an_interval() {
        let platform = Arc::new(ScriptedPlatform::new(PlatformKind::Resy));
        let orchestrator = orchestrator_with(platform.clone()).await;
        let open_time = Utc::now() + chrono::Duration::milliseconds(100);
        let id = create_request(&orchestrator, Some(open_time), 30).await;

        orchestrator.spawn_submit(id);

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if status_of(&orchestrator, id).await == RequestStatus::Polling {
                break;
            }
        }
        assert_eq!(status_of(&orchestrator, id).await, RequestStatus::Polling);

        let calls_at_cancel = platform.book_call_count();
        orchestrator.cancel(id).await.unwrap();

        // the loop wakes on the token and must not start more than one
        // further attempt
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(status_of(&orchestrator, id).await, RequestStatus::Cancelled);
        assert!(platform.book_call_count() <= calls_at_cancel + 1);
    }

    #[tokio::test]
    async fn booking_landing_after_cancel_is_discarded() {
        // The adapter call is in flight when the cancel lands; its success
        // result must be discarded, not committed.
        let platform = Arc::new(
            ScriptedPlatform::new(PlatformKind::Resy)
                .with_book_delay(Duration::from_millis(100))
                .script([ScriptedPlatform::booked("R-late", "19:00")]),
        );
        let orchestrator = orchestrator_with(platform.clone()).await;
        let id = create_request(&orchestrator, None, 10).await;

        let requests = RequestQueries::new(&orchestrator.db);
        requests
            .transition(id, RequestStatus::Searching, "search_started", None, None)
            .await
            .unwrap();

        let racing = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.try_platform(id, PlatformKind::Resy).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        orchestrator.cancel(id).await.unwrap();

        let outcome = racing.await.unwrap().unwrap();
        assert_eq!(outcome, TryOutcome::Aborted);
        assert_eq!(status_of(&orchestrator, id).await, RequestStatus::Cancelled);

        let bookings = BookingQueries::new(&orchestrator.db)
            .list_for_request(id)
            .await
            .unwrap();
        assert!(bookings.is_empty());

        let actions = actions_for(&orchestrator, id).await;
        assert!(actions.contains(&"booking_result_discarded".to_string()));
    }
}
