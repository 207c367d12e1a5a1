//! Acquisition orchestrator
//!
//! Drives one reservation request from intake to a terminal state:
//! immediate attempt, sniper hand-off when a booking open time is known,
//! notification-driven auto-booking, cancellation, and startup resume of
//! in-flight requests. All status changes go through the store's guarded
//! transitions; no platform call happens inside a transaction.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::db::{
    ActivityLogQueries, Database, PlatformKind, RequestModel, RequestQueries, RequestStatus,
    SubscriptionModel, SubscriptionQueries,
};
use crate::platform::{BookResult, PlatformRegistry};
use crate::{AgentError, AgentResult};

mod registry;
pub(crate) mod sniper;

pub use registry::{TaskHandle, TaskRegistry};

/// Default sniper poll cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of a single platform attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TryOutcome {
    /// A booking was committed.
    Booked,
    /// The platform had nothing; the caller decides what happens next.
    Unavailable,
    /// The request moved to a terminal state under us; stop acting.
    Aborted,
}

/// The acquisition orchestrator.
pub struct Orchestrator {
    pub(crate) db: Arc<Database>,
    platforms: PlatformRegistry,
    pub(crate) clock: Arc<dyn Clock>,
    registry: Arc<TaskRegistry>,
    pub(crate) poll_interval: Duration,
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(db: Arc<Database>, platforms: PlatformRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            platforms,
            clock,
            registry: Arc::new(TaskRegistry::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the sniper poll cadence.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The cancellation bus.
    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    /// Spawn the acquisition task for a newly created or retried request.
    /// Returns immediately; the task owns the request until it reaches a
    /// terminal state or is cancelled.
    pub fn spawn_submit(self: &Arc<Self>, request_id: i64) {
        let orchestrator = self.clone();
        let handle = self.registry.register(request_id);
        tokio::spawn(async move {
            let token = handle.token();
            if let Err(e) = orchestrator.submit(request_id, &token).await {
                orchestrator.fold_error(request_id, e).await;
            }
            orchestrator.registry.deregister(&handle);
        });
    }

    /// Entry point for a new request. Idempotent: a request that already
    /// left `pending` is left alone.
    pub async fn submit(&self, request_id: i64, token: &CancellationToken) -> AgentResult<()> {
        let requests = RequestQueries::new(&self.db);

        match requests
            .transition(request_id, RequestStatus::Searching, "search_started", None, None)
            .await
        {
            Ok(_) => {}
            Err(AgentError::InvalidTransition { from, .. }) => {
                debug!(
                    "Submit for request {} is a no-op (status {})",
                    request_id, from
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.acquire(request_id, token).await
    }

    /// The acquisition flow, entered after the request is in `searching`.
    /// Also the supervisor's resume point for requests found in `searching`.
    pub(crate) async fn acquire(
        &self,
        request_id: i64,
        token: &CancellationToken,
    ) -> AgentResult<()> {
        let requests = RequestQueries::new(&self.db);
        let Some(request) = requests.get_by_id(request_id).await? else {
            warn!("Request {} not found", request_id);
            return Ok(());
        };

        // A future booking open time means inventory is not out yet: go
        // straight to the sniper instead of burning an attempt now.
        if let Some(open_time) = request.booking_open_time {
            if open_time > self.clock.now_utc() {
                return sniper::run(self, request_id, token).await;
            }
        }

        match self.try_platform(request_id, PlatformKind::Resy).await? {
            TryOutcome::Booked | TryOutcome::Aborted => return Ok(()),
            TryOutcome::Unavailable => {}
        }

        let Some(request) = requests.get_by_id(request_id).await? else {
            return Ok(());
        };
        if request.status != RequestStatus::Searching {
            // cancel (or a racing notification) moved the request on
            return Ok(());
        }

        match requests
            .transition(
                request_id,
                RequestStatus::NoAvailability,
                "no_availability",
                None,
                Some(json!({
                    "reason": "No slots found and no booking_open_time set"
                })),
            )
            .await
        {
            Ok(_) => {}
            Err(AgentError::InvalidTransition { from, .. }) => {
                debug!(
                    "Request {} moved to {} while finishing acquisition",
                    request_id, from
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.create_notify_subscription(request_id, PlatformKind::Resy)
            .await;
        Ok(())
    }

    /// Entry point from the notification router (and the supervisor's
    /// resume of `notify_received`). One best-effort attempt on the named
    /// platform, regardless of booking open time. On success, all of the
    /// request's subscriptions are deactivated before the confirmation log
    /// is emitted; on a dry attempt the request moves to `failed`.
    pub async fn auto_book(&self, request_id: i64, platform: PlatformKind) -> AgentResult<bool> {
        info!(
            "Auto-booking request {} via {} notification",
            request_id, platform
        );

        match self.try_platform(request_id, platform).await? {
            TryOutcome::Booked => {
                let subscriptions = SubscriptionQueries::new(&self.db);
                subscriptions.deactivate_for_request(request_id).await?;
                ActivityLogQueries::new(&self.db)
                    .append(Some(request_id), "booking_confirmed", Some(platform), None)
                    .await?;
                Ok(true)
            }
            TryOutcome::Aborted => Ok(false),
            TryOutcome::Unavailable => {
                let requests = RequestQueries::new(&self.db);
                match requests
                    .transition(
                        request_id,
                        RequestStatus::Failed,
                        "auto_book_failed",
                        Some(platform),
                        None,
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(AgentError::InvalidTransition { from, .. }) => {
                        debug!(
                            "Auto-book failure transition skipped for request {} (status {})",
                            request_id, from
                        );
                    }
                    Err(e) => return Err(e),
                }
                Ok(false)
            }
        }
    }

    /// Force a non-booked request back to `pending` and re-enter the
    /// orchestrator.
    pub async fn retry(self: &Arc<Self>, request_id: i64) -> AgentResult<()> {
        let requests = RequestQueries::new(&self.db);
        requests
            .transition(request_id, RequestStatus::Pending, "retry_requested", None, None)
            .await?;
        self.spawn_submit(request_id);
        Ok(())
    }

    /// Cancel a request: persist `cancelled`, deactivate its subscriptions,
    /// then fire its task's cancellation token.
    pub async fn cancel(&self, request_id: i64) -> AgentResult<()> {
        let requests = RequestQueries::new(&self.db);
        requests
            .transition(request_id, RequestStatus::Cancelled, "cancelled", None, None)
            .await?;
        SubscriptionQueries::new(&self.db)
            .deactivate_for_request(request_id)
            .await?;
        self.registry.cancel(request_id);
        info!("Request {} cancelled", request_id);
        Ok(())
    }

    /// One platform attempt: resolve the venue (write-once), call the
    /// adapter outside any transaction, and commit the outcome.
    pub(crate) async fn try_platform(
        &self,
        request_id: i64,
        kind: PlatformKind,
    ) -> AgentResult<TryOutcome> {
        let requests = RequestQueries::new(&self.db);
        let logs = ActivityLogQueries::new(&self.db);

        let Some(request) = requests.get_by_id(request_id).await? else {
            warn!("Request {} not found", request_id);
            return Ok(TryOutcome::Aborted);
        };
        if request.status.is_terminal() {
            debug!(
                "Skipping attempt for request {}: status {}",
                request_id, request.status
            );
            return Ok(TryOutcome::Aborted);
        }

        let Some(platform) = self.platforms.get(kind) else {
            warn!("No adapter registered for platform {}", kind);
            logs.append(Some(request_id), "adapter_not_registered", Some(kind), None)
                .await?;
            return Ok(TryOutcome::Unavailable);
        };

        logs.append(
            Some(request_id),
            &format!("{kind}_search"),
            Some(kind),
            None,
        )
        .await?;

        let venue_id = if !request.venue_id.is_empty() {
            request.venue_id.clone()
        } else {
            match platform.resolve_venue(&request.restaurant_name).await? {
                Some(venue_id) if !venue_id.is_empty() => {
                    requests.set_venue_id(request_id, &venue_id).await?;
                    venue_id
                }
                _ => {
                    logs.append(
                        Some(request_id),
                        &format!("{kind}_venue_not_found"),
                        Some(kind),
                        Some(json!({ "restaurant": request.restaurant_name })),
                    )
                    .await?;
                    return Ok(TryOutcome::Unavailable);
                }
            }
        };

        let result = platform
            .try_book(&venue_id, &request.date, &request.time, request.party_size)
            .await?;

        match result {
            BookResult::Booked {
                confirmation_id,
                booked_time,
                raw,
            } => {
                let commit = requests
                    .confirm_booking(
                        request_id,
                        kind,
                        confirmation_id.as_deref(),
                        booked_time.as_deref(),
                        raw.as_deref(),
                        &format!("{kind}_booked"),
                        Some(json!({
                            "confirmation_id": confirmation_id,
                            "booked_time": booked_time,
                        })),
                    )
                    .await;
                match commit {
                    Ok(()) => Ok(TryOutcome::Booked),
                    Err(AgentError::InvalidTransition { from, .. }) => {
                        // Lost the commit race: another path booked first, or
                        // a cancel landed while the adapter was in flight.
                        // The platform-side reservation needs operator
                        // attention either way.
                        let action = if from == RequestStatus::Booked.as_str() {
                            "duplicate_booking_detected"
                        } else {
                            "booking_result_discarded"
                        };
                        warn!(
                            "Request {}: booking on {} not committed (status {}), logging {}",
                            request_id, kind, from, action
                        );
                        logs.append(
                            Some(request_id),
                            action,
                            Some(kind),
                            Some(json!({
                                "confirmation_id": confirmation_id,
                                "status": from,
                            })),
                        )
                        .await?;
                        Ok(TryOutcome::Aborted)
                    }
                    Err(e) => Err(e),
                }
            }
            BookResult::NoAvailability => {
                logs.append(
                    Some(request_id),
                    &format!("{kind}_unavailable"),
                    Some(kind),
                    None,
                )
                .await?;
                Ok(TryOutcome::Unavailable)
            }
            BookResult::AuthExpired => {
                logs.append(
                    Some(request_id),
                    &format!("{kind}_auth_expired"),
                    Some(kind),
                    None,
                )
                .await?;
                Ok(TryOutcome::Unavailable)
            }
            BookResult::TransportError(message) => {
                warn!(
                    "Transport error booking request {} on {}: {}",
                    request_id, kind, message
                );
                logs.append(
                    Some(request_id),
                    "transport_ambiguous",
                    Some(kind),
                    Some(json!({ "severity": "warn", "error": message })),
                )
                .await?;
                Ok(TryOutcome::Unavailable)
            }
        }
    }

    /// Stand up a platform-side availability alert and persist the matching
    /// subscription row. Runs when a request lands in `no_availability`;
    /// best-effort, failures are logged and swallowed.
    async fn create_notify_subscription(&self, request_id: i64, kind: PlatformKind) {
        let result = self.try_create_subscription(request_id, kind).await;
        if let Err(e) = result {
            warn!(
                "Failed to create notify subscription for request {}: {}",
                request_id, e
            );
        }
    }

    async fn try_create_subscription(
        &self,
        request_id: i64,
        kind: PlatformKind,
    ) -> AgentResult<()> {
        let requests = RequestQueries::new(&self.db);
        let Some(request) = requests.get_by_id(request_id).await? else {
            return Ok(());
        };
        if request.venue_id.is_empty() {
            debug!(
                "Not subscribing request {}: venue never resolved",
                request_id
            );
            return Ok(());
        }
        let Some(platform) = self.platforms.get(kind) else {
            return Ok(());
        };

        let accepted = platform
            .subscribe_notify(
                &request.venue_id,
                &request.date,
                &request.time,
                request.party_size,
            )
            .await?;
        if !accepted {
            debug!(
                "Platform {} declined notify subscription for request {}",
                kind, request_id
            );
            return Ok(());
        }

        let subscriptions = SubscriptionQueries::new(&self.db);
        let inserted = subscriptions
            .insert_if_absent(&SubscriptionModel {
                id: 0,
                request_id,
                platform: kind,
                restaurant_name: request.restaurant_name.clone(),
                venue_id: Some(request.venue_id.clone()),
                search_date: request.date.clone(),
                search_time: request.time.clone(),
                search_party_size: request.party_size,
                active: true,
                subscribed_at: Utc::now(),
            })
            .await?;
        if inserted {
            ActivityLogQueries::new(&self.db)
                .append(
                    Some(request_id),
                    "subscription_created",
                    Some(kind),
                    Some(json!({ "venue_id": request.venue_id })),
                )
                .await?;
        }
        Ok(())
    }

    /// Fold an acquisition error into the state machine: non-terminal
    /// requests move to `failed` with an `orchestration_error` log. Only
    /// programmer errors reach this point; adapter outcomes are handled
    /// inline.
    pub(crate) async fn fold_error(&self, request_id: i64, error: AgentError) {
        error!("Error during acquisition for request {}: {}", request_id, error);
        let requests = RequestQueries::new(&self.db);
        let transition = requests
            .transition(
                request_id,
                RequestStatus::Failed,
                "orchestration_error",
                None,
                Some(json!({ "error": error.to_string() })),
            )
            .await;
        match transition {
            Ok(_) => {}
            Err(AgentError::InvalidTransition { .. }) | Err(AgentError::NotFound(_)) => {}
            Err(e) => error!(
                "Failed to record orchestration error for request {}: {}",
                request_id, e
            ),
        }
    }

    /// Supervisor: re-dispatch requests stranded in transient states by a
    /// restart. `searching` resumes the acquisition flow, `waiting` and
    /// `polling` re-enter the sniper (which recomputes its wait), and
    /// `notify_received` becomes a fresh auto-book attempt. Duplicate
    /// dispatch is absorbed by the guarded transitions and the
    /// single-booking commit.
    pub async fn resume_in_flight(self: &Arc<Self>) -> AgentResult<()> {
        info!("Resuming in-flight requests...");

        let requests = RequestQueries::new(&self.db);
        let stranded = requests
            .list_by_statuses(&[
                RequestStatus::Searching,
                RequestStatus::Waiting,
                RequestStatus::Polling,
                RequestStatus::NotifyReceived,
            ])
            .await?;

        if stranded.is_empty() {
            info!("No in-flight requests to resume");
            return Ok(());
        }

        let total = stranded.len();
        info!("Found {} in-flight request(s) to resume", total);
        let mut resumed_search = 0;
        let mut resumed_sniper = 0;
        let mut resumed_auto_book = 0;

        for (index, request) in stranded.into_iter().enumerate() {
            info!(
                "[Resume {}/{}] Request {} in status {}",
                index + 1,
                total,
                request.id,
                request.status
            );
            match request.status {
                RequestStatus::Searching => {
                    resumed_search += 1;
                    self.spawn_resume_acquire(request.id);
                }
                RequestStatus::Waiting | RequestStatus::Polling => {
                    resumed_sniper += 1;
                    self.spawn_resume_sniper(request.id);
                }
                RequestStatus::NotifyReceived => {
                    resumed_auto_book += 1;
                    let platform = self.subscription_platform(&request).await;
                    self.spawn_resume_auto_book(request.id, platform);
                }
                other => {
                    debug!("Request {} no longer transient ({})", request.id, other);
                }
            }
        }

        info!(
            "Resume dispatch complete: {} searching, {} sniping, {} auto-booking",
            resumed_search, resumed_sniper, resumed_auto_book
        );
        Ok(())
    }

    /// Pick the platform for a resumed auto-book from the request's active
    /// subscriptions; the primary platform when there is none.
    async fn subscription_platform(&self, request: &RequestModel) -> PlatformKind {
        let subscriptions = SubscriptionQueries::new(&self.db);
        match subscriptions.list_for_request(request.id).await {
            Ok(subs) => subs
                .into_iter()
                .find(|s| s.active)
                .map(|s| s.platform)
                .unwrap_or(PlatformKind::Resy),
            Err(e) => {
                warn!(
                    "Failed to load subscriptions for request {}: {}",
                    request.id, e
                );
                PlatformKind::Resy
            }
        }
    }

    fn spawn_resume_acquire(self: &Arc<Self>, request_id: i64) {
        let orchestrator = self.clone();
        let handle = self.registry.register(request_id);
        tokio::spawn(async move {
            let token = handle.token();
            if let Err(e) = orchestrator.acquire(request_id, &token).await {
                orchestrator.fold_error(request_id, e).await;
            }
            orchestrator.registry.deregister(&handle);
        });
    }

    fn spawn_resume_sniper(self: &Arc<Self>, request_id: i64) {
        let orchestrator = self.clone();
        let handle = self.registry.register(request_id);
        tokio::spawn(async move {
            let token = handle.token();
            if let Err(e) = sniper::run(&orchestrator, request_id, &token).await {
                orchestrator.fold_error(request_id, e).await;
            }
            orchestrator.registry.deregister(&handle);
        });
    }

    fn spawn_resume_auto_book(self: &Arc<Self>, request_id: i64, platform: PlatformKind) {
        let orchestrator = self.clone();
        let handle = self.registry.register(request_id);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.auto_book(request_id, platform).await {
                orchestrator.fold_error(request_id, e).await;
            }
            orchestrator.registry.deregister(&handle);
        });
    }
}
