//! booking-agent: a reservation acquisition agent for restaurant platforms
//!
//! The agent takes a reservation desire (restaurant, date, time, party size)
//! and works it to a terminal state with three cooperating strategies:
//!
//! - **Immediate acquisition**: try the primary platform right away
//! - **Sniping**: wait for a known inventory release instant, then rapid-poll
//!   on a sub-second cadence for a bounded window
//! - **Notification-driven auto-booking**: consume availability alert emails
//!   and re-attempt acquisition the moment a table frees up
//!
//! # Architecture
//!
//! 1. Requests are durable rows with a guarded status machine; every
//!    transition happens inside a store transaction with its log append
//! 2. The orchestrator drives one acquisition task per request, with a
//!    cancellation token registered on a per-request bus
//! 3. Platform adapters sit behind the `Platform` capability; the Resy
//!    adapter speaks the widget JSON API
//! 4. On startup a supervisor pass re-dispatches requests stranded in
//!    transient states by a restart
//!
#![warn(missing_docs)]

pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod notify;
pub mod orchestrator;
pub mod platform;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clock::SystemClock;
pub use config::Config;
use db::Database;
use notify::mailbox::{MailSource, MailboxMonitor};
use notify::NotificationRouter;
use orchestrator::Orchestrator;
use platform::{PlatformRegistry, ResyCredentials, ResyPlatform};

/// The main agent application state
#[derive(Clone)]
pub struct AgentApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Database connection
    pub db: Arc<Database>,
    /// The Resy adapter, also used directly for venue autocomplete
    pub resy: Arc<ResyPlatform>,
    /// The acquisition orchestrator
    pub orchestrator: Arc<Orchestrator>,
    /// The notification router
    pub router: Arc<NotificationRouter>,
}

impl AgentApp {
    /// Create a new agent application instance
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing booking agent...");

        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        info!("Connecting to database at: {}", db_url);
        let db = Arc::new(Database::connect(&db_url).await?);

        let resy = Arc::new(ResyPlatform::new(ResyCredentials {
            api_key: config.resy.api_key.clone(),
            auth_token: config.resy.auth_token.clone(),
            payment_method_id: config.resy.payment_method_id.clone(),
            email: config.resy.email.clone(),
            password: config.resy.password.clone(),
        })?);

        let mut platforms = PlatformRegistry::new();
        platforms.register(resy.clone());

        let orchestrator = Arc::new(
            Orchestrator::new(db.clone(), platforms, Arc::new(SystemClock)).with_poll_interval(
                Duration::from_millis(config.sniper.poll_interval_ms),
            ),
        );

        let router = Arc::new(NotificationRouter::new(db.clone(), orchestrator.clone()));

        info!("Booking agent initialized successfully");

        Ok(Self {
            config,
            db,
            resy,
            orchestrator,
            router,
        })
    }

    /// Start the agent and run until a shutdown signal (Ctrl+C, or SIGTERM
    /// on unix) arrives.
    pub async fn run(&self) -> Result<()> {
        self.run_until(install_signal_handler()).await
    }

    /// Start the agent and run until the given token fires. Tests and
    /// embedders supply their own token.
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting booking agent...");

        // Resume requests stranded in transient states by a restart
        self.orchestrator.resume_in_flight().await?;

        if !self.config.mailbox.is_configured() {
            info!("Mailbox not configured; notification-driven booking is idle");
        }

        info!(
            "Booking agent running. API available at http://{}",
            self.config.api_bind_address()
        );

        api::serve_until(self.clone(), shutdown).await?;

        self.shutdown().await
    }

    /// Spawn the mailbox monitor over the given mail source. Returns the
    /// token that stops it.
    pub fn spawn_mailbox_monitor(&self, source: Arc<dyn MailSource>) -> CancellationToken {
        let token = CancellationToken::new();
        let monitor = MailboxMonitor::new(
            source,
            self.router.clone(),
            Duration::from_secs(self.config.mailbox.poll_interval_seconds),
        );
        let monitor_token = token.clone();
        tokio::spawn(async move {
            monitor.run(monitor_token).await;
        });
        token
    }

    /// Shut the agent down gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down booking agent...");

        self.orchestrator.registry().cancel_all();
        self.db.close().await;

        info!("Booking agent shutdown complete");
        Ok(())
    }
}

/// Install handlers for Ctrl+C and, on unix, SIGTERM. The returned token
/// fires when either signal arrives.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown"),
                        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    info!("Received Ctrl+C, initiating shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl+C, initiating shutdown");
        }

        handler_token.cancel();
    });

    token
}

/// Error types for the booking agent
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Request or venue lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// The status machine rejected a transition
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Status the request was in
        from: String,
        /// Status the transition asked for
        to: String,
    },

    /// Platform adapter error
    #[error("Platform error: {0}")]
    Platform(String),

    /// API error
    #[error("API error: {0}")]
    Api(String),
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Database(e.to_string())
    }
}

/// Result type alias for agent operations
pub type AgentResult<T> = std::result::Result<T, AgentError>;
