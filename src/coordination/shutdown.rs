//! Shutdown Coordination
//!
//! Intercepts termination requests and drives the drain sequence: stop
//! admitting new component runs, cancel in-flight tasks, wait out the
//! grace deadline, abandon stragglers, take a final checkpoint. Requests
//! are coalesced; only the first one defines the shutdown.

use crate::config::ShutdownConfig;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The single active termination request.
#[derive(Debug, Clone)]
pub struct ShutdownRequest {
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    /// In-flight tasks still running past this point are force-abandoned.
    pub deadline: DateTime<Utc>,
}

/// Phases of the drain sequence, published for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// No longer admitting newly-due component runs
    Draining,
    /// Cancellation signalled to in-flight tasks
    Cancelling,
    /// Final checkpoint in progress
    Checkpointing,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::Draining => write!(f, "draining"),
            ShutdownPhase::Cancelling => write!(f, "cancelling"),
            ShutdownPhase::Checkpointing => write!(f, "checkpointing"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// How the process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// All tasks finished within the grace deadline
    Clean,
    /// Some tasks were abandoned past the deadline
    Forced { abandoned: Vec<String> },
}

impl Termination {
    /// Process exit code: 0 clean, 2 forced.
    pub fn exit_code(&self) -> u8 {
        match self {
            Termination::Clean => 0,
            Termination::Forced { .. } => 2,
        }
    }
}

/// Coordinates graceful shutdown. A second request while one is in
/// progress is a no-op that joins the first.
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    requested: AtomicBool,
    request: RwLock<Option<ShutdownRequest>>,
    cancel: CancellationToken,
    phase_tx: watch::Sender<ShutdownPhase>,
    phase_rx: watch::Receiver<ShutdownPhase>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            requested: AtomicBool::new(false),
            request: RwLock::new(None),
            cancel: CancellationToken::new(),
            phase_tx,
            phase_rx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    /// Request termination. Idempotent: the first caller wins and later
    /// requests coalesce into it.
    pub async fn request_shutdown(&self, reason: &str) {
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already in progress, coalescing request: {}", reason);
            return;
        }

        let now = Utc::now();
        let request = ShutdownRequest {
            reason: reason.to_string(),
            requested_at: now,
            deadline: now + chrono::Duration::milliseconds(self.config.grace_ms as i64),
        };

        info!(
            "Shutdown requested: {} (grace: {}ms)",
            reason, self.config.grace_ms
        );

        *self.request.write().await = Some(request);
        self.cancel.cancel();
    }

    /// Whether a shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The active request, if any.
    pub async fn active_request(&self) -> Option<ShutdownRequest> {
        self.request.read().await.clone()
    }

    /// Token cancelled the moment shutdown is requested. The supervisor
    /// loop selects on this to stop admitting due runs.
    pub fn trigger(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Grace period granted to in-flight tasks.
    pub fn grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.grace_ms)
    }

    /// Publish the current drain phase.
    pub fn set_phase(&self, phase: ShutdownPhase) {
        if *self.phase_rx.borrow() != phase {
            info!("Shutdown phase: {}", phase);
            let _ = self.phase_tx.send(phase);
        }
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    /// Receiver for phase changes.
    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_rx.clone()
    }
}

/// Route OS termination signals into the coordinator.
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let for_sigterm = coordinator.clone();
        tokio::spawn(async move {
            let mut stream =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
            stream.recv().await;
            info!("Received SIGTERM");
            for_sigterm.request_shutdown("signal: SIGTERM").await;
        });

        let for_sigint = coordinator;
        tokio::spawn(async move {
            let mut stream =
                signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
            stream.recv().await;
            info!("Received SIGINT");
            for_sigint.request_shutdown("signal: SIGINT").await;
        });
    }

    #[cfg(windows)]
    {
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C");
            coordinator.request_shutdown("signal: ctrl-c").await;
        });
    }
}
