//! Recovery Orchestrator
//!
//! State machine reacting to health-status changes: attempts local
//! remediation (soft restart), escalates to failover (pause risk
//! operations, restore the newest verified checkpoint, re-verify
//! health), and parks in a permanent-failure mode when attempts are
//! exhausted. Transitions are strictly serialized; only one failover
//! sequence can be in flight and concurrent triggers coalesce into it.

use crate::config::RecoveryConfig;
use crate::context::SupervisorContext;
use crate::error::Result;
use crate::supervisor::heartbeat::{HealthEvent, HealthStatus};
use crate::supervisor::scheduler::SupervisorCommand;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Risk-control capability invoked around failover. How pausing is
/// enforced downstream is out of scope.
#[async_trait]
pub trait RiskControl: Send + Sync {
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
}

/// Default risk control that only logs.
pub struct LogRiskControl;

#[async_trait]
impl RiskControl for LogRiskControl {
    async fn pause(&self) -> Result<()> {
        warn!("Risk-sensitive operations paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        info!("Risk-sensitive operations resumed");
        Ok(())
    }
}

/// Recovery state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Healthy,
    Degraded,
    FailoverInProgress,
    Recovering,
    FailedPermanent,
}

impl std::fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryState::Healthy => write!(f, "healthy"),
            RecoveryState::Degraded => write!(f, "degraded"),
            RecoveryState::FailoverInProgress => write!(f, "failover_in_progress"),
            RecoveryState::Recovering => write!(f, "recovering"),
            RecoveryState::FailedPermanent => write!(f, "failed_permanent"),
        }
    }
}

/// Valid edges of the recovery graph. FailedPermanent only exits via
/// manual reset.
fn edge_allowed(from: RecoveryState, to: RecoveryState) -> bool {
    use RecoveryState::*;
    match (from, to) {
        (Healthy, Degraded)
        | (Degraded, Healthy)
        | (Degraded, FailoverInProgress)
        | (FailoverInProgress, Recovering)
        | (Recovering, Healthy)
        | (Recovering, FailoverInProgress) => true,
        // Manual reset
        (FailedPermanent, Healthy) => true,
        // Attempt exhaustion can strike from any live state
        (from, FailedPermanent) => from != FailedPermanent,
        _ => false,
    }
}

/// One recorded transition, kept in a bounded log for inspection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StateTransition {
    pub from: RecoveryState,
    pub to: RecoveryState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

const TRANSITION_LOG_CAP: usize = 256;

/// Manual recovery trigger fed in from the control surface.
#[derive(Debug, Clone)]
enum RecoveryTrigger {
    ForceRecover { reason: String },
}

/// Owner of the recovery state machine. Single writer: all transitions
/// happen on the orchestrator's own task.
pub struct RecoveryOrchestrator {
    ctx: Arc<SupervisorContext>,
    commands: mpsc::Sender<SupervisorCommand>,
    state: RwLock<RecoveryState>,
    transitions: RwLock<Vec<StateTransition>>,
    trigger_tx: mpsc::Sender<RecoveryTrigger>,
    trigger_rx: std::sync::Mutex<Option<mpsc::Receiver<RecoveryTrigger>>>,
}

impl RecoveryOrchestrator {
    pub fn new(ctx: Arc<SupervisorContext>, commands: mpsc::Sender<SupervisorCommand>) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(8);
        Self {
            ctx,
            commands,
            state: RwLock::new(RecoveryState::Healthy),
            transitions: RwLock::new(Vec::new()),
            trigger_tx,
            trigger_rx: std::sync::Mutex::new(Some(trigger_rx)),
        }
    }

    /// Current recovery state.
    pub async fn state(&self) -> RecoveryState {
        *self.state.read().await
    }

    /// Copy of the transition log, oldest first.
    pub async fn transitions(&self) -> Vec<StateTransition> {
        self.transitions.read().await.clone()
    }

    /// Manually reset out of FailedPermanent. No-op in any other state.
    pub async fn reset(&self) {
        if self.state().await == RecoveryState::FailedPermanent {
            self.transition(RecoveryState::Healthy, "manual reset").await;
        }
    }

    /// Request a recovery sequence from the control surface. Queued onto
    /// the orchestrator task; coalesced if one is already in flight.
    pub async fn force_recover(&self, reason: &str) {
        let trigger = RecoveryTrigger::ForceRecover {
            reason: reason.to_string(),
        };
        if self.trigger_tx.try_send(trigger).is_err() {
            warn!("Recovery trigger queue full, request coalesced");
        }
    }

    /// Consume health events and manual triggers until cancelled.
    /// Events are processed strictly one at a time.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.ctx.monitor.subscribe();
        let Some(mut triggers) = self
            .trigger_rx
            .lock()
            .expect("trigger receiver mutex poisoned")
            .take()
        else {
            warn!("Recovery orchestrator started twice, ignoring");
            return;
        };

        info!("Recovery orchestrator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Recovery orchestrator lagged, {} health events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(trigger) = triggers.recv() => self.handle_trigger(trigger).await,
            }
        }

        info!("Recovery orchestrator stopped");
    }

    async fn handle_event(&self, event: HealthEvent) {
        if event.to == HealthStatus::Failed {
            self.ctx
                .alerts
                .error(
                    &event.component,
                    "Component Health Failed",
                    &format!("health transition {} -> {}", event.from, event.to),
                )
                .await;
        }
        if event.to == HealthStatus::Healthy {
            return;
        }
        if !event.critical {
            // Non-critical components never escalate.
            info!(
                "Non-critical component {} is {}, no recovery action",
                event.component, event.to
            );
            return;
        }

        // Events queued behind an earlier sequence may be stale by the
        // time they are processed.
        if self.ctx.monitor.status(&event.component).await == Some(HealthStatus::Healthy) {
            debug!("Component {} already recovered, event dropped", event.component);
            return;
        }

        match self.state().await {
            RecoveryState::Healthy => self.remediate(&event.component).await,
            RecoveryState::Degraded
            | RecoveryState::FailoverInProgress
            | RecoveryState::Recovering => {
                debug!(
                    "Recovery already in flight, coalescing event for {}",
                    event.component
                );
            }
            RecoveryState::FailedPermanent => {
                debug!(
                    "Ignoring event for {} while failed permanent",
                    event.component
                );
            }
        }
    }

    async fn handle_trigger(&self, trigger: RecoveryTrigger) {
        let RecoveryTrigger::ForceRecover { reason } = trigger;
        match self.state().await {
            RecoveryState::Healthy => {
                // The graph has no Healthy -> FailoverInProgress edge;
                // a forced sequence degrades first.
                self.transition(RecoveryState::Degraded, &reason).await;
                self.run_failover(&reason).await;
            }
            RecoveryState::Degraded => self.run_failover(&reason).await,
            RecoveryState::FailedPermanent => {
                self.reset().await;
                self.transition(RecoveryState::Degraded, &reason).await;
                self.run_failover(&reason).await;
            }
            RecoveryState::FailoverInProgress | RecoveryState::Recovering => {
                info!("Recovery already in flight, trigger coalesced");
            }
        }
    }

    /// Local remediation: soft-restart the affected component and wait
    /// for it to report healthy within the remediation timeout.
    async fn remediate(&self, component: &str) {
        let config = self.recovery_config();
        self.transition(
            RecoveryState::Degraded,
            &format!("component {} unhealthy", component),
        )
        .await;
        self.ctx
            .alerts
            .warning(
                component,
                "Remediation Started",
                "soft-restarting after health degradation",
            )
            .await;

        if self
            .commands
            .send(SupervisorCommand::SoftRestart {
                component: component.to_string(),
            })
            .await
            .is_err()
        {
            error!("Scheduler command channel closed during remediation");
            self.run_failover("remediation channel closed").await;
            return;
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(config.remediation_timeout_ms);
        let poll = Duration::from_millis(config.health_poll_ms);

        loop {
            if self.ctx.monitor.status(component).await == Some(HealthStatus::Healthy) {
                self.transition(
                    RecoveryState::Healthy,
                    &format!("remediation of {} succeeded", component),
                )
                .await;
                return;
            }
            if self.ctx.monitor.aggregate_status().await == HealthStatus::Failed {
                self.run_failover("aggregate status failed").await;
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                self.run_failover(&format!("remediation of {} timed out", component))
                    .await;
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Failover sequence: pause risk operations, restore from the newest
    /// checkpoint, re-verify health; retry from older checkpoints up to
    /// the attempt limit.
    async fn run_failover(&self, reason: &str) {
        let config = self.recovery_config();
        self.transition(RecoveryState::FailoverInProgress, reason).await;
        self.ctx
            .alerts
            .error("recovery", "Failover Initiated", reason)
            .await;

        if let Err(e) = self.ctx.risk.pause().await {
            error!("Risk pause failed: {}", e);
        }

        let checkpoints = self.ctx.backup.list().await;
        let mut attempt = 0u32;
        let mut next_checkpoint = 0usize;

        loop {
            if attempt >= config.max_failover_attempts {
                self.fail_permanent(&format!(
                    "recovery attempts exhausted after {} tries",
                    attempt
                ))
                .await;
                return;
            }
            attempt += 1;

            let Some(meta) = checkpoints.get(next_checkpoint) else {
                self.fail_permanent("no checkpoints left to restore").await;
                return;
            };
            next_checkpoint += 1;

            info!(
                "Failover attempt {}/{}: restoring checkpoint {} (tag: {})",
                attempt, config.max_failover_attempts, meta.id, meta.tag
            );

            let payload = match self.ctx.backup.restore(&meta.id).await {
                Ok(payload) => payload,
                Err(e) => {
                    // Integrity failures already raised an alert; move to
                    // the next-older checkpoint either way.
                    warn!("Restore of {} failed: {}", meta.id, e);
                    continue;
                }
            };

            if let Err(e) = self.ctx.source.apply(&payload).await {
                self.ctx
                    .alerts
                    .error(
                        "recovery",
                        "Restore Apply Failed",
                        &format!("checkpoint {}: {}", meta.id, e),
                    )
                    .await;
                continue;
            }

            let _ = self.commands.send(SupervisorCommand::RestartCritical).await;
            self.transition(
                RecoveryState::Recovering,
                &format!("restored checkpoint {}", meta.id),
            )
            .await;

            if self.verify(&config).await {
                if let Err(e) = self.ctx.risk.resume().await {
                    error!("Risk resume failed: {}", e);
                }
                self.transition(RecoveryState::Healthy, "verification passed")
                    .await;
                self.ctx
                    .alerts
                    .info(
                        "recovery",
                        "Recovery Complete",
                        &format!("restored from checkpoint {}", meta.id),
                    )
                    .await;
                return;
            }

            self.transition(
                RecoveryState::FailoverInProgress,
                "verification failed, retrying with older checkpoint",
            )
            .await;
        }
    }

    /// Wait for every critical component to report healthy within the
    /// verification window.
    async fn verify(&self, config: &RecoveryConfig) -> bool {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(config.verify_window_ms);
        let poll = Duration::from_millis(config.health_poll_ms);

        while tokio::time::Instant::now() < deadline {
            if self.ctx.monitor.all_critical_healthy().await {
                return true;
            }
            tokio::time::sleep(poll).await;
        }
        false
    }

    async fn fail_permanent(&self, reason: &str) {
        self.transition(RecoveryState::FailedPermanent, reason).await;
        // Pause stays active; the process remains alive for inspection.
        self.ctx
            .alerts
            .critical("recovery", "Recovery Exhausted", reason)
            .await;
    }

    async fn transition(&self, to: RecoveryState, reason: &str) {
        let mut state = self.state.write().await;
        let from = *state;
        if from == to {
            return;
        }
        if !edge_allowed(from, to) {
            error!(
                "Rejected recovery transition {} -> {} ({})",
                from, to, reason
            );
            return;
        }
        *state = to;
        info!("Recovery state: {} -> {} ({})", from, to, reason);

        let mut log = self.transitions.write().await;
        if log.len() >= TRANSITION_LOG_CAP {
            log.remove(0);
        }
        log.push(StateTransition {
            from,
            to,
            at: Utc::now(),
            reason: reason.to_string(),
        });
    }

    fn recovery_config(&self) -> RecoveryConfig {
        self.ctx.config.recovery.clone()
    }
}
