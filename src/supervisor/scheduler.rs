//! Daemon Supervisor
//!
//! Top-level scheduler: owns the component registry and the run loop,
//! invokes components on their cadence through a bounded worker pool,
//! reports outcomes to the heartbeat monitor, and drives the shutdown
//! drain sequence. A component panic is contained at the task boundary
//! and becomes a failed outcome for that component only.

use crate::component::{Checkpointable, Component, TaskContext, TaskOutcome};
use crate::config::SchedulerConfig;
use crate::context::SupervisorContext;
use crate::coordination::shutdown::{ShutdownPhase, Termination};
use crate::error::{Result, VigilError};
use crate::persistence::checkpoint::RetentionPolicy;
use crate::supervisor::heartbeat::ProbeOutcome;
use crate::supervisor::orchestrator::RecoveryOrchestrator;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands the remediation path sends into the scheduler loop, keeping
/// the registry single-writer.
#[derive(Debug, Clone)]
pub enum SupervisorCommand {
    /// Reset a component's backoff and force an immediate re-run
    SoftRestart { component: String },
    /// Soft-restart every critical component (post-restore)
    RestartCritical,
}

struct Registration {
    component: Arc<dyn Component>,
    interval: Duration,
    critical: bool,
    restart_count: u32,
    backoff_exp: u32,
    backoff_until: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    next_due: DateTime<Utc>,
    force_next: bool,
    running: bool,
}

/// Externally visible registration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub name: String,
    pub interval_secs: u64,
    pub critical: bool,
    pub restart_count: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub backoff_until: Option<DateTime<Utc>>,
}

/// Persisted registry state carried in checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub components: Vec<ComponentSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub name: String,
    pub restart_count: u32,
    pub last_success: Option<DateTime<Utc>>,
}

struct DueTask {
    name: String,
    component: Arc<dyn Component>,
}

/// Component registration table. Mutated only by the scheduler loop and
/// by remediation commands routed through it.
pub struct ComponentRegistry {
    inner: RwLock<HashMap<String, Registration>>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    async fn insert(
        &self,
        component: Arc<dyn Component>,
        interval: Duration,
        critical: bool,
    ) -> Result<()> {
        let name = component.name().to_string();
        let mut inner = self.inner.write().await;
        if inner.contains_key(&name) {
            return Err(VigilError::DuplicateComponent(name));
        }
        inner.insert(
            name.clone(),
            Registration {
                component,
                interval,
                critical,
                restart_count: 0,
                backoff_exp: 0,
                backoff_until: None,
                last_run: None,
                last_success: None,
                next_due: Utc::now(),
                force_next: false,
                running: false,
            },
        );
        debug!(
            "Registered component {} (interval: {:?}, critical: {})",
            name, interval, critical
        );
        Ok(())
    }

    /// Claim every component due at `now`, marking it in-flight.
    async fn claim_due(&self, now: DateTime<Utc>) -> Vec<DueTask> {
        let mut inner = self.inner.write().await;
        let mut due = Vec::new();
        for (name, reg) in inner.iter_mut() {
            if reg.running || now < reg.next_due {
                continue;
            }
            if let Some(until) = reg.backoff_until {
                if now < until {
                    continue;
                }
            }
            reg.running = true;
            reg.force_next = false;
            reg.last_run = Some(now);
            due.push(DueTask {
                name: name.clone(),
                component: Arc::clone(&reg.component),
            });
        }
        due
    }

    /// Return a claimed component without running it (no pool slot free).
    async fn release(&self, name: &str) {
        let mut inner = self.inner.write().await;
        if let Some(reg) = inner.get_mut(name) {
            reg.running = false;
        }
    }

    /// Record a finished run and schedule the next one.
    async fn complete(&self, name: &str, outcome: &TaskOutcome, config: &SchedulerConfig) {
        let mut inner = self.inner.write().await;
        let Some(reg) = inner.get_mut(name) else {
            return;
        };
        let now = Utc::now();
        reg.running = false;
        reg.next_due = if reg.force_next {
            reg.force_next = false;
            now
        } else {
            now + chrono::Duration::from_std(reg.interval).unwrap_or_else(|_| chrono::Duration::zero())
        };

        match outcome {
            TaskOutcome::Success => {
                reg.last_success = Some(now);
                reg.backoff_exp = 0;
                reg.backoff_until = None;
            }
            TaskOutcome::Cancelled => {}
            _ => {
                reg.restart_count += 1;
                reg.backoff_exp = (reg.backoff_exp + 1).min(16);
                let delay = backoff_delay(config, reg.backoff_exp);
                reg.backoff_until = Some(now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
            }
        }
    }

    /// Reset a component's backoff and force an immediate re-run.
    async fn soft_restart(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let reg = inner
            .get_mut(name)
            .ok_or_else(|| VigilError::UnknownComponent(name.to_string()))?;
        reg.restart_count = 0;
        reg.backoff_exp = 0;
        reg.backoff_until = None;
        reg.next_due = Utc::now();
        // A run currently in flight keeps the slot; re-run right after.
        reg.force_next = reg.running;
        info!("Soft restart scheduled for {}", name);
        Ok(())
    }

    async fn soft_restart_critical(&self) {
        let names: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .iter()
                .filter(|(_, reg)| reg.critical)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in names {
            let _ = self.soft_restart(&name).await;
        }
    }

    /// Snapshot of the mutable registry state, for checkpointing.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read().await;
        let mut components: Vec<ComponentSnapshot> = inner
            .iter()
            .map(|(name, reg)| ComponentSnapshot {
                name: name.clone(),
                restart_count: reg.restart_count,
                last_success: reg.last_success,
            })
            .collect();
        components.sort_by(|a, b| a.name.cmp(&b.name));
        RegistrySnapshot {
            taken_at: Utc::now(),
            components,
        }
    }

    /// Re-seed registry counters from a restored snapshot. Components not
    /// present in the snapshot are left untouched.
    pub async fn apply_snapshot(&self, snapshot: &RegistrySnapshot) {
        let mut inner = self.inner.write().await;
        for entry in &snapshot.components {
            if let Some(reg) = inner.get_mut(&entry.name) {
                reg.restart_count = entry.restart_count;
                reg.last_success = entry.last_success;
            }
        }
    }

    /// Registration details for every component.
    pub async fn info(&self) -> Vec<RegistrationInfo> {
        let inner = self.inner.read().await;
        let mut info: Vec<RegistrationInfo> = inner
            .iter()
            .map(|(name, reg)| RegistrationInfo {
                name: name.clone(),
                interval_secs: reg.interval.as_secs(),
                critical: reg.critical,
                restart_count: reg.restart_count,
                last_success: reg.last_success,
                backoff_until: reg.backoff_until,
            })
            .collect();
        info.sort_by(|a, b| a.name.cmp(&b.name));
        info
    }

    pub async fn restart_count(&self, name: &str) -> Option<u32> {
        let inner = self.inner.read().await;
        inner.get(name).map(|r| r.restart_count)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Checkpointable adapter over the registry: the daemon's own critical
/// mutable state (restart counters, last successes).
pub struct RegistrySource {
    registry: Arc<ComponentRegistry>,
}

impl RegistrySource {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Checkpointable for RegistrySource {
    async fn capture(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.registry.snapshot().await)?)
    }

    async fn apply(&self, payload: &[u8]) -> Result<()> {
        let snapshot: RegistrySnapshot = serde_json::from_slice(payload)?;
        self.registry.apply_snapshot(&snapshot).await;
        Ok(())
    }
}

/// Exponential backoff capped at the configured ceiling, with up to 10%
/// jitter so retries do not align.
fn backoff_delay(config: &SchedulerConfig, exp: u32) -> Duration {
    let base = config.backoff_base_ms.max(1);
    let raw = base.saturating_mul(1u64 << (exp.saturating_sub(1)).min(20));
    let capped = raw.min(config.backoff_cap_ms);
    let jitter = if capped >= 10 {
        rand::thread_rng().gen_range(0..=capped / 10)
    } else {
        0
    };
    Duration::from_millis(capped + jitter)
}

/// Top-level scheduler. `run` blocks until shutdown.
pub struct DaemonSupervisor {
    ctx: Arc<SupervisorContext>,
    registry: Arc<ComponentRegistry>,
    command_tx: mpsc::Sender<SupervisorCommand>,
    command_rx: std::sync::Mutex<Option<mpsc::Receiver<SupervisorCommand>>>,
    /// Root cancellation for in-flight component tasks.
    task_cancel: CancellationToken,
}

impl DaemonSupervisor {
    pub fn new(ctx: Arc<SupervisorContext>, registry: Arc<ComponentRegistry>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        Self {
            ctx,
            registry,
            command_tx,
            command_rx: std::sync::Mutex::new(Some(command_rx)),
            task_cancel: CancellationToken::new(),
        }
    }

    /// Add a component to the schedule.
    pub async fn register(
        &self,
        component: Arc<dyn Component>,
        interval: Duration,
        critical: bool,
    ) -> Result<()> {
        let name = component.name().to_string();
        self.registry.insert(component, interval, critical).await?;
        self.ctx.monitor.register(&name, critical).await;
        Ok(())
    }

    /// Sender for remediation commands into the scheduler loop.
    pub fn command_sender(&self) -> mpsc::Sender<SupervisorCommand> {
        self.command_tx.clone()
    }

    pub fn registry(&self) -> Arc<ComponentRegistry> {
        Arc::clone(&self.registry)
    }

    /// Request termination.
    pub async fn stop(&self, reason: &str) {
        self.ctx.shutdown.request_shutdown(reason).await;
    }

    /// Run the scheduling loop until shutdown, then drain. Returns how
    /// the process ended.
    pub async fn run(&self, orchestrator: Arc<RecoveryOrchestrator>) -> Result<Termination> {
        let mut commands = self
            .command_rx
            .lock()
            .expect("command receiver mutex poisoned")
            .take()
            .ok_or_else(|| VigilError::Internal("supervisor is already running".to_string()))?;

        let trigger = self.ctx.shutdown.trigger();
        let scheduler = self.ctx.config.scheduler.clone();

        let background = CancellationToken::new();
        let orch_handle = {
            let orchestrator = Arc::clone(&orchestrator);
            let cancel = background.child_token();
            tokio::spawn(async move { orchestrator.run(cancel).await })
        };
        let checkpoint_handle = self.ctx.backup.spawn_periodic(
            Duration::from_secs(self.ctx.config.checkpoint.interval_secs),
            RetentionPolicy {
                keep_recent: self.ctx.config.checkpoint.keep_recent,
                keep_daily: self.ctx.config.checkpoint.keep_daily,
            },
            background.child_token(),
        );

        let semaphore = Arc::new(Semaphore::new(scheduler.worker_pool_size));
        let mut tasks: JoinSet<(String, TaskOutcome)> = JoinSet::new();
        let mut inflight: HashMap<tokio::task::Id, String> = HashMap::new();

        let mut tick = tokio::time::interval(Duration::from_millis(scheduler.tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            "Supervisor started ({} components, pool: {})",
            self.registry.len().await,
            scheduler.worker_pool_size
        );

        loop {
            tokio::select! {
                _ = trigger.cancelled() => break,
                _ = tick.tick() => {
                    self.dispatch_due(&scheduler, &semaphore, &mut tasks, &mut inflight).await;
                }
                Some(cmd) = commands.recv() => {
                    self.handle_command(cmd).await;
                }
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    self.handle_join(joined, &scheduler, &mut inflight).await;
                }
            }
        }

        // Drain sequence: stop admitting, cancel, wait out the grace
        // deadline, abandon stragglers, final checkpoint.
        let reason = self
            .ctx
            .shutdown
            .active_request()
            .await
            .map(|r| r.reason)
            .unwrap_or_else(|| "unknown".to_string());
        info!("Draining {} in-flight tasks ({})", tasks.len(), reason);

        self.ctx.shutdown.set_phase(ShutdownPhase::Draining);
        background.cancel();

        self.ctx.shutdown.set_phase(ShutdownPhase::Cancelling);
        self.task_cancel.cancel();

        let grace = self.ctx.shutdown.grace();
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next_with_id().await {
                self.handle_join(joined, &scheduler, &mut inflight).await;
            }
        })
        .await;

        let abandoned: Vec<String> = if drained.is_err() {
            let names: Vec<String> = inflight.values().cloned().collect();
            for name in &names {
                warn!("Residual task {} ignored cancellation, abandoning", name);
            }
            self.ctx
                .alerts
                .warning(
                    "supervisor",
                    "Residual Tasks Abandoned",
                    &format!("grace deadline exceeded by: {}", names.join(", ")),
                )
                .await;
            tasks.abort_all();
            names
        } else {
            Vec::new()
        };

        self.ctx.shutdown.set_phase(ShutdownPhase::Checkpointing);
        match self.ctx.backup.create("shutdown").await {
            Ok(meta) => info!("Final checkpoint {} created", meta.id),
            Err(e) => warn!("Final checkpoint failed: {}", e),
        }

        let _ = orch_handle.await;
        let _ = checkpoint_handle.await;

        self.ctx.shutdown.set_phase(ShutdownPhase::Complete);

        let termination = if abandoned.is_empty() {
            Termination::Clean
        } else {
            Termination::Forced { abandoned }
        };
        info!("Supervisor stopped: {:?}", termination);
        Ok(termination)
    }

    async fn dispatch_due(
        &self,
        scheduler: &SchedulerConfig,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<(String, TaskOutcome)>,
        inflight: &mut HashMap<tokio::task::Id, String>,
    ) {
        let now = Utc::now();
        for due in self.registry.claim_due(now).await {
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                // Pool exhausted; the component stays due for the next tick.
                self.registry.release(&due.name).await;
                continue;
            };

            let timeout = Duration::from_millis(scheduler.task_timeout_ms);
            let deadline = now + chrono::Duration::milliseconds(scheduler.task_timeout_ms as i64);
            let task_ctx = TaskContext::new(self.task_cancel.child_token(), deadline);
            let component = due.component;
            let name = due.name.clone();

            let handle = tasks.spawn(async move {
                let _permit = permit;
                let outcome = match tokio::time::timeout(timeout, component.run(&task_ctx)).await {
                    Ok(result) => TaskOutcome::from_result(result),
                    Err(_) => TaskOutcome::Timeout,
                };
                (name, outcome)
            });
            inflight.insert(handle.id(), due.name);
        }
    }

    async fn handle_join(
        &self,
        joined: std::result::Result<(tokio::task::Id, (String, TaskOutcome)), tokio::task::JoinError>,
        scheduler: &SchedulerConfig,
        inflight: &mut HashMap<tokio::task::Id, String>,
    ) {
        let (name, outcome) = match joined {
            Ok((id, (name, outcome))) => {
                inflight.remove(&id);
                (name, outcome)
            }
            Err(join_error) => {
                let name = inflight
                    .remove(&join_error.id())
                    .unwrap_or_else(|| "unknown".to_string());
                if join_error.is_panic() {
                    // Contained: the panic dies with the worker task.
                    (name, TaskOutcome::Fatal("task panicked".to_string()))
                } else {
                    (name, TaskOutcome::Cancelled)
                }
            }
        };
        self.complete(&name, outcome, scheduler).await;
    }

    async fn complete(&self, name: &str, outcome: TaskOutcome, scheduler: &SchedulerConfig) {
        let now = Utc::now();
        match &outcome {
            TaskOutcome::Success => {
                debug!("Component {} succeeded", name);
                self.ctx.monitor.record(name, ProbeOutcome::success(now)).await;
            }
            TaskOutcome::Cancelled => {
                debug!("Component {} cancelled", name);
            }
            TaskOutcome::Fatal(message) => {
                error!("Component {} fatal failure: {}", name, message);
                self.ctx
                    .alerts
                    .error(name, "Component Fatal Failure", message)
                    .await;
                self.ctx.monitor.record(name, ProbeOutcome::fatal(now)).await;
            }
            other => {
                warn!("Component {} failed: {}", name, other);
                self.ctx.monitor.record(name, ProbeOutcome::failure(now)).await;
            }
        }
        self.registry.complete(name, &outcome, scheduler).await;
    }

    async fn handle_command(&self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::SoftRestart { component } => {
                if let Err(e) = self.registry.soft_restart(&component).await {
                    warn!("Soft restart of {} failed: {}", component, e);
                }
            }
            SupervisorCommand::RestartCritical => {
                info!("Soft-restarting all critical components");
                self.registry.soft_restart_critical().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VigilError;
    use async_trait::async_trait;

    struct NoopComponent {
        name: String,
    }

    #[async_trait]
    impl Component for NoopComponent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _ctx: &TaskContext) -> Result<()> {
            Ok(())
        }
    }

    fn noop(name: &str) -> Arc<dyn Component> {
        Arc::new(NoopComponent {
            name: name.to_string(),
        })
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicate_names() {
        let registry = ComponentRegistry::new();
        registry
            .insert(noop("worker"), Duration::from_secs(1), true)
            .await
            .unwrap();

        let err = registry
            .insert(noop("worker"), Duration::from_secs(5), false)
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::DuplicateComponent(_)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_claim_due_marks_running_and_release_undoes() {
        let registry = ComponentRegistry::new();
        registry
            .insert(noop("worker"), Duration::from_secs(1), true)
            .await
            .unwrap();

        let due = registry.claim_due(Utc::now()).await;
        assert_eq!(due.len(), 1);

        // Claimed components are not due again until completed.
        assert!(registry.claim_due(Utc::now()).await.is_empty());

        registry.release("worker").await;
        assert_eq!(registry.claim_due(Utc::now()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_failure_sets_backoff() {
        let registry = ComponentRegistry::new();
        let config = SchedulerConfig::default();
        registry
            .insert(noop("worker"), Duration::from_millis(10), true)
            .await
            .unwrap();

        let _ = registry.claim_due(Utc::now()).await;
        registry
            .complete("worker", &TaskOutcome::Transient("net".into()), &config)
            .await;

        let info = registry.info().await;
        assert_eq!(info[0].restart_count, 1);
        assert!(info[0].backoff_until.is_some());

        // Backoff holds the component back even past its interval.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.claim_due(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_success_clears_backoff() {
        let registry = ComponentRegistry::new();
        let config = SchedulerConfig::default();
        registry
            .insert(noop("worker"), Duration::from_millis(1), true)
            .await
            .unwrap();

        let _ = registry.claim_due(Utc::now()).await;
        registry
            .complete("worker", &TaskOutcome::Transient("net".into()), &config)
            .await;
        let _ = registry.soft_restart("worker").await;
        let _ = registry.claim_due(Utc::now()).await;
        registry.complete("worker", &TaskOutcome::Success, &config).await;

        let info = registry.info().await;
        assert_eq!(info[0].backoff_until, None);
        assert!(info[0].last_success.is_some());
    }

    #[tokio::test]
    async fn test_soft_restart_resets_and_forces_due() {
        let registry = ComponentRegistry::new();
        let config = SchedulerConfig::default();
        registry
            .insert(noop("worker"), Duration::from_secs(3600), true)
            .await
            .unwrap();

        let _ = registry.claim_due(Utc::now()).await;
        registry
            .complete("worker", &TaskOutcome::Transient("net".into()), &config)
            .await;
        // Next run is an hour out, behind backoff as well.
        assert!(registry.claim_due(Utc::now()).await.is_empty());

        registry.soft_restart("worker").await.unwrap();
        assert_eq!(registry.restart_count("worker").await, Some(0));
        assert_eq!(registry.claim_due(Utc::now()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_soft_restart_unknown_component() {
        let registry = ComponentRegistry::new();
        assert!(matches!(
            registry.soft_restart("ghost").await.unwrap_err(),
            VigilError::UnknownComponent(_)
        ));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let registry = ComponentRegistry::new();
        let config = SchedulerConfig::default();
        registry
            .insert(noop("a"), Duration::from_secs(1), true)
            .await
            .unwrap();
        registry
            .insert(noop("b"), Duration::from_secs(1), false)
            .await
            .unwrap();

        let _ = registry.claim_due(Utc::now()).await;
        registry
            .complete("a", &TaskOutcome::Transient("net".into()), &config)
            .await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.components.len(), 2);

        // A fresh registry picks the counters back up.
        let restored = ComponentRegistry::new();
        restored
            .insert(noop("a"), Duration::from_secs(1), true)
            .await
            .unwrap();
        restored
            .insert(noop("b"), Duration::from_secs(1), false)
            .await
            .unwrap();
        restored.apply_snapshot(&snapshot).await;
        assert_eq!(restored.restart_count("a").await, Some(1));
        assert_eq!(restored.restart_count("b").await, Some(0));
    }

    #[test]
    fn test_backoff_delay_caps_and_grows() {
        let config = SchedulerConfig {
            backoff_base_ms: 100,
            backoff_cap_ms: 1_000,
            ..Default::default()
        };

        let first = backoff_delay(&config, 1);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(110));

        // Far past the cap, jitter included.
        let capped = backoff_delay(&config, 12);
        assert!(capped >= Duration::from_millis(1_000));
        assert!(capped <= Duration::from_millis(1_100));
    }
}
