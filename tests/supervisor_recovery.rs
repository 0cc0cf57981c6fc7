//! End-to-end supervision scenarios: degradation, remediation, failover
//! with checkpoint restore, shutdown coalescing, and panic containment.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vigil::config::AppConfig;
use vigil::supervisor::RegistrySource;
use vigil::{
    Checkpointable, Component, ComponentRegistry, DaemonSupervisor, HealthStatus, LogAlertSink,
    MemoryStore, RecoveryOrchestrator, RecoveryState, RiskControl, SupervisorContext, TaskContext,
    Termination,
};

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.scheduler.tick_interval_ms = 10;
    config.scheduler.task_timeout_ms = 500;
    config.scheduler.backoff_base_ms = 5;
    config.scheduler.backoff_cap_ms = 20;
    config.recovery.remediation_timeout_ms = 1_000;
    config.recovery.verify_window_ms = 3_000;
    config.recovery.health_poll_ms = 10;
    config.recovery.max_failover_attempts = 3;
    // Keep the periodic cadence out of these scenarios.
    config.checkpoint.interval_secs = 3_600;
    config.shutdown.grace_ms = 2_000;
    config
}

/// Fails with a transient error while the counter is positive.
struct FlakyComponent {
    name: String,
    failures_left: AtomicU32,
}

impl FlakyComponent {
    fn new(name: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failures_left: AtomicU32::new(failures),
        })
    }
}

#[async_trait]
impl Component for FlakyComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &TaskContext) -> vigil::Result<()> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(vigil::VigilError::Transient("scripted failure".into()));
        }
        Ok(())
    }
}

/// Always succeeds.
struct SteadyComponent {
    name: String,
}

impl SteadyComponent {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Component for SteadyComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &TaskContext) -> vigil::Result<()> {
        Ok(())
    }
}

/// Fails while the shared flag is set; a soft restart alone cannot fix
/// it, only a state restore clears the flag.
struct GatedComponent {
    name: String,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl Component for GatedComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &TaskContext) -> vigil::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            Err(vigil::VigilError::Transient("state corrupted".into()))
        } else {
            Ok(())
        }
    }
}

/// Ignores cancellation and sleeps far past any grace deadline.
struct HangingComponent {
    name: String,
}

#[async_trait]
impl Component for HangingComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &TaskContext) -> vigil::Result<()> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(())
    }
}

/// Panics on every run.
struct PanickyComponent {
    name: String,
}

#[async_trait]
impl Component for PanickyComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &TaskContext) -> vigil::Result<()> {
        panic!("scripted panic");
    }
}

#[derive(Default)]
struct CountingRisk {
    paused: AtomicU32,
    resumed: AtomicU32,
}

#[async_trait]
impl RiskControl for CountingRisk {
    async fn pause(&self) -> vigil::Result<()> {
        self.paused.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> vigil::Result<()> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Snapshot source whose restore repairs the gated component's state.
struct RepairSource {
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl Checkpointable for RepairSource {
    async fn capture(&self) -> vigil::Result<Vec<u8>> {
        Ok(b"critical-state".to_vec())
    }

    async fn apply(&self, _payload: &[u8]) -> vigil::Result<()> {
        self.broken.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct Stack {
    ctx: Arc<SupervisorContext>,
    supervisor: Arc<DaemonSupervisor>,
    orchestrator: Arc<RecoveryOrchestrator>,
    registry: Arc<ComponentRegistry>,
    risk: Arc<CountingRisk>,
}

async fn build_stack(config: AppConfig, source: Arc<dyn Checkpointable>) -> Stack {
    let registry = Arc::new(ComponentRegistry::new());
    let risk = Arc::new(CountingRisk::default());
    let ctx = SupervisorContext::build(
        config,
        Arc::new(MemoryStore::new()),
        source,
        Arc::new(LogAlertSink),
        risk.clone(),
    )
    .await
    .expect("context should build over a memory store");
    let supervisor = Arc::new(DaemonSupervisor::new(ctx.clone(), registry.clone()));
    let orchestrator = Arc::new(RecoveryOrchestrator::new(
        ctx.clone(),
        supervisor.command_sender(),
    ));
    Stack {
        ctx,
        supervisor,
        orchestrator,
        registry,
        risk,
    }
}

fn spawn_run(stack: &Stack) -> tokio::task::JoinHandle<vigil::Result<Termination>> {
    let supervisor = stack.supervisor.clone();
    let orchestrator = stack.orchestrator.clone();
    tokio::spawn(async move { supervisor.run(orchestrator).await })
}

async fn wait_for<F, Fut>(condition: F, timeout: Duration, what: &str)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Wait until the orchestrator's transition log holds at least `count`
/// entries.
async fn wait_for_transitions(
    orchestrator: &Arc<RecoveryOrchestrator>,
    count: usize,
    timeout: Duration,
) {
    let orchestrator = orchestrator.clone();
    wait_for(
        move || {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.transitions().await.len() >= count }
        },
        timeout,
        "recovery transitions",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remediation_recovers_degraded_component() {
    let broken = Arc::new(AtomicBool::new(false));
    let stack = build_stack(test_config(), Arc::new(RepairSource { broken })).await;

    // A is critical and fails exactly 3 times (the degrade threshold);
    // B is critical and steady; C is non-critical and never succeeds.
    stack
        .supervisor
        .register(FlakyComponent::new("a", 3), Duration::from_millis(20), true)
        .await
        .unwrap();
    stack
        .supervisor
        .register(SteadyComponent::new("b"), Duration::from_millis(20), true)
        .await
        .unwrap();
    stack
        .supervisor
        .register(
            FlakyComponent::new("c", u32::MAX),
            Duration::from_millis(20),
            false,
        )
        .await
        .unwrap();

    let run = spawn_run(&stack);

    // The orchestrator degrades on A's third failure, soft-restarts it,
    // and A recovers within the remediation timeout.
    wait_for_transitions(&stack.orchestrator, 2, Duration::from_secs(5)).await;

    let transitions = stack.orchestrator.transitions().await;
    assert_eq!(transitions[0].from, RecoveryState::Healthy);
    assert_eq!(transitions[0].to, RecoveryState::Degraded);
    assert_eq!(transitions[1].from, RecoveryState::Degraded);
    assert_eq!(transitions[1].to, RecoveryState::Healthy);
    assert_eq!(stack.orchestrator.state().await, RecoveryState::Healthy);

    // Remediation reset A's failure counter and never escalated.
    assert_eq!(stack.registry.restart_count("a").await, Some(0));
    assert_eq!(stack.risk.paused.load(Ordering::SeqCst), 0);
    assert_eq!(
        stack.ctx.monitor.status("a").await,
        Some(HealthStatus::Healthy)
    );

    // C keeps failing but is non-critical: the aggregate ignores it.
    {
        let ctx = stack.ctx.clone();
        wait_for(
            move || {
                let ctx = ctx.clone();
                async move { ctx.monitor.status("c").await == Some(HealthStatus::Failed) }
            },
            Duration::from_secs(5),
            "non-critical component to fail",
        )
        .await;
    }
    assert_eq!(
        stack.ctx.monitor.aggregate_status().await,
        HealthStatus::Healthy
    );

    stack.ctx.shutdown.request_shutdown("test complete").await;
    let termination = run.await.unwrap().unwrap();
    assert_eq!(termination, Termination::Clean);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failover_restores_checkpoint_and_resumes() {
    let broken = Arc::new(AtomicBool::new(false));
    let mut config = test_config();
    // Soft restarts cannot fix corrupted state; time out quickly.
    config.recovery.remediation_timeout_ms = 150;

    let stack = build_stack(
        config,
        Arc::new(RepairSource {
            broken: broken.clone(),
        }),
    )
    .await;

    stack
        .supervisor
        .register(
            Arc::new(GatedComponent {
                name: "a".to_string(),
                broken: broken.clone(),
            }),
            Duration::from_millis(20),
            true,
        )
        .await
        .unwrap();
    stack
        .supervisor
        .register(SteadyComponent::new("b"), Duration::from_millis(20), true)
        .await
        .unwrap();

    // Baseline checkpoint of the healthy state.
    stack.ctx.backup.create("baseline").await.unwrap();

    let run = spawn_run(&stack);

    // Let A heartbeat while healthy, then corrupt its state.
    {
        let ctx = stack.ctx.clone();
        wait_for(
            move || {
                let ctx = ctx.clone();
                async move { ctx.monitor.last_heartbeat("a").await.is_some() }
            },
            Duration::from_secs(5),
            "first heartbeat from a",
        )
        .await;
    }
    broken.store(true, Ordering::SeqCst);

    // Remediation times out, failover restores the baseline checkpoint
    // (repairing the state), health verifies, and risk ops resume.
    {
        let orchestrator = stack.orchestrator.clone();
        let risk = stack.risk.clone();
        wait_for(
            move || {
                let orchestrator = orchestrator.clone();
                let risk = risk.clone();
                async move {
                    orchestrator.state().await == RecoveryState::Healthy
                        && risk.resumed.load(Ordering::SeqCst) >= 1
                }
            },
            Duration::from_secs(10),
            "failover to complete",
        )
        .await;
    }

    assert_eq!(stack.risk.paused.load(Ordering::SeqCst), 1);
    assert_eq!(stack.risk.resumed.load(Ordering::SeqCst), 1);
    assert!(!broken.load(Ordering::SeqCst));

    // The transition log walks every edge of the failover path and never
    // jumps from healthy straight into failover.
    let transitions = stack.orchestrator.transitions().await;
    for window in transitions.windows(2) {
        assert_eq!(window[0].to, window[1].from, "transition log has a gap");
    }
    assert!(!transitions
        .iter()
        .any(|t| t.from == RecoveryState::Healthy && t.to == RecoveryState::FailoverInProgress));
    let path: Vec<(RecoveryState, RecoveryState)> =
        transitions.iter().map(|t| (t.from, t.to)).collect();
    assert!(path.contains(&(RecoveryState::Healthy, RecoveryState::Degraded)));
    assert!(path.contains(&(RecoveryState::Degraded, RecoveryState::FailoverInProgress)));
    assert!(path.contains(&(RecoveryState::FailoverInProgress, RecoveryState::Recovering)));
    assert!(path.contains(&(RecoveryState::Recovering, RecoveryState::Healthy)));

    stack.ctx.shutdown.request_shutdown("test complete").await;
    let termination = run.await.unwrap().unwrap();
    assert_eq!(termination, Termination::Clean);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_shutdown_requests_run_one_sequence() {
    let broken = Arc::new(AtomicBool::new(false));
    let stack = build_stack(test_config(), Arc::new(RepairSource { broken })).await;

    stack
        .supervisor
        .register(
            SteadyComponent::new("worker"),
            Duration::from_millis(20),
            true,
        )
        .await
        .unwrap();

    let run = spawn_run(&stack);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let first = {
        let ctx = stack.ctx.clone();
        tokio::spawn(async move { ctx.shutdown.request_shutdown("first").await })
    };
    let second = {
        let ctx = stack.ctx.clone();
        tokio::spawn(async move { ctx.shutdown.request_shutdown("second").await })
    };
    first.await.unwrap();
    second.await.unwrap();

    let termination = run.await.unwrap().unwrap();
    assert_eq!(termination, Termination::Clean);

    // Exactly one shutdown sequence ran: one final checkpoint exists.
    let checkpoints = stack.ctx.backup.list().await;
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].tag, "shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hanging_task_is_abandoned_past_grace_deadline() {
    let broken = Arc::new(AtomicBool::new(false));
    let mut config = test_config();
    config.shutdown.grace_ms = 100;
    // Keep the per-task deadline far out so the hang survives into drain.
    config.scheduler.task_timeout_ms = 60_000;

    let stack = build_stack(config, Arc::new(RepairSource { broken })).await;
    stack
        .supervisor
        .register(
            Arc::new(HangingComponent {
                name: "sleeper".to_string(),
            }),
            Duration::from_millis(20),
            false,
        )
        .await
        .unwrap();

    let run = spawn_run(&stack);

    // Let the sleeper get in flight, then pull the plug.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stack.ctx.shutdown.request_shutdown("operator stop").await;

    let termination = run.await.unwrap().unwrap();
    match termination {
        Termination::Forced { abandoned } => {
            assert_eq!(abandoned, vec!["sleeper".to_string()]);
            assert_eq!(Termination::Forced { abandoned }.exit_code(), 2);
        }
        Termination::Clean => panic!("expected forced termination"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn component_panic_is_contained() {
    let broken = Arc::new(AtomicBool::new(false));
    let stack = build_stack(test_config(), Arc::new(RepairSource { broken })).await;

    stack
        .supervisor
        .register(
            Arc::new(PanickyComponent {
                name: "panicky".to_string(),
            }),
            Duration::from_millis(20),
            false,
        )
        .await
        .unwrap();
    stack
        .supervisor
        .register(
            SteadyComponent::new("worker"),
            Duration::from_millis(20),
            true,
        )
        .await
        .unwrap();

    let run = spawn_run(&stack);

    // The panic becomes a fatal outcome for that component only.
    {
        let ctx = stack.ctx.clone();
        wait_for(
            move || {
                let ctx = ctx.clone();
                async move { ctx.monitor.status("panicky").await == Some(HealthStatus::Failed) }
            },
            Duration::from_secs(5),
            "panicking component to be marked failed",
        )
        .await;
    }

    // The rest of the system keeps running.
    let before = stack.ctx.monitor.last_heartbeat("worker").await;
    {
        let ctx = stack.ctx.clone();
        wait_for(
            move || {
                let ctx = ctx.clone();
                async move { ctx.monitor.last_heartbeat("worker").await > before }
            },
            Duration::from_secs(5),
            "steady component to keep heartbeating",
        )
        .await;
    }

    stack.ctx.shutdown.request_shutdown("test complete").await;
    let termination = run.await.unwrap().unwrap();
    assert_eq!(termination, Termination::Clean);
}

/// The daemon's own registry state checkpoints through the backup
/// manager: capture, hash-verified restore, apply.
#[tokio::test]
async fn registry_snapshot_roundtrips_through_backup() {
    let registry = Arc::new(ComponentRegistry::new());
    let source = Arc::new(RegistrySource::new(registry.clone()));
    let backup = vigil::BackupManager::open(
        Arc::new(MemoryStore::new()),
        source.clone(),
        Arc::new(vigil::AlertDispatcher::new(Arc::new(LogAlertSink))),
    )
    .await
    .unwrap();

    let meta = backup.create("registry").await.unwrap();
    let payload = backup.restore(&meta.id).await.unwrap();
    assert_eq!(payload.len() as u64, meta.size);
    source.apply(&payload).await.unwrap();
}
