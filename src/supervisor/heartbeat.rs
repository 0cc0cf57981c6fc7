//! Heartbeat Monitor
//!
//! Tracks liveness of each registered component and converts raw
//! success/failure outcomes into a debounced health status. Status
//! transitions use hysteresis so a single marginal outcome cannot flap a
//! component between states.

use crate::config::HeartbeatConfig;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Debounced per-component liveness classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One heartbeat: a timestamped success/failure outcome.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    pub success: bool,
    /// Fatal-classified failures bypass the DEGRADED debounce.
    pub fatal: bool,
    pub timestamp: DateTime<Utc>,
}

impl ProbeOutcome {
    pub fn success(timestamp: DateTime<Utc>) -> Self {
        Self {
            success: true,
            fatal: false,
            timestamp,
        }
    }

    pub fn failure(timestamp: DateTime<Utc>) -> Self {
        Self {
            success: false,
            fatal: false,
            timestamp,
        }
    }

    pub fn fatal(timestamp: DateTime<Utc>) -> Self {
        Self {
            success: false,
            fatal: true,
            timestamp,
        }
    }
}

/// Emitted once per status transition, in the order transitions occurred.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub component: String,
    pub critical: bool,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub at: DateTime<Utc>,
}

/// Externally visible health report for one component.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub critical: bool,
    pub status: HealthStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Success share over the recent outcome window, 1.0 when empty.
    pub window_success_rate: f64,
}

struct TrackedComponent {
    critical: bool,
    status: HealthStatus,
    window: VecDeque<ProbeOutcome>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Timestamp of the last successful heartbeat. Only moves forward.
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Health-status table. Single owner of all status state; other
/// components read via [`HeartbeatMonitor::status`] or the event stream,
/// never by direct mutation.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    components: RwLock<HashMap<String, TrackedComponent>>,
    event_tx: tokio::sync::broadcast::Sender<HealthEvent>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(256);
        Self {
            config,
            components: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HeartbeatConfig::default())
    }

    /// Subscribe to status-change events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<HealthEvent> {
        self.event_tx.subscribe()
    }

    /// Register a component. Registration is idempotent and resets
    /// nothing for an already-known name.
    pub async fn register(&self, name: &str, critical: bool) {
        let mut components = self.components.write().await;
        components.entry(name.to_string()).or_insert_with(|| {
            debug!("Monitoring component {} (critical: {})", name, critical);
            TrackedComponent {
                critical,
                status: HealthStatus::Healthy,
                window: VecDeque::with_capacity(16),
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_heartbeat: None,
            }
        });
    }

    /// Record one outcome for a component and apply the hysteresis rules.
    pub async fn record(&self, name: &str, outcome: ProbeOutcome) {
        let mut components = self.components.write().await;
        let Some(tracked) = components.get_mut(name) else {
            warn!("Heartbeat for unregistered component {}", name);
            return;
        };

        tracked.window.push_back(outcome);
        while tracked.window.len() > self.config.window_size {
            tracked.window.pop_front();
        }

        if outcome.success {
            tracked.consecutive_failures = 0;
            tracked.consecutive_successes += 1;
            // Heartbeat timestamps are monotonically non-decreasing.
            tracked.last_heartbeat = Some(match tracked.last_heartbeat {
                Some(prev) if prev > outcome.timestamp => prev,
                _ => outcome.timestamp,
            });
        } else {
            tracked.consecutive_successes = 0;
            tracked.consecutive_failures += 1;
        }

        let from = tracked.status;
        let to = self.next_status(tracked, outcome);
        if from != to {
            tracked.status = to;
            let event = HealthEvent {
                component: name.to_string(),
                critical: tracked.critical,
                from,
                to,
                at: outcome.timestamp,
            };
            info!("Component {} health: {} -> {}", name, from, to);
            let _ = self.event_tx.send(event);
        }
    }

    fn next_status(&self, tracked: &TrackedComponent, outcome: ProbeOutcome) -> HealthStatus {
        if !outcome.success && outcome.fatal {
            return HealthStatus::Failed;
        }

        let degrade_at = self.config.degrade_threshold;
        let fail_at = self.config.degrade_threshold + self.config.fail_threshold;

        match tracked.status {
            HealthStatus::Healthy => {
                if tracked.consecutive_failures >= degrade_at {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
            HealthStatus::Degraded => {
                if tracked.consecutive_failures >= fail_at {
                    HealthStatus::Failed
                } else if tracked.consecutive_successes >= self.config.recover_threshold {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                }
            }
            HealthStatus::Failed => {
                if tracked.consecutive_successes >= self.config.recover_threshold {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Failed
                }
            }
        }
    }

    /// Current status for one component.
    pub async fn status(&self, name: &str) -> Option<HealthStatus> {
        let components = self.components.read().await;
        components.get(name).map(|c| c.status)
    }

    /// Aggregate system status: the worst status across critical
    /// components only. Non-critical components never degrade the
    /// aggregate.
    pub async fn aggregate_status(&self) -> HealthStatus {
        let components = self.components.read().await;
        components
            .values()
            .filter(|c| c.critical)
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Whether every critical component currently reports healthy.
    pub async fn all_critical_healthy(&self) -> bool {
        self.aggregate_status().await == HealthStatus::Healthy
    }

    /// Health report for every registered component.
    pub async fn report(&self) -> Vec<ComponentHealth> {
        let components = self.components.read().await;
        let mut report: Vec<ComponentHealth> = components
            .iter()
            .map(|(name, c)| ComponentHealth {
                name: name.clone(),
                critical: c.critical,
                status: c.status,
                last_heartbeat: c.last_heartbeat,
                consecutive_failures: c.consecutive_failures,
                window_success_rate: if c.window.is_empty() {
                    1.0
                } else {
                    let successes = c.window.iter().filter(|o| o.success).count();
                    successes as f64 / c.window.len() as f64
                },
            })
            .collect();
        report.sort_by(|a, b| a.name.cmp(&b.name));
        report
    }

    /// Last successful heartbeat for a component.
    pub async fn last_heartbeat(&self, name: &str) -> Option<DateTime<Utc>> {
        let components = self.components.read().await;
        components.get(name).and_then(|c| c.last_heartbeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        // Defaults: degrade after 3, fail after 3+2, recover after 2.
        HeartbeatMonitor::with_defaults()
    }

    async fn inject(monitor: &HeartbeatMonitor, name: &str, script: &str) {
        for c in script.chars() {
            let outcome = match c {
                's' => ProbeOutcome::success(Utc::now()),
                'f' => ProbeOutcome::failure(Utc::now()),
                'F' => ProbeOutcome::fatal(Utc::now()),
                _ => unreachable!(),
            };
            monitor.record(name, outcome).await;
        }
    }

    #[tokio::test]
    async fn test_degrades_after_n_consecutive_failures() {
        let m = monitor();
        m.register("a", true).await;

        inject(&m, "a", "ff").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Healthy));

        inject(&m, "a", "f").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Degraded));
    }

    #[tokio::test]
    async fn test_fails_after_n_plus_m_consecutive_failures() {
        let m = monitor();
        m.register("a", true).await;

        inject(&m, "a", "ffff").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Degraded));

        inject(&m, "a", "f").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Failed));
    }

    #[tokio::test]
    async fn test_fatal_outcome_fails_immediately() {
        let m = monitor();
        m.register("a", true).await;

        inject(&m, "a", "F").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Failed));
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter_but_needs_k_to_recover() {
        let m = monitor();
        m.register("a", true).await;

        inject(&m, "a", "fff").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Degraded));

        // One success is not enough to return to healthy.
        inject(&m, "a", "s").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Degraded));

        // But the failure streak restarted: 3 more needed to fail.
        inject(&m, "a", "ff").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Degraded));

        inject(&m, "a", "ss").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_failed_recovers_after_k_successes() {
        let m = monitor();
        m.register("a", true).await;

        inject(&m, "a", "fffff").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Failed));

        inject(&m, "a", "s").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Failed));

        inject(&m, "a", "s").await;
        assert_eq!(m.status("a").await, Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_aggregate_ignores_non_critical() {
        let m = monitor();
        m.register("critical", true).await;
        m.register("optional", false).await;

        inject(&m, "optional", "fffff").await;
        assert_eq!(m.status("optional").await, Some(HealthStatus::Failed));
        assert_eq!(m.aggregate_status().await, HealthStatus::Healthy);

        inject(&m, "critical", "fff").await;
        assert_eq!(m.aggregate_status().await, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_one_event_per_transition_in_order() {
        let m = monitor();
        let mut rx = m.subscribe();
        m.register("a", true).await;

        // 5 failures: Healthy->Degraded at the 3rd, Degraded->Failed at
        // the 5th. Exactly two events.
        inject(&m, "a", "fffff").await;

        let first = rx.try_recv().unwrap();
        assert_eq!(first.from, HealthStatus::Healthy);
        assert_eq!(first.to, HealthStatus::Degraded);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.from, HealthStatus::Degraded);
        assert_eq!(second.to, HealthStatus::Failed);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_report_reflects_outcome_window() {
        let m = monitor();
        m.register("a", true).await;

        inject(&m, "a", "ssf").await;

        let report = m.report().await;
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].name, "a");
        assert!((report[0].window_success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_timestamp_is_monotonic() {
        let m = monitor();
        m.register("a", true).await;

        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(30);

        m.record("a", ProbeOutcome::success(later)).await;
        m.record("a", ProbeOutcome::success(earlier)).await;

        assert_eq!(m.last_heartbeat("a").await, Some(later));
    }
}
