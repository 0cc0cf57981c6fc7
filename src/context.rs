//! Supervisor Context
//!
//! Explicit shared-state object passed to every component at
//! construction. All cross-cutting collaborators live here; there are no
//! ambient globals.

use crate::component::Checkpointable;
use crate::config::AppConfig;
use crate::coordination::shutdown::ShutdownCoordinator;
use crate::error::Result;
use crate::persistence::checkpoint::BackupManager;
use crate::persistence::store::KvStore;
use crate::supervisor::alert::{AlertDispatcher, AlertSink};
use crate::supervisor::heartbeat::HeartbeatMonitor;
use crate::supervisor::orchestrator::RiskControl;
use std::sync::Arc;

/// Shared state for the supervision stack.
pub struct SupervisorContext {
    pub config: AppConfig,
    pub monitor: Arc<HeartbeatMonitor>,
    pub backup: Arc<BackupManager>,
    pub alerts: Arc<AlertDispatcher>,
    pub risk: Arc<dyn RiskControl>,
    pub source: Arc<dyn Checkpointable>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

impl SupervisorContext {
    /// Assemble the context over the given capability implementations.
    /// Fails if the checkpoint store cannot be opened.
    pub async fn build(
        config: AppConfig,
        store: Arc<dyn KvStore>,
        source: Arc<dyn Checkpointable>,
        sink: Arc<dyn AlertSink>,
        risk: Arc<dyn RiskControl>,
    ) -> Result<Arc<Self>> {
        let alerts = Arc::new(AlertDispatcher::new(sink));
        let monitor = Arc::new(HeartbeatMonitor::new(config.heartbeat.clone()));
        let backup = Arc::new(BackupManager::open(store, source.clone(), alerts.clone()).await?);
        let shutdown = Arc::new(ShutdownCoordinator::new(config.shutdown.clone()));

        Ok(Arc::new(Self {
            config,
            monitor,
            backup,
            alerts,
            risk,
            source,
            shutdown,
        }))
    }
}
