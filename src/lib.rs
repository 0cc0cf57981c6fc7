pub mod component;
pub mod config;
pub mod context;
pub mod coordination;
pub mod error;
pub mod persistence;
pub mod services;
pub mod supervisor;

pub use component::{Checkpointable, Component, TaskContext, TaskOutcome};
pub use config::AppConfig;
pub use context::SupervisorContext;
pub use coordination::{
    install_signal_handlers, ShutdownCoordinator, ShutdownPhase, ShutdownRequest, Termination,
};
pub use error::{ErrorKind, Result, VigilError};
pub use persistence::{BackupManager, CheckpointMeta, FileStore, KvStore, MemoryStore, RetentionPolicy};
pub use services::{ControlState, HttpProbe, StatusResponse};
pub use supervisor::{
    Alert, AlertDispatcher, AlertSeverity, AlertSink, ComponentRegistry, DaemonSupervisor,
    HealthEvent, HealthStatus, HeartbeatMonitor, LogAlertSink, LogRiskControl, ProbeOutcome,
    RecoveryOrchestrator, RecoveryState, RegistrySource, RiskControl, SupervisorCommand,
};
