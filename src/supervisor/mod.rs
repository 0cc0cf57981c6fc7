//! Supervision Layer
//!
//! This module provides the supervision core:
//! - Scheduler loop and component registry
//! - Heartbeat monitor for debounced health status
//! - Recovery orchestrator state machine
//! - Alert dispatch

pub mod alert;
pub mod heartbeat;
pub mod orchestrator;
pub mod scheduler;

pub use alert::{Alert, AlertDispatcher, AlertSeverity, AlertSink, LogAlertSink};
pub use heartbeat::{ComponentHealth, HealthEvent, HealthStatus, HeartbeatMonitor, ProbeOutcome};
pub use orchestrator::{
    LogRiskControl, RecoveryOrchestrator, RecoveryState, RiskControl, StateTransition,
};
pub use scheduler::{
    ComponentRegistry, DaemonSupervisor, RegistrationInfo, RegistrySnapshot, RegistrySource,
    SupervisorCommand,
};
