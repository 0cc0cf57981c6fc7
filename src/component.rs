//! Component Task Contract
//!
//! Every unit of work the supervisor schedules implements [`Component`]:
//! a named, periodically-invoked task with a uniform run/cancel/report
//! contract. Business modules (signal generation, model inference,
//! exchange calls, notification delivery) live behind this seam.

use crate::error::{ErrorKind, Result, VigilError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Execution context handed to a component for a single run.
///
/// Tasks must observe `cancel` promptly during shutdown or restart; tasks
/// that ignore it are force-abandoned past the grace deadline.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub cancel: CancellationToken,
    pub deadline: DateTime<Utc>,
}

impl TaskContext {
    pub fn new(cancel: CancellationToken, deadline: DateTime<Utc>) -> Self {
        Self { cancel, deadline }
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time remaining until the deadline, zero if already past.
    pub fn remaining(&self) -> std::time::Duration {
        (self.deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// A named, periodically-invoked unit of work.
#[async_trait]
pub trait Component: Send + Sync {
    /// Component name, unique within the supervisor.
    fn name(&self) -> &str;

    /// Run one cycle of work. Errors carry the failure taxonomy through
    /// [`VigilError::kind`].
    async fn run(&self, ctx: &TaskContext) -> Result<()>;
}

/// Classified result of a single component run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// Retryable failure, retried on the component's backoff schedule
    Transient(String),
    /// Component reported invalid internal state
    Validation(String),
    /// Explicit unrecoverable signal, or a contained panic
    Fatal(String),
    /// Deadline expired before the task finished
    Timeout,
    /// Cancelled during shutdown or restart
    Cancelled,
}

impl TaskOutcome {
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => TaskOutcome::Success,
            Err(VigilError::Cancelled) => TaskOutcome::Cancelled,
            Err(VigilError::Timeout { .. }) => TaskOutcome::Timeout,
            Err(e) => match e.kind() {
                ErrorKind::Transient => TaskOutcome::Transient(e.to_string()),
                ErrorKind::Validation => TaskOutcome::Validation(e.to_string()),
                ErrorKind::Integrity | ErrorKind::Fatal => TaskOutcome::Fatal(e.to_string()),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskOutcome::Fatal(_))
    }

    /// Whether this outcome counts as a failed heartbeat. Cancellation is
    /// not a health signal.
    pub fn is_failure(&self) -> bool {
        !matches!(self, TaskOutcome::Success | TaskOutcome::Cancelled)
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Success => write!(f, "success"),
            TaskOutcome::Transient(e) => write!(f, "transient: {}", e),
            TaskOutcome::Validation(e) => write!(f, "validation: {}", e),
            TaskOutcome::Fatal(e) => write!(f, "fatal: {}", e),
            TaskOutcome::Timeout => write!(f, "timeout"),
            TaskOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Snapshot source for checkpointing critical mutable state.
///
/// `capture` serializes the current state; `apply` replaces it from a
/// restored payload during failover.
#[async_trait]
pub trait Checkpointable: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>>;
    async fn apply(&self, payload: &[u8]) -> Result<()>;
}
