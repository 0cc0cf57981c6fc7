use thiserror::Error;

/// Main error type for the supervision daemon
#[derive(Error, Debug)]
pub enum VigilError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Component registry errors
    #[error("Component already registered: {0}")]
    DuplicateComponent(String),

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Component failure: {component} - {reason}")]
    ComponentFailure { component: String, reason: String },

    // Checkpoint errors
    #[error("Checkpoint not found: {0}")]
    UnknownCheckpoint(String),

    #[error("Checkpoint integrity failure for {id}: expected {expected}, got {actual}")]
    Integrity {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Checkpoint store error: {0}")]
    Store(String),

    // Recovery state machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Recovery attempts exhausted after {attempts} tries")]
    RecoveryExhausted { attempts: u32 },

    // Failure taxonomy carried by component errors
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Fatal failure: {0}")]
    Fatal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    // Control surface errors
    #[error("Control request error: {0}")]
    Control(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for VigilError
pub type Result<T> = std::result::Result<T, VigilError>;

/// Failure classification used by the scheduler and the recovery state machine.
///
/// Transient failures retry with backoff and never change recovery state on
/// their own; validation failures degrade a component through the normal
/// heartbeat path; integrity failures abort a restore; fatal failures drive
/// failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Validation,
    Integrity,
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Integrity => write!(f, "integrity"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

impl VigilError {
    /// Classify this error into the failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VigilError::Transient(_)
            | VigilError::Timeout { .. }
            | VigilError::Cancelled
            | VigilError::Control(_)
            | VigilError::Io(_)
            | VigilError::Store(_) => ErrorKind::Transient,

            VigilError::Validation(_)
            | VigilError::InvalidConfig(_)
            | VigilError::Json(_)
            | VigilError::DuplicateComponent(_)
            | VigilError::UnknownComponent(_)
            | VigilError::UnknownCheckpoint(_) => ErrorKind::Validation,

            VigilError::Integrity { .. } => ErrorKind::Integrity,

            VigilError::Fatal(_)
            | VigilError::RecoveryExhausted { .. }
            | VigilError::InvalidStateTransition { .. }
            | VigilError::ComponentFailure { .. }
            | VigilError::Config(_)
            | VigilError::Internal(_)
            | VigilError::Other(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the scheduler should retry the component on its backoff schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            VigilError::Transient("probe timed out".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            VigilError::Validation("bad internal state".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            VigilError::Integrity {
                id: "cp-1".into(),
                expected: "aa".into(),
                actual: "bb".into(),
            }
            .kind(),
            ErrorKind::Integrity
        );
        assert_eq!(
            VigilError::Fatal("unrecoverable".into()).kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_retryable() {
        assert!(VigilError::Timeout { elapsed_ms: 5000 }.is_retryable());
        assert!(!VigilError::Fatal("gone".into()).is_retryable());
    }
}
