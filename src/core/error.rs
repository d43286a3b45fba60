use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Change log error: {0}")]
    ChangeLog(String),

    #[error("Lock contention: {0}")]
    LockContention(String),

    #[error("Lock row already exists for '{0}'")]
    LockConflict(String),

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Backup verification failed: {0}")]
    BackupVerification(String),

    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("External error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

/// Classification used by the retry layer.
///
/// Fatal errors are never retried; everything else is retried with
/// exponential backoff up to the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Fatal,
    Retryable,
}

/// Substring patterns that mark an externally-originated error as fatal.
///
/// Only consulted for `External` errors (e.g. a raw database driver
/// message); errors produced inside the engine carry their classification
/// in the variant itself.
const FATAL_PATTERNS: [&str; 5] = [
    "not found",
    "permission denied",
    "access denied",
    "invalid",
    "constraint violation",
];

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::NotFound(_)
            | MigrationError::PermissionDenied(_)
            | MigrationError::InvalidInput(_)
            | MigrationError::ConstraintViolation(_)
            | MigrationError::PathTraversal(_)
            | MigrationError::BackupVerification(_)
            | MigrationError::RetryExhausted { .. } => ErrorKind::Fatal,
            MigrationError::External(msg) => {
                let lower = msg.to_lowercase();
                if FATAL_PATTERNS.iter().any(|p| lower.contains(p)) {
                    ErrorKind::Fatal
                } else {
                    ErrorKind::Retryable
                }
            }
            _ => ErrorKind::Retryable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl<T> From<std::sync::PoisonError<T>> for MigrationError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::StateStore(err.to_string())
    }
}

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_variants_carry_classification() {
        assert!(MigrationError::NotFound("asset 42".into()).is_fatal());
        assert!(MigrationError::ConstraintViolation("fk".into()).is_fatal());
        assert_eq!(
            MigrationError::Io("disk full".into()).kind(),
            ErrorKind::Retryable
        );
        // Collaborator-originated failures retry like any other
        // transient error.
        assert_eq!(
            MigrationError::Repository("deadlock on relations".into()).kind(),
            ErrorKind::Retryable
        );
        assert_eq!(
            MigrationError::ObjectStore("throttled".into()).kind(),
            ErrorKind::Retryable
        );
    }

    #[test]
    fn test_external_errors_use_pattern_matching() {
        let fatal = MigrationError::External("ERROR: Permission Denied for relation".into());
        assert!(fatal.is_fatal());

        let retryable = MigrationError::External("connection reset by peer".into());
        assert_eq!(retryable.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn test_retry_exhausted_is_fatal() {
        let err = MigrationError::RetryExhausted {
            operation: "move-asset-7".into(),
            attempts: 3,
            source: Box::new(MigrationError::Io("timeout".into())),
        };
        assert!(err.is_fatal());
    }
}
