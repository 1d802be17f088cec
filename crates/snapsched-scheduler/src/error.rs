use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The cadence string is not `<positive integer><m|h|d|w|M|y>`, or
    /// minute granularity is not enabled.
    #[error("Invalid cadence spec: {0}")]
    InvalidCadenceSpec(String),

    /// The retention string is not `<positive integer><n|m|h|d|w|M|y>`.
    #[error("Invalid retention spec: {0}")]
    InvalidRetentionSpec(String),

    #[error("Schedule {cadence} already exists for {target}")]
    DuplicateSchedule { target: String, cadence: String },

    #[error("Retention for period '{period}' already exists for {target}; remove it first")]
    DuplicateRetention { target: String, period: String },

    /// Nothing is scheduled at exactly this target.
    #[error("No schedule found for {target}")]
    NotFound { target: String },

    /// The target could not be resolved to a filesystem path.
    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    /// Subvolume / group / filesystem arguments do not identify one target.
    #[error("Ambiguous scope: {0}")]
    AmbiguousScope(String),

    /// The caller addressed a schedule with a different scope than it was created with.
    #[error("Scope conflict for {target}: {reason}")]
    Conflict { target: String, reason: String },

    /// Transient filesystem failure.
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SchedulerError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::InvalidCadenceSpec(_) => "INVALID_CADENCE_SPEC",
            SchedulerError::InvalidRetentionSpec(_) => "INVALID_RETENTION_SPEC",
            SchedulerError::DuplicateSchedule { .. } => "DUPLICATE_SCHEDULE",
            SchedulerError::DuplicateRetention { .. } => "DUPLICATE_RETENTION",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::PathNotFound { .. } => "PATH_NOT_FOUND",
            SchedulerError::AmbiguousScope(_) => "AMBIGUOUS_SCOPE",
            SchedulerError::Conflict { .. } => "CONFLICT",
            SchedulerError::Io(_) => "IO_ERROR",
            SchedulerError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// User errors are rejected synchronously and never retried.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::Io(_) | SchedulerError::Config(_)
        )
    }
}

/// Failures reported by a [`PathAccessor`](crate::accessor::PathAccessor).
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("snapshot already exists: {0}")]
    AlreadyExists(String),

    #[error("ambiguous scope: {0}")]
    AmbiguousScope(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<AccessError> for SchedulerError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::NotFound(path) => SchedulerError::PathNotFound { path },
            AccessError::AmbiguousScope(reason) => SchedulerError::AmbiguousScope(reason),
            other => SchedulerError::Io(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_errors_map_to_scheduler_taxonomy() {
        let e: SchedulerError = AccessError::NotFound("/gone".into()).into();
        assert_eq!(e.code(), "PATH_NOT_FOUND");
        assert!(e.is_user_error());

        let e: SchedulerError = AccessError::Io {
            path: "/a".into(),
            source: std::io::Error::other("disk on fire"),
        }
        .into();
        assert_eq!(e.code(), "IO_ERROR");
        assert!(!e.is_user_error());
    }
}
