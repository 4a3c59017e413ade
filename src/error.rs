use thiserror::Error;

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why a single detection was dropped before association.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectionError {
    #[error("bounding box has non-finite coordinates")]
    NonFinite,
    #[error("degenerate bounding box [{x1}, {y1}, {x2}, {y2}]")]
    Degenerate { x1: f32, y1: f32, x2: f32, y2: f32 },
    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f32),
}

/// Datastore failures, tagged with the operation that hit them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("timed out waiting for a datastore connection during {operation}")]
    PoolTimeout { operation: &'static str },
    #[error("datastore unavailable during {operation}: {source}")]
    Unavailable {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} query failed: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("data integrity anomaly during {operation}: {detail}")]
    Integrity {
        operation: &'static str,
        detail: String,
    },
}

impl StoreError {
    /// Classify a driver error. Pool exhaustion and broken connections are
    /// retryable, everything else is reported as a failed query.
    pub fn from_sqlx(operation: &'static str, source: sqlx::Error) -> Self {
        match source {
            sqlx::Error::PoolTimedOut => StoreError::PoolTimeout { operation },
            sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable { operation, source },
            source => StoreError::Query { operation, source },
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            StoreError::PoolTimeout { operation }
            | StoreError::Unavailable { operation, .. }
            | StoreError::Query { operation, .. }
            | StoreError::Integrity { operation, .. } => operation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::PoolTimeout { .. } | StoreError::Unavailable { .. }
        )
    }
}

/// Analytics query failures, carrying enough context to retry or report.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{operation}: invalid {parameter} {value:?}: {reason}")]
    InvalidFilter {
        operation: &'static str,
        parameter: &'static str,
        value: String,
        reason: String,
    },
    #[error("{operation} failed (filter: {filter}): {source}")]
    Store {
        operation: &'static str,
        filter: String,
        #[source]
        source: StoreError,
    },
}

impl QueryError {
    pub fn operation(&self) -> &'static str {
        match self {
            QueryError::InvalidFilter { operation, .. } | QueryError::Store { operation, .. } => {
                operation
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::InvalidFilter { .. } => false,
            QueryError::Store { source, .. } => source.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_retryable() {
        let err = StoreError::from_sqlx("list_events", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::PoolTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(err.operation(), "list_events");
    }

    #[test]
    fn test_row_not_found_is_not_retryable() {
        let err = StoreError::from_sqlx("statistics", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Query { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_query_error_keeps_filter_context() {
        let err = QueryError::Store {
            operation: "list_events",
            filter: "date=2024-01-01 class=car".to_string(),
            source: StoreError::PoolTimeout { operation: "list_events" },
        };
        let msg = err.to_string();
        assert!(msg.contains("list_events"));
        assert!(msg.contains("date=2024-01-01"));
        assert!(err.is_retryable());
    }
}
