use thiserror::Error;

/// Errors from repository operations (used by trait definitions in cairn-core).
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// A failure that may succeed if retried (busy database, pool timeout).
    #[error("transient persistence error: {0}")]
    Transient(String),
}

impl RepositoryError {
    /// Whether a retry policy should attempt the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Connection | RepositoryError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_transient_classification() {
        assert!(RepositoryError::Connection.is_transient());
        assert!(RepositoryError::Transient("database is locked".into()).is_transient());
        assert!(!RepositoryError::NotFound.is_transient());
        assert!(!RepositoryError::Conflict("dup".into()).is_transient());
    }
}
