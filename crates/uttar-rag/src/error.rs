use thiserror::Error;

/// Tagged error taxonomy for the whole platform.
///
/// The variants map one-to-one onto the HTTP surface (see the server crate)
/// and onto the ingestion retry policy: only `Transient` is retried at stage
/// boundaries, everything else is terminal for the operation that raised it.
#[derive(Debug, Error)]
pub enum RagError {
    /// Malformed input: oversize file, bad slug, exceeded length, bad config.
    #[error("validation error: {0}")]
    Validation(String),

    /// Tenant, document, session, or access URL does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate slug, concurrent activation, stale lifecycle transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store or model server temporarily unavailable; safe to retry.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Corrupt PDF, model schema mismatch; retrying will not help.
    #[error("permanent upstream error: {0}")]
    Permanent(String),

    /// User-requested stop. Not an error to the client.
    #[error("cancelled")]
    Cancelled,

    /// Programming error. The only variant that justifies a 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RagError::Transient(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        RagError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        RagError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        RagError::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RagError::Internal(msg.into())
    }
}

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => RagError::NotFound("row not found".into()),
            sqlx::Error::Database(db) => {
                // SQLite unique/primary-key violations surface as conflicts,
                // everything else from the database layer is retryable.
                if db.is_unique_violation() {
                    RagError::Conflict(db.message().to_string())
                } else {
                    RagError::Transient(format!("database: {}", db.message()))
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                RagError::Transient(format!("database: {e}"))
            }
            _ => RagError::Internal(format!("database: {e}")),
        }
    }
}

impl From<reqwest::Error> for RagError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return RagError::Transient(format!("http: {e}"));
        }
        if let Some(status) = e.status() {
            if status.is_server_error() {
                return RagError::Transient(format!("http {status}: {e}"));
            }
            return RagError::Permanent(format!("http {status}: {e}"));
        }
        if e.is_decode() {
            return RagError::Permanent(format!("http decode: {e}"));
        }
        RagError::Transient(format!("http: {e}"))
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        RagError::Permanent(format!("json: {e}"))
    }
}

impl From<lancedb::Error> for RagError {
    fn from(e: lancedb::Error) -> Self {
        RagError::Transient(format!("vector store: {e}"))
    }
}

impl From<std::io::Error> for RagError {
    fn from(e: std::io::Error) -> Self {
        RagError::Transient(format!("io: {e}"))
    }
}

impl From<anyhow::Error> for RagError {
    fn from(e: anyhow::Error) -> Self {
        RagError::Internal(format!("{e:#}"))
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RagError::Transient("x".into()).is_transient());
        assert!(!RagError::Validation("x".into()).is_transient());
        assert!(!RagError::Cancelled.is_transient());
    }

    #[test]
    fn test_json_errors_are_permanent() {
        let err: RagError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, RagError::Permanent(_)));
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: RagError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, RagError::NotFound(_)));
    }
}
