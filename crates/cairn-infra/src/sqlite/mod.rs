//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools. Timestamps are RFC3339 text with a fixed
//! microsecond precision so that string comparison orders them correctly.
//! Enums are stored by their snake_case serde names, documents as JSON text.

pub mod backend;
pub mod graph;
pub mod lease;
pub mod metadata;
pub mod node_execution;
pub mod plan_execution;
pub mod pool;
pub mod wait;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use cairn_types::error::RepositoryError;
use cairn_types::status::StatusSet;

pub use backend::SqliteBackend;
pub use pool::DatabasePool;

// ---------------------------------------------------------------------------
// Column codecs shared by the repositories
// ---------------------------------------------------------------------------

pub(crate) fn map_sqlx(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut => RepositoryError::Transient("connection pool timed out".into()),
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed => RepositoryError::Connection,
        sqlx::Error::Database(db) => {
            let message = db.message();
            if message.contains("locked") || message.contains("busy") {
                RepositoryError::Transient(message.to_string())
            } else if message.contains("UNIQUE") {
                RepositoryError::Conflict(message.to_string())
            } else {
                RepositoryError::Query(message.to_string())
            }
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_opt_uuid(s: Option<&str>) -> Result<Option<Uuid>, RepositoryError> {
    s.map(parse_uuid).transpose()
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn parse_opt_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(parse_datetime).transpose()
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

pub(crate) fn from_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

pub(crate) fn opt_from_json<T: DeserializeOwned>(
    s: Option<&str>,
    what: &str,
) -> Result<Option<T>, RepositoryError> {
    s.map(|s| from_json(s, what)).transpose()
}

/// Snake-case name of a unit enum variant, as serde writes it.
pub(crate) fn enum_to_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("not a unit variant: {other}"))),
        Err(e) => Err(RepositoryError::Query(format!("serialize: {e}"))),
    }
}

pub(crate) fn enum_from_str<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

/// `?, ?, ?` with one placeholder per item.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// `status IN (...)` clause for `set`, or a never-true clause when empty.
pub(crate) fn status_clause(set: StatusSet) -> String {
    if set.is_empty() {
        "0 = 1".to_string()
    } else {
        format!("status IN ({})", placeholders(set.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::graph::ExecutionMode;
    use cairn_types::status::Status;

    #[test]
    fn datetimes_sort_as_strings() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(format_datetime(&early) < format_datetime(&late));
        assert_eq!(parse_datetime(&format_datetime(&early)).unwrap().timestamp_micros(), early.timestamp_micros());
    }

    #[test]
    fn enums_use_serde_names() {
        assert_eq!(enum_to_str(&ExecutionMode::ChildChain).unwrap(), "child_chain");
        let mode: ExecutionMode = enum_from_str("children", "mode").unwrap();
        assert_eq!(mode, ExecutionMode::Children);
        assert!(enum_from_str::<ExecutionMode>("bogus", "mode").is_err());
    }

    #[test]
    fn status_clause_handles_empty_set() {
        assert_eq!(status_clause(StatusSet::EMPTY), "0 = 1");
        assert_eq!(
            status_clause(StatusSet::of(&[Status::Queued, Status::Running])),
            "status IN (?, ?)"
        );
    }
}
