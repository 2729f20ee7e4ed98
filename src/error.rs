// ABOUTME: Error taxonomy for replication runs (connectivity, apply, capture gap, configuration)
// ABOUTME: Also classifies backend anyhow errors into connection-level failures

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instance::Side;

/// A problem observed during a replication run.
///
/// Errors are values here: a run collects them into its report instead of
/// aborting, so the variants carry owned strings and are serialisable for
/// dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncError {
    /// An instance could not be reached. Queue state on that side is untouched.
    #[error("{side} instance unreachable: {message}")]
    Connectivity { side: Side, message: String },

    /// A single queue entry (or window row) failed to apply.
    #[error("failed to apply {table} record {record_id} from {side} (entry {entry_id:?}): {message}")]
    Apply {
        side: Side,
        table: String,
        entry_id: Option<u64>,
        record_id: String,
        message: String,
    },

    /// Change capture is absent or not firing for a table.
    #[error("capture gap on {side} for {table}: {detail}")]
    CaptureGap {
        side: Side,
        table: String,
        detail: String,
    },

    /// A table cannot be replicated as configured; it is excluded from the run.
    #[error("{table} excluded from replication on {side}: {message}")]
    Configuration {
        side: Side,
        table: String,
        message: String,
    },
}

impl SyncError {
    /// Errors that mean the run as a whole did not complete its job.
    pub fn is_run_level(&self) -> bool {
        matches!(
            self,
            SyncError::Connectivity { .. } | SyncError::Configuration { .. }
        )
    }
}

/// Marker error for backends that lose their session.
///
/// The MySQL backend surfaces driver I/O errors instead; the in-memory
/// backend raises this when an instance is flagged unreachable.
#[derive(Debug, Error)]
#[error("connection lost: {0}")]
pub struct ConnectionLost(pub String);

/// Check whether an error chain represents a lost or refused connection
/// rather than a statement-level failure.
pub fn is_connectivity(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.downcast_ref::<ConnectionLost>().is_some() {
            return true;
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
        match cause.downcast_ref::<mysql_async::Error>() {
            Some(mysql_async::Error::Io(_)) => true,
            Some(mysql_async::Error::Driver(driver)) => {
                matches!(driver, mysql_async::DriverError::ConnectionClosed)
            }
            _ => false,
        }
    })
}

/// A backend error attributed to the instance it came from.
#[derive(Debug)]
pub struct SideFailure {
    pub side: Side,
    pub error: anyhow::Error,
}

impl SideFailure {
    pub fn new(side: Side, error: anyhow::Error) -> Self {
        Self { side, error }
    }

    pub fn is_connectivity(&self) -> bool {
        is_connectivity(&self.error)
    }

    /// Tag a result with the side it came from.
    pub fn on(side: Side) -> impl FnOnce(anyhow::Error) -> SideFailure {
        move |error| SideFailure::new(side, error)
    }
}

/// Render an error with its full cause chain on one line.
pub fn describe(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lost_is_connectivity() {
        let err = anyhow::Error::new(ConnectionLost("remote flagged down".into()))
            .context("Failed to fetch pending entries");
        assert!(is_connectivity(&err));
    }

    #[test]
    fn test_statement_error_is_not_connectivity() {
        let err = anyhow::anyhow!("Duplicate entry '7' for key 'PRIMARY'")
            .context("Failed to upsert row");
        assert!(!is_connectivity(&err));
    }

    #[test]
    fn test_run_level_classification() {
        let conn = SyncError::Connectivity {
            side: Side::Remote,
            message: "timed out".into(),
        };
        let apply = SyncError::Apply {
            side: Side::Local,
            table: "Guests".into(),
            entry_id: Some(4),
            record_id: "500".into(),
            message: "constraint".into(),
        };
        assert!(conn.is_run_level());
        assert!(!apply.is_run_level());
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let err = SyncError::CaptureGap {
            side: Side::Remote,
            table: "Rooms".into(),
            detail: "no insert trigger".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "capture_gap");
        assert_eq!(json["side"], "remote");
    }
}
