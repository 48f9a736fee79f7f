//! Shardstore errors.

use thiserror::Error;

/// Errors encountered in the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No group with this identity is hosted on this node.
    #[error("group {0} not found")]
    GroupNotFound(String),
    /// A group with this identity is already hosted on this node.
    #[error("group {0} already exists")]
    GroupExists(String),
    /// The group identity cannot be used as a database name or network tag.
    #[error("invalid group id {0:?}")]
    InvalidGroupId(String),
    /// This replica is not the leader of the group. The command was not
    /// appended anywhere and may be resubmitted to the current leader.
    #[error("not leader")]
    NotLeader,
    /// The submission deadline elapsed. The command may still commit.
    #[error("timed out waiting for command to apply")]
    Timeout,
    /// The group has been halted and accepts no more work.
    #[error("group {0} is stopped")]
    GroupStopped(String),
    /// The group stopped while the command was in flight. The command may
    /// still commit.
    #[error("group {0} stopped before the command applied")]
    Interrupted(String),
    /// Store or engine I/O failure.
    #[error("storage error: {0}")]
    StorageError(String),
    /// Listener bind, registration or peer link failure.
    #[error("transport error: {0}")]
    TransportError(String),
    /// The consensus engine could not be started.
    #[error("consensus init error: {0}")]
    ConsensusInitError(String),
    /// Malformed command payload.
    #[error("parse error: {0}")]
    ParseError(String),
    /// A directive payload without a leading `USE <db>;`.
    #[error("no USE statement found")]
    NoDatabaseDirective,
    /// Corrupt or incompatible snapshot data.
    #[error("restore error: {0}")]
    RestoreError(String),
    /// SQLite error.
    #[error("SQLite error: {0}")]
    SQLiteError(sqlite::Error),
}

impl StoreError {
    /// Returns true when the caller cannot know whether the command
    /// committed. Every other submission error means it definitely did not.
    pub fn commit_status_unknown(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Interrupted(_))
    }
}

impl From<sqlite::Error> for StoreError {
    fn from(e: sqlite::Error) -> Self {
        StoreError::SQLiteError(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::StorageError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_in_flight_failures_leave_commit_status_unknown() {
        assert!(StoreError::Timeout.commit_status_unknown());
        assert!(StoreError::Interrupted("shop".into()).commit_status_unknown());
        assert!(!StoreError::GroupStopped("shop".into()).commit_status_unknown());
        assert!(!StoreError::NotLeader.commit_status_unknown());
        assert!(!StoreError::GroupNotFound("shop".into()).commit_status_unknown());
    }

    #[test]
    fn io_errors_become_storage_errors() {
        let e: StoreError = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(e, StoreError::StorageError(msg) if msg.contains("disk gone")));
    }
}
