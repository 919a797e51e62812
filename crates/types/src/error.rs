//! Wire-visible command outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a command as seen by its submitter.
///
/// These are results, not process failures: a handler that returns a non-ok
/// code still commits its transaction (the log entry was consensus-committed,
/// so the applied index must advance even when the command had no effect).
/// The request router translates codes to wire errors from a uniform field
/// position in each response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ErrorCode {
    /// Success.
    #[default]
    NoError,
    /// The partition already exists.
    AlreadyExists,
    /// No blob with the given id (or it is soft-deleted).
    NoSuchBlob,
    /// The blob exists but has no tract at the given index.
    NoSuchTract,
    /// Shape violation: replication factor mismatch, bad host vector length,
    /// wrong keyspace for the partition tag, and similar.
    InvalidArgument,
    /// Extend carried a stale first tract key; the extension was already
    /// applied.
    ExtendConflict,
    /// Tract version was not exactly one past the current version.
    ConflictingState,
    /// No partition has capacity for a new allocation.
    GenBlobId,
    /// A mutating command arrived while the state machine is in read-only
    /// mode.
    ReadOnlyMode,
}

impl ErrorCode {
    /// True for [`ErrorCode::NoError`].
    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, ErrorCode::NoError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NoError => "no error",
            ErrorCode::AlreadyExists => "already exists",
            ErrorCode::NoSuchBlob => "no such blob",
            ErrorCode::NoSuchTract => "no such tract",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::ExtendConflict => "extend conflict",
            ErrorCode::ConflictingState => "conflicting state",
            ErrorCode::GenBlobId => "couldn't generate a blob id",
            ErrorCode::ReadOnlyMode => "curator is in read-only mode",
        };
        f.write_str(s)
    }
}
