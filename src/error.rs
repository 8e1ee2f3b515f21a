//! Unified error type for beads operations.
//!
//! Defines [`BeadsError`], covering the taxonomy the tracker can surface:
//! user input, invariant violations, resource contention, configuration, and
//! merge failures. Error messages are agent-friendly: each variant states
//! what went wrong and, where a remedy exists, how to fix it.

use std::fmt;
use std::path::PathBuf;

use crate::model::{IssueId, ValidationError};

// ---------------------------------------------------------------------------
// BeadsError
// ---------------------------------------------------------------------------

/// Unified error type for all tracker operations.
#[derive(Debug)]
pub enum BeadsError {
    /// An identifier failed format validation.
    InvalidId {
        /// The offending value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    /// An explicit identifier is already present in the store.
    DuplicateId { id: IssueId },

    /// The requested issue does not exist.
    NotFound { id: IssueId },

    /// The identifier is in the tombstone manifest and cannot be reused.
    Tombstoned { id: IssueId },

    /// A required field was missing or empty.
    MissingField { field: &'static str },

    /// An identifier prefix has no route and does not match this workspace.
    UnknownPrefix { prefix: String },

    /// Inserting this dependency would create a cycle.
    CycleDetected {
        /// The cycle path, starting and ending at the same identifier.
        path: Vec<IssueId>,
    },

    /// The storage engine stayed busy past the retry budget, or failed
    /// unrecoverably.
    StorageUnavailable { detail: String },

    /// The database schema is newer than this binary understands.
    MigrationRequired { found: i64, supported: i64 },

    /// Importing the exchange file failed; store and file are unchanged.
    ImportFailed {
        /// 1-based line number, when the failure is tied to one record.
        line: Option<usize>,
        detail: String,
    },

    /// Exporting the exchange file failed.
    ExportFailed { detail: String },

    /// The merge driver could not reconcile one or more records.
    MergeConflict {
        /// Identifiers of the conflicted records.
        ids: Vec<IssueId>,
    },

    /// No workspace control directory was found.
    WorkspaceNotFound { start: PathBuf },

    /// The control directory holds only transient daemon state.
    NotAWorkspace { path: PathBuf },

    /// A configuration key or file could not be read or parsed.
    Config { detail: String },

    /// The daemon was reachable but the request timed out.
    Timeout { operation: String },

    /// The daemon could not be reached and in-process fallback was disabled.
    DaemonUnavailable { detail: String },

    /// A row violated an invariant at read time.
    Corrupt { id: IssueId, detail: String },

    /// An I/O error during a tracker operation.
    Io(std::io::Error),

    /// A storage-engine error that is not a busy/retry condition.
    Sql(rusqlite::Error),

    /// A JSON encode/decode error outside the import path.
    Json(serde_json::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, BeadsError>;

impl BeadsError {
    /// The process exit code for this failure class: 1 for validation
    /// errors, 2 for runtime failures, 3 for merge conflicts.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidId { .. }
            | Self::DuplicateId { .. }
            | Self::NotFound { .. }
            | Self::Tombstoned { .. }
            | Self::MissingField { .. }
            | Self::UnknownPrefix { .. }
            | Self::CycleDetected { .. } => 1,
            Self::MergeConflict { .. } => 3,
            _ => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Display — agent-friendly messages
// ---------------------------------------------------------------------------

impl fmt::Display for BeadsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { value, reason } => {
                write!(
                    f,
                    "invalid issue id '{value}': {reason}\n  Expected '<prefix>-<hash>' with a 4-8 character base-36 hash, e.g. bd-a1b2."
                )
            }
            Self::DuplicateId { id } => {
                write!(
                    f,
                    "issue '{id}' already exists.\n  To fix: omit the explicit id to mint a fresh one, or update the existing issue:\n    bd update {id}"
                )
            }
            Self::NotFound { id } => {
                write!(
                    f,
                    "issue '{id}' not found.\n  To fix: list known issues:\n    bd list"
                )
            }
            Self::Tombstoned { id } => {
                write!(
                    f,
                    "issue '{id}' was deleted and its id is tombstoned.\n  Tombstoned ids cannot be recreated by normal commands. To purge expired tombstones:\n    bd admin purge-tombstones"
                )
            }
            Self::MissingField { field } => {
                write!(f, "missing required field '{field}'.")
            }
            Self::UnknownPrefix { prefix } => {
                write!(
                    f,
                    "no workspace is known for prefix '{prefix}'.\n  To fix: add a route:\n    bd routes add {prefix} <control-dir>"
                )
            }
            Self::CycleDetected { path } => {
                write!(f, "dependency would create a cycle:")?;
                let mut first = true;
                for id in path {
                    if first {
                        write!(f, " {id}")?;
                        first = false;
                    } else {
                        write!(f, " -> {id}")?;
                    }
                }
                write!(
                    f,
                    "\n  To fix: remove one of the existing edges on this path, or use a 'related' link instead."
                )
            }
            Self::StorageUnavailable { detail } => {
                write!(
                    f,
                    "storage unavailable: {detail}\n  Another writer may be holding the database. Retry, or stop a stuck daemon:\n    bd daemon stop"
                )
            }
            Self::MigrationRequired { found, supported } => {
                write!(
                    f,
                    "database schema version {found} is newer than this binary supports ({supported}).\n  To fix: upgrade bd."
                )
            }
            Self::ImportFailed { line, detail } => {
                write!(f, "import failed")?;
                if let Some(line) = line {
                    write!(f, " at line {line}")?;
                }
                write!(
                    f,
                    ": {detail}\n  The store and the exchange file were left unchanged."
                )
            }
            Self::ExportFailed { detail } => {
                write!(
                    f,
                    "export failed: {detail}\n  The previous exchange file is intact (exports are atomic)."
                )
            }
            Self::MergeConflict { ids } => {
                write!(f, "merge conflict in {} record(s):", ids.len())?;
                for id in ids {
                    write!(f, "\n  - {id}")?;
                }
                write!(
                    f,
                    "\n  To fix: resolve the conflict markers in the output file, then re-run the merge."
                )
            }
            Self::WorkspaceNotFound { start } => {
                write!(
                    f,
                    "no .beads/ workspace found from '{}' upward.\n  To fix: initialize one:\n    bd init\n  or point BEADS_DIR at an existing control directory.",
                    start.display()
                )
            }
            Self::NotAWorkspace { path } => {
                write!(
                    f,
                    "'{}' contains only transient daemon state, not a workspace.\n  To fix: run `bd init` in the project root.",
                    path.display()
                )
            }
            Self::Config { detail } => {
                write!(
                    f,
                    "configuration error: {detail}\n  To fix: inspect settings with `bd config list`."
                )
            }
            Self::Timeout { operation } => {
                write!(
                    f,
                    "operation '{operation}' timed out.\n  To fix: retry; if the daemon is stuck, restart it:\n    bd daemon stop"
                )
            }
            Self::DaemonUnavailable { detail } => {
                write!(f, "daemon unavailable: {detail}")
            }
            Self::Corrupt { id, detail } => {
                write!(
                    f,
                    "row '{id}' violates an invariant: {detail}\n  The row was returned with a corrupt marker; run `bd doctor` for a full report."
                )
            }
            Self::Io(err) => {
                write!(
                    f,
                    "I/O error: {err}\n  To fix: check file permissions and disk space."
                )
            }
            Self::Sql(err) => write!(f, "storage error: {err}"),
            Self::Json(err) => write!(f, "JSON error: {err}"),
        }
    }
}

// ---------------------------------------------------------------------------
// std::error::Error
// ---------------------------------------------------------------------------

impl std::error::Error for BeadsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Sql(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<std::io::Error> for BeadsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<rusqlite::Error> for BeadsError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sql(err)
    }
}

impl From<serde_json::Error> for BeadsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<ValidationError> for BeadsError {
    fn from(err: ValidationError) -> Self {
        Self::InvalidId {
            value: err.value,
            reason: err.reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> IssueId {
        IssueId::new(s).unwrap()
    }

    #[test]
    fn cycle_message_shows_path() {
        let err = BeadsError::CycleDetected {
            path: vec![id("bd-aaaa"), id("bd-bbbb"), id("bd-aaaa")],
        };
        let msg = format!("{err}");
        assert!(msg.contains("bd-aaaa -> bd-bbbb -> bd-aaaa"));
        assert!(msg.contains("To fix"));
    }

    #[test]
    fn exit_codes_match_taxonomy() {
        assert_eq!(
            BeadsError::DuplicateId { id: id("bd-aaaa") }.exit_code(),
            1
        );
        assert_eq!(
            BeadsError::StorageUnavailable {
                detail: "busy".to_owned()
            }
            .exit_code(),
            2
        );
        assert_eq!(BeadsError::MergeConflict { ids: vec![] }.exit_code(), 3);
    }

    #[test]
    fn tombstoned_message_names_remedy() {
        let err = BeadsError::Tombstoned { id: id("bd-dead") };
        let msg = format!("{err}");
        assert!(msg.contains("bd-dead"));
        assert!(msg.contains("purge-tombstones"));
    }

    #[test]
    fn not_found_suggests_list() {
        let msg = format!("{}", BeadsError::NotFound { id: id("bd-miss") });
        assert!(msg.contains("bd list"));
    }

    #[test]
    fn source_chains_io() {
        let err = BeadsError::Io(std::io::Error::other("disk full"));
        assert!(std::error::Error::source(&err).is_some());
        let err = BeadsError::NotFound { id: id("bd-aaaa") };
        assert!(std::error::Error::source(&err).is_none());
    }
}
