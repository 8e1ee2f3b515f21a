//! Bidirectional translation between store rows and the line-oriented
//! exchange file.
//!
//! One JSON record per line, UTF-8, LF endings, no trailing blank line.
//! Field order is fixed by the [`crate::model::Issue`] declaration order;
//! empty fields are omitted and set-valued fields are sorted, so the file
//! diffs cleanly under git.

pub mod export;
pub mod import;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::model::timefmt;

pub use export::{ExportOutcome, export};
pub use import::{ImportOutcome, import};

// ---------------------------------------------------------------------------
// ErrorPolicy
// ---------------------------------------------------------------------------

/// How export and import react to a record that cannot be processed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Abort the whole operation.
    #[default]
    Strict,
    /// Skip the offending record with a warning; mark the manifest
    /// incomplete.
    BestEffort,
    /// Emit/apply what succeeded; the caller is warned via the outcome.
    Partial,
}

impl ErrorPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::BestEffort => "best-effort",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "best-effort" | "best_effort" => Ok(Self::BestEffort),
            "partial" => Ok(Self::Partial),
            other => Err(format!(
                "unknown error policy '{other}' (expected strict, best-effort, or partial)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// ExportManifest
// ---------------------------------------------------------------------------

/// Sibling file describing the last export.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportManifest {
    #[serde(with = "timefmt::ts")]
    pub exported_at: DateTime<Utc>,
    pub policy: String,
    pub complete: bool,
    #[serde(default)]
    pub records: usize,
    #[serde(default)]
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// SHA-256 of a file's bytes, or `None` when the file does not exist.
///
/// # Errors
/// I/O errors other than not-found.
pub fn file_sha256(path: &Path) -> Result<Option<String>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(format!("{:x}", Sha256::digest(&bytes))))
}
