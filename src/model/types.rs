//! Core identifier and enum types for beads.
//!
//! Foundation types used throughout the tracker: issue identifiers, lifecycle
//! status, priority, issue type, dependency kinds, and audit event kinds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The base-36 alphabet used for identifier hashes.
pub const ID_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Prefixes that can never be used as a workspace issue prefix.
///
/// These collide with file or directory names inside the control directory
/// and would make `<prefix>-...` identifiers ambiguous in diagnostics.
pub const RESERVED_PREFIXES: &[&str] = &["var", "daemon", "config", "tombstone"];

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Which kind of value failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    IssueId,
    Prefix,
    Status,
    Priority,
}

/// A value failed format validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ErrorKind,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value '{}': {}", self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// IssueId
// ---------------------------------------------------------------------------

/// A validated issue identifier: `<prefix>-<hash>` with optional `.N`
/// hierarchical suffixes.
///
/// The prefix is 1–16 lowercase alphanumeric characters starting with a
/// letter. The hash is 4–8 characters from the base-36 alphabet. Children of
/// an issue append `.N` segments (`bd-a1b2.1`, `bd-a1b2.1.3`); each segment
/// is a positive integer with no leading zeros.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IssueId(String);

impl IssueId {
    /// Minimum hash length for newly minted identifiers.
    pub const MIN_HASH_LEN: usize = 4;
    /// Maximum hash length for newly minted identifiers.
    pub const MAX_HASH_LEN: usize = 8;
    /// Maximum prefix length.
    pub const MAX_PREFIX_LEN: usize = 16;

    /// Create a new `IssueId` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the string is not `<prefix>-<hash>[.N]*`.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The workspace prefix, e.g. `"bd"` for `bd-a1b2.3`.
    #[must_use]
    pub fn prefix(&self) -> &str {
        // Validation guarantees at least one '-'.
        self.0.split('-').next().unwrap_or(&self.0)
    }

    /// Whether this identifier is a hierarchical child (`<parent>.<N>`).
    #[must_use]
    pub fn is_child(&self) -> bool {
        self.0.contains('.')
    }

    /// The direct parent of a hierarchical identifier, if any.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let idx = self.0.rfind('.')?;
        Some(Self(self.0[..idx].to_owned()))
    }

    /// The root (non-hierarchical) ancestor of this identifier.
    #[must_use]
    pub fn root(&self) -> Self {
        match self.0.find('.') {
            Some(idx) => Self(self.0[..idx].to_owned()),
            None => self.clone(),
        }
    }

    /// The child identifier `<self>.<n>`.
    #[must_use]
    pub fn child(&self, n: u32) -> Self {
        Self(format!("{}.{n}", self.0))
    }

    /// Validate a workspace prefix on its own.
    ///
    /// # Errors
    /// Returns an error for empty, too-long, reserved, or malformed prefixes.
    pub fn validate_prefix(prefix: &str) -> Result<(), ValidationError> {
        let err = |reason: String| ValidationError {
            kind: ErrorKind::Prefix,
            value: prefix.to_owned(),
            reason,
        };
        if prefix.is_empty() {
            return Err(err("prefix must not be empty".to_owned()));
        }
        if prefix.len() > Self::MAX_PREFIX_LEN {
            return Err(err(format!(
                "prefix must be at most {} characters, got {}",
                Self::MAX_PREFIX_LEN,
                prefix.len()
            )));
        }
        if !prefix.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
            return Err(err("prefix must start with a lowercase letter".to_owned()));
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(err(
                "prefix must contain only lowercase letters and digits".to_owned(),
            ));
        }
        if RESERVED_PREFIXES.contains(&prefix) {
            return Err(err(format!("'{prefix}' is a reserved prefix")));
        }
        Ok(())
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let err = |reason: String| ValidationError {
            kind: ErrorKind::IssueId,
            value: s.to_owned(),
            reason,
        };

        let Some((prefix, rest)) = s.split_once('-') else {
            return Err(err("expected '<prefix>-<hash>' with a '-'".to_owned()));
        };
        Self::validate_prefix(prefix).map_err(|e| err(e.reason))?;

        let mut segments = rest.split('.');
        let hash = segments.next().unwrap_or("");
        if hash.len() < Self::MIN_HASH_LEN || hash.len() > Self::MAX_HASH_LEN {
            return Err(err(format!(
                "hash must be {}-{} characters, got {}",
                Self::MIN_HASH_LEN,
                Self::MAX_HASH_LEN,
                hash.len()
            )));
        }
        if !hash.bytes().all(|b| ID_ALPHABET.contains(&b)) {
            return Err(err(
                "hash must contain only base-36 characters (0-9, a-z)".to_owned(),
            ));
        }
        for seg in segments {
            if seg.is_empty()
                || !seg.bytes().all(|b| b.is_ascii_digit())
                || (seg.len() > 1 && seg.starts_with('0'))
                || seg == "0"
            {
                return Err(err(format!(
                    "child segment '{seg}' must be a positive integer"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IssueId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for IssueId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<IssueId> for String {
    fn from(id: IssueId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Issue lifecycle status.
///
/// Domain deployments may carry extra statuses; those round-trip through the
/// untagged `Custom` variant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
    Tombstone,
    #[serde(untagged)]
    Custom(String),
}

impl Status {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Deferred => "deferred",
            Self::Closed => "closed",
            Self::Tombstone => "tombstone",
            Self::Custom(value) => value,
        }
    }

    /// Closed and tombstone issues never block anything.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Tombstone)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" | "in-progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "deferred" => Ok(Self::Deferred),
            "closed" => Ok(Self::Closed),
            "tombstone" => Ok(Self::Tombstone),
            other if !other.is_empty() => Ok(Self::Custom(other.to_owned())),
            _ => Err(ValidationError {
                kind: ErrorKind::Status,
                value: s.to_owned(),
                reason: "status must not be empty".to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Issue priority: 0 = most urgent, 4 = backlog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i64);

impl Priority {
    pub const CRITICAL: Self = Self(0);
    pub const HIGH: Self = Self(1);
    pub const MEDIUM: Self = Self(2);
    pub const LOW: Self = Self(3);
    pub const BACKLOG: Self = Self(4);
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix(['p', 'P'])
            .unwrap_or(trimmed);
        match digits.parse::<i64>() {
            Ok(p) if (0..=4).contains(&p) => Ok(Self(p)),
            _ => Err(ValidationError {
                kind: ErrorKind::Priority,
                value: s.to_owned(),
                reason: "priority must be an integer in 0..=4 (0 = most urgent)".to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// IssueType
// ---------------------------------------------------------------------------

/// Issue type category. Unknown categories round-trip via `Custom`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    #[default]
    Task,
    Bug,
    Feature,
    Epic,
    Chore,
    #[serde(untagged)]
    Custom(String),
}

impl IssueType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Epic => "epic",
            Self::Chore => "chore",
            Self::Custom(value) => value,
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "task" => Self::Task,
            "bug" => Self::Bug,
            "feature" => Self::Feature,
            "epic" => Self::Epic,
            "chore" => Self::Chore,
            other => Self::Custom(other.to_owned()),
        })
    }
}

// ---------------------------------------------------------------------------
// DependencyKind
// ---------------------------------------------------------------------------

/// The kind of a directed dependency edge.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    Blocks,
    ParentChild,
    Related,
    DiscoveredFrom,
    #[serde(untagged)]
    Custom(String),
}

impl DependencyKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Blocks => "blocks",
            Self::ParentChild => "parent-child",
            Self::Related => "related",
            Self::DiscoveredFrom => "discovered-from",
            Self::Custom(value) => value,
        }
    }

    /// Only blocks and parent-child edges participate in cycle checks and
    /// the blocked-state computation.
    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocks | Self::ParentChild)
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "blocks" => Self::Blocks,
            "parent-child" => Self::ParentChild,
            "related" => Self::Related,
            "discovered-from" => Self::DiscoveredFrom,
            other => Self::Custom(other.to_owned()),
        })
    }
}

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Audit event kind. Serialized as its string form so unknown kinds from
/// newer versions survive a round-trip.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    StatusChanged,
    Commented,
    Closed,
    Reopened,
    DependencyAdded,
    DependencyRemoved,
    LabelAdded,
    LabelRemoved,
    Compacted,
    Deleted,
    ImportSkipped,
    Resurrected,
    Custom(String),
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::StatusChanged => "status_changed",
            Self::Commented => "commented",
            Self::Closed => "closed",
            Self::Reopened => "reopened",
            Self::DependencyAdded => "dependency_added",
            Self::DependencyRemoved => "dependency_removed",
            Self::LabelAdded => "label_added",
            Self::LabelRemoved => "label_removed",
            Self::Compacted => "compacted",
            Self::Deleted => "deleted",
            Self::ImportSkipped => "import_skipped",
            Self::Resurrected => "resurrected",
            Self::Custom(value) => value,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "status_changed" => Self::StatusChanged,
            "commented" => Self::Commented,
            "closed" => Self::Closed,
            "reopened" => Self::Reopened,
            "dependency_added" => Self::DependencyAdded,
            "dependency_removed" => Self::DependencyRemoved,
            "label_added" => Self::LabelAdded,
            "label_removed" => Self::LabelRemoved,
            "compacted" => Self::Compacted,
            "deleted" => Self::Deleted,
            "import_skipped" => Self::ImportSkipped,
            "resurrected" => Self::Resurrected,
            other => Self::Custom(other.to_owned()),
        })
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(value.parse().unwrap_or(Self::Custom(value)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
