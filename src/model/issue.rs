//! The issue entity and its relational sub-records.
//!
//! Field declaration order here *is* the exchange-file field order: serde
//! serializes struct fields in declaration order, empty fields are omitted,
//! and unknown fields from newer versions are captured in `extras` and echoed
//! back on export so old binaries never drop data they don't understand.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::timefmt;
use super::types::{DependencyKind, EventKind, IssueId, IssueType, Priority, Status};

/// Description prefix stamped on placeholder rows synthesized for dangling
/// parent references during import or merge.
pub const RESURRECTION_MARKER: &str = "[resurrected placeholder]";

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(b: &bool) -> bool {
    !*b
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// A tracked work item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Unique identifier, e.g. `bd-a1b2` or `bd-a1b2.3`.
    pub id: IssueId,

    /// Stable digest of the externally observable fields. Derived; never
    /// exported (each clone recomputes it).
    #[serde(skip)]
    pub content_hash: Option<String>,

    /// Title (required, non-empty).
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default)]
    pub status: Status,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub issue_type: IssueType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<i64>,

    #[serde(with = "timefmt::ts")]
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(with = "timefmt::ts")]
    pub updated_at: DateTime<Utc>,

    #[serde(default, with = "timefmt::opt_ts", skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,

    // Soft-delete (tombstone) fields.
    #[serde(default, with = "timefmt::opt_ts", skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_reason: Option<String>,

    /// The issue type before it became a tombstone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,

    /// Local-only row: never exported, never ready work, no tombstone on
    /// removal.
    #[serde(default, skip_serializing_if = "is_false")]
    pub ephemeral: bool,

    /// Pinned rows are excluded from ready work.
    #[serde(default, skip_serializing_if = "is_false")]
    pub pinned: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,

    /// Unknown fields from newer schema versions, preserved for round-trip.
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl Issue {
    /// Create a minimal open issue with the given id and title.
    #[must_use]
    pub fn new(id: IssueId, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            content_hash: None,
            title: title.into(),
            description: None,
            design: None,
            acceptance_criteria: None,
            notes: None,
            status: Status::Open,
            priority: Priority::default(),
            issue_type: IssueType::default(),
            assignee: None,
            estimated_minutes: None,
            created_at: now,
            created_by: None,
            updated_at: now,
            closed_at: None,
            close_reason: None,
            deleted_at: None,
            deleted_by: None,
            delete_reason: None,
            original_type: None,
            external_ref: None,
            source_system: None,
            ephemeral: false,
            pinned: false,
            labels: Vec::new(),
            dependencies: Vec::new(),
            comments: Vec::new(),
            extras: BTreeMap::new(),
        }
    }

    /// Compute the canonical content hash.
    ///
    /// Inclusion set (frozen; see DESIGN.md): title, description, design,
    /// acceptance criteria, notes, status, priority, issue type, assignee,
    /// close reason, sorted parent ids (parent-child edges), sorted labels.
    /// Excluded: all timestamps, soft-delete metadata, ephemeral/pinned
    /// markers, comments, non-parent dependencies, and unknown extras — these
    /// either vary per clone or are merged by other rules.
    #[must_use]
    pub fn compute_content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        fn field(hasher: &mut Sha256, s: &str) {
            hasher.update(s.as_bytes());
            hasher.update([0]);
        }

        field(&mut hasher, &self.title);
        field(&mut hasher, self.description.as_deref().unwrap_or(""));
        field(&mut hasher, self.design.as_deref().unwrap_or(""));
        field(&mut hasher, self.acceptance_criteria.as_deref().unwrap_or(""));
        field(&mut hasher, self.notes.as_deref().unwrap_or(""));
        field(&mut hasher, self.status.as_str());
        field(&mut hasher, &self.priority.0.to_string());
        field(&mut hasher, self.issue_type.as_str());
        field(&mut hasher, self.assignee.as_deref().unwrap_or(""));
        field(&mut hasher, self.close_reason.as_deref().unwrap_or(""));

        let mut parents: Vec<&str> = self
            .dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::ParentChild)
            .map(|d| d.depends_on_id.as_str())
            .collect();
        parents.sort_unstable();
        for parent in parents {
            field(&mut hasher, parent);
        }
        hasher.update([1]);

        let mut labels: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        labels.sort_unstable();
        for label in labels {
            field(&mut hasher, label);
        }

        format!("{:x}", hasher.finalize())
    }

    /// Sort set-valued fields into canonical order, in place.
    ///
    /// Labels and dependencies sort lexicographically; comments stay in
    /// chronological order. Export and merge both call this so the exchange
    /// file is byte-stable regardless of insertion order.
    pub fn normalize(&mut self) {
        self.labels.sort_unstable();
        self.labels.dedup();
        self.dependencies
            .sort_unstable_by(|a, b| (&a.depends_on_id, &a.kind).cmp(&(&b.depends_on_id, &b.kind)));
        self.dependencies
            .dedup_by(|a, b| a.depends_on_id == b.depends_on_id && a.kind == b.kind);
        self.comments
            .sort_by(|a, b| (a.created_at, &a.author).cmp(&(b.created_at, &b.author)));
    }

    /// Synthesize a closed placeholder for a dangling reference.
    ///
    /// Used when an import or merge encounters a dependency on an identifier
    /// that no longer exists anywhere.
    #[must_use]
    pub fn resurrected(id: IssueId, now: DateTime<Utc>) -> Self {
        let mut issue = Self::new(id, "(resurrected)", now);
        issue.status = Status::Closed;
        issue.priority = Priority::BACKLOG;
        issue.description = Some(format!(
            "{RESURRECTION_MARKER} synthesized for a dangling reference"
        ));
        issue.closed_at = Some(now);
        issue
    }

    /// Whether this row is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.status == Status::Tombstone
    }
}

// ---------------------------------------------------------------------------
// Dependency
// ---------------------------------------------------------------------------

/// A directed edge: `issue_id` depends on `depends_on_id`.
///
/// For `parent-child` edges the child is the source and the parent the
/// target. Inside an exchange record the edge is nested under its source
/// issue, so only the target and kind are serialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Source issue. Implied by the enclosing record in the exchange file.
    #[serde(skip)]
    pub issue_id: Option<IssueId>,

    pub depends_on_id: IssueId,

    #[serde(rename = "type")]
    pub kind: DependencyKind,

    #[serde(default, with = "timefmt::opt_ts", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Dependency {
    #[must_use]
    pub fn new(depends_on_id: IssueId, kind: DependencyKind) -> Self {
        Self {
            issue_id: None,
            depends_on_id,
            kind,
            created_at: None,
            created_by: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Comment
// ---------------------------------------------------------------------------

/// An issue-scoped discussion entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Local row id; not part of the exchange format.
    #[serde(skip)]
    pub id: i64,

    pub author: String,

    #[serde(rename = "text")]
    pub body: String,

    #[serde(with = "timefmt::ts")]
    pub created_at: DateTime<Utc>,
}

impl Comment {
    /// Dedup key used by the merge driver: (author, timestamp, body digest).
    #[must_use]
    pub fn merge_key(&self) -> (String, DateTime<Utc>, String) {
        let digest = format!("{:x}", Sha256::digest(self.body.as_bytes()));
        (self.author.clone(), self.created_at, digest)
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An append-only audit record. Events are local to a clone and are not part
/// of the exchange format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub issue_id: IssueId,
    pub kind: EventKind,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(with = "timefmt::ts")]
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tombstone manifest entry
// ---------------------------------------------------------------------------

/// One line of the tombstone manifest: a deleted identifier that must never
/// be recreated by import or merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneEntry {
    pub id: IssueId,
    #[serde(with = "timefmt::ts")]
    pub deleted_at: DateTime<Utc>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
