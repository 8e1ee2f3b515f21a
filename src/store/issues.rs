//! Issue rows: create, read, update, soft-delete, filtered queries, and the
//! idempotent batch upsert used by import and merge replay.
//!
//! Every write runs inside one immediate transaction that also appends an
//! audit event and refreshes the issue's content hash and `updated_at`.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Row, Transaction, params};

use crate::error::{BeadsError, Result};
use crate::model::timefmt;
use crate::model::{Dependency, EventKind, Issue, IssueId, IssueType, Priority, Status};

use super::{CancelToken, Store, actor};

/// Column list matching [`map_issue_row`]. Keep the two in sync.
pub(crate) const ISSUE_COLUMNS: &str = "id, content_hash, title, description, design, \
     acceptance_criteria, notes, status, priority, issue_type, assignee, estimated_minutes, \
     created_at, created_by, updated_at, closed_at, close_reason, deleted_at, deleted_by, \
     delete_reason, original_type, external_ref, source_system, ephemeral, pinned, extras";

// ---------------------------------------------------------------------------
// Filters and patches
// ---------------------------------------------------------------------------

/// Query filter for [`Store::list_issues`]. Empty fields do not constrain.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IssueFilter {
    pub statuses: Vec<Status>,
    pub priority_min: Option<i64>,
    pub priority_max: Option<i64>,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
    /// Case-insensitive substring over title, description, and notes.
    pub text: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub include_ephemeral: bool,
    pub include_tombstones: bool,
}

/// Field-level patch for [`Store::update_issue`]. `None` leaves a field
/// untouched; `Some(None)` clears an optional field. (Over RPC, an absent
/// key and an explicit `null` both read back as "leave untouched".)
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub design: Option<Option<String>>,
    pub acceptance_criteria: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub issue_type: Option<IssueType>,
    pub assignee: Option<Option<String>>,
    pub estimated_minutes: Option<Option<i64>>,
    pub external_ref: Option<Option<String>>,
}

impl IssuePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.design.is_none()
            && self.acceptance_criteria.is_none()
            && self.notes.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.issue_type.is_none()
            && self.assignee.is_none()
            && self.estimated_minutes.is_none()
            && self.external_ref.is_none()
    }
}

/// Outcome of one record in a batch upsert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
    SkippedTombstoned,
}

// ---------------------------------------------------------------------------
// Status transition rule
// ---------------------------------------------------------------------------

/// Legal transitions: open ↔ in-progress ↔ blocked ↔ deferred move freely;
/// any non-terminal → closed; closed → open (reopen); any → tombstone.
/// Custom statuses behave as non-terminal working states.
pub fn validate_transition(from: &Status, to: &Status) -> Result<()> {
    if from == to || *to == Status::Tombstone {
        return Ok(());
    }
    let ok = match (from, to) {
        (Status::Closed, Status::Open) => true,
        (Status::Closed | Status::Tombstone, _) => false,
        (_, Status::Closed) => true,
        // Among non-terminal working states, every move is legal.
        (_, Status::Open | Status::InProgress | Status::Blocked | Status::Deferred
            | Status::Custom(_)) => true,
        (_, Status::Tombstone) => true,
    };
    if ok {
        Ok(())
    } else {
        Err(BeadsError::Config {
            detail: format!("illegal status transition {from} -> {to}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

impl Store {
    /// Insert a new issue. Fills in `content_hash`, appends a `created`
    /// event, and rejects tombstoned or duplicate identifiers.
    ///
    /// Dependencies on the issue are added separately (see
    /// [`Store::add_dependency`]) so cycle checks see a consistent graph.
    ///
    /// # Errors
    /// `MissingField` for an empty title, `Tombstoned` / `DuplicateId` per
    /// the identity rules.
    pub fn create_issue(&mut self, cancel: &CancelToken, issue: &mut Issue) -> Result<()> {
        if issue.title.trim().is_empty() {
            return Err(BeadsError::MissingField { field: "title" });
        }
        issue.content_hash = Some(issue.compute_content_hash());
        let snapshot = issue.clone();
        self.with_write_tx(cancel, |tx| {
            if tombstoned_tx(tx, &snapshot.id)? {
                return Err(BeadsError::Tombstoned {
                    id: snapshot.id.clone(),
                });
            }
            if exists_tx(tx, &snapshot.id)? {
                return Err(BeadsError::DuplicateId {
                    id: snapshot.id.clone(),
                });
            }
            insert_issue_tx(tx, &snapshot)?;
            for label in &snapshot.labels {
                tx.execute(
                    "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)",
                    params![snapshot.id.as_str(), label],
                )?;
            }
            append_event_tx(tx, &snapshot.id, &EventKind::Created, None)?;
            Ok(())
        })
    }

    /// Load one issue with its labels, dependencies, and comments.
    ///
    /// # Errors
    /// Storage errors only; an absent id returns `Ok(None)`.
    pub fn get_issue(&self, id: &IssueId) -> Result<Option<Issue>> {
        let sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1");
        let mut stmt = self.conn().prepare(&sql)?;
        let mut rows = stmt.query_map(params![id.as_str()], map_issue_row)?;
        let Some(issue) = rows.next().transpose()? else {
            return Ok(None);
        };
        let mut issue = issue;
        self.load_relations(&mut issue)?;
        Ok(Some(issue))
    }

    /// Apply a field patch. Recomputes the content hash, bumps `updated_at`,
    /// and appends an `updated` (or `status_changed` / `closed` / `reopened`)
    /// event.
    ///
    /// # Errors
    /// `NotFound` for unknown ids; a config error for illegal status
    /// transitions.
    pub fn update_issue(
        &mut self,
        cancel: &CancelToken,
        id: &IssueId,
        patch: &IssuePatch,
    ) -> Result<Issue> {
        let Some(mut issue) = self.get_issue(id)? else {
            return Err(BeadsError::NotFound { id: id.clone() });
        };
        let now = Utc::now();
        let old_status = issue.status.clone();
        let mut event = EventKind::Updated;

        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(BeadsError::MissingField { field: "title" });
            }
            issue.title.clone_from(title);
        }
        if let Some(v) = &patch.description {
            issue.description.clone_from(v);
        }
        if let Some(v) = &patch.design {
            issue.design.clone_from(v);
        }
        if let Some(v) = &patch.acceptance_criteria {
            issue.acceptance_criteria.clone_from(v);
        }
        if let Some(v) = &patch.notes {
            issue.notes.clone_from(v);
        }
        if let Some(v) = &patch.priority {
            issue.priority = *v;
        }
        if let Some(v) = &patch.issue_type {
            issue.issue_type = v.clone();
        }
        if let Some(v) = &patch.assignee {
            issue.assignee.clone_from(v);
        }
        if let Some(v) = &patch.estimated_minutes {
            issue.estimated_minutes = *v;
        }
        if let Some(v) = &patch.external_ref {
            issue.external_ref.clone_from(v);
        }
        if let Some(status) = &patch.status {
            validate_transition(&old_status, status)?;
            issue.status = status.clone();
            if *status == Status::Closed {
                issue.closed_at = Some(now);
                event = EventKind::Closed;
            } else if old_status == Status::Closed {
                issue.closed_at = None;
                issue.close_reason = None;
                event = EventKind::Reopened;
            } else {
                event = EventKind::StatusChanged;
            }
        }

        issue.updated_at = now;
        issue.content_hash = Some(issue.compute_content_hash());
        let snapshot = issue.clone();
        let payload = (event == EventKind::StatusChanged || event == EventKind::Closed
            || event == EventKind::Reopened)
            .then(|| {
                serde_json::json!({
                    "from": old_status.as_str(),
                    "to": snapshot.status.as_str(),
                })
            });
        self.with_write_tx(cancel, |tx| {
            update_issue_row_tx(tx, &snapshot)?;
            append_event_tx(tx, &snapshot.id, &event, payload.clone())?;
            Ok(())
        })?;
        Ok(issue)
    }

    /// Close an issue with an optional reason.
    ///
    /// # Errors
    /// `NotFound`; illegal transition for already-terminal rows.
    pub fn close_issue(
        &mut self,
        cancel: &CancelToken,
        id: &IssueId,
        reason: Option<&str>,
    ) -> Result<Issue> {
        let Some(mut issue) = self.get_issue(id)? else {
            return Err(BeadsError::NotFound { id: id.clone() });
        };
        validate_transition(&issue.status, &Status::Closed)?;
        let now = Utc::now();
        issue.status = Status::Closed;
        issue.closed_at = Some(now);
        issue.close_reason = reason.map(str::to_owned);
        issue.updated_at = now;
        issue.content_hash = Some(issue.compute_content_hash());
        let snapshot = issue.clone();
        self.with_write_tx(cancel, |tx| {
            update_issue_row_tx(tx, &snapshot)?;
            append_event_tx(
                tx,
                &snapshot.id,
                &EventKind::Closed,
                snapshot
                    .close_reason
                    .as_ref()
                    .map(|r| serde_json::json!({ "reason": r })),
            )?;
            Ok(())
        })?;
        Ok(issue)
    }

    /// Reopen a closed issue, clearing `closed_at` and the close reason.
    ///
    /// # Errors
    /// `NotFound`; illegal transition unless the issue is closed.
    pub fn reopen_issue(&mut self, cancel: &CancelToken, id: &IssueId) -> Result<Issue> {
        let mut patch = IssuePatch::default();
        patch.status = Some(Status::Open);
        self.update_issue(cancel, id, &patch)
    }

    /// Soft-delete: turn the row into a tombstone and record the identifier
    /// in the tombstone manifest. Ephemeral rows are removed outright and
    /// leave no tombstone.
    ///
    /// # Errors
    /// `NotFound` for unknown ids.
    pub fn delete_issue(
        &mut self,
        cancel: &CancelToken,
        id: &IssueId,
        reason: Option<&str>,
    ) -> Result<()> {
        let Some(mut issue) = self.get_issue(id)? else {
            return Err(BeadsError::NotFound { id: id.clone() });
        };
        let now = Utc::now();
        let who = actor().to_owned();
        if issue.ephemeral {
            let snapshot_id = issue.id.clone();
            return self.with_write_tx(cancel, |tx| {
                tx.execute(
                    "DELETE FROM issues WHERE id = ?1",
                    params![snapshot_id.as_str()],
                )?;
                Ok(())
            });
        }
        issue.original_type = Some(issue.issue_type.as_str().to_owned());
        issue.status = Status::Tombstone;
        issue.deleted_at = Some(now);
        issue.deleted_by = Some(who.clone());
        issue.delete_reason = reason.map(str::to_owned);
        issue.updated_at = now;
        issue.content_hash = Some(issue.compute_content_hash());
        let snapshot = issue.clone();
        let reason_owned = reason.map(str::to_owned);
        self.with_write_tx(cancel, |tx| {
            update_issue_row_tx(tx, &snapshot)?;
            tx.execute(
                "INSERT OR REPLACE INTO tombstones (id, deleted_at, actor, reason)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    snapshot.id.as_str(),
                    timefmt::encode(&now),
                    who,
                    reason_owned
                ],
            )?;
            append_event_tx(
                tx,
                &snapshot.id,
                &EventKind::Deleted,
                reason_owned
                    .as_ref()
                    .map(|r| serde_json::json!({ "reason": r })),
            )?;
            Ok(())
        })
    }

    /// Filtered listing, sorted by (priority, created_at, id).
    ///
    /// # Errors
    /// Storage errors only.
    pub fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        let mut sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.include_ephemeral {
            sql.push_str(" AND ephemeral = 0");
        }
        if !filter.include_tombstones {
            sql.push_str(" AND status <> 'tombstone'");
        }
        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({placeholders})"));
            for status in &filter.statuses {
                args.push(Box::new(status.as_str().to_owned()));
            }
        }
        if let Some(min) = filter.priority_min {
            sql.push_str(" AND priority >= ?");
            args.push(Box::new(min));
        }
        if let Some(max) = filter.priority_max {
            sql.push_str(" AND priority <= ?");
            args.push(Box::new(max));
        }
        if let Some(assignee) = &filter.assignee {
            sql.push_str(" AND assignee = ?");
            args.push(Box::new(assignee.clone()));
        }
        if let Some(text) = &filter.text {
            sql.push_str(
                " AND (instr(lower(title), lower(?)) > 0
                   OR instr(lower(coalesce(description, '')), lower(?)) > 0
                   OR instr(lower(coalesce(notes, '')), lower(?)) > 0)",
            );
            for _ in 0..3 {
                args.push(Box::new(text.clone()));
            }
        }
        if let Some(before) = filter.created_before {
            sql.push_str(" AND created_at < ?");
            args.push(Box::new(timefmt::encode(&before)));
        }
        if let Some(after) = filter.created_after {
            sql.push_str(" AND created_at > ?");
            args.push(Box::new(timefmt::encode(&after)));
        }
        for label in &filter.labels {
            sql.push_str(" AND id IN (SELECT issue_id FROM labels WHERE label = ?)");
            args.push(Box::new(label.clone()));
        }
        sql.push_str(" ORDER BY priority ASC, created_at ASC, id ASC");

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), map_issue_row)?;
        let mut issues = Vec::new();
        for row in rows {
            let mut issue = row?;
            self.load_relations(&mut issue)?;
            issues.push(issue);
        }
        Ok(issues)
    }

    /// Every non-ephemeral row (tombstones included) with relations loaded,
    /// sorted by identifier. This is the export view.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn export_view(&self) -> Result<Vec<Issue>> {
        let sql = format!(
            "SELECT {ISSUE_COLUMNS} FROM issues WHERE ephemeral = 0 ORDER BY id ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], map_issue_row)?;
        let mut issues = Vec::new();
        for row in rows {
            let mut issue = row?;
            self.load_relations(&mut issue)?;
            issue.normalize();
            issues.push(issue);
        }
        Ok(issues)
    }

    /// Whether any issue row exists (ephemeral rows excluded).
    ///
    /// # Errors
    /// Storage errors only.
    pub fn is_empty(&self) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT count(*) FROM issues WHERE ephemeral = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count == 0)
    }

    /// # Errors
    /// Storage errors only.
    pub fn issue_exists(&self, id: &IssueId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT count(*) FROM issues WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Row counts grouped by status, for `bd stats`.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn counts_by_status(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn().prepare(
            "SELECT status, count(*) FROM issues WHERE ephemeral = 0
             GROUP BY status ORDER BY status",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Idempotent upsert of one exchange record, keyed by
    /// (identifier, content hash). Used by import and merge replay.
    ///
    /// The record's labels, dependencies, and comments replace the stored
    /// relations (the exchange file is the authoritative superset view).
    ///
    /// # Errors
    /// Storage errors only; tombstoned identifiers are reported in the
    /// outcome, not as errors.
    pub fn upsert_issue(&mut self, cancel: &CancelToken, record: &Issue) -> Result<UpsertOutcome> {
        let mut record = record.clone();
        record.normalize();
        let incoming_hash = record.compute_content_hash();
        record.content_hash = Some(incoming_hash.clone());

        let existing = self.get_issue(&record.id)?;
        // Tombstones never revert to live rows, whatever the other clone
        // thinks it knows.
        if !record.is_tombstone() {
            let locally_dead = existing.as_ref().is_some_and(Issue::is_tombstone)
                || self.is_tombstoned(&record.id)?;
            if locally_dead {
                return Ok(UpsertOutcome::SkippedTombstoned);
            }
        }
        let outcome = match &existing {
            None => UpsertOutcome::Created,
            Some(current) => {
                let current_hash = current
                    .content_hash
                    .clone()
                    .unwrap_or_else(|| current.compute_content_hash());
                if current_hash == incoming_hash && relations_equal(current, &record) {
                    return Ok(UpsertOutcome::Unchanged);
                }
                UpsertOutcome::Updated
            }
        };

        let is_new = existing.is_none();
        self.with_write_tx(cancel, |tx| {
            if is_new {
                if tombstoned_tx(tx, &record.id)? && !record.is_tombstone() {
                    return Ok(UpsertOutcome::SkippedTombstoned);
                }
                insert_issue_tx(tx, &record)?;
            } else {
                update_issue_row_tx(tx, &record)?;
            }
            replace_relations_tx(tx, &record)?;
            if record.is_tombstone() {
                tx.execute(
                    "INSERT OR IGNORE INTO tombstones (id, deleted_at, actor, reason)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record.id.as_str(),
                        timefmt::encode(&record.deleted_at.unwrap_or(record.updated_at)),
                        record.deleted_by.as_deref().unwrap_or("import"),
                        record.delete_reason
                    ],
                )?;
            }
            Ok(outcome)
        })
    }

    fn load_relations(&self, issue: &mut Issue) -> Result<()> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT label FROM labels WHERE issue_id = ?1 ORDER BY label",
        )?;
        issue.labels = stmt
            .query_map(params![issue.id.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut stmt = conn.prepare(
            "SELECT depends_on_id, kind, created_at, created_by FROM dependencies
             WHERE issue_id = ?1 ORDER BY depends_on_id, kind",
        )?;
        let deps = stmt.query_map(params![issue.id.as_str()], |row| {
            let target: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let created_at: Option<String> = row.get(2)?;
            let created_by: Option<String> = row.get(3)?;
            Ok((target, kind, created_at, created_by))
        })?;
        issue.dependencies.clear();
        for dep in deps {
            let (target, kind, created_at, created_by) = dep?;
            let target = IssueId::new(&target).map_err(|e| BeadsError::Corrupt {
                id: issue.id.clone(),
                detail: format!("dependency target: {e}"),
            })?;
            issue.dependencies.push(Dependency {
                issue_id: Some(issue.id.clone()),
                depends_on_id: target,
                kind: kind.parse().unwrap_or(crate::model::DependencyKind::Blocks),
                created_at: created_at.as_deref().and_then(|s| timefmt::decode(s).ok()),
                created_by,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT id, author, body, created_at FROM comments
             WHERE issue_id = ?1 ORDER BY created_at, id",
        )?;
        let comments = stmt.query_map(params![issue.id.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        issue.comments.clear();
        for comment in comments {
            let (id, author, body, created_at) = comment?;
            issue.comments.push(crate::model::Comment {
                id,
                author,
                body,
                created_at: timefmt::decode(&created_at).unwrap_or_default(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row-level helpers (used inside transactions)
// ---------------------------------------------------------------------------

pub(crate) fn exists_tx(tx: &Transaction, id: &IssueId) -> Result<bool> {
    let count: i64 = tx.query_row(
        "SELECT count(*) FROM issues WHERE id = ?1",
        params![id.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn tombstoned_tx(tx: &Transaction, id: &IssueId) -> Result<bool> {
    let count: i64 = tx.query_row(
        "SELECT count(*) FROM tombstones WHERE id = ?1",
        params![id.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn insert_issue_tx(tx: &Transaction, issue: &Issue) -> Result<()> {
    tx.execute(
        "INSERT INTO issues (id, content_hash, title, description, design,
             acceptance_criteria, notes, status, priority, issue_type, assignee,
             estimated_minutes, created_at, created_by, updated_at, closed_at,
             close_reason, deleted_at, deleted_by, delete_reason, original_type,
             external_ref, source_system, ephemeral, pinned, extras)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
             ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
        rusqlite::params_from_iter(issue_params(issue)?),
    )?;
    Ok(())
}

pub(crate) fn update_issue_row_tx(tx: &Transaction, issue: &Issue) -> Result<()> {
    tx.execute(
        "UPDATE issues SET content_hash = ?2, title = ?3, description = ?4, design = ?5,
             acceptance_criteria = ?6, notes = ?7, status = ?8, priority = ?9,
             issue_type = ?10, assignee = ?11, estimated_minutes = ?12, created_at = ?13,
             created_by = ?14, updated_at = ?15, closed_at = ?16, close_reason = ?17,
             deleted_at = ?18, deleted_by = ?19, delete_reason = ?20, original_type = ?21,
             external_ref = ?22, source_system = ?23, ephemeral = ?24, pinned = ?25,
             extras = ?26
         WHERE id = ?1",
        rusqlite::params_from_iter(issue_params(issue)?),
    )?;
    Ok(())
}

/// Replace labels, dependencies, and comments with the record's sets.
pub(crate) fn replace_relations_tx(tx: &Transaction, issue: &Issue) -> Result<()> {
    let id = issue.id.as_str();
    tx.execute("DELETE FROM labels WHERE issue_id = ?1", params![id])?;
    for label in &issue.labels {
        tx.execute(
            "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)",
            params![id, label],
        )?;
    }
    tx.execute("DELETE FROM dependencies WHERE issue_id = ?1", params![id])?;
    for dep in &issue.dependencies {
        tx.execute(
            "INSERT OR IGNORE INTO dependencies
                 (issue_id, depends_on_id, kind, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                dep.depends_on_id.as_str(),
                dep.kind.as_str(),
                timefmt::encode(&dep.created_at.unwrap_or(issue.updated_at)),
                dep.created_by
            ],
        )?;
    }
    tx.execute("DELETE FROM comments WHERE issue_id = ?1", params![id])?;
    for comment in &issue.comments {
        tx.execute(
            "INSERT INTO comments (issue_id, author, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, comment.author, comment.body, timefmt::encode(&comment.created_at)],
        )?;
    }
    Ok(())
}

/// Append an audit event. `BEADS_SESSION_ID`, when set, is folded into the
/// payload so events correlate with an external session.
pub(crate) fn append_event_tx(
    tx: &Transaction,
    issue_id: &IssueId,
    kind: &EventKind,
    payload: Option<serde_json::Value>,
) -> Result<()> {
    let payload = match (payload, std::env::var("BEADS_SESSION_ID").ok()) {
        (Some(serde_json::Value::Object(mut map)), Some(session)) => {
            map.insert("session_id".to_owned(), serde_json::Value::String(session));
            Some(serde_json::Value::Object(map))
        }
        (None, Some(session)) => Some(serde_json::json!({ "session_id": session })),
        (payload, _) => payload,
    };
    tx.execute(
        "INSERT INTO events (issue_id, kind, actor, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            issue_id.as_str(),
            kind.as_str(),
            actor(),
            payload.map(|p| p.to_string()),
            timefmt::encode(&Utc::now())
        ],
    )?;
    Ok(())
}

#[allow(clippy::type_complexity)]
fn issue_params(
    issue: &Issue,
) -> Result<[Box<dyn rusqlite::ToSql>; 26]> {
    let extras = if issue.extras.is_empty() {
        "{}".to_owned()
    } else {
        serde_json::to_string(&issue.extras)?
    };
    Ok([
        Box::new(issue.id.as_str().to_owned()),
        Box::new(issue.content_hash.clone().unwrap_or_default()),
        Box::new(issue.title.clone()),
        Box::new(issue.description.clone()),
        Box::new(issue.design.clone()),
        Box::new(issue.acceptance_criteria.clone()),
        Box::new(issue.notes.clone()),
        Box::new(issue.status.as_str().to_owned()),
        Box::new(issue.priority.0),
        Box::new(issue.issue_type.as_str().to_owned()),
        Box::new(issue.assignee.clone()),
        Box::new(issue.estimated_minutes),
        Box::new(timefmt::encode(&issue.created_at)),
        Box::new(issue.created_by.clone()),
        Box::new(timefmt::encode(&issue.updated_at)),
        Box::new(issue.closed_at.as_ref().map(timefmt::encode)),
        Box::new(issue.close_reason.clone()),
        Box::new(issue.deleted_at.as_ref().map(timefmt::encode)),
        Box::new(issue.deleted_by.clone()),
        Box::new(issue.delete_reason.clone()),
        Box::new(issue.original_type.clone()),
        Box::new(issue.external_ref.clone()),
        Box::new(issue.source_system.clone()),
        Box::new(i64::from(issue.ephemeral)),
        Box::new(i64::from(issue.pinned)),
        Box::new(extras),
    ])
}

/// Map one `issues` row. A row with an unparseable timestamp or extras blob
/// is returned with a `corrupt` marker in its extras instead of failing the
/// whole query; the caller decides whether to surface or skip it.
pub(crate) fn map_issue_row(row: &Row<'_>) -> rusqlite::Result<Issue> {
    let id_raw: String = row.get(0)?;
    let id = IssueId::new(&id_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
    })?;

    let mut corrupt: Option<String> = None;
    let mut parse_ts = |idx: usize, raw: String| match timefmt::decode(&raw) {
        Ok(ts) => ts,
        Err(e) => {
            corrupt = Some(format!("column {idx}: bad timestamp '{raw}': {e}"));
            DateTime::<Utc>::default()
        }
    };

    let created_at = parse_ts(12, row.get::<_, String>(12)?);
    let updated_at = parse_ts(14, row.get::<_, String>(14)?);
    let closed_at = row
        .get::<_, Option<String>>(15)?
        .map(|raw| parse_ts(15, raw));
    let deleted_at = row
        .get::<_, Option<String>>(17)?
        .map(|raw| parse_ts(17, raw));

    let extras_raw: String = row.get(25)?;
    let mut extras = serde_json::from_str(&extras_raw).unwrap_or_else(|e| {
        corrupt = Some(format!("extras blob: {e}"));
        std::collections::BTreeMap::new()
    });
    if let Some(detail) = corrupt {
        tracing::warn!(id = %id, detail = %detail, "corrupt row");
        extras.insert("corrupt".to_owned(), serde_json::Value::String(detail));
    }

    let status_raw: String = row.get(7)?;
    let type_raw: String = row.get(9)?;
    Ok(Issue {
        id,
        content_hash: {
            let hash: String = row.get(1)?;
            (!hash.is_empty()).then_some(hash)
        },
        title: row.get(2)?,
        description: row.get(3)?,
        design: row.get(4)?,
        acceptance_criteria: row.get(5)?,
        notes: row.get(6)?,
        status: status_raw.parse().unwrap_or(Status::Open),
        priority: Priority(row.get(8)?),
        issue_type: type_raw.parse().unwrap_or_default(),
        assignee: row.get(10)?,
        estimated_minutes: row.get(11)?,
        created_at,
        created_by: row.get(13)?,
        updated_at,
        closed_at,
        close_reason: row.get(16)?,
        deleted_at,
        deleted_by: row.get(18)?,
        delete_reason: row.get(19)?,
        original_type: row.get(20)?,
        external_ref: row.get(21)?,
        source_system: row.get(22)?,
        ephemeral: row.get::<_, i64>(23)? != 0,
        pinned: row.get::<_, i64>(24)? != 0,
        labels: Vec::new(),
        dependencies: Vec::new(),
        comments: Vec::new(),
        extras,
    })
}

fn relations_equal(a: &Issue, b: &Issue) -> bool {
    let key = |d: &Dependency| (d.depends_on_id.clone(), d.kind.clone());
    let mut da: Vec<_> = a.dependencies.iter().map(key).collect();
    let mut db: Vec<_> = b.dependencies.iter().map(key).collect();
    da.sort();
    db.sort();
    da == db && a.comments.len() == b.comments.len()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DependencyKind;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("beads.db")).expect("open");
        (dir, store)
    }

    fn id(s: &str) -> IssueId {
        IssueId::new(s).unwrap()
    }

    fn new_issue(s: &str, title: &str) -> Issue {
        Issue::new(id(s), title, Utc::now())
    }

    #[test]
    fn create_and_get_round_trip() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut issue = new_issue("bd-a1b2", "First");
        issue.labels = vec!["backend".to_owned()];
        store.create_issue(&cancel, &mut issue).unwrap();

        let loaded = store.get_issue(&id("bd-a1b2")).unwrap().unwrap();
        assert_eq!(loaded.title, "First");
        assert_eq!(loaded.labels, vec!["backend".to_owned()]);
        assert_eq!(loaded.content_hash, issue.content_hash);
    }

    #[test]
    fn create_rejects_empty_title() {
        let (_dir, mut store) = temp_store();
        let mut issue = new_issue("bd-a1b2", "  ");
        let err = store
            .create_issue(&CancelToken::new(), &mut issue)
            .unwrap_err();
        assert!(matches!(err, BeadsError::MissingField { field: "title" }));
    }

    #[test]
    fn create_rejects_duplicate() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        store
            .create_issue(&cancel, &mut new_issue("bd-a1b2", "First"))
            .unwrap();
        let err = store
            .create_issue(&cancel, &mut new_issue("bd-a1b2", "Second"))
            .unwrap_err();
        assert!(matches!(err, BeadsError::DuplicateId { .. }));
    }

    #[test]
    fn create_appends_created_event() {
        let (_dir, mut store) = temp_store();
        store
            .create_issue(&CancelToken::new(), &mut new_issue("bd-a1b2", "First"))
            .unwrap();
        let count: i64 = store
            .conn()
            .query_row(
                "SELECT count(*) FROM events WHERE issue_id = 'bd-a1b2' AND kind = 'created'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn update_changes_hash_and_updated_at() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut issue = new_issue("bd-a1b2", "First");
        store.create_issue(&cancel, &mut issue).unwrap();
        let before = store.get_issue(&issue.id).unwrap().unwrap();

        let mut patch = IssuePatch::default();
        patch.title = Some("Renamed".to_owned());
        let after = store.update_issue(&cancel, &issue.id, &patch).unwrap();
        assert_ne!(before.content_hash, after.content_hash);
        assert!(after.updated_at >= before.updated_at);
    }

    #[test]
    fn close_then_reopen() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut issue = new_issue("bd-a1b2", "First");
        store.create_issue(&cancel, &mut issue).unwrap();

        let closed = store
            .close_issue(&cancel, &issue.id, Some("done"))
            .unwrap();
        assert_eq!(closed.status, Status::Closed);
        assert!(closed.closed_at.is_some());
        assert_eq!(closed.close_reason.as_deref(), Some("done"));

        let reopened = store.reopen_issue(&cancel, &issue.id).unwrap();
        assert_eq!(reopened.status, Status::Open);
        assert!(reopened.closed_at.is_none());
        assert!(reopened.close_reason.is_none());
    }

    #[test]
    fn tombstone_blocks_recreation() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut issue = new_issue("bd-a1b2", "First");
        store.create_issue(&cancel, &mut issue).unwrap();
        store.delete_issue(&cancel, &issue.id, Some("obsolete")).unwrap();

        let stored = store.get_issue(&issue.id).unwrap().unwrap();
        assert_eq!(stored.status, Status::Tombstone);
        assert_eq!(stored.original_type.as_deref(), Some("task"));

        let err = store
            .create_issue(&cancel, &mut new_issue("bd-a1b2", "Again"))
            .unwrap_err();
        assert!(matches!(err, BeadsError::Tombstoned { .. }));
    }

    #[test]
    fn ephemeral_delete_leaves_no_tombstone() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut issue = new_issue("bd-a1b2", "Scratch");
        issue.ephemeral = true;
        store.create_issue(&cancel, &mut issue).unwrap();
        store.delete_issue(&cancel, &issue.id, None).unwrap();
        assert!(!store.issue_exists(&issue.id).unwrap());
        let count: i64 = store
            .conn()
            .query_row("SELECT count(*) FROM tombstones", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn list_filters_by_status_and_label() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut a = new_issue("bd-aaaa", "Open one");
        a.labels = vec!["x".to_owned()];
        store.create_issue(&cancel, &mut a).unwrap();
        let mut b = new_issue("bd-bbbb", "Closed one");
        store.create_issue(&cancel, &mut b).unwrap();
        store.close_issue(&cancel, &b.id, None).unwrap();

        let mut filter = IssueFilter::default();
        filter.statuses = vec![Status::Open];
        let open = store.list_issues(&filter).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id.as_str(), "bd-aaaa");

        let mut filter = IssueFilter::default();
        filter.labels = vec!["x".to_owned()];
        assert_eq!(store.list_issues(&filter).unwrap().len(), 1);

        let mut filter = IssueFilter::default();
        filter.text = Some("closed".to_owned());
        let found = store.list_issues(&filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "bd-bbbb");
    }

    #[test]
    fn export_view_excludes_ephemeral_includes_tombstones() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        store
            .create_issue(&cancel, &mut new_issue("bd-aaaa", "Keep"))
            .unwrap();
        let mut scratch = new_issue("bd-bbbb", "Scratch");
        scratch.ephemeral = true;
        store.create_issue(&cancel, &mut scratch).unwrap();
        store
            .create_issue(&cancel, &mut new_issue("bd-cccc", "Dead"))
            .unwrap();
        store
            .delete_issue(&cancel, &id("bd-cccc"), None)
            .unwrap();

        let view = store.export_view().unwrap();
        let ids: Vec<&str> = view.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["bd-aaaa", "bd-cccc"]);
    }

    #[test]
    fn upsert_is_idempotent_by_content_hash() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut record = new_issue("bd-aaaa", "From file");
        record.labels = vec!["imported".to_owned()];

        assert_eq!(
            store.upsert_issue(&cancel, &record).unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            store.upsert_issue(&cancel, &record).unwrap(),
            UpsertOutcome::Unchanged
        );
        record.title = "Newer title".to_owned();
        assert_eq!(
            store.upsert_issue(&cancel, &record).unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(
            store.get_issue(&record.id).unwrap().unwrap().title,
            "Newer title"
        );
    }

    #[test]
    fn upsert_skips_tombstoned_id() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut victim = new_issue("bd-aaaa", "Doomed");
        store.create_issue(&cancel, &mut victim).unwrap();
        store.delete_issue(&cancel, &victim.id, None).unwrap();
        // Simulate a fresh clone importing the same id as a live row.
        store
            .with_write_tx(&cancel, |tx| {
                tx.execute("DELETE FROM issues WHERE id = 'bd-aaaa'", [])?;
                Ok(())
            })
            .unwrap();

        let record = new_issue("bd-aaaa", "Back from the dead");
        assert_eq!(
            store.upsert_issue(&cancel, &record).unwrap(),
            UpsertOutcome::SkippedTombstoned
        );
        assert!(!store.issue_exists(&record.id).unwrap());
    }

    #[test]
    fn upsert_preserves_unknown_extras() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut record = new_issue("bd-aaaa", "From the future");
        record.extras.insert(
            "quality_score".to_owned(),
            serde_json::Value::from(0.75),
        );
        store.upsert_issue(&cancel, &record).unwrap();
        let loaded = store.get_issue(&record.id).unwrap().unwrap();
        assert_eq!(
            loaded.extras.get("quality_score"),
            Some(&serde_json::Value::from(0.75))
        );
    }

    #[test]
    fn status_transition_rules() {
        use validate_transition as vt;
        assert!(vt(&Status::Open, &Status::InProgress).is_ok());
        assert!(vt(&Status::InProgress, &Status::Deferred).is_ok());
        assert!(vt(&Status::Open, &Status::Closed).is_ok());
        assert!(vt(&Status::Closed, &Status::Open).is_ok());
        assert!(vt(&Status::Closed, &Status::InProgress).is_err());
        assert!(vt(&Status::Tombstone, &Status::Open).is_err());
        assert!(vt(&Status::Blocked, &Status::Tombstone).is_ok());
    }

    #[test]
    fn update_with_dependency_keeps_relations() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut record = new_issue("bd-aaaa", "Child");
        record.dependencies.push(Dependency::new(
            id("bd-bbbb"),
            DependencyKind::ParentChild,
        ));
        store.upsert_issue(&cancel, &record).unwrap();
        let loaded = store.get_issue(&record.id).unwrap().unwrap();
        assert_eq!(loaded.dependencies.len(), 1);
        assert_eq!(loaded.dependencies[0].kind, DependencyKind::ParentChild);
    }
}
