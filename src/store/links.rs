//! Relational writes: dependencies, labels, and comments, plus event reads.
//!
//! Dependency inserts of a blocking kind run the cycle check against the
//! full persisted edge set before touching the table; the offending path
//! comes back in the error.

use chrono::Utc;
use rusqlite::params;

use crate::error::{BeadsError, Result};
use crate::graph;
use crate::model::timefmt;
use crate::model::{Comment, Dependency, DependencyKind, Event, EventKind, IssueId};

use super::issues::{append_event_tx, exists_tx};
use super::{CancelToken, Store, actor};

impl Store {
    /// Add a directed dependency edge: `issue` depends on `target`.
    ///
    /// # Errors
    /// `NotFound` if either endpoint is missing, `CycleDetected` (with the
    /// offending path) if a blocking edge would close a cycle.
    pub fn add_dependency(
        &mut self,
        cancel: &CancelToken,
        issue: &IssueId,
        target: &IssueId,
        kind: DependencyKind,
    ) -> Result<()> {
        if !self.issue_exists(issue)? {
            return Err(BeadsError::NotFound { id: issue.clone() });
        }
        if !self.issue_exists(target)? {
            return Err(BeadsError::NotFound { id: target.clone() });
        }
        if kind.is_blocking() {
            let edges = self.blocking_edges()?;
            if let Some(path) = graph::cycle_path_with(&edges, issue, target) {
                return Err(BeadsError::CycleDetected { path });
            }
        }
        let now = timefmt::encode(&Utc::now());
        let who = actor().to_owned();
        let kind_str = kind.as_str().to_owned();
        self.with_write_tx(cancel, |tx| {
            tx.execute(
                "INSERT OR IGNORE INTO dependencies
                     (issue_id, depends_on_id, kind, created_at, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![issue.as_str(), target.as_str(), kind_str, now, who],
            )?;
            append_event_tx(
                tx,
                issue,
                &EventKind::DependencyAdded,
                Some(serde_json::json!({ "depends_on": target.as_str(), "kind": kind_str })),
            )?;
            if kind_str == "parent-child" {
                // Parent linkage participates in the content hash.
                refresh_content_hash_tx(tx, issue)?;
            }
            Ok(())
        })
    }

    /// Remove a dependency edge.
    ///
    /// # Errors
    /// `NotFound` if the edge does not exist.
    pub fn remove_dependency(
        &mut self,
        cancel: &CancelToken,
        issue: &IssueId,
        target: &IssueId,
        kind: &DependencyKind,
    ) -> Result<()> {
        let kind_str = kind.as_str().to_owned();
        self.with_write_tx(cancel, |tx| {
            let removed = tx.execute(
                "DELETE FROM dependencies
                 WHERE issue_id = ?1 AND depends_on_id = ?2 AND kind = ?3",
                params![issue.as_str(), target.as_str(), kind_str],
            )?;
            if removed == 0 {
                return Err(BeadsError::NotFound { id: issue.clone() });
            }
            append_event_tx(
                tx,
                issue,
                &EventKind::DependencyRemoved,
                Some(serde_json::json!({ "depends_on": target.as_str(), "kind": kind_str })),
            )?;
            if kind_str == "parent-child" {
                refresh_content_hash_tx(tx, issue)?;
            }
            Ok(())
        })
    }

    /// Every persisted edge, all kinds.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn all_dependencies(&self) -> Result<Vec<Dependency>> {
        let mut stmt = self.conn().prepare(
            "SELECT issue_id, depends_on_id, kind, created_at, created_by
             FROM dependencies ORDER BY issue_id, depends_on_id, kind",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        let mut deps = Vec::new();
        for row in rows {
            let (source, target, kind, created_at, created_by) = row?;
            deps.push(Dependency {
                issue_id: Some(IssueId::new(&source)?),
                depends_on_id: IssueId::new(&target)?,
                kind: kind.parse().unwrap_or(DependencyKind::Blocks),
                created_at: created_at.as_deref().and_then(|s| timefmt::decode(s).ok()),
                created_by,
            });
        }
        Ok(deps)
    }

    /// Edges that participate in cycle checks and blocked computation
    /// (blocks and parent-child), as (source, target) id pairs.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn blocking_edges(&self) -> Result<Vec<(IssueId, IssueId)>> {
        let mut stmt = self.conn().prepare(
            "SELECT issue_id, depends_on_id FROM dependencies
             WHERE kind IN ('blocks', 'parent-child')",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut edges = Vec::new();
        for row in rows {
            let (source, target) = row?;
            edges.push((IssueId::new(&source)?, IssueId::new(&target)?));
        }
        Ok(edges)
    }

    /// Attach a label.
    ///
    /// # Errors
    /// `NotFound` for unknown issues.
    pub fn add_label(
        &mut self,
        cancel: &CancelToken,
        issue: &IssueId,
        label: &str,
    ) -> Result<()> {
        let label = label.to_owned();
        self.with_write_tx(cancel, |tx| {
            if !exists_tx(tx, issue)? {
                return Err(BeadsError::NotFound { id: issue.clone() });
            }
            let added = tx.execute(
                "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)",
                params![issue.as_str(), label],
            )?;
            if added > 0 {
                append_event_tx(
                    tx,
                    issue,
                    &EventKind::LabelAdded,
                    Some(serde_json::json!({ "label": label })),
                )?;
                refresh_content_hash_tx(tx, issue)?;
            }
            Ok(())
        })
    }

    /// Detach a label.
    ///
    /// # Errors
    /// `NotFound` if the label was not attached.
    pub fn remove_label(
        &mut self,
        cancel: &CancelToken,
        issue: &IssueId,
        label: &str,
    ) -> Result<()> {
        let label = label.to_owned();
        self.with_write_tx(cancel, |tx| {
            let removed = tx.execute(
                "DELETE FROM labels WHERE issue_id = ?1 AND label = ?2",
                params![issue.as_str(), label],
            )?;
            if removed == 0 {
                return Err(BeadsError::NotFound { id: issue.clone() });
            }
            append_event_tx(
                tx,
                issue,
                &EventKind::LabelRemoved,
                Some(serde_json::json!({ "label": label })),
            )?;
            refresh_content_hash_tx(tx, issue)?;
            Ok(())
        })
    }

    /// Append a comment by the current actor.
    ///
    /// # Errors
    /// `NotFound` for unknown issues.
    pub fn add_comment(
        &mut self,
        cancel: &CancelToken,
        issue: &IssueId,
        body: &str,
    ) -> Result<Comment> {
        if body.trim().is_empty() {
            return Err(BeadsError::MissingField { field: "text" });
        }
        let now = Utc::now();
        let who = actor().to_owned();
        let body = body.to_owned();
        let row_id = self.with_write_tx(cancel, |tx| {
            if !exists_tx(tx, issue)? {
                return Err(BeadsError::NotFound { id: issue.clone() });
            }
            tx.execute(
                "INSERT INTO comments (issue_id, author, body, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![issue.as_str(), who, body, timefmt::encode(&now)],
            )?;
            let row_id = tx.last_insert_rowid();
            append_event_tx(tx, issue, &EventKind::Commented, None)?;
            Ok(row_id)
        })?;
        Ok(Comment {
            id: row_id,
            author: actor().to_owned(),
            body,
            created_at: now,
        })
    }

    /// Audit events for one issue, oldest first.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn events_for(&self, issue: &IssueId) -> Result<Vec<Event>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, issue_id, kind, actor, payload, created_at FROM events
             WHERE issue_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![issue.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (id, issue_id, kind, actor, payload, created_at) = row?;
            events.push(Event {
                id,
                issue_id: IssueId::new(&issue_id)?,
                kind: kind.parse().unwrap_or(EventKind::Custom(kind)),
                actor,
                payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
                created_at: timefmt::decode(&created_at).unwrap_or_default(),
            });
        }
        Ok(events)
    }
}

/// Recompute and persist the content hash after a relation change that
/// participates in it (labels, parent edges).
fn refresh_content_hash_tx(tx: &rusqlite::Transaction, id: &IssueId) -> Result<()> {
    let mut labels_stmt =
        tx.prepare("SELECT label FROM labels WHERE issue_id = ?1 ORDER BY label")?;
    let labels: Vec<String> = labels_stmt
        .query_map(params![id.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    drop(labels_stmt);

    let mut parents_stmt = tx.prepare(
        "SELECT depends_on_id FROM dependencies
         WHERE issue_id = ?1 AND kind = 'parent-child' ORDER BY depends_on_id",
    )?;
    let parents: Vec<String> = parents_stmt
        .query_map(params![id.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    drop(parents_stmt);

    // Rebuild just enough of the issue to rehash: scalar fields + sets.
    let mut issue = tx.query_row(
        &format!(
            "SELECT {} FROM issues WHERE id = ?1",
            super::issues::ISSUE_COLUMNS
        ),
        params![id.as_str()],
        |row| {
            // Reuse the full row mapper via a thin shim.
            super::issues::map_issue_row(row)
        },
    )?;
    issue.labels = labels;
    issue.dependencies = parents
        .into_iter()
        .filter_map(|p| IssueId::new(&p).ok())
        .map(|p| Dependency::new(p, DependencyKind::ParentChild))
        .collect();
    let hash = issue.compute_content_hash();
    tx.execute(
        "UPDATE issues SET content_hash = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.as_str(), hash, timefmt::encode(&Utc::now())],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Issue;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("beads.db")).expect("open");
        (dir, store)
    }

    fn id(s: &str) -> IssueId {
        IssueId::new(s).unwrap()
    }

    fn seed(store: &mut Store, ids: &[&str]) {
        let cancel = CancelToken::new();
        for s in ids {
            let mut issue = Issue::new(id(s), format!("Issue {s}"), Utc::now());
            store.create_issue(&cancel, &mut issue).unwrap();
        }
    }

    #[test]
    fn add_and_remove_dependency() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        seed(&mut store, &["bd-aaaa", "bd-bbbb"]);

        store
            .add_dependency(&cancel, &id("bd-aaaa"), &id("bd-bbbb"), DependencyKind::Blocks)
            .unwrap();
        assert_eq!(store.all_dependencies().unwrap().len(), 1);

        store
            .remove_dependency(&cancel, &id("bd-aaaa"), &id("bd-bbbb"), &DependencyKind::Blocks)
            .unwrap();
        assert!(store.all_dependencies().unwrap().is_empty());
    }

    #[test]
    fn dependency_requires_both_endpoints() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        seed(&mut store, &["bd-aaaa"]);
        let err = store
            .add_dependency(&cancel, &id("bd-aaaa"), &id("bd-zzzz"), DependencyKind::Blocks)
            .unwrap_err();
        assert!(matches!(err, BeadsError::NotFound { .. }));
    }

    #[test]
    fn cycle_is_rejected_with_path() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        seed(&mut store, &["bd-aaaa", "bd-bbbb", "bd-cccc"]);
        store
            .add_dependency(&cancel, &id("bd-aaaa"), &id("bd-bbbb"), DependencyKind::Blocks)
            .unwrap();
        store
            .add_dependency(&cancel, &id("bd-bbbb"), &id("bd-cccc"), DependencyKind::Blocks)
            .unwrap();

        let err = store
            .add_dependency(&cancel, &id("bd-cccc"), &id("bd-aaaa"), DependencyKind::Blocks)
            .unwrap_err();
        let BeadsError::CycleDetected { path } = err else {
            panic!("expected cycle");
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);
        // No edge was added.
        assert_eq!(store.all_dependencies().unwrap().len(), 2);
    }

    #[test]
    fn related_edges_skip_cycle_check() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        seed(&mut store, &["bd-aaaa", "bd-bbbb"]);
        store
            .add_dependency(&cancel, &id("bd-aaaa"), &id("bd-bbbb"), DependencyKind::Related)
            .unwrap();
        // The reverse related edge is fine — related edges form no cycle.
        store
            .add_dependency(&cancel, &id("bd-bbbb"), &id("bd-aaaa"), DependencyKind::Related)
            .unwrap();
        assert_eq!(store.all_dependencies().unwrap().len(), 2);
    }

    #[test]
    fn labels_update_content_hash() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        seed(&mut store, &["bd-aaaa"]);
        let before = store.get_issue(&id("bd-aaaa")).unwrap().unwrap();

        store.add_label(&cancel, &id("bd-aaaa"), "urgent").unwrap();
        let after = store.get_issue(&id("bd-aaaa")).unwrap().unwrap();
        assert_ne!(before.content_hash, after.content_hash);
        assert_eq!(after.labels, vec!["urgent".to_owned()]);

        store.remove_label(&cancel, &id("bd-aaaa"), "urgent").unwrap();
        let removed = store.get_issue(&id("bd-aaaa")).unwrap().unwrap();
        assert_eq!(removed.content_hash, before.content_hash);
    }

    #[test]
    fn comments_append_and_load() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        seed(&mut store, &["bd-aaaa"]);
        store.add_comment(&cancel, &id("bd-aaaa"), "first").unwrap();
        store.add_comment(&cancel, &id("bd-aaaa"), "second").unwrap();
        let issue = store.get_issue(&id("bd-aaaa")).unwrap().unwrap();
        assert_eq!(issue.comments.len(), 2);
        assert_eq!(issue.comments[0].body, "first");
    }

    #[test]
    fn events_record_dependency_changes() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        seed(&mut store, &["bd-aaaa", "bd-bbbb"]);
        store
            .add_dependency(&cancel, &id("bd-aaaa"), &id("bd-bbbb"), DependencyKind::Blocks)
            .unwrap();
        let events = store.events_for(&id("bd-aaaa")).unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert!(kinds.contains(&"created"));
        assert!(kinds.contains(&"dependency_added"));
    }
}
