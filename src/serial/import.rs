//! Import: apply the exchange file to the store.
//!
//! Records are applied transactionally one by one — partial progress is
//! observable, which is what lets a cancelled import resume cheaply. Under
//! the strict policy the whole file is parsed before the first write, so a
//! malformed line leaves the store untouched. Tombstoned identifiers are
//! skipped with a warning event; dangling parent references are resolved by
//! synthesizing closed placeholder rows.

use std::collections::HashSet;

use chrono::Utc;

use crate::error::{BeadsError, Result};
use crate::model::timefmt;
use crate::model::{EventKind, Issue, IssueId};
use crate::store::issues::UpsertOutcome;
use crate::store::meta::{META_LAST_IMPORT_AT, META_LAST_IMPORT_HASH};
use crate::store::{CancelToken, Store};
use crate::workspace::Layout;

use super::{ErrorPolicy, file_sha256};

/// What an import did.
#[derive(Clone, Debug, Default)]
pub struct ImportOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_tombstoned: usize,
    pub skipped_malformed: usize,
    /// Placeholder rows synthesized for dangling references.
    pub resurrected: Vec<IssueId>,
}

/// Import the workspace's exchange file.
///
/// # Errors
/// `ImportFailed` with the offending line under the strict policy; storage
/// errors; `Timeout` when the cancel token fires between records.
pub fn import(
    store: &mut Store,
    layout: &Layout,
    policy: ErrorPolicy,
    cancel: &CancelToken,
) -> Result<ImportOutcome> {
    let path = layout.exchange_path();
    let content = std::fs::read_to_string(&path).map_err(|e| BeadsError::ImportFailed {
        line: None,
        detail: format!("cannot read {}: {e}", path.display()),
    })?;

    let mut outcome = ImportOutcome::default();
    let mut records: Vec<(usize, Issue)> = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Issue>(line) {
            Ok(issue) => records.push((i + 1, issue)),
            Err(e) => match policy {
                ErrorPolicy::Strict => {
                    return Err(BeadsError::ImportFailed {
                        line: Some(i + 1),
                        detail: e.to_string(),
                    });
                }
                ErrorPolicy::BestEffort | ErrorPolicy::Partial => {
                    tracing::warn!(line = i + 1, error = %e, "skipping malformed record");
                    outcome.skipped_malformed += 1;
                }
            },
        }
    }

    for (line, record) in &records {
        if cancel.is_cancelled() {
            return Err(BeadsError::Timeout {
                operation: format!("import (cancelled before line {line})"),
            });
        }
        match store.upsert_issue(cancel, record)? {
            UpsertOutcome::Created => outcome.created += 1,
            UpsertOutcome::Updated => outcome.updated += 1,
            UpsertOutcome::Unchanged => outcome.unchanged += 1,
            UpsertOutcome::SkippedTombstoned => {
                outcome.skipped_tombstoned += 1;
                tracing::warn!(id = %record.id, "skipping tombstoned identifier");
                store.with_write_tx(cancel, |tx| {
                    crate::store::issues::append_event_tx(
                        tx,
                        &record.id,
                        &EventKind::ImportSkipped,
                        Some(serde_json::json!({ "reason": "tombstoned" })),
                    )
                })?;
            }
        }
    }

    outcome.resurrected = resurrect_dangling(store, cancel)?;

    // Journal the import so staleness detection has a baseline.
    if let Some(hash) = file_sha256(&path)? {
        store.metadata_set(cancel, META_LAST_IMPORT_HASH, &hash)?;
        store.metadata_set(cancel, META_LAST_IMPORT_AT, &timefmt::encode(&Utc::now()))?;
    }

    tracing::debug!(
        created = outcome.created,
        updated = outcome.updated,
        unchanged = outcome.unchanged,
        "import finished"
    );
    Ok(outcome)
}

/// Synthesize closed placeholders for dependency targets that resolve to
/// nothing. Tombstoned identifiers stay dead — a dangling reference to one
/// is dropped with a warning instead.
pub fn resurrect_dangling(store: &mut Store, cancel: &CancelToken) -> Result<Vec<IssueId>> {
    let deps = store.all_dependencies()?;
    let mut targets: Vec<IssueId> = deps.into_iter().map(|d| d.depends_on_id).collect();
    targets.sort();
    targets.dedup();

    let mut seen: HashSet<IssueId> = HashSet::new();
    let mut resurrected = Vec::new();
    for target in targets {
        if !seen.insert(target.clone()) || store.issue_exists(&target)? {
            continue;
        }
        if store.is_tombstoned(&target)? {
            tracing::warn!(id = %target, "dangling reference to tombstoned id; not resurrected");
            continue;
        }
        let mut placeholder = Issue::resurrected(target.clone(), Utc::now());
        placeholder.content_hash = Some(placeholder.compute_content_hash());
        let snapshot = placeholder.clone();
        store.with_write_tx(cancel, |tx| {
            crate::store::issues::insert_issue_tx(tx, &snapshot)?;
            crate::store::issues::append_event_tx(
                tx,
                &snapshot.id,
                &EventKind::Resurrected,
                None,
            )?;
            Ok(())
        })?;
        resurrected.push(target);
    }
    Ok(resurrected)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
