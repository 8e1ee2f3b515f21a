//! Export: stream the store's superset view into the exchange file.
//!
//! The export writes a temp file in the control directory and atomically
//! renames it into place, so concurrent readers see either the previous
//! snapshot or the new one — never a partial file. Concurrent exporters are
//! serialized by an advisory lock next to the exchange file.

use std::fs::File;
use std::io::Write;

use chrono::Utc;
use fs2::FileExt;

use crate::error::{BeadsError, Result};
use crate::model::timefmt;
use crate::store::meta::{META_LAST_IMPORT_AT, META_LAST_IMPORT_HASH};
use crate::store::{CancelToken, Store};
use crate::workspace::Layout;

use super::{ErrorPolicy, ExportManifest, file_sha256};

/// What an export did.
#[derive(Clone, Debug)]
pub struct ExportOutcome {
    pub records: usize,
    pub skipped: usize,
    pub complete: bool,
}

/// Advisory lock guard; released when dropped.
struct ExportLock {
    file: File,
}

impl ExportLock {
    fn acquire(layout: &Layout) -> Result<Self> {
        layout.ensure_var_dir()?;
        let file = File::create(layout.export_lock_path())?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for ExportLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Export every non-ephemeral row to the exchange file.
///
/// Also journals the new file's hash as the last-import hash: store and file
/// agree after an export, and the next auto-sync must not re-import.
///
/// # Errors
/// `ExportFailed` under the strict policy when a record cannot be
/// serialized; I/O and storage errors.
pub fn export(
    store: &mut Store,
    layout: &Layout,
    policy: ErrorPolicy,
    write_manifest: bool,
    cancel: &CancelToken,
) -> Result<ExportOutcome> {
    let _lock = ExportLock::acquire(layout)?;

    // `export.skip_encoding_errors` downgrades encoding failures to skips
    // even under the strict policy.
    let skip_encoding_errors = store
        .config_get(crate::config::EXPORT_SKIP_ENCODING_ERRORS)?
        .is_some_and(|v| matches!(v.as_str(), "true" | "1" | "yes" | "on"));

    let issues = store.export_view()?;
    let mut lines = Vec::with_capacity(issues.len());
    let mut skipped = 0usize;
    for issue in &issues {
        if cancel.is_cancelled() {
            return Err(BeadsError::Timeout {
                operation: "export".to_owned(),
            });
        }
        match serde_json::to_string(issue) {
            Ok(line) => lines.push(line),
            Err(e) if policy == ErrorPolicy::Strict && !skip_encoding_errors => {
                return Err(BeadsError::ExportFailed {
                    detail: format!("cannot serialize '{}': {e}", issue.id),
                });
            }
            Err(e) => {
                tracing::warn!(id = %issue.id, error = %e, "skipping unserializable row");
                skipped += 1;
            }
        }
    }

    // Records are already sorted by identifier (the export view orders them).
    let mut tmp = tempfile::NamedTempFile::new_in(layout.control_dir())?;
    for line in &lines {
        tmp.write_all(line.as_bytes())?;
        tmp.write_all(b"\n")?;
    }
    tmp.flush()?;
    restrict_permissions(tmp.as_file())?;
    tmp.persist(layout.exchange_path())
        .map_err(|e| BeadsError::ExportFailed {
            detail: format!("atomic rename failed: {}", e.error),
        })?;

    let complete = skipped == 0 || policy == ErrorPolicy::Partial;
    if write_manifest {
        let manifest = ExportManifest {
            exported_at: Utc::now(),
            policy: policy.as_str().to_owned(),
            complete: skipped == 0,
            records: lines.len(),
            skipped,
        };
        std::fs::write(
            layout.manifest_path(),
            serde_json::to_string_pretty(&manifest)?,
        )?;
    }

    // Mirror the tombstone manifest alongside the exchange file.
    write_tombstone_file(store, layout)?;

    if let Some(hash) = file_sha256(&layout.exchange_path())? {
        store.metadata_set(cancel, META_LAST_IMPORT_HASH, &hash)?;
        store.metadata_set(cancel, META_LAST_IMPORT_AT, &timefmt::encode(&Utc::now()))?;
    }

    tracing::debug!(records = lines.len(), skipped, "export finished");
    Ok(ExportOutcome {
        records: lines.len(),
        skipped,
        complete,
    })
}

/// Rewrite `tombstones.jsonl` from the manifest table, in time order.
fn write_tombstone_file(store: &Store, layout: &Layout) -> Result<()> {
    let entries = store.tombstones()?;
    if entries.is_empty() && !layout.tombstones_path().exists() {
        return Ok(());
    }
    let mut out = String::new();
    for entry in &entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    let mut tmp = tempfile::NamedTempFile::new_in(layout.control_dir())?;
    tmp.write_all(out.as_bytes())?;
    tmp.flush()?;
    restrict_permissions(tmp.as_file())?;
    tmp.persist(layout.tombstones_path())
        .map_err(|e| BeadsError::ExportFailed {
            detail: format!("tombstone file rename failed: {}", e.error),
        })?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(file: &File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = file.metadata()?.permissions();
    perms.set_mode(0o600);
    file.set_permissions(perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &File) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
