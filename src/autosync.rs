//! Auto-sync: keep the store and the exchange file consistent across
//! sessions and external edits (a pull, a hand edit, a fresh clone).
//!
//! Every command that touches the store runs the staleness check first. The
//! exchange file's content hash is compared against the journaled
//! last-import hash; a mismatch means the file changed behind our back and
//! is imported before the command proceeds. The check never exports an
//! empty store over a non-empty file unless explicitly overridden — that is
//! the guard against wiping a tracker from a mis-initialized clone.

use crate::config::WorkspaceConfig;
use crate::error::{BeadsError, Result};
use crate::serial::{self, ErrorPolicy, file_sha256};
use crate::store::meta::META_LAST_IMPORT_HASH;
use crate::store::{CancelToken, Store};
use crate::workspace::Layout;

/// What the staleness check decided to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// Store and file agree; nothing happened.
    Fresh,
    /// The file was newer (or the store empty); an import ran.
    Imported,
    /// The file was missing and the store was not empty; an export ran.
    Exported,
    /// The store is empty and the file non-empty was refused for export.
    RefusedEmptyExport,
}

/// Options for [`ensure_fresh`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncOptions {
    /// Allow exporting an empty store over a non-empty exchange file.
    pub allow_empty_export: bool,
}

/// Run the staleness check and reconcile if needed.
///
/// # Errors
/// `ImportFailed` (store and file untouched) when the inbound pass fails;
/// export and storage errors otherwise.
pub fn ensure_fresh(
    store: &mut Store,
    layout: &Layout,
    config: &WorkspaceConfig,
    cancel: &CancelToken,
) -> Result<SyncAction> {
    // Fast path: the file has not been touched since the last import, so
    // there is no need to hash it.
    if file_unchanged_since_journal(store, layout)? {
        return Ok(SyncAction::Fresh);
    }

    let file_hash = file_sha256(&layout.exchange_path())?;
    let journal = store.metadata_get(META_LAST_IMPORT_HASH)?;
    let store_empty = store.is_empty()?;

    match file_hash {
        None => {
            if store_empty {
                return Ok(SyncAction::Fresh);
            }
            // File lost or never written: regenerate it from the store.
            serial::export(
                store,
                layout,
                config.export_auto_policy,
                config.export_write_manifest,
                cancel,
            )?;
            Ok(SyncAction::Exported)
        }
        Some(hash) => {
            if journal.as_deref() == Some(hash.as_str()) {
                return Ok(SyncAction::Fresh);
            }
            // Covers both the fresh-clone case (empty store, full file) and
            // an external edit after a pull: the file is the newer truth.
            serial::import(store, layout, import_policy(config), cancel)?;
            Ok(SyncAction::Imported)
        }
    }
}

/// Guarded export for write paths: refuse to clobber a non-empty exchange
/// file from an empty store.
///
/// # Errors
/// Export errors; the refusal is reported in the action, not as an error.
pub fn guarded_export(
    store: &mut Store,
    layout: &Layout,
    config: &WorkspaceConfig,
    options: SyncOptions,
    cancel: &CancelToken,
) -> Result<SyncAction> {
    if store.is_empty()? && !is_effectively_empty(layout)? && !options.allow_empty_export {
        tracing::warn!(
            "refusing to export an empty store over a non-empty exchange file; \
             pass the explicit override to force"
        );
        return Ok(SyncAction::RefusedEmptyExport);
    }
    serial::export(
        store,
        layout,
        config.export_policy,
        config.export_write_manifest,
        cancel,
    )?;
    Ok(SyncAction::Exported)
}

/// True when the exchange file's modification time predates the journaled
/// last-import time. A clock that runs backwards only costs us a hash check.
fn file_unchanged_since_journal(store: &Store, layout: &Layout) -> Result<bool> {
    let Some(journalled) = store.metadata_get(crate::store::meta::META_LAST_IMPORT_AT)? else {
        return Ok(false);
    };
    let Ok(journalled) = crate::model::timefmt::decode(&journalled) else {
        return Ok(false);
    };
    let Ok(meta) = std::fs::metadata(layout.exchange_path()) else {
        return Ok(false);
    };
    let Ok(mtime) = meta.modified() else {
        return Ok(false);
    };
    let mtime: chrono::DateTime<chrono::Utc> = mtime.into();
    // A full second of slack absorbs coarse filesystem timestamp
    // granularity; anything closer goes through the hash comparison.
    Ok(mtime + chrono::Duration::seconds(1) <= journalled)
}

const fn import_policy(config: &WorkspaceConfig) -> ErrorPolicy {
    // Auto-sync runs in front of unrelated commands; a single bad line must
    // not brick every invocation, so the auto policy applies.
    config.export_auto_policy
}

fn is_effectively_empty(layout: &Layout) -> Result<bool> {
    match std::fs::read_to_string(layout.exchange_path()) {
        Ok(content) => Ok(content.lines().all(|l| l.trim().is_empty())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(BeadsError::Io(e)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
