//! Config rows, the metadata journal, and tombstone manifest administration.
//!
//! `config` holds operator-set keys (issue prefix, export policy, ready-work
//! tuning). `metadata` holds machine-written tracking fields: the last-import
//! hash and time, and the tool version that wrote the schema. Tombstones are
//! append-only under normal commands; `purge_tombstones` is the single
//! administrative edit.

use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, params};

use crate::error::Result;
use crate::model::timefmt;
use crate::model::{IssueId, TombstoneEntry};

use super::{CancelToken, Store};

/// Metadata key: SHA-256 of the exchange file at last import/export.
pub const META_LAST_IMPORT_HASH: &str = "last_import_hash";
/// Metadata key: time of the last import/export, canonical form.
pub const META_LAST_IMPORT_AT: &str = "last_import_at";
/// Metadata key: tool version that last wrote the schema.
pub const META_TOOL_VERSION: &str = "tool_version";

impl Store {
    // -- config -------------------------------------------------------------

    /// Read one config key.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write one config key, invalidating dependent caches.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn config_set(&mut self, cancel: &CancelToken, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_owned(), value.to_owned());
        self.with_write_tx(cancel, |tx| {
            tx.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })?;
        self.invalidate_exclude_cache();
        Ok(())
    }

    /// All config rows, sorted by key.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn config_list(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(pairs)
    }

    // -- metadata -----------------------------------------------------------

    /// # Errors
    /// Storage errors only.
    pub fn metadata_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// # Errors
    /// Storage errors only.
    pub fn metadata_set(&mut self, cancel: &CancelToken, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_owned(), value.to_owned());
        self.with_write_tx(cancel, |tx| {
            tx.execute(
                "INSERT INTO metadata (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    // -- tombstones ---------------------------------------------------------

    /// Whether an identifier is in the tombstone manifest.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn is_tombstoned(&self, id: &IssueId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT count(*) FROM tombstones WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The full manifest, oldest deletion first.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn tombstones(&self) -> Result<Vec<TombstoneEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, deleted_at, actor, reason FROM tombstones ORDER BY deleted_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, deleted_at, actor, reason) = row?;
            entries.push(TombstoneEntry {
                id: IssueId::new(&id)?,
                deleted_at: timefmt::decode(&deleted_at).unwrap_or_default(),
                actor,
                reason,
            });
        }
        Ok(entries)
    }

    /// Administrative manifest rewrite: drop tombstones older than the
    /// retention window and remove their issue rows. `retention_days == 0`
    /// disables purging entirely.
    ///
    /// Returns the purged identifiers.
    ///
    /// # Errors
    /// Storage errors only.
    pub fn purge_tombstones(
        &mut self,
        cancel: &CancelToken,
        retention_days: u32,
    ) -> Result<Vec<IssueId>> {
        if retention_days == 0 {
            return Ok(Vec::new());
        }
        let cutoff = timefmt::encode(&(Utc::now() - Duration::days(i64::from(retention_days))));
        self.with_write_tx(cancel, |tx| {
            let mut stmt =
                tx.prepare("SELECT id FROM tombstones WHERE deleted_at < ?1 ORDER BY id")?;
            let ids: Vec<String> = stmt
                .query_map(params![cutoff], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);
            let mut purged = Vec::new();
            for id in ids {
                tx.execute("DELETE FROM tombstones WHERE id = ?1", params![id])?;
                tx.execute(
                    "DELETE FROM issues WHERE id = ?1 AND status = 'tombstone'",
                    params![id],
                )?;
                purged.push(IssueId::new(&id)?);
            }
            Ok(purged)
        })
    }
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

    #[test]
    fn config_set_get_overwrite() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        assert!(store.config_get("issue_prefix").unwrap().is_none());
        store.config_set(&cancel, "issue_prefix", "bd").unwrap();
        assert_eq!(store.config_get("issue_prefix").unwrap().as_deref(), Some("bd"));
        store.config_set(&cancel, "issue_prefix", "proj").unwrap();
        assert_eq!(store.config_get("issue_prefix").unwrap().as_deref(), Some("proj"));
        assert_eq!(store.config_list().unwrap().len(), 1);
    }

    #[test]
    fn config_write_invalidates_exclude_cache() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        assert!(store.exclude_patterns().unwrap().is_empty());
        store
            .config_set(&cancel, crate::config::READY_EXCLUDE_ID_PATTERNS, "bd-tmp*")
            .unwrap();
        let patterns = store.exclude_patterns().unwrap();
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].matches("bd-tmp1"));
    }

    #[test]
    fn metadata_journal_round_trip() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        store
            .metadata_set(&cancel, META_LAST_IMPORT_HASH, "deadbeef")
            .unwrap();
        assert_eq!(
            store.metadata_get(META_LAST_IMPORT_HASH).unwrap().as_deref(),
            Some("deadbeef")
        );
    }

    #[test]
    fn purge_respects_retention_window() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let mut old = Issue::new(
            IssueId::new("bd-aaaa").unwrap(),
            "Old",
            Utc::now() - Duration::days(100),
        );
        store.create_issue(&cancel, &mut old).unwrap();
        store.delete_issue(&cancel, &old.id, None).unwrap();
        // Backdate the tombstone so it falls outside the window.
        store
            .with_write_tx(&cancel, |tx| {
                tx.execute(
                    "UPDATE tombstones SET deleted_at = ?1",
                    params![timefmt::encode(&(Utc::now() - Duration::days(90)))],
                )?;
                Ok(())
            })
            .unwrap();

        assert!(store.purge_tombstones(&cancel, 0).unwrap().is_empty());
        assert!(store.purge_tombstones(&cancel, 365).unwrap().is_empty());
        let purged = store.purge_tombstones(&cancel, 30).unwrap();
        assert_eq!(purged.len(), 1);
        assert!(!store.is_tombstoned(&old.id).unwrap());
        assert!(!store.issue_exists(&old.id).unwrap());
    }
}
