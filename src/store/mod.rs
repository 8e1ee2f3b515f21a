//! Durable, transactional storage on SQLite.
//!
//! The store is the only writer to its tables; every mutation flows through
//! [`Store::with_write_tx`], which begins an immediate transaction and
//! retries on `SQLITE_BUSY` with exponential backoff (50 ms doubling to a
//! ~12.8 s ceiling, 10 attempts, ≤ ~25.5 s total). The enlarged budget is
//! what lets many agent processes contend on one workspace without spurious
//! failures. Read-only queries use the connection's short busy timeout
//! instead.

pub mod issues;
pub mod links;
pub mod meta;
pub mod schema;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};

use crate::error::{BeadsError, Result};

/// First retry delay after a busy write.
const RETRY_BASE: Duration = Duration::from_millis(50);
/// Backoff ceiling.
const RETRY_CAP: Duration = Duration::from_millis(12_800);
/// Write attempts before surfacing storage-unavailable.
const RETRY_ATTEMPTS: u32 = 10;
/// Busy timeout for read-only statements.
const READ_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Cooperative cancellation handle carried by long-running operations.
///
/// Cancelling aborts the wait for a busy transaction and stops imports
/// between records; it never undoes a committed transaction.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// An open workspace database.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: PathBuf,
    /// Compiled `ready.exclude_id_patterns`, cached on first use and
    /// invalidated when the config row is written.
    exclude_cache: RefCell<Option<Arc<Vec<glob::Pattern>>>>,
}

impl Store {
    /// Open (creating if absent) the database at `path` and bring the schema
    /// up to date.
    ///
    /// On filesystems whose locking SQLite's WAL mode cannot rely on
    /// (network mounts, detected by path heuristics), the store falls back
    /// to the rollback journal even though it reduces concurrency.
    ///
    /// # Errors
    /// Returns `MigrationRequired` if the on-disk schema is newer than this
    /// binary, or a storage error if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(READ_BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // `PRAGMA journal_mode` returns the resulting mode as a row, so it
        // goes through the query interface rather than pragma_update.
        if wal_unsafe_path(path) {
            let _mode: String =
                conn.query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))?;
            tracing::warn!(
                path = %path.display(),
                "network filesystem detected; using rollback journal instead of WAL"
            );
        } else {
            let _mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }

        let mut store = Self {
            conn,
            path: path.to_owned(),
            exclude_cache: RefCell::new(None),
        };
        store.apply_migrations()?;
        Ok(store)
    }

    /// Path of the underlying database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Direct access for read-only statements.
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // -- migrations ---------------------------------------------------------

    fn apply_migrations(&mut self) -> Result<()> {
        let current: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > schema::CURRENT_SCHEMA_VERSION {
            return Err(BeadsError::MigrationRequired {
                found: current,
                supported: schema::CURRENT_SCHEMA_VERSION,
            });
        }
        for migration in schema::MIGRATIONS.iter().filter(|m| m.version > current) {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            for statement in migration.statements {
                tx.execute_batch(statement)?;
            }
            tx.pragma_update(None, "user_version", migration.version)?;
            tx.commit()?;
            tracing::debug!(name = migration.name, version = migration.version, "applied migration");
        }
        Ok(())
    }

    // -- write transactions -------------------------------------------------

    /// Run `f` inside an immediate transaction, retrying on busy.
    ///
    /// # Errors
    /// Surfaces `StorageUnavailable` once the retry budget is exhausted;
    /// other errors from `f` propagate unchanged and roll the transaction
    /// back.
    pub fn with_write_tx<T>(
        &mut self,
        cancel: &CancelToken,
        mut f: impl FnMut(&Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut delay = RETRY_BASE;
        let mut last_busy = String::new();
        for attempt in 0..RETRY_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(BeadsError::Timeout {
                    operation: "write transaction (cancelled)".to_owned(),
                });
            }
            if attempt > 0 {
                std::thread::sleep(delay);
                delay = (delay * 2).min(RETRY_CAP);
            }
            let tx = match self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
            {
                Ok(tx) => tx,
                Err(err) if is_busy(&err) => {
                    last_busy = err.to_string();
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            match f(&tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(err) if is_busy(&err) => {
                        last_busy = err.to_string();
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                },
                Err(BeadsError::Sql(err)) if is_busy(&err) => {
                    last_busy = err.to_string();
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(BeadsError::StorageUnavailable {
            detail: format!("database stayed busy after {RETRY_ATTEMPTS} attempts: {last_busy}"),
        })
    }

    // -- caches -------------------------------------------------------------

    /// Compiled exclude patterns for ready-work, cached until the config row
    /// changes.
    ///
    /// # Errors
    /// Returns a config error if a stored pattern is not valid glob syntax.
    pub fn exclude_patterns(&self) -> Result<Arc<Vec<glob::Pattern>>> {
        if let Some(cached) = self.exclude_cache.borrow().as_ref() {
            return Ok(Arc::clone(cached));
        }
        let raw = self.config_get(crate::config::READY_EXCLUDE_ID_PATTERNS)?;
        let mut patterns = Vec::new();
        if let Some(raw) = raw {
            for pat in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                patterns.push(glob::Pattern::new(pat).map_err(|e| BeadsError::Config {
                    detail: format!("bad exclude pattern '{pat}': {e}"),
                })?);
            }
        }
        let patterns = Arc::new(patterns);
        *self.exclude_cache.borrow_mut() = Some(Arc::clone(&patterns));
        Ok(patterns)
    }

    pub(crate) fn invalidate_exclude_cache(&self) {
        self.exclude_cache.borrow_mut().take();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// Heuristic: paths where SQLite's shared-memory WAL locking is unreliable.
fn wal_unsafe_path(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.starts_with("//")
        || s.starts_with(r"\\")
        || s.starts_with("/mnt/")
        || s.starts_with("/net/")
        || s.starts_with("/nfs")
        || s.contains("/nfs/")
}

/// The event actor: git `user.name`, falling back to `$USER`, cached for the
/// process lifetime.
pub fn actor() -> &'static str {
    static ACTOR: OnceLock<String> = OnceLock::new();
    ACTOR.get_or_init(|| {
        if let Ok(output) = std::process::Command::new("git")
            .args(["config", "user.name"])
            .output()
        {
            if output.status.success() {
                let name = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                if !name.is_empty() {
                    return name;
                }
            }
        }
        std::env::var("USER").unwrap_or_else(|_| "unknown".to_owned())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("beads.db")).expect("open");
        (dir, store)
    }

    #[test]
    fn open_applies_all_migrations() {
        let (_dir, store) = temp_store();
        let version: i64 = store
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, schema::CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beads.db");
        drop(Store::open(&path).unwrap());
        drop(Store::open(&path).unwrap());
        let store = Store::open(&path).unwrap();
        let count: i64 = store
            .conn()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'issues'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beads.db");
        drop(Store::open(&path).unwrap());
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 9_999).unwrap();
        }
        match Store::open(&path) {
            Err(BeadsError::MigrationRequired { found, .. }) => assert_eq!(found, 9_999),
            other => panic!("expected MigrationRequired, got {other:?}"),
        }
    }

    #[test]
    fn write_tx_commits() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        store
            .with_write_tx(&cancel, |tx| {
                tx.execute(
                    "INSERT INTO config (key, value) VALUES ('k', 'v')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        let value: String = store
            .conn()
            .query_row("SELECT value FROM config WHERE key = 'k'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(value, "v");
    }

    #[test]
    fn write_tx_rolls_back_on_error() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        let result: Result<()> = store.with_write_tx(&cancel, |tx| {
            tx.execute("INSERT INTO config (key, value) VALUES ('k', 'v')", [])?;
            Err(BeadsError::MissingField { field: "title" })
        });
        assert!(result.is_err());
        let count: i64 = store
            .conn()
            .query_row("SELECT count(*) FROM config", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn cancelled_token_aborts_before_work() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result: Result<()> = store.with_write_tx(&cancel, |_tx| Ok(()));
        assert!(matches!(result, Err(BeadsError::Timeout { .. })));
    }

    #[test]
    fn wal_heuristic_flags_network_paths() {
        assert!(wal_unsafe_path(Path::new("/mnt/share/beads.db")));
        assert!(wal_unsafe_path(Path::new("//server/share/beads.db")));
        assert!(wal_unsafe_path(Path::new("/nfs/home/beads.db")));
        assert!(!wal_unsafe_path(Path::new("/home/dev/repo/.beads/beads.db")));
    }
}
