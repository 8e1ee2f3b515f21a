//! DDL and the linear migration list for the SQLite schema.
//!
//! Timestamps are stored as TEXT in the canonical exchange form (SQLite has
//! no native datetime type). Booleans are INTEGER 0/1. Unknown-field extras
//! are a JSON TEXT blob. The schema version lives in `PRAGMA user_version`;
//! each migration is idempotent and applied inside one transaction.

/// A single numbered migration.
pub struct Migration {
    /// Target schema version after this migration runs.
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

/// Schema version written by this binary.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

/// The linear migration list. Applied in order at open; a database at
/// version N skips the first N entries.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        statements: &[
            r"
            CREATE TABLE IF NOT EXISTS issues (
                id                  TEXT PRIMARY KEY,
                content_hash        TEXT NOT NULL DEFAULT '',
                title               TEXT NOT NULL,
                description         TEXT,
                design              TEXT,
                acceptance_criteria TEXT,
                notes               TEXT,
                status              TEXT NOT NULL DEFAULT 'open',
                priority            INTEGER NOT NULL DEFAULT 2,
                issue_type          TEXT NOT NULL DEFAULT 'task',
                assignee            TEXT,
                estimated_minutes   INTEGER,
                created_at          TEXT NOT NULL,
                created_by          TEXT,
                updated_at          TEXT NOT NULL,
                closed_at           TEXT,
                close_reason        TEXT,
                deleted_at          TEXT,
                deleted_by          TEXT,
                delete_reason       TEXT,
                original_type       TEXT,
                external_ref        TEXT,
                source_system       TEXT,
                ephemeral           INTEGER NOT NULL DEFAULT 0,
                pinned              INTEGER NOT NULL DEFAULT 0,
                extras              TEXT NOT NULL DEFAULT '{}'
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS dependencies (
                issue_id      TEXT NOT NULL,
                depends_on_id TEXT NOT NULL,
                kind          TEXT NOT NULL DEFAULT 'blocks',
                created_at    TEXT NOT NULL,
                created_by    TEXT,
                PRIMARY KEY (issue_id, depends_on_id, kind),
                FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS labels (
                issue_id TEXT NOT NULL,
                label    TEXT NOT NULL,
                PRIMARY KEY (issue_id, label),
                FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS comments (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_id   TEXT NOT NULL,
                author     TEXT NOT NULL,
                body       TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_id   TEXT NOT NULL,
                kind       TEXT NOT NULL,
                actor      TEXT NOT NULL,
                payload    TEXT,
                created_at TEXT NOT NULL
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS metadata (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS tombstones (
                id         TEXT PRIMARY KEY,
                deleted_at TEXT NOT NULL,
                actor      TEXT NOT NULL,
                reason     TEXT
            )
            ",
        ],
    },
    Migration {
        version: 2,
        name: "query_indexes",
        statements: &[
            "CREATE INDEX IF NOT EXISTS idx_issues_status_priority_created
                 ON issues(status, priority, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_issues_priority_assignee
                 ON issues(priority, assignee)",
            "CREATE INDEX IF NOT EXISTS idx_deps_issue ON dependencies(issue_id)",
            "CREATE INDEX IF NOT EXISTS idx_deps_target ON dependencies(depends_on_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_issue ON events(issue_id)",
            "CREATE INDEX IF NOT EXISTS idx_comments_issue ON comments(issue_id)",
            "CREATE INDEX IF NOT EXISTS idx_labels_label ON labels(label)",
            // Partial index feeding the ready-work query.
            "CREATE INDEX IF NOT EXISTS idx_issues_ready
                 ON issues(priority, created_at)
                 WHERE pinned = 0 AND ephemeral = 0
                   AND status NOT IN ('closed', 'tombstone')",
        ],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_linear() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.version, i as i64 + 1, "migration {} out of order", m.name);
        }
        assert_eq!(
            MIGRATIONS.last().map(|m| m.version),
            Some(CURRENT_SCHEMA_VERSION)
        );
    }

    #[test]
    fn statements_are_idempotent_by_construction() {
        for m in MIGRATIONS {
            for s in m.statements {
                let sql = s.trim_start();
                assert!(
                    sql.starts_with("CREATE TABLE IF NOT EXISTS")
                        || sql.starts_with("CREATE INDEX IF NOT EXISTS"),
                    "migration {} has a non-idempotent statement",
                    m.name
                );
            }
        }
    }
}
