//! Workspace configuration.
//!
//! Config lives in the store's `config` table and is optionally mirrored to
//! `.beads/config.toml` so it travels with the repository. The table wins on
//! conflict; the mirror seeds an empty table at open. Missing file means all
//! defaults (no error).

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{BeadsError, Result};
use crate::graph::SortPolicy;
use crate::serial::ErrorPolicy;
use crate::store::{CancelToken, Store};

// Recognized config keys. All optional.
pub const ISSUE_PREFIX: &str = "issue_prefix";
pub const SYNC_BRANCH: &str = "sync.branch";
pub const EXPORT_POLICY: &str = "export.policy";
pub const EXPORT_AUTO_POLICY: &str = "export.auto_policy";
pub const EXPORT_RETRY_ATTEMPTS: &str = "export.retry_attempts";
pub const EXPORT_RETRY_BACKOFF_MS: &str = "export.retry_backoff_ms";
pub const EXPORT_SKIP_ENCODING_ERRORS: &str = "export.skip_encoding_errors";
pub const EXPORT_WRITE_MANIFEST: &str = "export.write_manifest";
pub const READY_EXCLUDE_ID_PATTERNS: &str = "ready.exclude_id_patterns";
pub const READY_SORT_POLICY: &str = "ready.sort_policy";
pub const COMPACT_TIER1_DAYS: &str = "compact.tier1_days";
pub const COMPACT_TIER1_DEP_LEVELS: &str = "compact.tier1_dep_levels";
pub const RETENTION_TOMBSTONE_DAYS: &str = "retention.tombstone_days";
pub const ID_MIN_LENGTH: &str = "id.min_length";
pub const ID_MAX_LENGTH: &str = "id.max_length";

/// Every key the store recognizes, for `bd config list` completeness.
pub const KNOWN_KEYS: &[&str] = &[
    ISSUE_PREFIX,
    SYNC_BRANCH,
    EXPORT_POLICY,
    EXPORT_AUTO_POLICY,
    EXPORT_RETRY_ATTEMPTS,
    EXPORT_RETRY_BACKOFF_MS,
    EXPORT_SKIP_ENCODING_ERRORS,
    EXPORT_WRITE_MANIFEST,
    READY_EXCLUDE_ID_PATTERNS,
    READY_SORT_POLICY,
    COMPACT_TIER1_DAYS,
    COMPACT_TIER1_DEP_LEVELS,
    RETENTION_TOMBSTONE_DAYS,
    ID_MIN_LENGTH,
    ID_MAX_LENGTH,
];

const DEFAULT_PREFIX: &str = "bd";

// ---------------------------------------------------------------------------
// Typed view
// ---------------------------------------------------------------------------

/// Snapshot of the configuration a command needs, with defaults applied.
#[derive(Clone, Debug)]
pub struct WorkspaceConfig {
    pub issue_prefix: String,
    pub sync_branch: String,
    pub export_policy: ErrorPolicy,
    pub export_auto_policy: ErrorPolicy,
    pub export_write_manifest: bool,
    pub ready_sort_policy: SortPolicy,
    pub retention_tombstone_days: u32,
    pub id_min_length: usize,
    pub id_max_length: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            issue_prefix: DEFAULT_PREFIX.to_owned(),
            sync_branch: "main".to_owned(),
            export_policy: ErrorPolicy::Strict,
            export_auto_policy: ErrorPolicy::BestEffort,
            export_write_manifest: true,
            ready_sort_policy: SortPolicy::Hybrid,
            retention_tombstone_days: 0,
            id_min_length: 4,
            id_max_length: 8,
        }
    }
}

impl WorkspaceConfig {
    /// Load the typed view from the store, falling back to defaults for
    /// unset keys.
    ///
    /// # Errors
    /// A config error for values that fail to parse.
    pub fn load(store: &Store) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(prefix) = store.config_get(ISSUE_PREFIX)? {
            cfg.issue_prefix = prefix;
        }
        if let Some(branch) = store.config_get(SYNC_BRANCH)? {
            cfg.sync_branch = branch;
        }
        if let Some(raw) = store.config_get(EXPORT_POLICY)? {
            cfg.export_policy = parse_key(EXPORT_POLICY, &raw)?;
        }
        if let Some(raw) = store.config_get(EXPORT_AUTO_POLICY)? {
            cfg.export_auto_policy = parse_key(EXPORT_AUTO_POLICY, &raw)?;
        }
        if let Some(raw) = store.config_get(EXPORT_WRITE_MANIFEST)? {
            cfg.export_write_manifest = parse_bool(EXPORT_WRITE_MANIFEST, &raw)?;
        }
        if let Some(raw) = store.config_get(READY_SORT_POLICY)? {
            cfg.ready_sort_policy =
                raw.parse().map_err(|e| BeadsError::Config { detail: e })?;
        }
        if let Some(raw) = store.config_get(RETENTION_TOMBSTONE_DAYS)? {
            cfg.retention_tombstone_days = parse_key(RETENTION_TOMBSTONE_DAYS, &raw)?;
        }
        if let Some(raw) = store.config_get(ID_MIN_LENGTH)? {
            cfg.id_min_length = parse_key(ID_MIN_LENGTH, &raw)?;
        }
        if let Some(raw) = store.config_get(ID_MAX_LENGTH)? {
            cfg.id_max_length = parse_key(ID_MAX_LENGTH, &raw)?;
        }
        if cfg.id_min_length < 4 || cfg.id_max_length > 8 || cfg.id_min_length > cfg.id_max_length {
            return Err(BeadsError::Config {
                detail: format!(
                    "id length bounds {}..{} out of range (4..8 allowed)",
                    cfg.id_min_length, cfg.id_max_length
                ),
            });
        }
        Ok(cfg)
    }
}

fn parse_key<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| BeadsError::Config {
        detail: format!("bad value '{raw}' for {key}: {e}"),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(BeadsError::Config {
            detail: format!("bad boolean '{raw}' for {key}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// TOML mirror
// ---------------------------------------------------------------------------

/// The `.beads/config.toml` mirror: a flat `[config]` table of string
/// key/value pairs.
#[derive(Debug, Default, Deserialize)]
struct ConfigMirror {
    #[serde(default)]
    config: std::collections::BTreeMap<String, String>,
}

/// Seed an empty config table from the mirror file, if present.
///
/// Called once at workspace open. Rows already in the table win; the mirror
/// only fills gaps, so a pulled config.toml cannot clobber local settings.
///
/// # Errors
/// A config error if the mirror exists but fails to parse.
pub fn seed_from_mirror(store: &mut Store, cancel: &CancelToken, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let content = std::fs::read_to_string(path)?;
    let mirror: ConfigMirror = toml::from_str(&content).map_err(|e| BeadsError::Config {
        detail: format!("failed to parse {}: {e}", path.display()),
    })?;
    for (key, value) in &mirror.config {
        if store.config_get(key)?.is_none() {
            store.config_set(cancel, key, value)?;
        }
    }
    Ok(())
}

/// Rewrite the mirror file from the config table.
///
/// # Errors
/// I/O errors writing the file.
pub fn write_mirror(store: &Store, path: &Path) -> Result<()> {
    let mut out = String::from("[config]\n");
    for (key, value) in store.config_list()? {
        out.push_str(&format!("{key:?} = {value:?}\n"));
    }
    std::fs::write(path, out)?;
    Ok(())
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
    fn defaults_when_unset() {
        let (_dir, store) = temp_store();
        let cfg = WorkspaceConfig::load(&store).unwrap();
        assert_eq!(cfg.issue_prefix, "bd");
        assert_eq!(cfg.ready_sort_policy, SortPolicy::Hybrid);
        assert_eq!(cfg.export_policy, ErrorPolicy::Strict);
        assert_eq!(cfg.id_min_length, 4);
    }

    #[test]
    fn typed_values_parse() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        store.config_set(&cancel, ISSUE_PREFIX, "proj").unwrap();
        store.config_set(&cancel, READY_SORT_POLICY, "oldest").unwrap();
        store.config_set(&cancel, EXPORT_POLICY, "best-effort").unwrap();
        store.config_set(&cancel, ID_MAX_LENGTH, "6").unwrap();
        let cfg = WorkspaceConfig::load(&store).unwrap();
        assert_eq!(cfg.issue_prefix, "proj");
        assert_eq!(cfg.ready_sort_policy, SortPolicy::Oldest);
        assert_eq!(cfg.export_policy, ErrorPolicy::BestEffort);
        assert_eq!(cfg.id_max_length, 6);
    }

    #[test]
    fn bad_values_are_config_errors() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        store.config_set(&cancel, READY_SORT_POLICY, "fastest").unwrap();
        assert!(matches!(
            WorkspaceConfig::load(&store),
            Err(BeadsError::Config { .. })
        ));
    }

    #[test]
    fn id_bounds_validated() {
        let (_dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        store.config_set(&cancel, ID_MIN_LENGTH, "9").unwrap();
        assert!(WorkspaceConfig::load(&store).is_err());
    }

    #[test]
    fn mirror_seeds_only_missing_keys() {
        let (dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        store.config_set(&cancel, ISSUE_PREFIX, "local").unwrap();
        let mirror = dir.path().join("config.toml");
        std::fs::write(
            &mirror,
            "[config]\n\"issue_prefix\" = \"pulled\"\n\"sync.branch\" = \"trunk\"\n",
        )
        .unwrap();

        seed_from_mirror(&mut store, &cancel, &mirror).unwrap();
        assert_eq!(store.config_get(ISSUE_PREFIX).unwrap().as_deref(), Some("local"));
        assert_eq!(store.config_get(SYNC_BRANCH).unwrap().as_deref(), Some("trunk"));
    }

    #[test]
    fn mirror_round_trips() {
        let (dir, mut store) = temp_store();
        let cancel = CancelToken::new();
        store.config_set(&cancel, ISSUE_PREFIX, "proj").unwrap();
        let mirror = dir.path().join("config.toml");
        write_mirror(&store, &mirror).unwrap();

        let (dir2, mut fresh) = temp_store();
        let _ = dir2;
        seed_from_mirror(&mut fresh, &cancel, &mirror).unwrap();
        assert_eq!(fresh.config_get(ISSUE_PREFIX).unwrap().as_deref(), Some("proj"));
    }

    #[test]
    fn missing_mirror_is_fine() {
        let (dir, mut store) = temp_store();
        seed_from_mirror(&mut store, &CancelToken::new(), &dir.path().join("absent.toml"))
            .unwrap();
    }
}
