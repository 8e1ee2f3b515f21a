//! CLI command implementations.
//!
//! Each command is a thin wrapper: open the workspace, auto-sync, run one
//! library operation, flush. The daemon is consulted first for store
//! operations when its socket is up; unknown operations (or no daemon) fall
//! back to in-process mode.

pub mod admin;
pub mod dep;
pub mod issue;
pub mod sync;

use anyhow::{Context as _, Result};

use beads::autosync;
use beads::config::{self, WorkspaceConfig};
use beads::flush::FlushManager;
use beads::store::{CancelToken, Store};
use beads::workspace::{self, Layout};

/// An opened workspace: layout, store, typed config, and a flush manager
/// that runs the post-write export (final one on drop).
pub struct Context {
    pub layout: Layout,
    pub store: Store,
    pub config: WorkspaceConfig,
    pub cancel: CancelToken,
    flush: Option<FlushManager>,
}

impl Context {
    /// Discover the workspace, open the store, seed config from the mirror,
    /// and run the staleness check.
    pub fn open() -> Result<Self> {
        let cwd = std::env::current_dir().context("cannot determine working directory")?;
        let layout = workspace::discover(&cwd)?;
        Self::open_at(layout)
    }

    /// As [`Context::open`] with a known layout (used by routed commands).
    pub fn open_at(layout: Layout) -> Result<Self> {
        let cancel = CancelToken::new();
        let mut store = Store::open(&layout.db_path())?;
        config::seed_from_mirror(&mut store, &cancel, &layout.config_mirror_path())?;
        let config = WorkspaceConfig::load(&store)?;
        autosync::ensure_fresh(&mut store, &layout, &config, &cancel)?;
        Ok(Self {
            layout,
            store,
            config,
            cancel,
            flush: None,
        })
    }

    /// Enqueue the post-write export. The first call spawns the manager;
    /// dropping the context runs the final flush.
    pub fn flush_after_write(&mut self) {
        let manager = self.flush.get_or_insert_with(|| {
            FlushManager::spawn(
                self.layout.clone(),
                self.config.export_auto_policy,
                self.config.export_write_manifest,
            )
        });
        manager.request_flush();
    }

    /// Try the daemon for one operation. `None` means run in-process.
    #[cfg(unix)]
    pub fn try_daemon(
        &self,
        op: &str,
        args: serde_json::Value,
    ) -> Option<beads::Result<serde_json::Value>> {
        use beads::daemon::{CallOutcome, DaemonClient};
        let mut client = match DaemonClient::connect(&self.layout) {
            Ok(Some(client)) => client,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        match client.call(op, args) {
            Ok(CallOutcome::Ok(value)) => Some(Ok(value)),
            Ok(CallOutcome::UnknownOp) => None,
            Err(e) => Some(Err(e)),
        }
    }

    #[cfg(not(unix))]
    pub fn try_daemon(
        &self,
        _op: &str,
        _args: serde_json::Value,
    ) -> Option<beads::Result<serde_json::Value>> {
        None
    }
}

/// Print a value as pretty JSON (the `--json` escape hatch).
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One-line summary used by list-style output.
pub fn issue_line(issue: &beads::model::Issue) -> String {
    let labels = if issue.labels.is_empty() {
        String::new()
    } else {
        format!(" [{}]", issue.labels.join(", "))
    };
    format!(
        "{:<14} {} {:<11} {}{}",
        issue.id, issue.priority, issue.status, issue.title, labels
    )
}
