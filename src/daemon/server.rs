//! The per-workspace daemon: one long-lived process holding an open store
//! connection and the flush manager, serving local clients over a Unix
//! domain socket.
//!
//! A PID file plus a heartbeat file guard against two daemons on the same
//! workspace. Concurrent clients are accepted; requests serialize only at
//! the store boundary (one mutex around the connection). The daemon shuts
//! itself down after the idle timeout, or on an explicit `shutdown` request.

use std::io::Write as _;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::autosync::{self, SyncOptions};
use crate::config::WorkspaceConfig;
use crate::error::{BeadsError, Result};
use crate::flush::FlushManager;
use crate::graph::SortPolicy;
use crate::identity;
use crate::model::timefmt;
use crate::model::{DependencyKind, Issue, IssueId};
use crate::store::issues::{IssueFilter, IssuePatch};
use crate::store::{CancelToken, Store};
use crate::workspace::Layout;

use super::protocol::{self, ERR_UNKNOWN_OP, Request, Response};

/// Default idle shutdown.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Default per-request deadline.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

/// Tunables for [`run`].
#[derive(Clone, Copy, Debug)]
pub struct DaemonOptions {
    pub idle_timeout: Duration,
    pub request_deadline: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            request_deadline: REQUEST_DEADLINE,
        }
    }
}

struct DaemonState {
    store: Mutex<Store>,
    layout: Layout,
    flush: FlushManager,
    last_activity: Mutex<Instant>,
    stopping: AtomicBool,
}

/// Run the daemon until idle timeout or an explicit stop. Blocks.
///
/// # Errors
/// `DaemonUnavailable` if another daemon already serves this workspace;
/// socket and storage errors.
pub fn run(layout: &Layout, options: DaemonOptions) -> Result<()> {
    layout.ensure_var_dir()?;
    let socket_path = layout.socket_path();

    if socket_path.exists() {
        if UnixStream::connect(&socket_path).is_ok() {
            return Err(BeadsError::DaemonUnavailable {
                detail: format!(
                    "a daemon is already serving this workspace ({})",
                    socket_path.display()
                ),
            });
        }
        // Unclean shutdown left a dead socket behind.
        std::fs::remove_file(&socket_path)?;
    }

    let mut store = Store::open(&layout.db_path())?;
    let config = WorkspaceConfig::load(&store)?;
    autosync::ensure_fresh(&mut store, layout, &config, &CancelToken::new())?;

    let listener = UnixListener::bind(&socket_path)?;
    restrict_socket(&socket_path)?;
    std::fs::write(layout.pid_path(), format!("{}\n", std::process::id()))?;

    let state = Arc::new(DaemonState {
        store: Mutex::new(store),
        layout: layout.clone(),
        flush: FlushManager::spawn(
            layout.clone(),
            config.export_auto_policy,
            config.export_write_manifest,
        ),
        last_activity: Mutex::new(Instant::now()),
        stopping: AtomicBool::new(false),
    });

    spawn_idle_monitor(Arc::clone(&state), options.idle_timeout);
    tracing::info!(socket = %socket_path.display(), "daemon listening");

    for stream in listener.incoming() {
        if state.stopping.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&state);
                let deadline = options.request_deadline;
                std::thread::spawn(move || serve_client(&state, stream, deadline));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
            }
        }
    }
    cleanup(layout);
    Ok(())
}

/// Remove the daemon's volatile files. Safe to call twice.
pub fn cleanup(layout: &Layout) {
    let _ = std::fs::remove_file(layout.socket_path());
    let _ = std::fs::remove_file(layout.pid_path());
    let _ = std::fs::remove_file(layout.heartbeat_path());
}

fn spawn_idle_monitor(state: Arc<DaemonState>, idle_timeout: Duration) {
    std::thread::spawn(move || {
        let tick = Duration::from_secs(5).min(idle_timeout);
        loop {
            std::thread::sleep(tick);
            let _ = std::fs::write(
                state.layout.heartbeat_path(),
                timefmt::encode(&Utc::now()),
            );
            if state.stopping.load(Ordering::SeqCst) {
                return;
            }
            let idle = state
                .last_activity
                .lock()
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if idle >= idle_timeout {
                tracing::info!("idle timeout reached; shutting down");
                state.stopping.store(true, Ordering::SeqCst);
                // process::exit skips destructors, so flush explicitly.
                let _ = state.flush.flush_and_wait(REQUEST_DEADLINE);
                cleanup(&state.layout);
                std::process::exit(0);
            }
        }
    });
}

fn serve_client(state: &DaemonState, stream: UnixStream, deadline: Duration) {
    let _ = stream.set_read_timeout(Some(deadline));
    let _ = stream.set_write_timeout(Some(deadline));
    let mut reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!(error = %e, "cannot clone client stream");
            return;
        }
    };
    let mut writer = stream;

    loop {
        let request: Request = match protocol::read_frame(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "client stream closed");
                return;
            }
        };
        if let Ok(mut t) = state.last_activity.lock() {
            *t = Instant::now();
        }

        let response = dispatch(state, &request);
        if protocol::write_frame(&mut writer, &response).is_err() {
            return;
        }
        let _ = writer.flush();

        if request.op == "shutdown" {
            state.stopping.store(true, Ordering::SeqCst);
            // process::exit skips destructors, so flush explicitly.
            let _ = state.flush.flush_and_wait(REQUEST_DEADLINE);
            cleanup(&state.layout);
            std::process::exit(0);
        }
    }
}

fn dispatch(state: &DaemonState, request: &Request) -> Response {
    match handle(state, &request.op, &request.args) {
        Ok(result) => Response::ok(request.id, result),
        Err(BeadsError::DaemonUnavailable { detail }) if detail == ERR_UNKNOWN_OP => {
            Response::err(request.id, ERR_UNKNOWN_OP, format!("no operation '{}'", request.op))
        }
        Err(e) => Response::err(request.id, "error", e.to_string()),
    }
}

#[allow(clippy::too_many_lines)]
fn handle(state: &DaemonState, op: &str, args: &serde_json::Value) -> Result<serde_json::Value> {
    let cancel = CancelToken::new();
    let mut store = state.store.lock().map_err(|_| BeadsError::StorageUnavailable {
        detail: "store mutex poisoned".to_owned(),
    })?;

    let result = match op {
        "ping" => serde_json::json!({
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
        }),
        "create" => {
            let mut issue: Issue = serde_json::from_value(args.clone())?;
            store.create_issue(&cancel, &mut issue)?;
            state.flush.request_flush();
            serde_json::to_value(&issue)?
        }
        "mint" => {
            let config = WorkspaceConfig::load(&store)?;
            let id = identity::mint_id(
                &store,
                &config.issue_prefix,
                config.id_min_length,
                config.id_max_length,
            )?;
            serde_json::json!({ "id": id })
        }
        "update" => {
            let id = arg_id(args, "id")?;
            let patch: IssuePatch = serde_json::from_value(args["patch"].clone())?;
            let issue = store.update_issue(&cancel, &id, &patch)?;
            state.flush.request_flush();
            serde_json::to_value(&issue)?
        }
        "close" => {
            let id = arg_id(args, "id")?;
            let reason = args["reason"].as_str();
            let issue = store.close_issue(&cancel, &id, reason)?;
            state.flush.request_flush();
            serde_json::to_value(&issue)?
        }
        "reopen" => {
            let id = arg_id(args, "id")?;
            let issue = store.reopen_issue(&cancel, &id)?;
            state.flush.request_flush();
            serde_json::to_value(&issue)?
        }
        "delete" => {
            let id = arg_id(args, "id")?;
            store.delete_issue(&cancel, &id, args["reason"].as_str())?;
            state.flush.request_flush();
            serde_json::json!({ "deleted": id })
        }
        "dep.add" => {
            let id = arg_id(args, "id")?;
            let target = arg_id(args, "depends_on")?;
            let kind: DependencyKind = args["kind"]
                .as_str()
                .unwrap_or("blocks")
                .parse()
                .unwrap_or(DependencyKind::Blocks);
            store.add_dependency(&cancel, &id, &target, kind)?;
            state.flush.request_flush();
            serde_json::json!({ "ok": true })
        }
        "dep.remove" => {
            let id = arg_id(args, "id")?;
            let target = arg_id(args, "depends_on")?;
            let kind: DependencyKind = args["kind"]
                .as_str()
                .unwrap_or("blocks")
                .parse()
                .unwrap_or(DependencyKind::Blocks);
            store.remove_dependency(&cancel, &id, &target, &kind)?;
            state.flush.request_flush();
            serde_json::json!({ "ok": true })
        }
        "show" => {
            let id = arg_id(args, "id")?;
            let issue = store
                .get_issue(&id)?
                .ok_or(BeadsError::NotFound { id })?;
            serde_json::to_value(&issue)?
        }
        "list" => {
            let filter: IssueFilter = serde_json::from_value(args.clone())?;
            serde_json::to_value(store.list_issues(&filter)?)?
        }
        "ready" => {
            let policy = args["policy"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(SortPolicy::Hybrid);
            let limit = args["limit"].as_u64().map(|n| n as usize);
            serde_json::to_value(store.ready_work(policy, limit)?)?
        }
        "flush" => {
            drop(store);
            let outcome = state.flush.flush_and_wait(REQUEST_DEADLINE)?;
            return Ok(serde_json::json!({
                "records": outcome.records,
                "complete": outcome.complete,
            }));
        }
        "sync" => {
            let config = WorkspaceConfig::load(&store)?;
            let action =
                autosync::ensure_fresh(&mut store, &state.layout, &config, &cancel)?;
            serde_json::json!({ "action": format!("{action:?}") })
        }
        "export" => {
            let config = WorkspaceConfig::load(&store)?;
            let action = autosync::guarded_export(
                &mut store,
                &state.layout,
                &config,
                SyncOptions {
                    allow_empty_export: args["force"].as_bool().unwrap_or(false),
                },
                &cancel,
            )?;
            serde_json::json!({ "action": format!("{action:?}") })
        }
        "shutdown" => serde_json::json!({ "stopping": true }),
        _ => {
            return Err(BeadsError::DaemonUnavailable {
                detail: ERR_UNKNOWN_OP.to_owned(),
            });
        }
    };
    Ok(result)
}

fn arg_id(args: &serde_json::Value, key: &str) -> Result<IssueId> {
    let raw = args[key].as_str().ok_or(BeadsError::MissingField { field: "id" })?;
    Ok(IssueId::new(raw)?)
}

fn restrict_socket(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
