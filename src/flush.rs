//! Flush manager: coalesce exports triggered by bursts of writes.
//!
//! One background task per workspace. Writers enqueue flush requests; the
//! manager debounces for a short window (default 500 ms) and runs exactly
//! one export at window expiry. Requests arriving during an export fold into
//! a single following export, so the file always ends up reflecting every
//! committed write — coalesced, never lost. Cross-process exclusion comes
//! from the export's advisory file lock.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{BeadsError, Result};
use crate::serial::{self, ErrorPolicy, ExportOutcome};
use crate::store::{CancelToken, Store};
use crate::workspace::Layout;

/// Default debounce window.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

enum Msg {
    Flush(Option<mpsc::Sender<Result<ExportOutcome>>>),
    Shutdown,
}

/// Handle to the per-workspace flush task. Dropping it runs a final
/// synchronous export if any request arrived after the last export.
pub struct FlushManager {
    sender: mpsc::Sender<Msg>,
    worker: Option<JoinHandle<()>>,
}

impl FlushManager {
    /// Spawn the background task for `layout`.
    #[must_use]
    pub fn spawn(layout: Layout, policy: ErrorPolicy, write_manifest: bool) -> Self {
        Self::spawn_with_window(layout, policy, write_manifest, DEBOUNCE_WINDOW)
    }

    /// As [`FlushManager::spawn`], with an explicit debounce window (tests
    /// use a short one).
    #[must_use]
    pub fn spawn_with_window(
        layout: Layout,
        policy: ErrorPolicy,
        write_manifest: bool,
        window: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel();
        let worker = std::thread::spawn(move || {
            run_worker(&receiver, &layout, policy, write_manifest, window);
        });
        Self {
            sender,
            worker: Some(worker),
        }
    }

    /// Enqueue a flush after a completed write. Returns immediately.
    pub fn request_flush(&self) {
        let _ = self.sender.send(Msg::Flush(None));
    }

    /// Enqueue a flush and block until the export that covers it finishes.
    ///
    /// # Errors
    /// The export's error, or `Timeout` if the manager went away.
    pub fn flush_and_wait(&self, timeout: Duration) -> Result<ExportOutcome> {
        let (tx, rx) = mpsc::channel();
        self.sender
            .send(Msg::Flush(Some(tx)))
            .map_err(|_| BeadsError::Timeout {
                operation: "flush (manager stopped)".to_owned(),
            })?;
        rx.recv_timeout(timeout).map_err(|_| BeadsError::Timeout {
            operation: "flush".to_owned(),
        })?
    }
}

impl Drop for FlushManager {
    fn drop(&mut self) {
        let _ = self.sender.send(Msg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    receiver: &mpsc::Receiver<Msg>,
    layout: &Layout,
    policy: ErrorPolicy,
    write_manifest: bool,
    window: Duration,
) {
    let mut dirty = false;
    loop {
        let responder = match receiver.recv() {
            Ok(Msg::Flush(responder)) => responder,
            Ok(Msg::Shutdown) | Err(_) => break,
        };
        dirty = true;
        let mut latest = responder;
        let mut stop = false;

        // Debounce: absorb the burst until the window expires.
        let deadline = Instant::now() + window;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match receiver.recv_timeout(deadline - now) {
                Ok(Msg::Flush(responder)) => {
                    if responder.is_some() {
                        latest = responder;
                    }
                }
                Ok(Msg::Shutdown) => {
                    stop = true;
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    stop = true;
                    break;
                }
            }
        }

        let result = run_export(layout, policy, write_manifest);
        dirty = false;
        match (latest, result) {
            (Some(responder), result) => {
                let _ = responder.send(result);
            }
            (None, Err(e)) => tracing::warn!(error = %e, "background export failed"),
            (None, Ok(_)) => {}
        }
        if stop {
            return;
        }
    }
    // Shutdown: final synchronous export if a request arrived after the
    // last export.
    if dirty {
        if let Err(e) = run_export(layout, policy, write_manifest) {
            tracing::warn!(error = %e, "final export on shutdown failed");
        }
    }
}

fn run_export(layout: &Layout, policy: ErrorPolicy, write_manifest: bool) -> Result<ExportOutcome> {
    // A fresh connection per export: the manager outlives any one store
    // handle and must see every committed write.
    let mut store = Store::open(&layout.db_path())?;

    // `export.retry_attempts` / `export.retry_backoff_ms` cover transient
    // failures (the advisory lock held by another process, a slow disk).
    let attempts = config_u64(&store, crate::config::EXPORT_RETRY_ATTEMPTS, 1).max(1);
    let backoff =
        Duration::from_millis(config_u64(&store, crate::config::EXPORT_RETRY_BACKOFF_MS, 100));

    let mut last_err = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            std::thread::sleep(backoff);
        }
        match serial::export(&mut store, layout, policy, write_manifest, &CancelToken::new()) {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "export attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(BeadsError::ExportFailed {
        detail: "export retry budget exhausted".to_owned(),
    }))
}

fn config_u64(store: &Store, key: &str, default: u64) -> u64 {
    store
        .config_get(key)
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Issue, IssueId};
    use chrono::Utc;

    fn workspace() -> (tempfile::TempDir, Layout, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::init(dir.path()).expect("init layout");
        let store = Store::open(&layout.db_path()).expect("open");
        (dir, layout, store)
    }

    fn create(store: &mut Store, id: &str) {
        let mut issue = Issue::new(IssueId::new(id).unwrap(), format!("Issue {id}"), Utc::now());
        store.create_issue(&CancelToken::new(), &mut issue).unwrap();
    }

    #[test]
    fn burst_of_requests_yields_complete_export() {
        let (_dir, layout, mut store) = workspace();
        let manager = FlushManager::spawn_with_window(
            layout.clone(),
            ErrorPolicy::Strict,
            false,
            Duration::from_millis(50),
        );

        for id in ["bd-aaaa", "bd-bbbb", "bd-cccc"] {
            create(&mut store, id);
            manager.request_flush();
        }
        let outcome = manager.flush_and_wait(Duration::from_secs(10)).unwrap();
        assert_eq!(outcome.records, 3);

        let content = std::fs::read_to_string(layout.exchange_path()).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn flush_matches_direct_export() {
        let (_dir, layout, mut store) = workspace();
        create(&mut store, "bd-aaaa");
        let manager = FlushManager::spawn_with_window(
            layout.clone(),
            ErrorPolicy::Strict,
            false,
            Duration::from_millis(10),
        );
        manager.flush_and_wait(Duration::from_secs(10)).unwrap();
        let flushed = std::fs::read(layout.exchange_path()).unwrap();

        serial::export(
            &mut store,
            &layout,
            ErrorPolicy::Strict,
            false,
            &CancelToken::new(),
        )
        .unwrap();
        let direct = std::fs::read(layout.exchange_path()).unwrap();
        assert_eq!(flushed, direct);
    }

    #[test]
    fn shutdown_runs_final_export_when_dirty() {
        let (_dir, layout, mut store) = workspace();
        create(&mut store, "bd-aaaa");
        {
            let manager = FlushManager::spawn_with_window(
                layout.clone(),
                ErrorPolicy::Strict,
                false,
                // Window far longer than the test: the flush can only have
                // happened via the shutdown path.
                Duration::from_secs(60),
            );
            manager.request_flush();
            // Give the worker a moment to pick the request up.
            std::thread::sleep(Duration::from_millis(50));
        }
        let content = std::fs::read_to_string(layout.exchange_path()).unwrap();
        assert!(content.contains("bd-aaaa"));
    }

    #[test]
    fn export_error_reaches_waiting_requester() {
        let dir = tempfile::tempdir().unwrap();
        // A layout whose control dir does not exist: opening the store fails.
        let layout = Layout::at(dir.path().join("missing/.beads"));
        let manager = FlushManager::spawn_with_window(
            layout,
            ErrorPolicy::Strict,
            false,
            Duration::from_millis(10),
        );
        let err = manager.flush_and_wait(Duration::from_secs(10)).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
