//! Shared helpers for beads integration tests.
//!
//! All tests run against temp directories — no side effects outside them.
//! Each test gets its own workspace via `TestWorkspace::new()`.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use beads::model::{Issue, IssueId};
use beads::store::{CancelToken, Store};
use beads::workspace::Layout;

/// A fresh workspace in a temp directory.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub layout: Layout,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let layout = Layout::init(dir.path()).expect("failed to init layout");
        Self { dir, layout }
    }

    /// Open (or reopen) the workspace store.
    pub fn store(&self) -> Store {
        Store::open(&self.layout.db_path()).expect("failed to open store")
    }
}

pub fn id(s: &str) -> IssueId {
    IssueId::new(s).expect("bad test id")
}

pub fn ts(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(i64::from(secs))
}

/// Create a plain open issue with a deterministic timestamp.
pub fn create(store: &mut Store, ident: &str, title: &str) -> Issue {
    let mut issue = Issue::new(id(ident), title, ts(0));
    store
        .create_issue(&CancelToken::new(), &mut issue)
        .expect("create failed");
    issue
}

/// Serialize records into an exchange file at the workspace's path.
pub fn write_exchange(layout: &Layout, records: &[Issue]) {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record).expect("serialize"));
        out.push('\n');
    }
    std::fs::write(layout.exchange_path(), out).expect("write exchange file");
}
