//! Tombstone irreversibility: a manifested identifier never reappears
//! through import, merge, or explicit creation.

mod common;

use common::{TestWorkspace, create, id, ts, write_exchange};

use beads::error::BeadsError;
use beads::merge;
use beads::model::{Issue, Status};
use beads::serial::{self, ErrorPolicy};
use beads::store::CancelToken;

/// Delete an issue and then drop its row, leaving only the manifest entry —
/// the state a fresh clone that pulled the manifest would be in.
fn tombstone_and_forget(ws: &TestWorkspace, ident: &str) {
    let mut store = ws.store();
    let cancel = CancelToken::new();
    create(&mut store, ident, "Doomed");
    store.delete_issue(&cancel, &id(ident), Some("test")).unwrap();
    store
        .with_write_tx(&cancel, |tx| {
            tx.execute("DELETE FROM issues WHERE id = ?1", [ident])?;
            Ok(())
        })
        .unwrap();
}

#[test]
fn import_never_resurrects_a_tombstoned_id() {
    // Repeated imports never bring a manifested identifier back.
    let ws = TestWorkspace::new();
    tombstone_and_forget(&ws, "bd-dead");

    let revived = Issue::new(id("bd-dead"), "I'm back", ts(5));
    write_exchange(&ws.layout, &[revived]);

    let mut store = ws.store();
    let cancel = CancelToken::new();
    for _ in 0..3 {
        let outcome =
            serial::import(&mut store, &ws.layout, ErrorPolicy::Strict, &cancel).unwrap();
        assert_eq!(outcome.skipped_tombstoned, 1);
        assert!(!store.issue_exists(&id("bd-dead")).unwrap());
    }
}

#[test]
fn explicit_create_of_tombstoned_id_fails() {
    let ws = TestWorkspace::new();
    tombstone_and_forget(&ws, "bd-dead");

    let mut store = ws.store();
    let mut attempt = Issue::new(id("bd-dead"), "Again", ts(0));
    let err = store
        .create_issue(&CancelToken::new(), &mut attempt)
        .unwrap_err();
    assert!(matches!(err, BeadsError::Tombstoned { .. }));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn tombstone_record_round_trips_with_marker() {
    let ws = TestWorkspace::new();
    let mut store = ws.store();
    let cancel = CancelToken::new();
    create(&mut store, "bd-dead", "Doomed");
    store.delete_issue(&cancel, &id("bd-dead"), Some("cleanup")).unwrap();
    serial::export(&mut store, &ws.layout, ErrorPolicy::Strict, false, &cancel).unwrap();

    // The exchange file carries the tombstone marker and the manifest file
    // lists the identifier.
    let exchange = std::fs::read_to_string(ws.layout.exchange_path()).unwrap();
    assert!(exchange.contains("\"status\":\"tombstone\""));
    assert!(exchange.contains("\"original_type\":\"task\""));
    let manifest = std::fs::read_to_string(ws.layout.tombstones_path()).unwrap();
    assert!(manifest.contains("bd-dead"));
    assert!(manifest.contains("cleanup"));

    // A fresh clone importing that file records the tombstone, and the id
    // stays blocked there as well.
    let target = TestWorkspace::new();
    std::fs::copy(ws.layout.exchange_path(), target.layout.exchange_path()).unwrap();
    let mut fresh = target.store();
    serial::import(&mut fresh, &target.layout, ErrorPolicy::Strict, &cancel).unwrap();
    assert!(fresh.is_tombstoned(&id("bd-dead")).unwrap());
    let stored = fresh.get_issue(&id("bd-dead")).unwrap().unwrap();
    assert_eq!(stored.status, Status::Tombstone);
}

#[test]
fn merge_propagates_tombstone_over_live_edit() {
    let scratch = tempfile::tempdir().unwrap();
    let write = |name: &str, records: &[Issue]| {
        let path = scratch.path().join(name);
        let mut out = String::new();
        for r in records {
            out.push_str(&serde_json::to_string(r).unwrap());
            out.push('\n');
        }
        std::fs::write(&path, out).unwrap();
        path
    };

    let base = vec![Issue::new(id("bd-aaaa"), "Alive", ts(0))];
    let mut edited = base.clone();
    edited[0].title = "Edited since".to_owned();
    edited[0].updated_at = ts(60);
    let mut dead = base.clone();
    dead[0].status = Status::Tombstone;
    dead[0].deleted_at = Some(ts(10));
    dead[0].updated_at = ts(10);

    let base_path = write("base", &base);
    let ours_path = write("ours", &edited);
    let theirs_path = write("theirs", &dead);
    let out = scratch.path().join("out");
    merge::run(&base_path, &ours_path, &theirs_path, &out).unwrap();

    let content = std::fs::read_to_string(&out).unwrap();
    assert!(content.contains("\"status\":\"tombstone\""));
    assert!(!content.contains("Edited since"));
}

#[test]
fn purge_is_the_only_way_back() {
    let ws = TestWorkspace::new();
    let mut store = ws.store();
    let cancel = CancelToken::new();
    create(&mut store, "bd-dead", "Doomed");
    store.delete_issue(&cancel, &id("bd-dead"), None).unwrap();

    // Backdate the manifest entry past any retention window.
    store
        .with_write_tx(&cancel, |tx| {
            tx.execute(
                "UPDATE tombstones SET deleted_at = '2020-01-01T00:00:00.000Z'",
                [],
            )?;
            Ok(())
        })
        .unwrap();

    let purged = store.purge_tombstones(&cancel, 30).unwrap();
    assert_eq!(purged, vec![id("bd-dead")]);

    // After the administrative purge the identifier is mintable again.
    let mut again = Issue::new(id("bd-dead"), "A new life", ts(0));
    store.create_issue(&cancel, &mut again).unwrap();
}
