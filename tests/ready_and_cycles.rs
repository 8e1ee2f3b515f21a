//! Ready-work soundness and cycle rejection against a live store.

mod common;

use common::{TestWorkspace, create, id};

use beads::config;
use beads::error::BeadsError;
use beads::graph::SortPolicy;
use beads::model::{DependencyKind, Status};
use beads::store::CancelToken;
use beads::store::issues::IssuePatch;

#[test]
fn cycle_at_insert_reports_full_path_and_leaves_store_unchanged() {
    // A blocks B, B blocks C; adding "C blocks A" fails with the path
    // A -> B -> C -> A and no edge is added.
    let ws = TestWorkspace::new();
    let mut store = ws.store();
    let cancel = CancelToken::new();
    create(&mut store, "bd-aaaa", "A");
    create(&mut store, "bd-bbbb", "B");
    create(&mut store, "bd-cccc", "C");

    // "A blocks B" means B depends on A.
    store
        .add_dependency(&cancel, &id("bd-bbbb"), &id("bd-aaaa"), DependencyKind::Blocks)
        .unwrap();
    store
        .add_dependency(&cancel, &id("bd-cccc"), &id("bd-bbbb"), DependencyKind::Blocks)
        .unwrap();

    let err = store
        .add_dependency(&cancel, &id("bd-aaaa"), &id("bd-cccc"), DependencyKind::Blocks)
        .unwrap_err();
    let BeadsError::CycleDetected { path } = err else {
        panic!("expected cycle-detected");
    };
    let rendered: Vec<&str> = path.iter().map(|p| p.as_str()).collect();
    assert_eq!(rendered, vec!["bd-aaaa", "bd-bbbb", "bd-cccc", "bd-aaaa"]);
    assert_eq!(store.all_dependencies().unwrap().len(), 2);
}

#[test]
fn ready_work_is_sound() {
    // Everything returned is open, unblocked, and unexcluded.
    let ws = TestWorkspace::new();
    let mut store = ws.store();
    let cancel = CancelToken::new();

    create(&mut store, "bd-free", "Free to work");
    create(&mut store, "bd-wait", "Blocked by open work");
    create(&mut store, "bd-gate", "The blocker");
    store
        .add_dependency(&cancel, &id("bd-wait"), &id("bd-gate"), DependencyKind::Blocks)
        .unwrap();

    create(&mut store, "bd-done", "Closed already");
    store.close_issue(&cancel, &id("bd-done"), None).unwrap();

    create(&mut store, "bd-tmpx", "Excluded by pattern");
    store
        .config_set(&cancel, config::READY_EXCLUDE_ID_PATTERNS, "bd-tmp*")
        .unwrap();

    let ready = store.ready_work(SortPolicy::Hybrid, None).unwrap();
    let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
    assert!(ids.contains(&"bd-free"));
    assert!(ids.contains(&"bd-gate"));
    assert!(!ids.contains(&"bd-wait"), "blocked issue listed as ready");
    assert!(!ids.contains(&"bd-done"));
    assert!(!ids.contains(&"bd-tmpx"), "excluded pattern listed as ready");
    for issue in &ready {
        assert_eq!(issue.status, Status::Open);
    }
}

#[test]
fn closing_the_blocker_unblocks_dependents() {
    let ws = TestWorkspace::new();
    let mut store = ws.store();
    let cancel = CancelToken::new();
    create(&mut store, "bd-wait", "Waiting");
    create(&mut store, "bd-gate", "Gate");
    store
        .add_dependency(&cancel, &id("bd-wait"), &id("bd-gate"), DependencyKind::Blocks)
        .unwrap();

    let ready = store.ready_work(SortPolicy::Hybrid, None).unwrap();
    assert!(!ready.iter().any(|i| i.id.as_str() == "bd-wait"));

    store.close_issue(&cancel, &id("bd-gate"), None).unwrap();
    let ready = store.ready_work(SortPolicy::Hybrid, None).unwrap();
    assert!(ready.iter().any(|i| i.id.as_str() == "bd-wait"));
}

#[test]
fn deferred_parent_blocks_children_through_hierarchy() {
    let ws = TestWorkspace::new();
    let mut store = ws.store();
    let cancel = CancelToken::new();
    create(&mut store, "bd-epic", "The epic");
    create(&mut store, "bd-epic.1", "Child");
    create(&mut store, "bd-epic.1.1", "Grandchild");
    store
        .add_dependency(
            &cancel,
            &id("bd-epic.1"),
            &id("bd-epic"),
            DependencyKind::ParentChild,
        )
        .unwrap();
    store
        .add_dependency(
            &cancel,
            &id("bd-epic.1.1"),
            &id("bd-epic.1"),
            DependencyKind::ParentChild,
        )
        .unwrap();

    let mut patch = IssuePatch::default();
    patch.status = Some(Status::Deferred);
    store.update_issue(&cancel, &id("bd-epic"), &patch).unwrap();

    let ready = store.ready_work(SortPolicy::Hybrid, None).unwrap();
    let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
    assert!(!ids.contains(&"bd-epic.1"));
    assert!(!ids.contains(&"bd-epic.1.1"));
}

#[test]
fn related_links_do_not_gate_readiness() {
    let ws = TestWorkspace::new();
    let mut store = ws.store();
    let cancel = CancelToken::new();
    create(&mut store, "bd-aaaa", "A");
    create(&mut store, "bd-bbbb", "B");
    store
        .add_dependency(&cancel, &id("bd-aaaa"), &id("bd-bbbb"), DependencyKind::Related)
        .unwrap();
    store
        .add_dependency(
            &cancel,
            &id("bd-aaaa"),
            &id("bd-bbbb"),
            DependencyKind::DiscoveredFrom,
        )
        .unwrap();

    let ready = store.ready_work(SortPolicy::Hybrid, None).unwrap();
    assert_eq!(ready.len(), 2);
}

#[test]
fn global_revalidation_finds_nothing_on_a_clean_graph() {
    let ws = TestWorkspace::new();
    let mut store = ws.store();
    let cancel = CancelToken::new();
    create(&mut store, "bd-aaaa", "A");
    create(&mut store, "bd-bbbb", "B");
    store
        .add_dependency(&cancel, &id("bd-aaaa"), &id("bd-bbbb"), DependencyKind::Blocks)
        .unwrap();
    assert!(store.validate_graph().unwrap().is_empty());
}
