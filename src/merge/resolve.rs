//! Per-record reconciliation rules for the three-way merge.
//!
//! Scalars are last-writer-wins by `updated_at`, tie-broken by comparing
//! content hashes lexicographically (an arbitrary but deterministic choice).
//! Set-valued fields merge with the classic three-way formula
//! `(base ∩ ours ∩ theirs) ∪ (ours − base) ∪ (theirs − base)`, which is a
//! union that honors explicit removals on either side. Comments are
//! append-only and deduplicate by (author, timestamp, body digest).
//! Tombstones always win, keeping the earliest deletion time.

use std::collections::BTreeMap;

use crate::model::{Comment, Dependency, DependencyKind, Issue, IssueId};

/// Merge one identifier present on both sides.
///
/// `base` is `None` when the record was added independently in both clones.
#[must_use]
pub fn resolve(base: Option<&Issue>, ours: &Issue, theirs: &Issue) -> Issue {
    if ours.is_tombstone() || theirs.is_tombstone() {
        return resolve_tombstone(ours, theirs);
    }

    let ours_hash = content_hash(ours);
    let theirs_hash = content_hash(theirs);
    let theirs_wins = match theirs.updated_at.cmp(&ours.updated_at) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => theirs_hash > ours_hash,
    };
    let (winner, loser) = if theirs_wins {
        (theirs, ours)
    } else {
        (ours, theirs)
    };

    let mut merged = winner.clone();

    // Stable bookkeeping regardless of who won.
    merged.created_at = ours.created_at.min(theirs.created_at);
    merged.updated_at = ours.updated_at.max(theirs.updated_at);
    if merged.created_by.is_none() {
        merged.created_by = loser.created_by.clone();
    }

    merged.labels = merge_labels(base, ours, theirs);
    merged.dependencies = merge_dependencies(base, ours, theirs);
    merged.comments = merge_comments(ours, theirs);
    merged.extras = merge_extras(winner, loser);

    merged.normalize();
    merged.content_hash = Some(merged.compute_content_hash());
    merged
}

/// Tombstones beat live rows; two tombstones keep the earliest deletion.
fn resolve_tombstone(ours: &Issue, theirs: &Issue) -> Issue {
    let mut merged = match (ours.is_tombstone(), theirs.is_tombstone()) {
        (true, false) => ours.clone(),
        (false, true) => theirs.clone(),
        _ => {
            // Both tombstones: earliest deleted_at is authoritative.
            let ours_at = ours.deleted_at.unwrap_or(ours.updated_at);
            let theirs_at = theirs.deleted_at.unwrap_or(theirs.updated_at);
            if theirs_at < ours_at {
                theirs.clone()
            } else {
                ours.clone()
            }
        }
    };
    merged.normalize();
    merged.content_hash = Some(merged.compute_content_hash());
    merged
}

fn content_hash(issue: &Issue) -> String {
    issue
        .content_hash
        .clone()
        .unwrap_or_else(|| issue.compute_content_hash())
}

fn merge_labels(base: Option<&Issue>, ours: &Issue, theirs: &Issue) -> Vec<String> {
    three_way_set(
        base.map(|b| b.labels.clone()).unwrap_or_default(),
        ours.labels.clone(),
        theirs.labels.clone(),
    )
}

fn merge_dependencies(base: Option<&Issue>, ours: &Issue, theirs: &Issue) -> Vec<Dependency> {
    let key = |d: &Dependency| (d.depends_on_id.clone(), d.kind.clone());
    let to_map = |deps: &[Dependency]| -> BTreeMap<(IssueId, DependencyKind), Dependency> {
        deps.iter().map(|d| (key(d), d.clone())).collect()
    };
    let base_map = base.map(|b| to_map(&b.dependencies)).unwrap_or_default();
    let ours_map = to_map(&ours.dependencies);
    let theirs_map = to_map(&theirs.dependencies);

    let keys = three_way_set(
        base_map.keys().cloned().collect(),
        ours_map.keys().cloned().collect(),
        theirs_map.keys().cloned().collect(),
    );
    keys.into_iter()
        .filter_map(|k| ours_map.get(&k).or_else(|| theirs_map.get(&k)).cloned())
        .collect()
}

fn merge_comments(ours: &Issue, theirs: &Issue) -> Vec<Comment> {
    let mut merged: Vec<Comment> = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for comment in ours.comments.iter().chain(&theirs.comments) {
        if seen.insert(comment.merge_key()) {
            merged.push(comment.clone());
        }
    }
    merged.sort_by(|a, b| (a.created_at, &a.author).cmp(&(b.created_at, &b.author)));
    merged
}

fn merge_extras(
    winner: &Issue,
    loser: &Issue,
) -> BTreeMap<String, serde_json::Value> {
    let mut extras = loser.extras.clone();
    for (k, v) in &winner.extras {
        extras.insert(k.clone(), v.clone());
    }
    extras
}

/// `(base ∩ ours ∩ theirs) ∪ (ours − base) ∪ (theirs − base)`, sorted.
fn three_way_set<T: Ord + Clone>(base: Vec<T>, ours: Vec<T>, theirs: Vec<T>) -> Vec<T> {
    let base: std::collections::BTreeSet<T> = base.into_iter().collect();
    let ours: std::collections::BTreeSet<T> = ours.into_iter().collect();
    let theirs: std::collections::BTreeSet<T> = theirs.into_iter().collect();

    let mut out = std::collections::BTreeSet::new();
    for item in ours.intersection(&theirs) {
        if base.contains(item) {
            out.insert(item.clone());
        }
    }
    for item in ours.difference(&base) {
        out.insert(item.clone());
    }
    for item in theirs.difference(&base) {
        out.insert(item.clone());
    }
    out.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
