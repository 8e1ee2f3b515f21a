//! Three-way merge driver for divergent exchange files.
//!
//! Invoked by the revision-control system with base, ours, and theirs
//! versions of the exchange file. The driver is pure: the same three inputs
//! always yield byte-identical output, because records and set elements are
//! emitted in canonical order and no clocks are read. Unresolvable records
//! are written with explicit conflict markers and reported so the caller
//! exits with the merge-conflict code.

pub mod resolve;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{BeadsError, Result};
use crate::graph;
use crate::model::{Issue, IssueId};

/// Result of a three-way merge.
#[derive(Clone, Debug)]
pub struct MergeReport {
    /// Records in the merged output (conflicted ones excluded).
    pub records: usize,
    /// Identifiers that could not be reconciled.
    pub conflicts: Vec<IssueId>,
}

/// Merge three exchange files and write the result to `output`.
///
/// `output` may equal `ours` (the usual git merge-driver convention of
/// rewriting `%A` in place).
///
/// # Errors
/// `ImportFailed` for malformed input lines; `MergeConflict` after writing
/// the marked-up output when records could not be reconciled; I/O errors.
pub fn run(base: &Path, ours: &Path, theirs: &Path, output: &Path) -> Result<MergeReport> {
    let base_map = parse_file(base)?;
    let ours_map = parse_file(ours)?;
    let theirs_map = parse_file(theirs)?;

    let merged = merge_maps(&base_map, &ours_map, &theirs_map);
    let text = render(&merged, &ours_map, &theirs_map);
    std::fs::write(output, text)?;

    let report = MergeReport {
        records: merged
            .iter()
            .filter(|(_, v)| matches!(v, Merged::Record(_)))
            .count(),
        conflicts: merged
            .iter()
            .filter_map(|(id, v)| matches!(v, Merged::Conflict).then(|| id.clone()))
            .collect(),
    };
    if report.conflicts.is_empty() {
        Ok(report)
    } else {
        Err(BeadsError::MergeConflict {
            ids: report.conflicts,
        })
    }
}

/// One merged identifier: a clean record or a conflict needing markers.
#[derive(Clone, Debug)]
enum Merged {
    Record(Issue),
    Conflict,
}

fn parse_file(path: &Path) -> Result<BTreeMap<IssueId, Issue>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        // git hands the driver /dev/null (or an empty temp file) for a side
        // where the file does not exist.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let mut map = BTreeMap::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut issue: Issue =
            serde_json::from_str(line).map_err(|e| BeadsError::ImportFailed {
                line: Some(i + 1),
                detail: format!("{}: {e}", path.display()),
            })?;
        issue.normalize();
        issue.content_hash = Some(issue.compute_content_hash());
        map.insert(issue.id.clone(), issue);
    }
    Ok(map)
}

fn merge_maps(
    base: &BTreeMap<IssueId, Issue>,
    ours: &BTreeMap<IssueId, Issue>,
    theirs: &BTreeMap<IssueId, Issue>,
) -> BTreeMap<IssueId, Merged> {
    let mut ids: BTreeSet<&IssueId> = BTreeSet::new();
    ids.extend(base.keys());
    ids.extend(ours.keys());
    ids.extend(theirs.keys());

    let mut merged: BTreeMap<IssueId, Merged> = BTreeMap::new();
    for id in ids {
        let (b, o, t) = (base.get(id), ours.get(id), theirs.get(id));
        let outcome = match (b, o, t) {
            // Added on one side only.
            (None, Some(added), None) | (None, None, Some(added)) => {
                Some(added.clone())
            }
            // Added independently on both sides: reconcile field-wise
            // (identical content degenerates to either side unchanged).
            (None, Some(o), Some(t)) => Some(resolve::resolve(None, o, t)),
            // Deleted on both sides.
            (Some(_), None, None) => None,
            // Deleted on one side. A tombstone on the surviving side is an
            // explicit deletion and is kept; a plain omission removes the
            // record.
            (Some(_), Some(survivor), None) | (Some(_), None, Some(survivor)) => {
                survivor.is_tombstone().then(|| survivor.clone())
            }
            // Present everywhere.
            (Some(b), Some(o), Some(t)) => {
                if o.content_hash == t.content_hash {
                    Some(resolve::resolve(Some(b), o, t))
                } else if o.content_hash == b.content_hash {
                    Some(t.clone())
                } else if t.content_hash == b.content_hash {
                    Some(o.clone())
                } else {
                    Some(resolve::resolve(Some(b), o, t))
                }
            }
            (None, None, None) => None,
        };
        if let Some(record) = outcome {
            merged.insert(id.clone(), Merged::Record(record));
        }
    }

    flag_cycles(&mut merged, base);
    merged
}

/// A cycle that exists only after merging means the union of edges is
/// unsafe; the records on the cycle that changed relative to base are
/// demoted to conflicts rather than applying the graph.
fn flag_cycles(merged: &mut BTreeMap<IssueId, Merged>, base: &BTreeMap<IssueId, Issue>) {
    let edges: Vec<(IssueId, IssueId)> = merged
        .iter()
        .filter_map(|(id, v)| match v {
            Merged::Record(issue) => Some((id, issue)),
            Merged::Conflict => None,
        })
        .flat_map(|(id, issue)| {
            issue
                .dependencies
                .iter()
                .filter(|d| d.kind.is_blocking())
                .map(|d| (id.clone(), d.depends_on_id.clone()))
                .collect::<Vec<_>>()
        })
        .collect();

    let cycles = graph::find_cycles(&edges);
    if cycles.is_empty() {
        return;
    }
    let mut flagged: BTreeSet<IssueId> = BTreeSet::new();
    for cycle in cycles {
        for id in cycle {
            // Records identical to base did not cause the cycle. The
            // content hash alone is not enough: blocks edges are outside
            // it, so the edge sets are compared directly.
            let unchanged = match (base.get(&id), merged.get(&id)) {
                (Some(b), Some(Merged::Record(m))) => {
                    b.content_hash == m.content_hash
                        && blocking_targets(b) == blocking_targets(m)
                }
                _ => false,
            };
            if !unchanged {
                flagged.insert(id);
            }
        }
    }
    for id in flagged {
        merged.insert(id, Merged::Conflict);
    }
}

fn blocking_targets(issue: &Issue) -> Vec<&IssueId> {
    let mut targets: Vec<&IssueId> = issue
        .dependencies
        .iter()
        .filter(|d| d.kind.is_blocking())
        .map(|d| &d.depends_on_id)
        .collect();
    targets.sort_unstable();
    targets
}

/// Serialize the merged map in canonical identifier order. Conflicted
/// records are emitted as marker blocks carrying both sides verbatim.
fn render(
    merged: &BTreeMap<IssueId, Merged>,
    ours: &BTreeMap<IssueId, Issue>,
    theirs: &BTreeMap<IssueId, Issue>,
) -> String {
    let mut out = String::new();
    for (id, value) in merged {
        match value {
            Merged::Record(issue) => {
                // Serialization of a value we just built cannot fail; fall
                // back to skipping the record rather than panicking.
                if let Ok(line) = serde_json::to_string(issue) {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            Merged::Conflict => {
                out.push_str("<<<<<<< ours\n");
                if let Some(line) = ours.get(id).and_then(|i| serde_json::to_string(i).ok()) {
                    out.push_str(&line);
                    out.push('\n');
                }
                out.push_str("=======\n");
                if let Some(line) = theirs.get(id).and_then(|i| serde_json::to_string(i).ok()) {
                    out.push_str(&line);
                    out.push('\n');
                }
                out.push_str(">>>>>>> theirs\n");
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dependency, DependencyKind, Status};
    use chrono::{DateTime, TimeZone, Utc};
    use std::path::PathBuf;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, secs).unwrap()
    }

    fn issue(id: &str, title: &str, updated: u32) -> Issue {
        let mut issue = Issue::new(IssueId::new(id).unwrap(), title, ts(0));
        issue.updated_at = ts(updated);
        issue
    }

    fn write(dir: &Path, name: &str, records: &[Issue]) -> PathBuf {
        let path = dir.join(name);
        let mut out = String::new();
        for r in records {
            out.push_str(&serde_json::to_string(r).unwrap());
            out.push('\n');
        }
        std::fs::write(&path, out).unwrap();
        path
    }

    fn merge_to(
        dir: &Path,
        base: &[Issue],
        ours: &[Issue],
        theirs: &[Issue],
    ) -> (Result<MergeReport>, String) {
        let base = write(dir, "base", base);
        let ours = write(dir, "ours", ours);
        let theirs = write(dir, "theirs", theirs);
        let out = dir.join("out");
        let report = run(&base, &ours, &theirs, &out);
        let text = std::fs::read_to_string(&out).unwrap();
        (report, text)
    }

    #[test]
    fn disjoint_adds_union() {
        let dir = tempfile::tempdir().unwrap();
        let base = vec![issue("bd-base", "Shared", 0)];
        let mut ours = base.clone();
        ours.push(issue("bd-mine", "Ours", 1));
        let mut theirs = base.clone();
        theirs.push(issue("bd-your", "Theirs", 1));

        let (report, text) = merge_to(dir.path(), &base, &ours, &theirs);
        assert_eq!(report.unwrap().records, 3);
        assert!(text.contains("bd-base"));
        assert!(text.contains("bd-mine"));
        assert!(text.contains("bd-your"));
    }

    #[test]
    fn divergent_titles_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let base = vec![issue("bd-a1b2", "Draft", 0)];
        let ours = vec![issue("bd-a1b2", "Implement X", 10)];
        let theirs = vec![issue("bd-a1b2", "Build X", 20)];

        let (report, text) = merge_to(dir.path(), &base, &ours, &theirs);
        assert!(report.is_ok());
        assert!(text.contains("\"title\":\"Build X\""));
        assert!(!text.contains("<<<<<<<"));
    }

    #[test]
    fn merge_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let base = vec![issue("bd-a1b2", "Draft", 0)];
        let ours = vec![issue("bd-a1b2", "Ours", 10), issue("bd-mine", "M", 2)];
        let theirs = vec![issue("bd-a1b2", "Theirs", 10), issue("bd-your", "Y", 3)];

        let (_, first) = merge_to(dir.path(), &base, &ours, &theirs);
        let dir2 = tempfile::tempdir().unwrap();
        let (_, second) = merge_to(dir2.path(), &base, &ours, &theirs);
        assert_eq!(first, second);
    }

    #[test]
    fn deletion_by_omission_removes() {
        let dir = tempfile::tempdir().unwrap();
        let base = vec![issue("bd-a1b2", "Doomed", 0), issue("bd-keep", "Keep", 0)];
        let ours = vec![issue("bd-keep", "Keep", 0)];
        let theirs = base.clone();

        let (report, text) = merge_to(dir.path(), &base, &ours, &theirs);
        assert_eq!(report.unwrap().records, 1);
        assert!(!text.contains("bd-a1b2"));
    }

    #[test]
    fn tombstone_deletion_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let base = vec![issue("bd-a1b2", "Doomed", 0)];
        let ours: Vec<Issue> = vec![];
        let mut dead = issue("bd-a1b2", "Doomed", 5);
        dead.status = Status::Tombstone;
        dead.deleted_at = Some(ts(5));
        let theirs = vec![dead];

        let (report, text) = merge_to(dir.path(), &base, &ours, &theirs);
        assert_eq!(report.unwrap().records, 1);
        assert!(text.contains("\"status\":\"tombstone\""));
    }

    #[test]
    fn tombstone_beats_concurrent_edit() {
        let dir = tempfile::tempdir().unwrap();
        let base = vec![issue("bd-a1b2", "Draft", 0)];
        let ours = vec![issue("bd-a1b2", "Edited heavily", 50)];
        let mut dead = issue("bd-a1b2", "Draft", 10);
        dead.status = Status::Tombstone;
        dead.deleted_at = Some(ts(10));
        let theirs = vec![dead];

        let (_, text) = merge_to(dir.path(), &base, &ours, &theirs);
        assert!(text.contains("\"status\":\"tombstone\""));
        assert!(!text.contains("Edited heavily"));
    }

    #[test]
    fn merge_cycle_flags_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let dep = |target: &str| {
            Dependency::new(IssueId::new(target).unwrap(), DependencyKind::Blocks)
        };
        let base = vec![issue("bd-aaaa", "A", 0), issue("bd-bbbb", "B", 0)];
        // Ours: A depends on B. Theirs: B depends on A. Each side alone is
        // acyclic; the union is not.
        let mut ours = base.clone();
        ours[0].dependencies = vec![dep("bd-bbbb")];
        ours[0].updated_at = ts(10);
        let mut theirs = base.clone();
        theirs[1].dependencies = vec![dep("bd-aaaa")];
        theirs[1].updated_at = ts(10);

        let (report, text) = merge_to(dir.path(), &base, &ours, &theirs);
        let err = report.unwrap_err();
        let BeadsError::MergeConflict { ids } = err else {
            panic!("expected MergeConflict");
        };
        assert_eq!(ids.len(), 2);
        assert!(text.contains("<<<<<<< ours"));
        assert!(text.contains(">>>>>>> theirs"));
    }

    #[test]
    fn both_added_same_content_is_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let record = issue("bd-same", "Twin", 5);
        let (report, text) = merge_to(dir.path(), &[], &[record.clone()], &[record]);
        assert_eq!(report.unwrap().records, 1);
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn empty_base_missing_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let ours = write(dir.path(), "ours", &[issue("bd-mine", "M", 1)]);
        let theirs = write(dir.path(), "theirs", &[issue("bd-your", "Y", 1)]);
        let out = dir.path().join("out");
        let report = run(&dir.path().join("nonexistent"), &ours, &theirs, &out).unwrap();
        assert_eq!(report.records, 2);
    }

    #[test]
    fn malformed_input_fails_with_line() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(dir.path(), "base", &[]);
        let ours = dir.path().join("ours");
        std::fs::write(&ours, "junk\n").unwrap();
        let theirs = write(dir.path(), "theirs", &[]);
        let err = run(&base, &ours, &theirs, &dir.path().join("out")).unwrap_err();
        assert!(matches!(
            err,
            BeadsError::ImportFailed { line: Some(1), .. }
        ));
    }
}
