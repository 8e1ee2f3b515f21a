//! Dependency engine: cycle detection, transitive blocked computation, and
//! ready-work ranking.
//!
//! Only `blocks` and `parent-child` edges participate here; `related` and
//! `discovered-from` links never affect readiness. Nodes are held in an
//! arena (a vector plus an id → index map) and all traversals are iterative
//! — dense graphs must not exhaust the stack.
//!
//! Edge direction follows the store: `(source, target)` means *source
//! depends on target*, i.e. the target blocks the source.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use glob::Pattern;

use crate::error::Result;
use crate::model::{Dependency, DependencyKind, Issue, IssueId, Status};
use crate::store::Store;

// ---------------------------------------------------------------------------
// SortPolicy
// ---------------------------------------------------------------------------

/// Ordering applied to the ready-work list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortPolicy {
    /// Ascending priority, then ascending creation time.
    Priority,
    /// Ascending creation time only.
    Oldest,
    /// Bucket by priority; oldest first within a bucket; ties broken by
    /// identifier.
    #[default]
    Hybrid,
}

impl SortPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::Oldest => "oldest",
            Self::Hybrid => "hybrid",
        }
    }
}

impl FromStr for SortPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "priority" => Ok(Self::Priority),
            "oldest" => Ok(Self::Oldest),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!(
                "unknown sort policy '{other}' (expected priority, oldest, or hybrid)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Index-based adjacency over depends-on edges.
struct Arena<'a> {
    nodes: Vec<&'a IssueId>,
    index: HashMap<&'a IssueId, usize>,
    /// `out[i]` lists the nodes that node `i` depends on.
    out: Vec<Vec<usize>>,
}

impl<'a> Arena<'a> {
    fn build(edges: &'a [(IssueId, IssueId)]) -> Self {
        let mut arena = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            out: Vec::new(),
        };
        for (source, target) in edges {
            let s = arena.intern(source);
            let t = arena.intern(target);
            arena.out[s].push(t);
        }
        arena
    }

    fn intern(&mut self, id: &'a IssueId) -> usize {
        if let Some(&i) = self.index.get(id) {
            return i;
        }
        let i = self.nodes.len();
        self.nodes.push(id);
        self.index.insert(id, i);
        self.out.push(Vec::new());
        i
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// Would adding the edge `source -> target` close a cycle in the blocking
/// graph? Returns the cycle path in blocks direction, starting and ending at
/// `source`, or `None` when the edge is safe.
#[must_use]
pub fn cycle_path_with(
    edges: &[(IssueId, IssueId)],
    source: &IssueId,
    target: &IssueId,
) -> Option<Vec<IssueId>> {
    if source == target {
        return Some(vec![source.clone(), source.clone()]);
    }
    let arena = Arena::build(edges);
    let (&start, &goal) = (arena.index.get(target)?, arena.index.get(source)?);

    // Iterative DFS from the proposed target back toward the source,
    // keeping parent pointers for path reconstruction.
    let mut parent: HashMap<usize, usize> = HashMap::new();
    let mut visited = vec![false; arena.nodes.len()];
    let mut stack = vec![start];
    visited[start] = true;
    let mut found = false;
    while let Some(node) = stack.pop() {
        if node == goal {
            found = true;
            break;
        }
        for &next in &arena.out[node] {
            if !visited[next] {
                visited[next] = true;
                parent.insert(next, node);
                stack.push(next);
            }
        }
    }
    if !found {
        return None;
    }

    // Walk the parent pointers back from the source: this reads out the
    // blocks-direction chain source, ..., target. Appending the source
    // closes the cycle introduced by the proposed edge.
    let mut route = vec![goal];
    let mut node = goal;
    while node != start {
        node = parent[&node];
        route.push(node);
    }
    let mut cycle: Vec<IssueId> = route
        .into_iter()
        .map(|i| arena.nodes[i].clone())
        .collect();
    cycle.push(source.clone());
    Some(cycle)
}

/// Find every cycle currently present in the blocking graph (administrative
/// revalidation). Returns one representative path per cycle found.
#[must_use]
pub fn find_cycles(edges: &[(IssueId, IssueId)]) -> Vec<Vec<IssueId>> {
    let arena = Arena::build(edges);
    let n = arena.nodes.len();

    const WHITE: u8 = 0;
    const GREY: u8 = 1;
    const BLACK: u8 = 2;
    let mut color = vec![WHITE; n];
    let mut cycles = Vec::new();

    for root in 0..n {
        if color[root] != WHITE {
            continue;
        }
        // Stack frames: (node, next child index). Grey nodes on the stack
        // form the current path.
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        color[root] = GREY;
        loop {
            let Some(&(node, child)) = stack.last() else {
                break;
            };
            if child < arena.out[node].len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let next = arena.out[node][child];
                match color[next] {
                    WHITE => {
                        color[next] = GREY;
                        stack.push((next, 0));
                    }
                    GREY => {
                        // Back edge: the path from `next` to `node` plus the
                        // edge back to `next` is a cycle.
                        let pos = stack
                            .iter()
                            .position(|&(n2, _)| n2 == next)
                            .unwrap_or(0);
                        let mut cycle: Vec<IssueId> = stack[pos..]
                            .iter()
                            .map(|&(i, _)| arena.nodes[i].clone())
                            .collect();
                        cycle.push(arena.nodes[next].clone());
                        cycle.reverse();
                        cycles.push(cycle);
                    }
                    _ => {}
                }
            } else {
                color[node] = BLACK;
                stack.pop();
            }
        }
    }
    cycles
}

// ---------------------------------------------------------------------------
// Blocked computation
// ---------------------------------------------------------------------------

/// Compute the transitively blocked set.
///
/// An issue is blocked when an open (non-terminal) blocker is reachable over
/// `blocks` edges, or when its parent over `parent-child` is itself blocked
/// or deferred, transitively.
#[must_use]
pub fn compute_blocked(
    statuses: &HashMap<IssueId, Status>,
    deps: &[Dependency],
) -> HashSet<IssueId> {
    let mut blocked: HashSet<IssueId> = HashSet::new();
    // Children by parent, for transitive parent propagation.
    let mut children: HashMap<&IssueId, Vec<&IssueId>> = HashMap::new();
    let mut worklist: Vec<&IssueId> = Vec::new();

    for dep in deps {
        let Some(source) = dep.issue_id.as_ref() else {
            continue;
        };
        match dep.kind {
            DependencyKind::Blocks => {
                let live = statuses
                    .get(&dep.depends_on_id)
                    .is_some_and(|s| !s.is_terminal());
                if live && blocked.insert(source.clone()) {
                    worklist.push(source);
                }
            }
            DependencyKind::ParentChild => {
                children.entry(&dep.depends_on_id).or_default().push(source);
                let parent_down = statuses
                    .get(&dep.depends_on_id)
                    .is_some_and(|s| matches!(s, Status::Blocked | Status::Deferred));
                if parent_down && blocked.insert(source.clone()) {
                    worklist.push(source);
                }
            }
            _ => {}
        }
    }

    // Propagate blocked parents down to their children until stable.
    while let Some(parent) = worklist.pop() {
        if let Some(kids) = children.get(parent) {
            for &kid in kids {
                if blocked.insert(kid.clone()) {
                    worklist.push(kid);
                }
            }
        }
    }
    blocked
}

// ---------------------------------------------------------------------------
// Ready-work ranking
// ---------------------------------------------------------------------------

/// Filter and order candidates into the ready-work list.
///
/// Soundness rule: open status, not transitively blocked, not pinned, not
/// ephemeral, and no match against the exclude patterns.
#[must_use]
pub fn rank_ready(
    mut candidates: Vec<Issue>,
    blocked: &HashSet<IssueId>,
    excludes: &[Pattern],
    policy: SortPolicy,
    limit: Option<usize>,
) -> Vec<Issue> {
    candidates.retain(|issue| {
        issue.status == Status::Open
            && !issue.pinned
            && !issue.ephemeral
            && !blocked.contains(&issue.id)
            && !excludes.iter().any(|p| p.matches(issue.id.as_str()))
    });
    match policy {
        SortPolicy::Priority => {
            candidates.sort_by(|a, b| {
                (a.priority, a.created_at).cmp(&(b.priority, b.created_at))
            });
        }
        SortPolicy::Oldest => {
            candidates.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        }
        SortPolicy::Hybrid => {
            candidates.sort_by(|a, b| {
                (a.priority, a.created_at, &a.id).cmp(&(b.priority, b.created_at, &b.id))
            });
        }
    }
    if let Some(limit) = limit {
        candidates.truncate(limit);
    }
    candidates
}

// ---------------------------------------------------------------------------
// Store glue
// ---------------------------------------------------------------------------

impl Store {
    /// The ready-work query: open, unblocked, non-excluded issues under the
    /// configured (or given) sort policy.
    ///
    /// # Errors
    /// Storage errors; a config error for malformed exclude patterns.
    pub fn ready_work(&self, policy: SortPolicy, limit: Option<usize>) -> Result<Vec<Issue>> {
        // The partial ready index covers this scan.
        let sql = format!(
            "SELECT {} FROM issues
             WHERE pinned = 0 AND ephemeral = 0 AND status = 'open'
             ORDER BY priority, created_at",
            crate::store::issues::ISSUE_COLUMNS
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], crate::store::issues::map_issue_row)?;
        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }

        let deps = self.all_dependencies()?;
        let statuses = self.status_map()?;
        let blocked = compute_blocked(&statuses, &deps);
        let excludes = self.exclude_patterns()?;
        Ok(rank_ready(candidates, &blocked, excludes.as_slice(), policy, limit))
    }

    /// Validate the whole blocking graph (administrative command).
    ///
    /// # Errors
    /// Storage errors only.
    pub fn validate_graph(&self) -> Result<Vec<Vec<IssueId>>> {
        Ok(find_cycles(&self.blocking_edges()?))
    }

    fn status_map(&self) -> Result<HashMap<IssueId, Status>> {
        let mut stmt = self.conn().prepare("SELECT id, status FROM issues")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (id, status) = row?;
            map.insert(
                IssueId::new(&id)?,
                status.parse().unwrap_or(Status::Open),
            );
        }
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn id(s: &str) -> IssueId {
        IssueId::new(s).unwrap()
    }

    fn edge(a: &str, b: &str) -> (IssueId, IssueId) {
        (id(a), id(b))
    }

    fn dep(source: &str, target: &str, kind: DependencyKind) -> Dependency {
        let mut d = Dependency::new(id(target), kind);
        d.issue_id = Some(id(source));
        d
    }

    // -- cycle detection --

    #[test]
    fn safe_edge_has_no_cycle() {
        let edges = vec![edge("bd-bbbb", "bd-aaaa")];
        assert!(cycle_path_with(&edges, &id("bd-cccc"), &id("bd-aaaa")).is_none());
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let path = cycle_path_with(&[], &id("bd-aaaa"), &id("bd-aaaa")).unwrap();
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn triangle_cycle_reports_path() {
        // A blocks B, B blocks C: edges (B,A), (C,B). Adding C blocks A
        // (edge (A,C)) closes the triangle.
        let edges = vec![edge("bd-bbbb", "bd-aaaa"), edge("bd-cccc", "bd-bbbb")];
        let path = cycle_path_with(&edges, &id("bd-aaaa"), &id("bd-cccc")).unwrap();
        assert_eq!(
            path.iter().map(IssueId::as_str).collect::<Vec<_>>(),
            vec!["bd-aaaa", "bd-bbbb", "bd-cccc", "bd-aaaa"]
        );
    }

    #[test]
    fn long_chain_does_not_overflow() {
        // 10k-node chain: iterative traversal must handle it.
        let ids: Vec<IssueId> = (0..10_000)
            .map(|i| id(&format!("bd-{:04}", i % 10_000)))
            .collect();
        let mut edges = Vec::new();
        for pair in ids.windows(2) {
            edges.push((pair[1].clone(), pair[0].clone()));
        }
        let path = cycle_path_with(&edges, &ids[0], ids.last().unwrap());
        assert!(path.is_some());
        assert_eq!(path.unwrap().len(), 10_001);
    }

    #[test]
    fn find_cycles_reports_existing_loop() {
        let edges = vec![
            edge("bd-aaaa", "bd-bbbb"),
            edge("bd-bbbb", "bd-cccc"),
            edge("bd-cccc", "bd-aaaa"),
            edge("bd-dddd", "bd-aaaa"),
        ];
        let cycles = find_cycles(&edges);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].first(), cycles[0].last());
        assert_eq!(cycles[0].len(), 4);
    }

    #[test]
    fn find_cycles_empty_on_dag() {
        let edges = vec![edge("bd-aaaa", "bd-bbbb"), edge("bd-bbbb", "bd-cccc")];
        assert!(find_cycles(&edges).is_empty());
    }

    // -- blocked computation --

    fn statuses(pairs: &[(&str, Status)]) -> HashMap<IssueId, Status> {
        pairs.iter().map(|(s, st)| (id(s), st.clone())).collect()
    }

    #[test]
    fn open_blocker_blocks_source() {
        let st = statuses(&[("bd-aaaa", Status::Open), ("bd-bbbb", Status::Open)]);
        let deps = vec![dep("bd-aaaa", "bd-bbbb", DependencyKind::Blocks)];
        let blocked = compute_blocked(&st, &deps);
        assert!(blocked.contains(&id("bd-aaaa")));
        assert!(!blocked.contains(&id("bd-bbbb")));
    }

    #[test]
    fn closed_blocker_does_not_block() {
        let st = statuses(&[("bd-aaaa", Status::Open), ("bd-bbbb", Status::Closed)]);
        let deps = vec![dep("bd-aaaa", "bd-bbbb", DependencyKind::Blocks)];
        assert!(compute_blocked(&st, &deps).is_empty());
    }

    #[test]
    fn deferred_parent_blocks_children_transitively() {
        let st = statuses(&[
            ("bd-aaaa", Status::Deferred),
            ("bd-aaaa.1", Status::Open),
            ("bd-aaaa.1.1", Status::Open),
        ]);
        let deps = vec![
            dep("bd-aaaa.1", "bd-aaaa", DependencyKind::ParentChild),
            dep("bd-aaaa.1.1", "bd-aaaa.1", DependencyKind::ParentChild),
        ];
        let blocked = compute_blocked(&st, &deps);
        assert!(blocked.contains(&id("bd-aaaa.1")));
        assert!(blocked.contains(&id("bd-aaaa.1.1")));
    }

    #[test]
    fn open_parent_does_not_block_children() {
        let st = statuses(&[("bd-aaaa", Status::Open), ("bd-aaaa.1", Status::Open)]);
        let deps = vec![dep("bd-aaaa.1", "bd-aaaa", DependencyKind::ParentChild)];
        assert!(compute_blocked(&st, &deps).is_empty());
    }

    #[test]
    fn related_edges_never_block() {
        let st = statuses(&[("bd-aaaa", Status::Open), ("bd-bbbb", Status::Open)]);
        let deps = vec![dep("bd-aaaa", "bd-bbbb", DependencyKind::Related)];
        assert!(compute_blocked(&st, &deps).is_empty());
    }

    // -- ready ranking --

    fn issue(s: &str, priority: i64, day: u32) -> Issue {
        let mut issue = Issue::new(
            id(s),
            format!("Issue {s}"),
            Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap(),
        );
        issue.priority = crate::model::Priority(priority);
        issue
    }

    #[test]
    fn hybrid_buckets_by_priority_then_age() {
        let ready = rank_ready(
            vec![issue("bd-aaaa", 2, 1), issue("bd-bbbb", 0, 5), issue("bd-cccc", 2, 3)],
            &HashSet::new(),
            &[],
            SortPolicy::Hybrid,
            None,
        );
        let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["bd-bbbb", "bd-aaaa", "bd-cccc"]);
    }

    #[test]
    fn oldest_ignores_priority() {
        let ready = rank_ready(
            vec![issue("bd-aaaa", 0, 9), issue("bd-bbbb", 4, 1)],
            &HashSet::new(),
            &[],
            SortPolicy::Oldest,
            None,
        );
        assert_eq!(ready[0].id.as_str(), "bd-bbbb");
    }

    #[test]
    fn ready_excludes_blocked_pinned_and_patterns() {
        let mut pinned = issue("bd-dddd", 0, 1);
        pinned.pinned = true;
        let blocked: HashSet<IssueId> = [id("bd-aaaa")].into_iter().collect();
        let excludes = vec![Pattern::new("bd-cc*").unwrap()];
        let ready = rank_ready(
            vec![
                issue("bd-aaaa", 0, 1),
                issue("bd-bbbb", 1, 1),
                issue("bd-cccc", 0, 1),
                pinned,
            ],
            &blocked,
            &excludes,
            SortPolicy::Hybrid,
            None,
        );
        let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["bd-bbbb"]);
    }

    #[test]
    fn limit_truncates() {
        let ready = rank_ready(
            vec![issue("bd-aaaa", 0, 1), issue("bd-bbbb", 1, 1)],
            &HashSet::new(),
            &[],
            SortPolicy::Hybrid,
            Some(1),
        );
        assert_eq!(ready.len(), 1);
    }
}
