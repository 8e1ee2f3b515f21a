//! Workspace router: locate the active `.beads/` control directory and
//! resolve identifier prefixes to other workspaces.
//!
//! Resolution order:
//! 1. `BEADS_DIR`, canonicalized, following a one-line `redirect` file at
//!    most one hop.
//! 2. The nearest ancestor of the working directory containing `.beads/`,
//!    stopping at the revision-control root. Git worktrees fall back to the
//!    main checkout's control directory.
//!
//! A control directory that holds only transient daemon state (var/ files,
//! pid, socket) is not a workspace and is refused.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BeadsError, Result};
use crate::model::IssueId;

/// Name of the control directory.
pub const CONTROL_DIR: &str = ".beads";
/// Environment override for the control directory.
pub const ENV_DIR: &str = "BEADS_DIR";
/// Environment flag selecting the flat (pre-var/) file layout.
pub const ENV_LEGACY_LAYOUT: &str = "BEADS_LEGACY_LAYOUT";

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Resolved paths inside one workspace's control directory.
///
/// The newer layout keeps volatile files (socket, pid, locks, logs) under
/// `var/`; the legacy layout (`BEADS_LEGACY_LAYOUT`) places them at the top
/// level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    control_dir: PathBuf,
    legacy: bool,
}

impl Layout {
    /// Wrap an existing control directory without discovery.
    #[must_use]
    pub fn at(control_dir: PathBuf) -> Self {
        let legacy = std::env::var_os(ENV_LEGACY_LAYOUT).is_some();
        Self {
            control_dir,
            legacy,
        }
    }

    #[must_use]
    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.control_dir.join("beads.db")
    }

    /// The exchange file: one JSON record per line, versioned with the code.
    #[must_use]
    pub fn exchange_path(&self) -> PathBuf {
        self.control_dir.join("issues.jsonl")
    }

    /// The export manifest, sibling of the exchange file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.control_dir.join("issues.meta.json")
    }

    /// The tombstone manifest mirror (append-only JSONL).
    #[must_use]
    pub fn tombstones_path(&self) -> PathBuf {
        self.control_dir.join("tombstones.jsonl")
    }

    /// The prefix routing table (optional JSONL).
    #[must_use]
    pub fn routes_path(&self) -> PathBuf {
        self.control_dir.join("routes.jsonl")
    }

    /// The config mirror.
    #[must_use]
    pub fn config_mirror_path(&self) -> PathBuf {
        self.control_dir.join("config.toml")
    }

    /// Directory for volatile files; `var/` in the current layout.
    #[must_use]
    pub fn var_dir(&self) -> PathBuf {
        if self.legacy {
            self.control_dir.clone()
        } else {
            self.control_dir.join("var")
        }
    }

    #[must_use]
    pub fn export_lock_path(&self) -> PathBuf {
        self.var_dir().join("export.lock")
    }

    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.var_dir().join("daemon.sock")
    }

    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.var_dir().join("daemon.pid")
    }

    #[must_use]
    pub fn heartbeat_path(&self) -> PathBuf {
        self.var_dir().join("daemon.heartbeat")
    }

    /// Create the var/ directory if missing.
    ///
    /// # Errors
    /// I/O errors.
    pub fn ensure_var_dir(&self) -> Result<()> {
        fs::create_dir_all(self.var_dir())?;
        Ok(())
    }

    /// Initialize a fresh control directory under `project_root`.
    ///
    /// # Errors
    /// I/O errors creating the directories.
    pub fn init(project_root: &Path) -> Result<Self> {
        let layout = Self::at(project_root.join(CONTROL_DIR));
        fs::create_dir_all(&layout.control_dir)?;
        layout.ensure_var_dir()?;
        Ok(layout)
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Locate the active workspace starting from `cwd`.
///
/// # Errors
/// `WorkspaceNotFound` when no control directory exists on the search path;
/// `NotAWorkspace` when the candidate holds only transient daemon state.
pub fn discover(cwd: &Path) -> Result<Layout> {
    if let Some(dir) = std::env::var_os(ENV_DIR) {
        let dir = PathBuf::from(dir);
        let dir = dir.canonicalize().unwrap_or(dir);
        let dir = follow_redirect(&dir)?;
        return admit(dir);
    }

    let mut current = Some(cwd.to_path_buf());
    while let Some(dir) = current {
        let candidate = dir.join(CONTROL_DIR);
        if candidate.is_dir() {
            return admit(follow_redirect(&candidate)?);
        }
        let git = dir.join(".git");
        if git.exists() {
            // At the revision-control root. A worktree keeps `.git` as a
            // file pointing into the main checkout; follow it once.
            if let Some(main_root) = worktree_main_root(&git) {
                let candidate = main_root.join(CONTROL_DIR);
                if candidate.is_dir() {
                    return admit(follow_redirect(&candidate)?);
                }
            }
            break;
        }
        current = dir.parent().map(Path::to_path_buf);
    }
    Err(BeadsError::WorkspaceNotFound {
        start: cwd.to_path_buf(),
    })
}

/// Follow a `redirect` file inside the control directory, at most one hop.
fn follow_redirect(control_dir: &Path) -> Result<PathBuf> {
    let redirect = control_dir.join("redirect");
    if !redirect.is_file() {
        return Ok(control_dir.to_path_buf());
    }
    let target = fs::read_to_string(&redirect)?;
    let target = PathBuf::from(target.trim());
    let target = if target.is_absolute() {
        target
    } else {
        control_dir.join(target)
    };
    Ok(target.canonicalize().unwrap_or(target))
}

fn admit(control_dir: PathBuf) -> Result<Layout> {
    let layout = Layout::at(control_dir);
    if !layout.control_dir().is_dir() {
        return Err(BeadsError::WorkspaceNotFound {
            start: layout.control_dir().to_path_buf(),
        });
    }
    if !is_workspace(&layout) {
        return Err(BeadsError::NotAWorkspace {
            path: layout.control_dir().to_path_buf(),
        });
    }
    Ok(layout)
}

/// A directory is a workspace when it carries project artifacts, not just
/// daemon droppings.
fn is_workspace(layout: &Layout) -> bool {
    layout.db_path().exists()
        || layout.exchange_path().exists()
        || layout.config_mirror_path().exists()
}

/// For a `.git` *file* (worktree marker), resolve the main checkout's root.
fn worktree_main_root(git: &Path) -> Option<PathBuf> {
    if !git.is_file() {
        return None;
    }
    let content = fs::read_to_string(git).ok()?;
    let gitdir = content.strip_prefix("gitdir:")?.trim();
    let gitdir = if Path::new(gitdir).is_absolute() {
        PathBuf::from(gitdir)
    } else {
        git.parent()?.join(gitdir)
    };
    // Worktree gitdirs look like <main>/.git/worktrees/<name>.
    let mut dir = gitdir.as_path();
    while let Some(parent) = dir.parent() {
        if dir.file_name().is_some_and(|n| n == ".git") {
            return Some(parent.to_path_buf());
        }
        dir = parent;
    }
    None
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// One line of the routes file: an identifier prefix mapped to another
/// workspace's control directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    pub dir: PathBuf,
}

/// Load the routing table; an absent file is an empty table.
///
/// # Errors
/// `Config` for malformed route lines.
pub fn load_routes(layout: &Layout) -> Result<Vec<Route>> {
    let path = layout.routes_path();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&path)?;
    let mut routes = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let route: Route = serde_json::from_str(line).map_err(|e| BeadsError::Config {
            detail: format!("bad route at {}:{}: {e}", path.display(), i + 1),
        })?;
        routes.push(route);
    }
    Ok(routes)
}

/// Append a route, replacing any existing entry for the prefix.
///
/// # Errors
/// `InvalidId` for a malformed prefix; I/O errors.
pub fn add_route(layout: &Layout, prefix: &str, dir: &Path) -> Result<()> {
    IssueId::validate_prefix(prefix)?;
    let mut routes = load_routes(layout)?;
    routes.retain(|r| r.prefix != prefix);
    routes.push(Route {
        prefix: prefix.to_owned(),
        dir: dir.to_path_buf(),
    });
    let mut out = String::new();
    for route in &routes {
        out.push_str(&serde_json::to_string(route)?);
        out.push('\n');
    }
    fs::write(layout.routes_path(), out)?;
    Ok(())
}

/// Decide where a command carrying an explicit identifier executes.
///
/// Returns `None` for the local workspace, or the routed layout when the
/// prefix maps elsewhere.
///
/// # Errors
/// `UnknownPrefix` when the prefix neither matches the workspace nor any
/// route.
pub fn route_for_id(
    layout: &Layout,
    workspace_prefix: &str,
    id: &IssueId,
) -> Result<Option<Layout>> {
    let prefix = id.prefix();
    if prefix == workspace_prefix {
        return Ok(None);
    }
    let routes = load_routes(layout)?;
    let Some(route) = routes.into_iter().find(|r| r.prefix == prefix) else {
        return Err(BeadsError::UnknownPrefix {
            prefix: prefix.to_owned(),
        });
    };
    let dir = if route.dir.is_absolute() {
        route.dir
    } else {
        layout.control_dir().join(route.dir)
    };
    let dir = follow_redirect(&dir)?;
    admit(dir).map(Some)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
