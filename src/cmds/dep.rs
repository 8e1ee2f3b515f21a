//! Dependency commands and the ready-work query.

use anyhow::Result;
use clap::{Args, Subcommand};

use beads::error::BeadsError;
use beads::graph::SortPolicy;
use beads::model::{DependencyKind, IssueId};

use super::{Context, issue_line, print_json};

#[derive(Subcommand)]
pub enum DepCommands {
    /// Add a dependency: <id> depends on <depends-on>
    ///
    /// Blocking kinds (blocks, parent-child) are cycle-checked; the insert
    /// is rejected with the offending path if it would close a loop.
    Add {
        /// The issue that is blocked
        id: String,
        /// The issue it depends on
        depends_on: String,
        /// Kind: blocks, parent-child, related, discovered-from
        #[arg(short, long, default_value = "blocks")]
        kind: DependencyKind,
    },
    /// Remove a dependency edge
    Remove {
        id: String,
        depends_on: String,
        #[arg(short, long, default_value = "blocks")]
        kind: DependencyKind,
    },
    /// Revalidate the whole blocking graph (administrative)
    Cycles,
}

pub fn run(cmd: &DepCommands) -> Result<()> {
    match cmd {
        DepCommands::Add {
            id,
            depends_on,
            kind,
        } => {
            let mut ctx = Context::open()?;
            let id = IssueId::new(id).map_err(BeadsError::from)?;
            let target = IssueId::new(depends_on).map_err(BeadsError::from)?;
            ctx.store
                .add_dependency(&ctx.cancel, &id, &target, kind.clone())?;
            ctx.flush_after_write();
            println!("{id} now depends on {target} ({kind})");
        }
        DepCommands::Remove {
            id,
            depends_on,
            kind,
        } => {
            let mut ctx = Context::open()?;
            let id = IssueId::new(id).map_err(BeadsError::from)?;
            let target = IssueId::new(depends_on).map_err(BeadsError::from)?;
            ctx.store
                .remove_dependency(&ctx.cancel, &id, &target, kind)?;
            ctx.flush_after_write();
            println!("removed {id} -> {target} ({kind})");
        }
        DepCommands::Cycles => {
            let ctx = Context::open()?;
            let cycles = ctx.store.validate_graph()?;
            if cycles.is_empty() {
                println!("no cycles in the blocking graph");
            } else {
                for cycle in &cycles {
                    let path: Vec<&str> = cycle.iter().map(IssueId::as_str).collect();
                    println!("cycle: {}", path.join(" -> "));
                }
                return Err(BeadsError::CycleDetected {
                    path: cycles.into_iter().next().unwrap_or_default(),
                }
                .into());
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ready
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct ReadyArgs {
    /// Sort policy: priority, oldest, hybrid (default from config)
    #[arg(long)]
    pub sort: Option<SortPolicy>,
    /// Maximum rows
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
    /// Emit JSON
    #[arg(long)]
    pub json: bool,
}

pub fn ready(args: &ReadyArgs) -> Result<()> {
    let ctx = Context::open()?;
    let policy = args.sort.unwrap_or(ctx.config.ready_sort_policy);

    if let Some(result) = ctx.try_daemon(
        "ready",
        serde_json::json!({ "policy": policy.as_str(), "limit": args.limit }),
    ) {
        let issues: Vec<beads::model::Issue> = serde_json::from_value(result?)?;
        return render(&issues, args.json);
    }

    let issues = ctx.store.ready_work(policy, args.limit)?;
    render(&issues, args.json)
}

fn render(issues: &[beads::model::Issue], json: bool) -> Result<()> {
    if json {
        return print_json(&issues);
    }
    if issues.is_empty() {
        println!("nothing is ready; check blocked issues with: bd list -s blocked");
        return Ok(());
    }
    for issue in issues {
        println!("{}", issue_line(issue));
    }
    Ok(())
}
