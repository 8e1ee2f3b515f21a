//! Issue lifecycle commands: create, update, show, list, close, reopen,
//! delete, comment, label, stats, epic.

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Args, Subcommand};

use beads::error::BeadsError;
use beads::identity;
use beads::model::{DependencyKind, Issue, IssueId, IssueType, Priority, Status};
use beads::store::issues::{IssueFilter, IssuePatch};
use beads::workspace;

use super::{Context, issue_line, print_json};

// ---------------------------------------------------------------------------
// create
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct CreateArgs {
    /// Issue title
    pub title: String,

    /// Explicit identifier (minted when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Create as a hierarchical child of this issue (id becomes <parent>.N)
    #[arg(long, conflicts_with = "id")]
    pub parent: Option<String>,

    /// Long description
    #[arg(short, long)]
    pub description: Option<String>,

    /// Priority 0-4 (0 = most urgent)
    #[arg(short, long, default_value = "2")]
    pub priority: Priority,

    /// Issue type: bug, feature, task, epic, chore
    #[arg(short = 't', long = "type", default_value = "task")]
    pub issue_type: IssueType,

    /// Assignee
    #[arg(short, long)]
    pub assignee: Option<String>,

    /// Labels (repeatable)
    #[arg(short, long)]
    pub label: Vec<String>,

    /// Local-only row: never exported, never ready work
    #[arg(long)]
    pub ephemeral: bool,

    /// Print the created issue as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn create(args: CreateArgs) -> Result<()> {
    let mut ctx = Context::open()?;

    let id = match (&args.id, &args.parent) {
        (Some(explicit), None) => {
            // A foreign prefix routes the command to its home workspace.
            let id = IssueId::new(explicit).map_err(BeadsError::from)?;
            if let Some(routed) =
                workspace::route_for_id(&ctx.layout, &ctx.config.issue_prefix, &id)?
            {
                ctx = Context::open_at(routed)?;
            }
            identity::admit_explicit(&ctx.store, explicit)?
        }
        (None, Some(parent)) => {
            let parent = IssueId::new(parent).map_err(BeadsError::from)?;
            identity::next_child_id(&ctx.store, &parent)?
        }
        (None, None) => identity::mint_id(
            &ctx.store,
            &ctx.config.issue_prefix,
            ctx.config.id_min_length,
            ctx.config.id_max_length,
        )?,
        (Some(_), Some(_)) => unreachable!("clap conflicts_with"),
    };

    let mut issue = Issue::new(id, args.title, Utc::now());
    issue.description = args.description;
    issue.priority = args.priority;
    issue.issue_type = args.issue_type;
    issue.assignee = args.assignee;
    issue.labels = args.label;
    issue.ephemeral = args.ephemeral;
    issue.created_by = Some(beads::store::actor().to_owned());

    ctx.store.create_issue(&ctx.cancel, &mut issue)?;
    // A hierarchical child is linked to its parent automatically.
    if let Some(parent) = issue.id.parent() {
        ctx.store
            .add_dependency(&ctx.cancel, &issue.id, &parent, DependencyKind::ParentChild)?;
    }
    ctx.flush_after_write();

    if args.json {
        let stored = ctx.store.get_issue(&issue.id)?;
        print_json(&stored)?;
    } else {
        println!("created {}", issue.id);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// update
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct UpdateArgs {
    /// Issue identifier
    pub id: String,

    #[arg(long)]
    pub title: Option<String>,
    #[arg(short, long)]
    pub description: Option<String>,
    #[arg(long)]
    pub design: Option<String>,
    #[arg(long)]
    pub acceptance: Option<String>,
    #[arg(long)]
    pub notes: Option<String>,
    #[arg(short, long)]
    pub priority: Option<Priority>,
    #[arg(short = 't', long = "type")]
    pub issue_type: Option<IssueType>,
    #[arg(short, long)]
    pub assignee: Option<String>,
    /// New status (open, in_progress, blocked, deferred)
    #[arg(short, long)]
    pub status: Option<Status>,
    #[arg(long)]
    pub external_ref: Option<String>,
}

pub fn update(args: &UpdateArgs) -> Result<()> {
    let mut ctx = Context::open()?;
    let id = IssueId::new(&args.id).map_err(BeadsError::from)?;

    let patch = IssuePatch {
        title: args.title.clone(),
        description: args.description.clone().map(Some),
        design: args.design.clone().map(Some),
        acceptance_criteria: args.acceptance.clone().map(Some),
        notes: args.notes.clone().map(Some),
        status: args.status.clone(),
        priority: args.priority,
        issue_type: args.issue_type.clone(),
        assignee: args.assignee.clone().map(Some),
        estimated_minutes: None,
        external_ref: args.external_ref.clone().map(Some),
    };
    if patch.is_empty() {
        bail!("nothing to update; pass at least one field flag");
    }
    let issue = ctx.store.update_issue(&ctx.cancel, &id, &patch)?;
    ctx.flush_after_write();
    println!("updated {} ({})", issue.id, issue.status);
    Ok(())
}

// ---------------------------------------------------------------------------
// show / list
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct ShowArgs {
    /// Issue identifier
    pub id: String,
    /// Emit JSON
    #[arg(long)]
    pub json: bool,
}

pub fn show(args: &ShowArgs) -> Result<()> {
    let ctx = Context::open()?;
    let id = IssueId::new(&args.id).map_err(BeadsError::from)?;
    let issue = ctx
        .store
        .get_issue(&id)?
        .ok_or(BeadsError::NotFound { id })?;

    if args.json {
        return print_json(&issue);
    }
    println!("{}  {}", issue.id, issue.title);
    println!(
        "  {} | {} | {}{}",
        issue.status,
        issue.priority,
        issue.issue_type,
        issue
            .assignee
            .as_deref()
            .map(|a| format!(" | @{a}"))
            .unwrap_or_default()
    );
    if let Some(description) = &issue.description {
        println!("\n{description}");
    }
    if !issue.labels.is_empty() {
        println!("\nlabels: {}", issue.labels.join(", "));
    }
    for dep in &issue.dependencies {
        println!("  {} -> {}", dep.kind, dep.depends_on_id);
    }
    for comment in &issue.comments {
        println!(
            "\n[{}] {}:\n  {}",
            beads::model::timefmt::encode(&comment.created_at),
            comment.author,
            comment.body
        );
    }
    for event in ctx.store.events_for(&issue.id)? {
        println!(
            "  {} {} by {}",
            beads::model::timefmt::encode(&event.created_at),
            event.kind,
            event.actor
        );
    }
    Ok(())
}

#[derive(Args)]
pub struct ListArgs {
    /// Filter by status (repeatable)
    #[arg(short, long)]
    pub status: Vec<Status>,
    /// Filter by assignee
    #[arg(short, long)]
    pub assignee: Option<String>,
    /// Filter by label (repeatable, all must match)
    #[arg(short, long)]
    pub label: Vec<String>,
    /// Substring search over title, description, notes
    #[arg(short, long)]
    pub text: Option<String>,
    /// Include tombstoned rows
    #[arg(long)]
    pub all: bool,
    /// Emit JSON
    #[arg(long)]
    pub json: bool,
}

pub fn list(args: &ListArgs) -> Result<()> {
    let ctx = Context::open()?;
    let filter = IssueFilter {
        statuses: args.status.clone(),
        assignee: args.assignee.clone(),
        labels: args.label.clone(),
        text: args.text.clone(),
        include_tombstones: args.all,
        ..IssueFilter::default()
    };
    let issues = ctx.store.list_issues(&filter)?;
    if args.json {
        return print_json(&issues);
    }
    for issue in &issues {
        println!("{}", issue_line(issue));
    }
    println!("{} issue(s)", issues.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// close / reopen / delete
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct CloseArgs {
    /// Issue identifier
    pub id: String,
    /// Why it is done
    #[arg(short, long)]
    pub reason: Option<String>,
}

pub fn close(args: &CloseArgs) -> Result<()> {
    let mut ctx = Context::open()?;
    let id = IssueId::new(&args.id).map_err(BeadsError::from)?;
    ctx.store
        .close_issue(&ctx.cancel, &id, args.reason.as_deref())?;
    ctx.flush_after_write();
    println!("closed {id}");
    Ok(())
}

#[derive(Args)]
pub struct ReopenArgs {
    /// Issue identifier
    pub id: String,
}

pub fn reopen(args: &ReopenArgs) -> Result<()> {
    let mut ctx = Context::open()?;
    let id = IssueId::new(&args.id).map_err(BeadsError::from)?;
    ctx.store.reopen_issue(&ctx.cancel, &id)?;
    ctx.flush_after_write();
    println!("reopened {id}");
    Ok(())
}

#[derive(Args)]
pub struct DeleteArgs {
    /// Issue identifier
    pub id: String,
    /// Why it is being removed
    #[arg(short, long)]
    pub reason: Option<String>,
}

pub fn delete(args: &DeleteArgs) -> Result<()> {
    let mut ctx = Context::open()?;
    let id = IssueId::new(&args.id).map_err(BeadsError::from)?;
    ctx.store
        .delete_issue(&ctx.cancel, &id, args.reason.as_deref())?;
    ctx.flush_after_write();
    println!("tombstoned {id}");
    Ok(())
}

// ---------------------------------------------------------------------------
// comment / label
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct CommentArgs {
    /// Issue identifier
    pub id: String,
    /// Comment text
    pub text: String,
}

pub fn comment(args: &CommentArgs) -> Result<()> {
    let mut ctx = Context::open()?;
    let id = IssueId::new(&args.id).map_err(BeadsError::from)?;
    ctx.store.add_comment(&ctx.cancel, &id, &args.text)?;
    ctx.flush_after_write();
    println!("commented on {id}");
    Ok(())
}

#[derive(Subcommand)]
pub enum LabelCommands {
    /// Attach a label
    Add {
        /// Issue identifier
        id: String,
        /// Label text (case-sensitive)
        label: String,
    },
    /// Detach a label
    Remove {
        /// Issue identifier
        id: String,
        /// Label text
        label: String,
    },
}

pub fn label(cmd: &LabelCommands) -> Result<()> {
    let mut ctx = Context::open()?;
    match cmd {
        LabelCommands::Add { id, label } => {
            let id = IssueId::new(id).map_err(BeadsError::from)?;
            ctx.store.add_label(&ctx.cancel, &id, label)?;
            ctx.flush_after_write();
            println!("labeled {id} +{label}");
        }
        LabelCommands::Remove { id, label } => {
            let id = IssueId::new(id).map_err(BeadsError::from)?;
            ctx.store.remove_label(&ctx.cancel, &id, label)?;
            ctx.flush_after_write();
            println!("unlabeled {id} -{label}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// stats / epic
// ---------------------------------------------------------------------------

pub fn stats() -> Result<()> {
    let ctx = Context::open()?;
    let counts = ctx.store.counts_by_status()?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    for (status, count) in &counts {
        println!("{status:<12} {count}");
    }
    println!("{:<12} {total}", "total");
    Ok(())
}

#[derive(Args)]
pub struct EpicArgs {
    /// Epic identifier
    pub id: String,
}

/// An epic is eligible for closing when every parent-child child is closed.
pub fn epic(args: &EpicArgs) -> Result<()> {
    let ctx = Context::open()?;
    let id = IssueId::new(&args.id).map_err(BeadsError::from)?;
    let epic = ctx
        .store
        .get_issue(&id)?
        .ok_or(BeadsError::NotFound { id: id.clone() })?;

    let deps = ctx.store.all_dependencies()?;
    let children: Vec<IssueId> = deps
        .iter()
        .filter(|d| d.kind == DependencyKind::ParentChild && d.depends_on_id == id)
        .filter_map(|d| d.issue_id.clone())
        .collect();
    let mut closed = 0usize;
    for child in &children {
        if let Some(issue) = ctx.store.get_issue(child)? {
            if issue.status == Status::Closed {
                closed += 1;
            }
        }
    }
    println!("{}  {}", epic.id, epic.title);
    println!("children: {closed}/{} closed", children.len());
    if !children.is_empty() && closed == children.len() {
        println!("eligible for close: bd close {}", epic.id);
    }
    Ok(())
}
