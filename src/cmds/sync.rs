//! Workspace setup and synchronization commands: init, import, export,
//! sync, and the three-way merge driver entry point.

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::Args;

use beads::autosync::{self, SyncOptions};
use beads::config;
use beads::error::BeadsError;
use beads::merge as merge_driver;
use beads::model::IssueId;
use beads::serial::{self, ErrorPolicy};
use beads::store::{CancelToken, Store};
use beads::workspace::{CONTROL_DIR, Layout};

use super::Context;

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct InitArgs {
    /// Identifier prefix for issues minted here (e.g. "bd", "web")
    #[arg(long, default_value = "bd")]
    pub prefix: String,
}

pub fn init(args: &InitArgs) -> Result<()> {
    IssueId::validate_prefix(&args.prefix).map_err(BeadsError::from)?;
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let layout = Layout::init(&cwd)?;
    let cancel = CancelToken::new();

    let mut store = Store::open(&layout.db_path())?;
    config::seed_from_mirror(&mut store, &cancel, &layout.config_mirror_path())?;
    if store.config_get(config::ISSUE_PREFIX)?.is_none() {
        store.config_set(&cancel, config::ISSUE_PREFIX, &args.prefix)?;
    }
    config::write_mirror(&store, &layout.config_mirror_path())?;

    // If a pulled exchange file is already there, load it; otherwise write
    // an empty one so the workspace is recognizable.
    let cfg = config::WorkspaceConfig::load(&store)?;
    autosync::ensure_fresh(&mut store, &layout, &cfg, &cancel)?;
    if !layout.exchange_path().exists() {
        serial::export(&mut store, &layout, cfg.export_policy, cfg.export_write_manifest, &cancel)?;
    }

    println!("initialized {}/{CONTROL_DIR} (prefix '{}')", cwd.display(), args.prefix);
    println!("track it: git add {CONTROL_DIR}/issues.jsonl {CONTROL_DIR}/config.toml");
    Ok(())
}

// ---------------------------------------------------------------------------
// import / export / sync
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct ImportArgs {
    /// Error policy: strict, best-effort, partial
    #[arg(long)]
    pub policy: Option<ErrorPolicy>,
}

pub fn import(args: &ImportArgs) -> Result<()> {
    let mut ctx = Context::open()?;
    let policy = args.policy.unwrap_or(ctx.config.export_policy);
    let outcome = serial::import(&mut ctx.store, &ctx.layout, policy, &ctx.cancel)?;
    println!(
        "imported: {} created, {} updated, {} unchanged, {} tombstoned skipped, {} malformed skipped",
        outcome.created,
        outcome.updated,
        outcome.unchanged,
        outcome.skipped_tombstoned,
        outcome.skipped_malformed
    );
    for id in &outcome.resurrected {
        println!("resurrected placeholder {id}");
    }
    Ok(())
}

#[derive(Args)]
pub struct ExportArgs {
    /// Error policy: strict, best-effort, partial
    #[arg(long)]
    pub policy: Option<ErrorPolicy>,
    /// Allow exporting an empty store over a non-empty exchange file
    #[arg(long)]
    pub force: bool,
}

pub fn export(args: &ExportArgs) -> Result<()> {
    let mut ctx = Context::open()?;
    let mut cfg = ctx.config.clone();
    if let Some(policy) = args.policy {
        cfg.export_policy = policy;
    }
    let action = autosync::guarded_export(
        &mut ctx.store,
        &ctx.layout,
        &cfg,
        SyncOptions {
            allow_empty_export: args.force,
        },
        &ctx.cancel,
    )?;
    match action {
        autosync::SyncAction::RefusedEmptyExport => {
            bail!(
                "refusing to overwrite a non-empty {} from an empty database; \
                 re-run with --force if that is really what you want",
                ctx.layout.exchange_path().display()
            );
        }
        _ => println!("exported {}", ctx.layout.exchange_path().display()),
    }
    Ok(())
}

pub fn sync() -> Result<()> {
    // Context::open already runs the staleness check; report what it did by
    // running it once more explicitly (idempotent).
    let mut ctx = Context::open()?;
    let action = autosync::ensure_fresh(&mut ctx.store, &ctx.layout, &ctx.config, &ctx.cancel)?;
    println!("sync: {action:?}");
    Ok(())
}

// ---------------------------------------------------------------------------
// merge driver
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct MergeArgs {
    /// Common-ancestor version (%O)
    pub base: PathBuf,
    /// Our version (%A)
    pub ours: PathBuf,
    /// Their version (%B)
    pub theirs: PathBuf,
    /// Where to write the result (defaults to the ours path, as git expects)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

pub fn merge(args: &MergeArgs) -> Result<()> {
    let output = args.output.clone().unwrap_or_else(|| args.ours.clone());
    let report = merge_driver::run(&args.base, &args.ours, &args.theirs, &output)?;
    eprintln!("merged {} record(s) into {}", report.records, output.display());
    Ok(())
}
