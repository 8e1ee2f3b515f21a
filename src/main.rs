use std::process::ExitCode;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

mod cmds;

use beads::error::BeadsError;

/// Distributed, git-backed issue tracker
///
/// bd keeps issues in a local SQLite database mirrored to a line-oriented
/// JSONL file (.beads/issues.jsonl) that is versioned alongside your code.
/// Multiple clones mutate the tracker offline; convergence happens at the
/// file layer through git's merge machinery plus bd's own merge driver.
///
/// QUICK START:
///
///   bd init                 # create .beads/ in the repo root
///   bd create "Fix login"   # mint an id and record the issue
///   bd ready                # what can be picked up right now
///   bd close bd-a1b2        # done
///
/// Every command auto-syncs first: after a git pull, the next bd command
/// imports whatever the exchange file gained.
#[derive(Parser)]
#[command(name = "bd")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'bd <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize bd in the current repository
    ///
    /// Creates .beads/ with the database, an empty exchange file, and the
    /// var/ directory for volatile state. Safe to run multiple times.
    Init(cmds::sync::InitArgs),

    /// Create an issue
    Create(cmds::issue::CreateArgs),

    /// Update fields of an issue
    Update(cmds::issue::UpdateArgs),

    /// Show one issue with labels, dependencies, and comments
    Show(cmds::issue::ShowArgs),

    /// List issues with filters
    List(cmds::issue::ListArgs),

    /// Ordered list of open, unblocked work
    ///
    /// Sound by construction: every listed issue is open, has no unmet
    /// blocker (transitively), and matches no configured exclude pattern.
    Ready(cmds::dep::ReadyArgs),

    /// Close an issue (reversible)
    Close(cmds::issue::CloseArgs),

    /// Reopen a closed issue
    Reopen(cmds::issue::ReopenArgs),

    /// Soft-delete an issue (tombstone; irreversible)
    Delete(cmds::issue::DeleteArgs),

    /// Comment on an issue
    Comment(cmds::issue::CommentArgs),

    /// Manage labels
    #[command(subcommand)]
    Label(cmds::issue::LabelCommands),

    /// Manage dependencies
    #[command(subcommand)]
    Dep(cmds::dep::DepCommands),

    /// Import the exchange file into the database
    Import(cmds::sync::ImportArgs),

    /// Export the database to the exchange file
    Export(cmds::sync::ExportArgs),

    /// Run the staleness check and reconcile store and file
    Sync,

    /// Three-way merge driver for the exchange file
    ///
    /// Wire it up in .gitattributes / git config:
    ///   .beads/issues.jsonl merge=beads
    ///   [merge "beads"] driver = bd merge %O %A %B --output %A
    Merge(cmds::sync::MergeArgs),

    /// Read or write configuration keys
    #[command(subcommand)]
    Config(cmds::admin::ConfigCommands),

    /// Manage identifier-prefix routes to other workspaces
    #[command(subcommand)]
    Routes(cmds::admin::RoutesCommands),

    /// Manage the workspace daemon
    #[command(subcommand)]
    Daemon(cmds::admin::DaemonCommands),

    /// Row counts by status
    Stats,

    /// Epic completion status
    Epic(cmds::issue::EpicArgs),

    /// Administrative operations
    #[command(subcommand)]
    Admin(cmds::admin::AdminCommands),

    /// Check workspace health and layout
    ///
    /// Verifies the control directory, database openability, schema
    /// version, exchange-file hash against the journal, and daemon state.
    Doctor,

    /// Generate shell completions
    Completion {
        /// Shell to generate for
        shell: clap_complete::Shell,
    },
}

fn main() -> ExitCode {
    beads::telemetry::init();
    let cli = Cli::parse();

    let result: Result<()> = match cli.command {
        Commands::Init(args) => cmds::sync::init(&args),
        Commands::Create(args) => cmds::issue::create(args),
        Commands::Update(args) => cmds::issue::update(&args),
        Commands::Show(args) => cmds::issue::show(&args),
        Commands::List(args) => cmds::issue::list(&args),
        Commands::Ready(args) => cmds::dep::ready(&args),
        Commands::Close(args) => cmds::issue::close(&args),
        Commands::Reopen(args) => cmds::issue::reopen(&args),
        Commands::Delete(args) => cmds::issue::delete(&args),
        Commands::Comment(args) => cmds::issue::comment(&args),
        Commands::Label(cmd) => cmds::issue::label(&cmd),
        Commands::Dep(cmd) => cmds::dep::run(&cmd),
        Commands::Import(args) => cmds::sync::import(&args),
        Commands::Export(args) => cmds::sync::export(&args),
        Commands::Sync => cmds::sync::sync(),
        Commands::Merge(args) => cmds::sync::merge(&args),
        Commands::Config(cmd) => cmds::admin::config(&cmd),
        Commands::Routes(cmd) => cmds::admin::routes(&cmd),
        Commands::Daemon(cmd) => cmds::admin::daemon(&cmd),
        Commands::Stats => cmds::issue::stats(),
        Commands::Epic(args) => cmds::issue::epic(&args),
        Commands::Admin(cmd) => cmds::admin::run(&cmd),
        Commands::Doctor => cmds::admin::doctor(),
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "bd", &mut std::io::stdout());
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<BeadsError>()
                .map_or(2, BeadsError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(2))
        }
    }
}
