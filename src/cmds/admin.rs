//! Configuration, routes, daemon management, tombstone administration, and
//! the doctor report.

use anyhow::{Result, bail};
use clap::{Args, Subcommand};

use beads::config;
use beads::error::BeadsError;
use beads::serial;
use beads::store::meta::{META_LAST_IMPORT_AT, META_LAST_IMPORT_HASH};
use beads::store::schema;
use beads::workspace;

use super::Context;

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Read one key
    Get { key: String },
    /// Write one key (also refreshes the config.toml mirror)
    Set { key: String, value: String },
    /// List all set keys
    List,
}

pub fn config(cmd: &ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Get { key } => {
            let ctx = Context::open()?;
            match ctx.store.config_get(key)? {
                Some(value) => println!("{value}"),
                None => bail!("key '{key}' is not set (known keys: {})", config::KNOWN_KEYS.join(", ")),
            }
        }
        ConfigCommands::Set { key, value } => {
            let mut ctx = Context::open()?;
            if !config::KNOWN_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %key, "setting a key bd does not recognize");
            }
            ctx.store.config_set(&ctx.cancel, key, value)?;
            // Validate eagerly so a bad value fails here, not on next open.
            config::WorkspaceConfig::load(&ctx.store)?;
            config::write_mirror(&ctx.store, &ctx.layout.config_mirror_path())?;
            println!("{key} = {value}");
        }
        ConfigCommands::List => {
            let ctx = Context::open()?;
            for (key, value) in ctx.store.config_list()? {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// routes
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum RoutesCommands {
    /// Map an identifier prefix to another workspace's control directory
    Add {
        prefix: String,
        dir: std::path::PathBuf,
    },
    /// List routes
    List,
}

pub fn routes(cmd: &RoutesCommands) -> Result<()> {
    let ctx = Context::open()?;
    match cmd {
        RoutesCommands::Add { prefix, dir } => {
            workspace::add_route(&ctx.layout, prefix, dir)?;
            println!("{prefix} -> {}", dir.display());
        }
        RoutesCommands::List => {
            for route in workspace::load_routes(&ctx.layout)? {
                println!("{} -> {}", route.prefix, route.dir.display());
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// daemon
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum DaemonCommands {
    /// Run the daemon in the foreground (spawned detached by auto-start)
    Run(DaemonRunArgs),
    /// Ask a running daemon to stop
    Stop,
    /// Report daemon state
    Status,
}

#[derive(Args)]
pub struct DaemonRunArgs {
    /// Idle shutdown in minutes
    #[arg(long, default_value = "30")]
    pub idle_minutes: u64,
}

#[cfg(unix)]
pub fn daemon(cmd: &DaemonCommands) -> Result<()> {
    use beads::daemon::{DaemonClient, DaemonOptions, server};

    match cmd {
        DaemonCommands::Run(args) => {
            let ctx = Context::open()?;
            let options = DaemonOptions {
                idle_timeout: std::time::Duration::from_secs(args.idle_minutes * 60),
                ..DaemonOptions::default()
            };
            drop(ctx.store);
            server::run(&ctx.layout, options)?;
        }
        DaemonCommands::Stop => {
            let ctx = Context::open()?;
            match DaemonClient::connect(&ctx.layout)? {
                Some(client) => {
                    client.shutdown();
                    println!("daemon stopped");
                }
                None => println!("no daemon running"),
            }
        }
        DaemonCommands::Status => {
            let ctx = Context::open()?;
            match DaemonClient::connect(&ctx.layout)? {
                Some(mut client) => {
                    match client.call("ping", serde_json::Value::Null)? {
                        beads::daemon::CallOutcome::Ok(info) => {
                            println!(
                                "daemon running: pid {} version {}",
                                info["pid"], info["version"]
                            );
                        }
                        beads::daemon::CallOutcome::UnknownOp => {
                            println!("daemon running (no ping support)");
                        }
                    }
                }
                None => println!("no daemon running"),
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn daemon(_cmd: &DaemonCommands) -> Result<()> {
    bail!("the daemon requires Unix domain sockets; this platform runs in-process only");
}

// ---------------------------------------------------------------------------
// admin
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Drop tombstones older than the retention window and delete their rows
    ///
    /// The single operation allowed to edit the tombstone manifest. Uses
    /// retention.tombstone_days unless --days is given; 0 disables purging.
    PurgeTombstones {
        #[arg(long)]
        days: Option<u32>,
    },
}

pub fn run(cmd: &AdminCommands) -> Result<()> {
    match cmd {
        AdminCommands::PurgeTombstones { days } => {
            let mut ctx = Context::open()?;
            let days = days.unwrap_or(ctx.config.retention_tombstone_days);
            if days == 0 {
                println!("tombstone retention is disabled (0 days); nothing purged");
                return Ok(());
            }
            let purged = ctx.store.purge_tombstones(&ctx.cancel, days)?;
            ctx.flush_after_write();
            println!("purged {} tombstone(s)", purged.len());
            for id in purged {
                println!("  {id}");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// doctor
// ---------------------------------------------------------------------------

pub fn doctor() -> Result<()> {
    let cwd = std::env::current_dir()?;
    println!("bd {} doctor", env!("CARGO_PKG_VERSION"));

    let layout = match workspace::discover(&cwd) {
        Ok(layout) => {
            println!("workspace:  {}", layout.control_dir().display());
            layout
        }
        Err(e) => {
            println!("workspace:  NOT FOUND\n{e}");
            return Err(e.into());
        }
    };

    match beads::store::Store::open(&layout.db_path()) {
        Ok(store) => {
            let version: i64 = store
                .conn()
                .query_row("PRAGMA user_version", [], |row| row.get(0))
                .map_err(BeadsError::from)?;
            let journal_mode: String = store
                .conn()
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(BeadsError::from)?;
            println!(
                "database:   ok (schema v{version}/{}, journal {journal_mode})",
                schema::CURRENT_SCHEMA_VERSION
            );

            let file_hash = serial::file_sha256(&layout.exchange_path())?;
            let journal = store.metadata_get(META_LAST_IMPORT_HASH)?;
            let last_at = store.metadata_get(META_LAST_IMPORT_AT)?;
            match (&file_hash, &journal) {
                (None, _) => println!("exchange:   missing (next command will export)"),
                (Some(_), None) => println!("exchange:   present, never imported"),
                (Some(f), Some(j)) if f == j => {
                    println!(
                        "exchange:   in sync (last import {})",
                        last_at.as_deref().unwrap_or("unknown")
                    );
                }
                (Some(_), Some(_)) => {
                    println!("exchange:   STALE (next command will import)");
                }
            }
        }
        Err(e) => println!("database:   FAILED\n{e}"),
    }

    let socket = layout.socket_path();
    if socket.exists() {
        #[cfg(unix)]
        {
            if std::os::unix::net::UnixStream::connect(&socket).is_ok() {
                println!("daemon:     running ({})", socket.display());
            } else {
                println!("daemon:     STALE socket ({}); next client cleans it up", socket.display());
            }
        }
        #[cfg(not(unix))]
        println!("daemon:     unsupported on this platform");
    } else {
        println!("daemon:     not running");
    }
    Ok(())
}
