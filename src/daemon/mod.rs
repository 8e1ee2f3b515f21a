//! Optional per-workspace daemon and its local RPC protocol.
//!
//! Unix only: the endpoint is a Unix domain socket under the workspace's
//! var/ directory. Platforms without one always run in-process — the client
//! API degrades to "no daemon available" rather than failing.

pub mod protocol;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod server;

#[cfg(unix)]
pub use client::{CallOutcome, DaemonClient};
#[cfg(unix)]
pub use server::{DaemonOptions, run};
