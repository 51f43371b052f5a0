//! Console diagnostics.
//!
//! Events are formatted per line and written while holding the writer's
//! mutex, so output from the cycle and the shutdown watcher never
//! interleaves mid-line.

use std::io::{self, IsTerminal};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Subscriber writing formatted events to `writer` under a lock.
pub fn subscriber<W>(writer: W, filter: EnvFilter, ansi: bool) -> impl Subscriber + Send + Sync
where
    W: io::Write + Send + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(writer))
        .with_target(false)
        .with_ansi(ansi)
        .finish()
}

/// Install the global subscriber on stderr.  Filter from `RUST_LOG`,
/// defaulting to [`DEFAULT_FILTER`].
pub fn init() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let stderr = io::stderr();
    let ansi = stderr.is_terminal();
    tracing::subscriber::set_global_default(subscriber(stderr, filter, ansi))
        .map_err(|e| anyhow!("installing log subscriber: {e}"))
}

// ===========================================================================
// Tests
// ===========================================================================
