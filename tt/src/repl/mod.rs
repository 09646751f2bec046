//! Interactive terminal for the table
//!
//! Reads operator commands, sends them through the command coordinator and
//! prints replies. Rotation progress is reported from a background task
//! while the prompt stays usable.

mod session;

pub use session::{ReplSession, print_watchdog_event};

use eyre::{Context, Result};

use crate::config::Config;
use crate::table::Table;

/// Run the interactive terminal
///
/// This is the main entry point for `tt repl`.
pub async fn run_interactive(config: &Config) -> Result<()> {
    let (table, events) = Table::connect(config)
        .await
        .context(format!("Failed to open port {}", config.port.target))?;

    let session = ReplSession::new(table, events);
    session.run().await
}
