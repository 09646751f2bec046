//! Turntable - rotating-table terminal
//!
//! CLI entry point: opens the port and runs the interactive terminal or a
//! one-shot command.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use turntable::cli::{Cli, Command};
use turntable::config::Config;
use turntable::protocol;
use turntable::repl::{self, print_watchdog_event};
use turntable::table::Table;
use turntable::watchdog::WatchdogEvent;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("turntable")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("turntable.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

/// How long blocked port reads may delay process exit
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref())
        .context("Failed to load configuration")?
        .with_overrides(cli.port.as_deref(), cli.baud);
    config.validate()?;

    info!(port = %config.port.target, "Turntable starting");

    // A serial read parked on a blocking thread never returns on its own
    let rt = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let result = rt.block_on(dispatch(cli.command, &config));
    rt.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn dispatch(command: Option<Command>, config: &Config) -> Result<()> {
    debug!(?command, "dispatch: called");
    match command {
        None | Some(Command::Repl) => repl::run_interactive(config).await,
        Some(Command::Send { words, timeout_ms }) => {
            let line = Command::command_line(&words);
            cmd_send(config, &line, timeout_ms.map(Duration::from_millis)).await
        }
        Some(Command::Rotate { motion, wait_secs }) => cmd_rotate(config, motion, Duration::from_secs(wait_secs)).await,
    }
}

async fn connect(config: &Config) -> Result<(Table, tokio::sync::mpsc::UnboundedReceiver<WatchdogEvent>)> {
    Table::connect(config)
        .await
        .context(format!("Failed to open port {}", config.port.target))
}

async fn cmd_send(config: &Config, line: &str, timeout: Option<Duration>) -> Result<()> {
    debug!(%line, ?timeout, "cmd_send: called");
    let (table, _events) = connect(config).await?;

    let timeout = timeout.unwrap_or_else(|| table.coordinator().timeout());
    let result = table.coordinator().send_with_timeout(line, timeout).await;
    table.shutdown().await;

    let reply = result?;
    if reply.is_error() {
        println!("{}", reply.to_string().red());
    } else {
        println!("{}", reply.to_string().yellow());
    }
    Ok(())
}

async fn cmd_rotate(config: &Config, motion: i32, wait: Duration) -> Result<()> {
    debug!(motion, ?wait, "cmd_rotate: called");
    let (mut table, mut events) = connect(config).await?;

    let outcome = match table.send(protocol::Command::Fm(motion)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            table.shutdown().await;
            return Err(e.into());
        }
    };

    if !outcome.watching {
        table.shutdown().await;
        println!("{}", outcome.reply.to_string().red());
        return Err(eyre::eyre!("Table refused rotation: {}", outcome.reply));
    }
    println!("{}", outcome.reply.to_string().yellow());

    let follow = async {
        let mut move_error = false;
        while let Some(event) = events.recv().await {
            print_watchdog_event(&event, true);
            match event {
                WatchdogEvent::Completed => return Ok(move_error),
                WatchdogEvent::StreamClosed => return Err(eyre::eyre!("Connection closed before rotation finished")),
                WatchdogEvent::MoveError => move_error = true,
                WatchdogEvent::Progress(_) | WatchdogEvent::Stalled { .. } => {}
            }
        }
        Err(eyre::eyre!("Watchdog stopped unexpectedly"))
    };

    let result = tokio::time::timeout(wait, follow).await;
    table.shutdown().await;

    match result {
        Ok(Ok(false)) => Ok(()),
        Ok(Ok(true)) => Err(eyre::eyre!("Rotation finished with a move error")),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(eyre::eyre!("Rotation did not finish within {}s", wait.as_secs())),
    }
}
