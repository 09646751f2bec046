//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Turntable - rotating-table terminal
#[derive(Parser, Debug)]
#[command(
    name = "tt",
    about = "Terminal client for serial rotating-table controllers",
    version,
    after_help = "Logs are written to: ~/.local/share/turntable/logs/turntable.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(
        long = "log-level",
        global = true,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,

    /// Port override
    #[arg(short, long, global = true, value_name = "TARGET", help = "Serial device or tcp://host:port")]
    pub port: Option<String>,

    /// Baud rate override
    #[arg(short, long, global = true, help = "Serial line speed")]
    pub baud: Option<u32>,

    /// Subcommand to execute (defaults to the interactive terminal)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive terminal (default)
    Repl,

    /// Send one command and print the reply
    Send {
        /// Command text, e.g. `GET ACC`
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        words: Vec<String>,

        /// Reply timeout in milliseconds (default from config)
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Start a rotation and follow it until the table reports END
    Rotate {
        /// Motion parameter passed to FM
        #[arg(allow_negative_numbers = true)]
        motion: i32,

        /// Give up waiting for END after this many seconds
        #[arg(short, long, default_value = "120")]
        wait_secs: u64,
    },
}

impl Command {
    /// Join the words of a `send` command into one protocol line
    pub fn command_line(words: &[String]) -> String {
        words.join(" ")
    }
}
