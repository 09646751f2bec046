//! REPL session management

use colored::Colorize;
use eyre::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::protocol::{Command, Reply};
use crate::table::Table;
use crate::watchdog::WatchdogEvent;

/// Interactive terminal session over one open table connection
pub struct ReplSession {
    table: Table,
    printer: JoinHandle<()>,
}

impl ReplSession {
    /// Create a session; watchdog events are printed as they arrive
    pub fn new(table: Table, mut events: mpsc::UnboundedReceiver<WatchdogEvent>) -> Self {
        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_watchdog_event(&event, false);
            }
        });
        Self { table, printer }
    }

    /// Run the REPL main loop until an empty line, Ctrl-D or a fatal error
    pub async fn run(mut self) -> Result<()> {
        print_available_commands();

        let mut rl = DefaultEditor::new().map_err(|e| eyre::eyre!("Failed to initialize readline: {}", e))?;
        let prompt = format!("{} ", ">".bright_green());

        let result = loop {
            // Line editing blocks; keep it off the async workers
            let readline = tokio::task::block_in_place(|| rl.readline(&prompt));

            match readline {
                Ok(line) => {
                    let input = line.trim();
                    if input.is_empty() {
                        break Ok(());
                    }

                    let _ = rl.add_history_entry(input);

                    if input.starts_with('/') {
                        match self.handle_slash_command(input) {
                            SlashResult::Continue => continue,
                            SlashResult::Quit => break Ok(()),
                        }
                    }

                    if let Err(e) = self.process_command(input).await {
                        break Err(e);
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    // Ctrl+C - just show new prompt
                    println!("^C");
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    // Ctrl+D - exit
                    println!();
                    break Ok(());
                }
                Err(err) => {
                    break Err(eyre::eyre!("Readline error: {}", err));
                }
            }
        };

        self.table.shutdown().await;
        self.printer.abort();
        if result.is_ok() {
            println!("Goodbye!");
        }
        result
    }

    /// Send one command and report the reply
    ///
    /// Timeouts are reported and the session continues; transport failures
    /// end it.
    async fn process_command(&mut self, input: &str) -> Result<()> {
        debug!(%input, "ReplSession::process_command: called");
        match self.table.execute(input).await {
            Ok(outcome) => {
                print_reply(&outcome.reply);
                if outcome.watching {
                    println!("{}", "Rotation started, watching for progress...".dimmed());
                }
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                println!("{}", e.to_string().red());
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Session ended by transport failure");
                println!("{}", e.to_string().red());
                println!("{}", "Oops! Something went wrong...".red());
                Err(e.into())
            }
        }
    }

    fn handle_slash_command(&mut self, input: &str) -> SlashResult {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let cmd = parts.first().copied().unwrap_or("");

        match cmd {
            "/help" | "/h" => {
                print_help();
                SlashResult::Continue
            }
            "/quit" | "/q" | "/exit" => SlashResult::Quit,
            "/disarm" => {
                if self.table.disarm() {
                    println!("{}", "Stopped watching the rotation.".dimmed());
                } else {
                    println!("{}", "No rotation is being watched.".dimmed());
                }
                SlashResult::Continue
            }
            _ => {
                println!("{} Unknown command: {}", "?".yellow(), cmd);
                println!("Type {} for available commands", "/help".yellow());
                SlashResult::Continue
            }
        }
    }
}

/// Result of handling a slash command
enum SlashResult {
    Continue,
    Quit,
}

fn print_available_commands() {
    println!("Available commands:");
    for usage in Command::USAGE {
        println!("   {}", usage.yellow());
    }
    println!("Empty line to exit, {} for terminal commands", "/help".yellow());
}

fn print_help() {
    println!();
    println!("{}", "Table Commands:".bright_cyan());
    for usage in Command::USAGE {
        println!("  {}", usage.yellow());
    }
    println!();
    println!("{}", "Terminal Commands:".bright_cyan());
    println!("  {:14} Show this help", "/help".yellow());
    println!("  {:14} Exit the terminal", "/quit".yellow());
    println!("  {:14} Stop watching the current rotation", "/disarm".yellow());
    println!();
}

/// Print the reply exactly as the table sent it
fn print_reply(reply: &Reply) {
    let text = reply.to_string();
    if reply.is_error() {
        println!("{}", text.red());
    } else {
        println!("{}", text.yellow());
    }
}

/// Report a watchdog event to the operator
///
/// Progress is only shown when `show_progress` is set.
pub fn print_watchdog_event(event: &WatchdogEvent, show_progress: bool) {
    match event {
        WatchdogEvent::Progress(token) => {
            if show_progress {
                println!("{}", token.as_str().dimmed());
            }
        }
        WatchdogEvent::Completed => println!("{}", "Rotation complete".green()),
        WatchdogEvent::MoveError => println!("{}", "MOVERR".red()),
        WatchdogEvent::Stalled { .. } => {
            // Seen after a sudden power loss of the table mid-rotation
            println!("{}", "Table stopped sending messages in the process of rotation".red());
        }
        WatchdogEvent::StreamClosed => println!("{}", "Connection to table lost".red()),
    }
}
