//! Turntable - terminal client for serial rotating-table controllers
//!
//! The table speaks a line protocol: the host sends one command per line and
//! the table answers with acknowledgement tokens, interleaved with
//! asynchronous progress tokens while a rotation is running.
//!
//! # Architecture
//!
//! ```text
//!   Transport ──▶ TokenStream ──┬──▶ CommandCoordinator   (one reply per command)
//!   (read half)   (fan-out)     └──▶ RotationWatchdog     (liveness during FM)
//!
//!   ReplSession ──▶ Table ──▶ CommandCoordinator ──▶ Transport (write half)
//!                       └──▶ RotationWatchdog (arm on FM + OK)
//! ```
//!
//! # Modules
//!
//! - [`token`] - single reader task fanning tokens out to subscribers
//! - [`command`] - command/reply matching with timeout
//! - [`watchdog`] - stall detection during rotation
//! - [`protocol`] - command and token vocabulary
//! - [`transport`] - serial device and TCP line transports
//! - [`table`] - wiring of the above for one connection
//! - [`repl`] - interactive terminal
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod protocol;
pub mod repl;
pub mod table;
pub mod token;
pub mod transport;
pub mod watchdog;

pub use command::{CommandCoordinator, DEFAULT_COMMAND_TIMEOUT};
pub use error::{CommandError, TransportError};
pub use protocol::{Command, Reply, Response, RotationEvent, Token};
pub use table::{Outcome, Table};
pub use token::{Subscription, SubscriptionId, TokenStream};
pub use watchdog::{DEFAULT_STALL_INTERVAL, RotationWatchdog, WatchdogEvent};
