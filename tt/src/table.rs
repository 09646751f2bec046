//! Table - a connected rotating-table controller
//!
//! Wires one transport to a token stream, a command coordinator and a
//! rotation watchdog, and arms the watchdog when a rotation is accepted.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::CommandCoordinator;
use crate::config::{Config, ProtocolConfig};
use crate::error::{CommandError, TransportError};
use crate::protocol::{Command, Reply, Response};
use crate::token::TokenStream;
use crate::transport::{self, TransportReader, TransportWriter};
use crate::watchdog::{RotationWatchdog, WatchdogEvent};

/// Result of one operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub reply: Reply,
    /// The command started a rotation and the watchdog is now armed
    pub watching: bool,
}

pub struct Table {
    stream: TokenStream,
    coordinator: CommandCoordinator,
    watchdog: RotationWatchdog,
}

impl Table {
    /// Open the configured port and start reading from it
    pub async fn connect(config: &Config) -> Result<(Self, mpsc::UnboundedReceiver<WatchdogEvent>), TransportError> {
        debug!(target = %config.port.target, "Table::connect: called");
        let (reader, writer) = transport::open(&config.port).await?;
        Ok(Self::from_transport(reader, writer, &config.protocol))
    }

    /// Build a table over an already-open transport
    pub fn from_transport(
        reader: TransportReader,
        writer: TransportWriter,
        protocol: &ProtocolConfig,
    ) -> (Self, mpsc::UnboundedReceiver<WatchdogEvent>) {
        let stream = TokenStream::spawn(reader);
        let coordinator = CommandCoordinator::new(stream.clone(), writer, protocol.command_timeout());
        let (watchdog, events) = RotationWatchdog::new(stream.clone(), protocol.stall_interval());
        let table = Self {
            stream,
            coordinator,
            watchdog,
        };
        (table, events)
    }

    /// Send operator text verbatim and arm the watchdog if it started a rotation
    ///
    /// For a rotation start the watchdog's subscription is taken before the
    /// command is written, so `POS`/`END` sent right behind `OK` are not lost.
    pub async fn execute(&mut self, text: &str) -> Result<Outcome, CommandError> {
        let starts_rotation = text.parse::<Command>().is_ok_and(|command| command.starts_rotation());
        if !starts_rotation {
            let reply = self.coordinator.send_and_await(text).await?;
            return Ok(Outcome { reply, watching: false });
        }

        let (reply, follow) = self.coordinator.send_and_follow(text).await?;
        let watching = reply.response == Response::Ok;
        if watching {
            info!(command = %text, "Rotation accepted, arming watchdog");
            self.watchdog.arm_with(follow);
        } else {
            debug!(command = %text, %reply, "Rotation not accepted");
        }

        Ok(Outcome { reply, watching })
    }

    /// Typed form of [`Table::execute`]
    pub async fn send(&mut self, command: Command) -> Result<Outcome, CommandError> {
        self.execute(&command.to_string()).await
    }

    pub fn is_rotating(&self) -> bool {
        self.watchdog.is_armed()
    }

    /// Stop watching the current rotation
    pub fn disarm(&mut self) -> bool {
        self.watchdog.disarm()
    }

    pub fn stream(&self) -> &TokenStream {
        &self.stream
    }

    pub fn coordinator(&self) -> &CommandCoordinator {
        &self.coordinator
    }

    /// Disarm, close the port and stop the read loop
    pub async fn shutdown(mut self) {
        self.watchdog.disarm();
        if let Err(e) = self.coordinator.close().await {
            warn!(error = %e, "Failed to close transport cleanly");
        }
        self.stream.shutdown();
        info!("Table connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn protocol() -> ProtocolConfig {
        ProtocolConfig::default()
    }

    #[tokio::test]
    async fn test_fm_ok_arms_watchdog() {
        let (device, host) = tokio::io::duplex(256);
        let (reader, writer) = transport::split(host, Duration::from_millis(100));
        let (mut table, _events) = Table::from_transport(reader, writer, &protocol());
        let (read, mut out) = tokio::io::split(device);
        let mut lines = BufReader::new(read).lines();

        let script = async {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "FM 10");
            out.write_all(b"OK\n").await.unwrap();
        };
        let (outcome, ()) = tokio::join!(table.execute("FM 10"), script);

        let outcome = outcome.unwrap();
        assert_eq!(outcome.reply.response, Response::Ok);
        assert!(outcome.watching);
        assert!(table.is_rotating());
        assert!(table.disarm());
    }

    #[tokio::test]
    async fn test_rejected_rotation_does_not_arm() {
        let (device, host) = tokio::io::duplex(256);
        let (reader, writer) = transport::split(host, Duration::from_millis(100));
        let (mut table, _events) = Table::from_transport(reader, writer, &protocol());
        let (read, mut out) = tokio::io::split(device);
        let mut lines = BufReader::new(read).lines();

        let script = async {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "FM 10");
            out.write_all(b"BUSY\n").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "STATUS");
            out.write_all(b"OK\n").await.unwrap();
        };
        let run = async {
            let first = table.send(Command::Fm(10)).await.unwrap();
            let second = table.send(Command::Status).await.unwrap();
            (first, second)
        };
        let ((first, second), ()) = tokio::join!(run, script);

        assert_eq!(first.reply.response, Response::Busy);
        assert!(!first.watching);
        assert_eq!(second.reply.response, Response::Ok);
        assert!(!second.watching);
        assert!(!table.is_rotating());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_in_same_write_as_ok_completes() {
        let (device, host) = tokio::io::duplex(256);
        let (reader, writer) = transport::split(host, Duration::from_millis(100));
        let (mut table, mut events) = Table::from_transport(reader, writer, &protocol());
        let (read, mut out) = tokio::io::split(device);
        let mut lines = BufReader::new(read).lines();

        let script = async {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "FM 0");
            out.write_all(b"OK\nEND\n").await.unwrap();
        };
        let (outcome, ()) = tokio::join!(table.execute("FM 0"), script);
        assert!(outcome.unwrap().watching);

        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::Completed);
        assert!(!table.is_rotating());
        assert_eq!(table.stream().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_stream() {
        let (_device, host) = tokio::io::duplex(256);
        let (reader, writer) = transport::split(host, Duration::from_millis(100));
        let (table, _events) = Table::from_transport(reader, writer, &protocol());
        let stream = table.stream().clone();

        table.shutdown().await;
        assert!(stream.is_closed());
    }
}
