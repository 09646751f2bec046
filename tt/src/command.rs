//! CommandCoordinator - one command, one classified reply
//!
//! Each exchange subscribes to the token stream before writing, so a reply
//! can never race ahead of the subscription. The first token that classifies
//! as a [`Reply`] resolves the exchange; tokens before it are skipped and
//! tokens after it are never seen, because the subscription is dropped as
//! soon as the exchange ends, whatever the outcome.
//!
//! Only one command is in flight at a time. The transport writer sits behind
//! an async mutex that is held for the whole exchange, so concurrent callers
//! queue up instead of interleaving.
//!
//! [`CommandCoordinator::send_and_follow`] also hands back a subscription
//! positioned right after the reply, for consumers that must see whatever the
//! table sends next (a rotation started by `FM` may finish in the same burst
//! as its `OK`).

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::CommandError;
use crate::protocol::{Command, Reply};
use crate::token::{Subscription, TokenStream};
use crate::transport::TransportWriter;

/// Default time to wait for a reply
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Sends commands and waits for their replies
pub struct CommandCoordinator {
    stream: TokenStream,
    writer: Mutex<TransportWriter>,
    timeout: Duration,
}

impl CommandCoordinator {
    pub fn new(stream: TokenStream, writer: TransportWriter, timeout: Duration) -> Self {
        debug!(?timeout, "CommandCoordinator::new: called");
        Self {
            stream,
            writer: Mutex::new(writer),
            timeout,
        }
    }

    /// The reply timeout used by [`CommandCoordinator::send_and_await`]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The token stream replies are read from
    pub fn stream(&self) -> &TokenStream {
        &self.stream
    }

    /// Send a typed command with the default timeout
    pub async fn send(&self, command: &Command) -> Result<Reply, CommandError> {
        self.send_and_await(&command.to_string()).await
    }

    /// Send `command` verbatim and wait for its reply
    pub async fn send_and_await(&self, command: &str) -> Result<Reply, CommandError> {
        self.send_with_timeout(command, self.timeout).await
    }

    /// Send `command` verbatim and wait at most `timeout` for its reply
    pub async fn send_with_timeout(&self, command: &str, timeout: Duration) -> Result<Reply, CommandError> {
        debug!(%command, ?timeout, "CommandCoordinator::send_with_timeout: called");
        let (reply, _) = self.exchange(command, timeout).await?;
        Ok(reply)
    }

    /// Send `command` and also return a subscription to everything after the reply
    ///
    /// The returned subscription has already queued any tokens the table sent
    /// right behind the reply.
    pub async fn send_and_follow(&self, command: &str) -> Result<(Reply, Subscription), CommandError> {
        debug!(%command, "CommandCoordinator::send_and_follow: called");
        self.exchange(command, self.timeout).await
    }

    async fn exchange(&self, command: &str, timeout: Duration) -> Result<(Reply, Subscription), CommandError> {
        let mut writer = self.writer.lock().await;

        // Both subscriptions see exactly the same tokens
        let (mut subscription, mut follower) = self.stream.subscribe_pair();
        let started = Instant::now();

        // On a write error the subscriptions are dropped, which unsubscribes them
        writer.write_line(command).await?;

        let outcome = tokio::time::timeout(timeout, await_reply(&mut subscription)).await;
        subscription.unsubscribe();

        match outcome {
            Ok(Some((reply, consumed))) => {
                debug!(
                    %command,
                    %reply,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Response received"
                );
                // Skip up to and including the reply
                for _ in 0..consumed {
                    follower.try_recv();
                }
                Ok((reply, follower))
            }
            Ok(None) => {
                warn!(%command, "Token stream closed before a response arrived");
                Err(CommandError::StreamClosed {
                    command: command.to_string(),
                })
            }
            Err(_) => {
                warn!(%command, ?timeout, "Table not responding to command");
                Err(CommandError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Close the write half of the transport
    pub async fn close(&self) -> Result<(), CommandError> {
        self.writer.lock().await.close().await?;
        Ok(())
    }
}

/// Wait for the first token that classifies as a reply
///
/// Also returns how many tokens were read, the reply included.
async fn await_reply(subscription: &mut Subscription) -> Option<(Reply, usize)> {
    let mut consumed = 0;
    while let Some(token) = subscription.recv().await {
        consumed += 1;
        match Reply::classify(token) {
            Some(reply) => return Some((reply, consumed)),
            None => trace!(consumed, "await_reply: not a reply, skipping"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    use crate::protocol::{Response, Token};
    use crate::transport;

    struct Device {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        out: WriteHalf<DuplexStream>,
    }

    impl Device {
        async fn expect(&mut self, command: &str) {
            let line = self.lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, command);
        }

        async fn reply(&mut self, tokens: &[&str]) {
            for token in tokens {
                self.out.write_all(format!("{token}\n").as_bytes()).await.unwrap();
            }
        }
    }

    fn connect(timeout: Duration) -> (CommandCoordinator, Device) {
        let (device, host) = tokio::io::duplex(1024);
        let (reader, writer) = transport::split(host, Duration::from_millis(100));
        let stream = TokenStream::spawn(reader);
        let (read, out) = tokio::io::split(device);
        let device = Device {
            lines: BufReader::new(read).lines(),
            out,
        };
        (CommandCoordinator::new(stream, writer, timeout), device)
    }

    #[tokio::test]
    async fn test_status_ready() {
        let (coordinator, mut device) = connect(DEFAULT_COMMAND_TIMEOUT);

        let table = async {
            device.expect("STATUS").await;
            device.reply(&["READY"]).await;
        };
        let (response, ()) = tokio::join!(coordinator.send(&Command::Status), table);

        assert_eq!(response.unwrap().response, Response::Ready);
        assert_eq!(coordinator.stream().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_first_accepted_token_wins() {
        let (coordinator, mut device) = connect(DEFAULT_COMMAND_TIMEOUT);
        let mut observer = coordinator.stream().subscribe();

        let table = async {
            device.expect("GET ACC").await;
            device.reply(&["PING", "7", "9"]).await;
        };
        let (response, ()) = tokio::join!(coordinator.send_and_await("GET ACC"), table);

        let reply = response.unwrap();
        assert_eq!(reply.response, Response::Value(7));
        assert_eq!(reply.token, "7");

        // Other consumers still see everything, including the reply
        assert_eq!(observer.recv().await.unwrap(), "PING");
        assert_eq!(observer.recv().await.unwrap(), "7");
        assert_eq!(observer.recv().await.unwrap(), "9");
        assert_eq!(coordinator.stream().subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_no_reply_classifies() {
        let (coordinator, mut device) = connect(DEFAULT_COMMAND_TIMEOUT);

        let table = async {
            device.expect("SOFTSTOP").await;
            device.reply(&["POS 4", "hello"]).await;
        };
        let started = Instant::now();
        let (response, ()) = tokio::join!(coordinator.send(&Command::SoftStop), table);

        let err = response.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.command(), Some("SOFTSTOP"));
        assert!(started.elapsed() >= DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(coordinator.stream().subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_timeout_override() {
        let (coordinator, _device) = connect(DEFAULT_COMMAND_TIMEOUT);

        let started = Instant::now();
        let err = coordinator
            .send_with_timeout("STATUS", Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Timeout { timeout, .. } if timeout == Duration::from_secs(2)));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_stream_close_fails_fast() {
        let (coordinator, mut device) = connect(Duration::from_secs(60));

        let table = async {
            device.expect("STATUS").await;
            drop(device);
        };
        let (response, ()) = tokio::join!(coordinator.send(&Command::Status), table);

        assert!(matches!(response, Err(CommandError::StreamClosed { .. })));
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_without_waiting() {
        let (coordinator, _device) = connect(Duration::from_secs(60));
        coordinator.close().await.unwrap();

        let err = coordinator.send(&Command::Stop).await.unwrap_err();
        assert!(matches!(err, CommandError::Transport(_)));
        assert_eq!(coordinator.stream().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_commands_are_serialized() {
        let (coordinator, mut device) = connect(DEFAULT_COMMAND_TIMEOUT);
        let coordinator = Arc::new(coordinator);

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.send(&Command::GetAcc).await }
        });
        device.expect("GET ACC").await;

        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.send(&Command::Status).await }
        });

        // The second command is not written until the first resolves
        device.reply(&["25"]).await;
        device.expect("STATUS").await;
        device.reply(&["BUSY"]).await;

        assert_eq!(first.await.unwrap().unwrap().response, Response::Value(25));
        assert_eq!(second.await.unwrap().unwrap().response, Response::Busy);
    }

    #[tokio::test]
    async fn test_stale_tokens_before_send_are_ignored() {
        let (coordinator, mut device) = connect(DEFAULT_COMMAND_TIMEOUT);
        coordinator.stream().publish(Token::from("OK"));

        let table = async {
            device.expect("SET ACC 40").await;
            device.reply(&["ERR"]).await;
        };
        let (response, ()) = tokio::join!(coordinator.send(&Command::SetAcc(40)), table);

        let reply = response.unwrap();
        assert_eq!(reply.response, Response::Err);
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn test_reply_keeps_table_text() {
        let (coordinator, mut device) = connect(DEFAULT_COMMAND_TIMEOUT);

        let table = async {
            device.expect("GET ACC").await;
            device.reply(&["007"]).await;
        };
        let (response, ()) = tokio::join!(coordinator.send(&Command::GetAcc), table);

        let reply = response.unwrap();
        assert_eq!(reply.response, Response::Value(7));
        assert_eq!(reply.to_string(), "007");
    }

    #[tokio::test]
    async fn test_follow_sees_tokens_sent_with_the_reply() {
        let (coordinator, mut device) = connect(DEFAULT_COMMAND_TIMEOUT);

        let table = async {
            device.expect("FM 0").await;
            device.out.write_all(b"PING\nOK\nPOS 1\nEND\n").await.unwrap();
        };
        let (result, ()) = tokio::join!(coordinator.send_and_follow("FM 0"), table);

        let (reply, mut follow) = result.unwrap();
        assert_eq!(reply.response, Response::Ok);
        assert_eq!(follow.recv().await.unwrap(), "POS 1");
        assert_eq!(follow.recv().await.unwrap(), "END");
        assert_eq!(coordinator.stream().subscriber_count(), 1);

        drop(follow);
        assert_eq!(coordinator.stream().subscriber_count(), 0);
    }
}
