//! RotationWatchdog - liveness tracking for a running rotation
//!
//! After `FM <n>` is acknowledged the table rotates on its own and reports
//! `POS <n>` updates until `END`. The watchdog listens to the token stream
//! independently of the command layer and restarts a one-shot stall timer on
//! every token. If the timer runs out while armed, the operator is warned
//! once; the next token starts a fresh window that can warn again.
//!
//! `MOVERR` is reported but leaves the watchdog armed: the table may still
//! send `END` afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{RotationEvent, Token};
use crate::token::{Subscription, SubscriptionId, TokenStream};

/// Default silence allowed between tokens during rotation
pub const DEFAULT_STALL_INTERVAL: Duration = Duration::from_millis(3000);

/// What the watchdog reports while armed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// Positional update received
    Progress(Token),
    /// Rotation finished; the watchdog has disarmed itself
    Completed,
    /// The table reported a move error
    MoveError,
    /// No token for a full stall interval
    Stalled { silence: Duration },
    /// The token stream ended while armed; the watchdog has disarmed itself
    StreamClosed,
}

struct Armed {
    subscription_id: SubscriptionId,
    task: JoinHandle<()>,
}

/// Watches a rotation for completion, errors and silence
pub struct RotationWatchdog {
    stream: TokenStream,
    stall_interval: Duration,
    events: mpsc::UnboundedSender<WatchdogEvent>,
    armed_flag: Arc<AtomicBool>,
    armed: Option<Armed>,
}

impl RotationWatchdog {
    /// Create a disarmed watchdog and the receiver for its events
    pub fn new(stream: TokenStream, stall_interval: Duration) -> (Self, mpsc::UnboundedReceiver<WatchdogEvent>) {
        debug!(?stall_interval, "RotationWatchdog::new: called");
        let (events, rx) = mpsc::unbounded_channel();
        let watchdog = Self {
            stream,
            stall_interval,
            events,
            armed_flag: Arc::new(AtomicBool::new(false)),
            armed: None,
        };
        (watchdog, rx)
    }

    pub fn stall_interval(&self) -> Duration {
        self.stall_interval
    }

    /// Start watching; re-arms with a fresh stall window if already armed
    pub fn arm(&mut self) {
        let subscription = self.stream.subscribe();
        self.arm_with(subscription);
    }

    /// Start watching through a subscription taken earlier
    ///
    /// Tokens already queued on `subscription` are handled first, so a
    /// rotation that finished before arming is still seen to complete.
    pub fn arm_with(&mut self, subscription: Subscription) {
        self.disarm();

        let subscription_id = subscription.id();
        self.armed_flag.store(true, Ordering::SeqCst);

        let task = tokio::spawn(watch(
            subscription,
            Instant::now(),
            self.stall_interval,
            self.events.clone(),
            self.armed_flag.clone(),
        ));
        self.armed = Some(Armed { subscription_id, task });
        info!(subscription_id, stall_interval_ms = self.stall_interval.as_millis() as u64, "Watchdog armed");
    }

    /// Stop watching; returns whether the watchdog was armed
    pub fn disarm(&mut self) -> bool {
        let Some(armed) = self.armed.take() else {
            return false;
        };

        self.stream.unsubscribe(armed.subscription_id);
        armed.task.abort();
        let was_armed = self.armed_flag.swap(false, Ordering::SeqCst);
        debug!(was_armed, "RotationWatchdog::disarm: called");
        was_armed
    }

    /// Whether a rotation is being watched
    ///
    /// Turns false by itself once `END` arrives or the stream closes.
    pub fn is_armed(&self) -> bool {
        self.armed_flag.load(Ordering::SeqCst)
    }
}

impl Drop for RotationWatchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

async fn watch(
    mut subscription: Subscription,
    armed_at: Instant,
    stall_interval: Duration,
    events: mpsc::UnboundedSender<WatchdogEvent>,
    armed: Arc<AtomicBool>,
) {
    let mut last_seen = armed_at;
    let mut warned = false;

    loop {
        tokio::select! {
            token = subscription.recv() => {
                let Some(token) = token else {
                    warn!("Token stream closed during rotation");
                    armed.store(false, Ordering::SeqCst);
                    let _ = events.send(WatchdogEvent::StreamClosed);
                    return;
                };

                // Any token proves the table is alive
                last_seen = Instant::now();
                warned = false;

                match RotationEvent::classify(&token) {
                    RotationEvent::Progress { position } => {
                        trace!(?position, "Rotation progress");
                        let _ = events.send(WatchdogEvent::Progress(token));
                    }
                    RotationEvent::Completed => {
                        info!("Rotation completed");
                        subscription.unsubscribe();
                        armed.store(false, Ordering::SeqCst);
                        let _ = events.send(WatchdogEvent::Completed);
                        return;
                    }
                    RotationEvent::MoveError => {
                        error!("Table reported a move error");
                        let _ = events.send(WatchdogEvent::MoveError);
                    }
                    RotationEvent::Other => {
                        trace!(%token, "Watchdog: liveness only");
                    }
                }
            }
            _ = sleep_until(last_seen + stall_interval), if !warned => {
                warned = true;
                let silence = last_seen.elapsed();
                warn!(silence_ms = silence.as_millis() as u64, "Table stopped sending messages in the process of rotation");
                let _ = events.send(WatchdogEvent::Stalled { silence });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::{advance, sleep};

    const STALL: Duration = DEFAULT_STALL_INTERVAL;

    /// Paused-clock timers land on millisecond ticks
    fn assert_near(actual: Duration, expected: Duration) {
        let slack = Duration::from_millis(2);
        assert!(
            actual >= expected && actual <= expected + slack,
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    fn assert_stalled(event: WatchdogEvent) {
        match event {
            WatchdogEvent::Stalled { silence } => assert_near(silence, STALL),
            other => panic!("Expected Stalled event, got {other:?}"),
        }
    }

    /// Publish `tokens` at the given offsets from `start`
    async fn feed(stream: &TokenStream, start: Instant, script: &[(u64, &str)]) {
        for (at_ms, text) in script {
            tokio::time::sleep_until(start + Duration::from_millis(*at_ms)).await;
            stream.publish(Token::from(*text));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_regular_progress_never_stalls() {
        let stream = TokenStream::new();
        let (mut watchdog, mut events) = RotationWatchdog::new(stream.clone(), STALL);
        let start = Instant::now();
        watchdog.arm();

        feed(&stream, start, &[(1000, "POS 1"), (2000, "POS 2"), (2500, "END")]).await;

        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::Progress(Token::from("POS 1")));
        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::Progress(Token::from("POS 2")));
        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::Completed);
        assert!(!watchdog.is_armed());
        assert_eq!(stream.subscriber_count(), 0);

        // Nothing more, even well past the stall interval
        sleep(STALL * 2).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_warns_once_then_rearms_on_token() {
        let stream = TokenStream::new();
        let (mut watchdog, mut events) = RotationWatchdog::new(stream.clone(), STALL);
        let start = Instant::now();
        watchdog.arm();

        assert_stalled(events.recv().await.unwrap());
        assert_near(start.elapsed(), STALL);

        // Only one warning for the same silence
        sleep_until(start + Duration::from_millis(3500)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert!(watchdog.is_armed());

        feed(&stream, start, &[(3600, "POS 5")]).await;
        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::Progress(Token::from("POS 5")));

        // A new window starts at the token
        assert_stalled(events.recv().await.unwrap());
        assert_near(start.elapsed(), Duration::from_millis(3600) + STALL);
        assert!(watchdog.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_token_counts_as_liveness() {
        let stream = TokenStream::new();
        let (mut watchdog, mut events) = RotationWatchdog::new(stream.clone(), STALL);
        let start = Instant::now();
        watchdog.arm();

        feed(&stream, start, &[(2000, "BUSY"), (4000, "noise"), (6000, "END")]).await;

        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_error_keeps_watchdog_armed() {
        let stream = TokenStream::new();
        let (mut watchdog, mut events) = RotationWatchdog::new(stream.clone(), STALL);
        let start = Instant::now();
        watchdog.arm();

        feed(&stream, start, &[(500, "MOVERR")]).await;
        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::MoveError);
        assert!(watchdog.is_armed());
        assert_eq!(stream.subscriber_count(), 1);

        feed(&stream, start, &[(1000, "END")]).await;
        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::Completed);
        assert!(!watchdog.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_stops_timer_and_subscription() {
        let stream = TokenStream::new();
        let (mut watchdog, mut events) = RotationWatchdog::new(stream.clone(), STALL);
        watchdog.arm();
        assert!(watchdog.is_armed());
        assert_eq!(stream.subscriber_count(), 1);

        assert!(watchdog.disarm());
        assert!(!watchdog.disarm());
        assert!(!watchdog.is_armed());
        assert_eq!(stream.subscriber_count(), 0);

        advance(STALL * 2).await;
        stream.publish(Token::from("POS 9"));
        tokio::task::yield_now().await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_watch() {
        let stream = TokenStream::new();
        let (mut watchdog, mut events) = RotationWatchdog::new(stream.clone(), STALL);
        let start = Instant::now();
        watchdog.arm();

        sleep(Duration::from_millis(2000)).await;
        watchdog.arm();
        assert_eq!(stream.subscriber_count(), 1);

        // The stall window restarted at the second arm
        assert_stalled(events.recv().await.unwrap());
        assert_near(start.elapsed(), Duration::from_millis(2000) + STALL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_with_handles_queued_tokens() {
        let stream = TokenStream::new();
        let (mut watchdog, mut events) = RotationWatchdog::new(stream.clone(), STALL);

        let subscription = stream.subscribe();
        stream.publish(Token::from("POS 1"));
        stream.publish(Token::from("END"));
        watchdog.arm_with(subscription);

        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::Progress(Token::from("POS 1")));
        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::Completed);
        assert!(!watchdog.is_armed());

        sleep(STALL * 2).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_stream_close_disarms() {
        let stream = TokenStream::new();
        let (mut watchdog, mut events) = RotationWatchdog::new(stream.clone(), STALL);
        watchdog.arm();

        stream.close();
        assert_eq!(events.recv().await.unwrap(), WatchdogEvent::StreamClosed);
        assert!(!watchdog.is_armed());
    }

    #[tokio::test]
    async fn test_drop_disarms() {
        let stream = TokenStream::new();
        let (mut watchdog, _events) = RotationWatchdog::new(stream.clone(), STALL);
        watchdog.arm();
        assert_eq!(stream.subscriber_count(), 1);

        drop(watchdog);
        assert_eq!(stream.subscriber_count(), 0);
    }
}
