//! TokenStream - fan-out of decoded transport lines
//!
//! A single read task owns the transport's read half. Every line it decodes
//! becomes a [`Token`] that is pushed, in arrival order, to each subscriber's
//! own unbounded channel. Publishing never blocks and never runs subscriber
//! code, so subscribers may unsubscribe at any time, including while they
//! are handling a token.
//!
//! ```text
//!   TransportReader ──▶ read task ──▶ TokenStream ──┬──▶ CommandCoordinator
//!                                    (registry)     └──▶ RotationWatchdog
//! ```
//!
//! When the read task ends (end of stream, read error, or [`TokenStream::shutdown`])
//! the stream closes: every pending [`Subscription::recv`] returns `None`, and
//! subscriptions taken afterwards are already closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::protocol::Token;
use crate::transport::TransportReader;

/// Identifies one subscription within a stream
pub type SubscriptionId = u64;

#[derive(Default)]
struct RegistryState {
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<Token>>,
    closed: bool,
    reader: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Nothing in the critical sections can leave the map half-updated
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }
}

/// Multi-consumer token feed
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone, Default)]
pub struct TokenStream {
    inner: Arc<Registry>,
}

impl TokenStream {
    /// Create a stream with no read task attached
    ///
    /// Tokens are fed with [`TokenStream::publish`].
    pub fn new() -> Self {
        debug!("TokenStream::new: called");
        Self::default()
    }

    /// Start the read loop over `reader` on its own task
    ///
    /// Taking the reader by value makes this a one-time operation per
    /// opened transport.
    pub fn spawn(reader: TransportReader) -> Self {
        let stream = Self::new();
        let task = tokio::spawn(stream.clone().read_loop(reader));
        stream.inner.lock().reader = Some(task);
        info!("TokenStream started");
        stream
    }

    async fn read_loop(self, mut reader: TransportReader) {
        loop {
            match reader.read_line().await {
                Ok(Some(line)) => self.publish(Token::from(line)),
                Ok(None) => {
                    info!("Transport closed, token stream ending");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Transport read failed, token stream ending");
                    break;
                }
            }
        }
        self.close();
    }

    /// Deliver `token` to every current subscriber
    ///
    /// Subscribers added afterwards never see it.
    pub fn publish(&self, token: Token) {
        let mut state = self.inner.lock();
        if state.closed {
            debug!(%token, "TokenStream::publish: stream closed, dropping token");
            return;
        }

        trace!(%token, subscribers = state.subscribers.len(), "TokenStream::publish");
        // A failed send means the receiver is gone; prune it
        state.subscribers.retain(|_, tx| tx.send(token.clone()).is_ok());
    }

    /// Register a new consumer
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.inner.lock();
        self.register(&mut state)
    }

    /// Register two consumers that observe exactly the same tokens
    pub fn subscribe_pair(&self) -> (Subscription, Subscription) {
        let mut state = self.inner.lock();
        let first = self.register(&mut state);
        let second = self.register(&mut state);
        (first, second)
    }

    fn register(&self, state: &mut RegistryState) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        if state.closed {
            // Dropping tx leaves the subscription born closed
            debug!(id, "TokenStream::subscribe: stream already closed");
        } else {
            state.subscribers.insert(id, tx);
            debug!(id, subscribers = state.subscribers.len(), "TokenStream::subscribe");
        }

        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscription by id
    ///
    /// Returns false if it was already gone. Safe to call any number of times
    /// and from any task.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.remove(id);
        debug!(id, removed, "TokenStream::unsubscribe");
        removed
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Mark the stream finished and release every subscriber
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let released = state.subscribers.len();
        state.subscribers.clear();
        info!(released, "TokenStream closed");
    }

    /// Cancel the read task, if any, and close the stream
    pub fn shutdown(&self) {
        let reader = self.inner.lock().reader.take();
        if let Some(task) = reader {
            debug!("TokenStream::shutdown: aborting read task");
            task.abort();
        }
        self.close();
    }
}

/// One consumer's view of a [`TokenStream`]
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Token>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next token; `None` once unsubscribed or the stream closed
    pub async fn recv(&mut self) -> Option<Token> {
        self.rx.recv().await
    }

    /// Take a token that has already arrived, without waiting
    pub fn try_recv(&mut self) -> Option<Token> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving; idempotent
    ///
    /// Tokens published after this call are never delivered here, and tokens
    /// still queued are discarded.
    pub fn unsubscribe(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
