//! Live broadcast channel.
//!
//! An explicit subscriber registry. Every subscriber owns an unbounded queue;
//! [`Broadcaster::broadcast`] pushes a frame to all of them in subscription
//! order. A subscriber leaves the registry when its [`Subscription`] is
//! dropped, which is what happens when the HTTP transport goes away. A failed
//! send never removes anyone.

use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::models::{Frame, LogFrame, LogLevel};
use crate::store::StoreHandle;

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    subscribers: BTreeMap<u64, UnboundedSender<Frame>>,
}

/// Fan-out of frames to every connected client.
#[derive(Debug, Clone, Default)]
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscriber whose queue starts with `initial()`.
    ///
    /// `initial` runs under the registry lock, so no broadcast can slip in
    /// between the initial frames and the subscriber becoming visible.
    ///
    /// # Arguments
    ///
    /// * `initial` - Builds the frames this subscriber sees first
    ///
    /// # Returns
    ///
    /// A [`Subscription`] stream of the initial frames followed by every later
    /// broadcast. Dropping it unsubscribes.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let mut sub = broadcaster.subscribe_with(|| vec![Frame::log("hello", LogLevel::Info)]);
    /// broadcaster.broadcast(Frame::log("live", LogLevel::Info));
    /// // yields "hello", then "live"
    /// ```
    pub fn subscribe_with(&self, initial: impl FnOnce() -> Vec<Frame>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.lock();
        for frame in initial() {
            // The receiver is alive in this scope.
            let _ = tx.send(frame);
        }
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        info!(subscriber = id, total = registry.subscribers.len(), "Client subscribed");
        Subscription {
            id,
            rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Send `frame` to every subscriber; returns how many accepted it.
    pub fn broadcast(&self, frame: Frame) -> usize {
        let registry = self.lock();
        let delivered = registry
            .subscribers
            .values()
            .filter(|tx| tx.send(frame.clone()).is_ok())
            .count();
        debug!(delivered, total = registry.subscribers.len(), "Broadcast frame");
        delivered
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Mirror a scan log line to tracing, keep it in the store's log buffer
    /// and send it to every client.
    pub fn log(
        &self,
        store: &StoreHandle,
        message: impl Into<String>,
        level: LogLevel,
        progress: Option<u8>,
    ) {
        let frame = LogFrame::new(message, level, progress);
        match level {
            LogLevel::Info | LogLevel::Success => info!(progress, "{}", frame.message),
            LogLevel::Warn => warn!(progress, "{}", frame.message),
            LogLevel::Error => error!(progress, "{}", frame.message),
        }
        store.update(|s| s.push_log(frame.clone()));
        self.broadcast(Frame::Log(frame));
    }
}

/// One client's view of the channel. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: UnboundedReceiver<Frame>,
    registry: Arc<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.subscribers.remove(&self.id);
        info!(subscriber = self.id, total = registry.subscribers.len(), "Client unsubscribed");
    }
}
