//! In-process progress bus
//!
//! Fan-out of [`ProgressEvent`]s to subscribers, plus a bounded tail of
//! recent events for polling consumers. Delivery is at-most-once within
//! the process and nothing is persisted.
//!
//! The bus is an explicit handle passed through construction; it is cheap
//! to clone (`Arc` inside) and safe for concurrent `publish` from many
//! producers with one consumer per subscription.

use crate::progress::ProgressEvent;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

/// The single process-wide progress topic
pub const PROGRESS_CHANNEL: &str = "progress_updates";

struct Subscriber {
    sender: UnboundedSender<ProgressEvent>,
}

struct BusState {
    subscribers: HashMap<String, Vec<Subscriber>>,
    tail: VecDeque<ProgressEvent>,
    max_tail: usize,
    total_published: u64,
    dropped: u64,
}

/// Pub/sub fan-out for progress events
///
/// Subscribers receive events in publish order on their own unbounded
/// channel. Closed subscriptions are swept on the next publish.
#[derive(Clone)]
pub struct ProgressBus {
    state: Arc<Mutex<BusState>>,
}

impl ProgressBus {
    /// Create a bus keeping at most `max_tail` recent events for polling
    pub fn new(max_tail: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                subscribers: HashMap::new(),
                tail: VecDeque::with_capacity(max_tail),
                max_tail,
                total_published: 0,
                dropped: 0,
            })),
        }
    }

    /// Publish an event to every live subscriber of `channel`
    ///
    /// The event also lands in the bounded tail; the oldest entry is
    /// evicted once the tail is full.
    pub fn publish(&self, channel: &str, event: ProgressEvent) {
        let mut state = self.state.lock();
        state.total_published += 1;

        if let Some(subs) = state.subscribers.get_mut(channel) {
            subs.retain(|sub| sub.sender.send(event.clone()).is_ok());
        }

        if state.tail.len() == state.max_tail {
            state.tail.pop_front();
            state.dropped += 1;
        }
        state.tail.push_back(event);
        trace!(channel, "published progress event");
    }

    /// Register a subscriber channel; events arrive in publish order
    pub fn subscribe(&self, channel: &str, sender: UnboundedSender<ProgressEvent>) {
        let mut state = self.state.lock();
        state
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { sender });
    }

    /// Drop every subscriber of `channel`
    pub fn unsubscribe(&self, channel: &str) {
        let mut state = self.state.lock();
        state.subscribers.remove(channel);
    }

    /// Pop the oldest buffered event, if any
    pub fn pull_next(&self) -> Option<ProgressEvent> {
        self.state.lock().tail.pop_front()
    }

    /// Total events published over the bus lifetime
    pub fn total_published(&self) -> u64 {
        self.state.lock().total_published
    }

    /// Events evicted from the tail before being pulled
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
