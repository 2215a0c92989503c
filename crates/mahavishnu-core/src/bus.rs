//! The event bus: fans out [`Event`]s published on the global channel and
//! per-pool channels to subscribers (§4.7).
//!
//! Each channel keeps its own monotonically increasing sequence counter
//! starting at zero, and every event published on a pool channel is also
//! mirrored onto the global channel. Subscriber fan-out uses [`dashmap`]
//! for lock-free lookup on the hot path; each subscriber's own delivery
//! queue is a small [`parking_lot::Mutex`]-guarded ring buffer so a slow
//! subscriber never makes `publish` block — on overflow the oldest queued
//! event is dropped and a `subscription.lagged` notice takes its place.
//! Subscriptions are held by [`std::sync::Weak`] reference so a dropped
//! client is forgotten the next time the channel is published to, without
//! requiring the client to call `unsubscribe`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::{Channel, Event, event_names};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct ChannelState {
    sequence: AtomicU64,
    subscribers: Mutex<Vec<Weak<Subscriber>>>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

struct SubscriberQueue {
    items: VecDeque<Event>,
    capacity: usize,
    lagged: bool,
}

struct Subscriber {
    channel: Channel,
    queue: Mutex<SubscriberQueue>,
    notify: Notify,
}

impl Subscriber {
    fn push(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.items.len() >= queue.capacity {
            queue.items.pop_front();
            queue.lagged = true;
        }
        queue.items.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

/// A live subscription to a channel, returned by [`EventBus::subscribe`].
///
/// Dropping this handle removes the subscription from the bus; no
/// explicit unsubscribe call is required.
pub struct Subscription {
    inner: Arc<Subscriber>,
}

impl Subscription {
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Wait for the next event on this subscription's channel.
    ///
    /// If this subscriber has lagged (its queue overflowed since the last
    /// receive), the first value returned is a synthetic
    /// `subscription.lagged` notice rather than a dropped event.
    pub async fn recv(&self) -> Event {
        loop {
            {
                let mut queue = self.inner.queue.lock();
                if queue.lagged {
                    queue.lagged = false;
                    let channel = self.inner.channel.clone();
                    drop(queue);
                    return lagged_event(channel);
                }
                if let Some(event) = queue.items.pop_front() {
                    return event;
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

fn lagged_event(channel: Channel) -> Event {
    Event {
        event_type: event_names::SUBSCRIPTION_LAGGED.to_string(),
        channel,
        payload: serde_json::json!({}),
        sequence: 0,
        timestamp: Utc::now(),
    }
}

/// Fans out events to subscribers of the global channel and per-pool
/// channels.
pub struct EventBus {
    channels: DashMap<String, Arc<ChannelState>>,
    queue_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            queue_capacity,
        }
    }

    fn channel_state(&self, channel: &Channel) -> Arc<ChannelState> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(ChannelState::new()))
            .clone()
    }

    /// Subscribe to a channel. The returned [`Subscription`] owns its
    /// delivery queue; dropping it unsubscribes.
    pub fn subscribe(&self, channel: Channel) -> Subscription {
        let state = self.channel_state(&channel);
        let subscriber = Arc::new(Subscriber {
            channel,
            queue: Mutex::new(SubscriberQueue {
                items: VecDeque::new(),
                capacity: self.queue_capacity,
                lagged: false,
            }),
            notify: Notify::new(),
        });
        state.subscribers.lock().push(Arc::downgrade(&subscriber));
        Subscription { inner: subscriber }
    }

    /// Publish `event_type`/`payload` on `channel`. If `channel` is a pool
    /// channel, the event is also mirrored onto the global channel (with
    /// its own, independent sequence number) so global subscribers see
    /// every pool's activity (§4.7).
    pub fn publish(&self, event_type: impl Into<String>, channel: Channel, payload: serde_json::Value) {
        let event_type = event_type.into();
        self.deliver(channel.clone(), event_type.clone(), payload.clone());
        if !matches!(channel, Channel::Global) {
            self.deliver(Channel::Global, event_type, payload);
        }
    }

    fn deliver(&self, channel: Channel, event_type: String, payload: serde_json::Value) {
        let state = self.channel_state(&channel);
        let sequence = state.next_sequence();
        let event = Event {
            event_type,
            channel,
            payload,
            sequence,
            timestamp: Utc::now(),
        };

        let mut subscribers = state.subscribers.lock();
        subscribers.retain(|weak| {
            if let Some(subscriber) = weak.upgrade() {
                subscriber.push(event.clone());
                true
            } else {
                false
            }
        });
    }

    /// Number of live subscribers currently registered on `channel`.
    /// Prunes any subscriptions whose client has already been dropped.
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        let Some(state) = self.channels.get(&channel.to_string()) else {
            return 0;
        };
        let mut subscribers = state.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.len()
    }
}
