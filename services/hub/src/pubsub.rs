//! Persistent pub/sub with seamless history catch-up.
//!
//! A [`Topic`] keeps a list of subscriber channels, each with a cut-off
//! timestamp `start`; a published message is delivered to every subscriber
//! whose `start` is at or before the message timestamp.
//!
//! Subscribing with a positive `start_at` replays history first.  The
//! replay runs under the topic's publisher lock so no publish can slip past
//! it; sends are attempted non-blocking, and when a subscriber channel
//! fills up the replay drops the lock before blocking so a slow consumer
//! never stalls the publishers.  Once a full pass completes with the lock
//! held throughout, the subscriber is appended with `start = last_at + 1` —
//! the bridge point: everything replayed is excluded from live delivery
//! (no duplicates) and everything after it is included (no gaps).
//!
//! A subscriber is in exactly one of three states: replaying, caught-up
//! (in the list) or closed.  `unsubscribe` during replay marks the ID
//! cancelled so the replay task closes the stream instead of registering.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use wd_protocol::{RFMessage, SensorDataValue};

use crate::store::StoreError;

/// Subscriber channel capacity; replay relies on this buffer to have a
/// chance of finishing a pass without releasing the publisher lock.
pub const SUBSCRIBER_CAPACITY: usize = 100;

const REPLAY_BATCH: usize = 64;

/// Anything with a millisecond timestamp can ride a [`Topic`].
pub trait Timestamped: Clone + Send + 'static {
    fn at(&self) -> i64;
}

impl Timestamped for RFMessage {
    fn at(&self) -> i64 {
        self.at
    }
}

impl Timestamped for SensorDataValue {
    fn at(&self) -> i64 {
        self.at
    }
}

/// Reads ordered history for replay: `(from, limit)` -> messages with
/// timestamp `>= from`, ascending, at most `limit` of them.
pub type ReplayFn<T> = dyn Fn(i64, usize) -> Result<Vec<T>, StoreError> + Send + Sync;

pub type SubId = u64;

/// A live subscription handle.  Dropping the receiver without
/// unsubscribing is tolerated, but unsubscribing keeps the topic tidy.
pub struct Subscription<T> {
    pub id: SubId,
    pub rx: mpsc::Receiver<T>,
}

struct Sub<T> {
    id: SubId,
    tx: mpsc::Sender<T>,
    start: i64,
}

struct TopicState<T> {
    subs: Vec<Sub<T>>,
    /// IDs unsubscribed while their replay was still running.
    cancelled: HashSet<SubId>,
}

/// One pub/sub topic.  Clones share state.
pub struct Topic<T> {
    label: Arc<str>,
    state: Arc<Mutex<TopicState<T>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Topic {
            label: Arc::clone(&self.label),
            state: Arc::clone(&self.state),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T: Timestamped> Topic<T> {
    pub fn new(label: impl Into<String>) -> Self {
        Topic {
            label: Arc::from(label.into()),
            state: Arc::new(Mutex::new(TopicState { subs: Vec::new(), cancelled: HashSet::new() })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribe from `start_at` (ms since epoch); `start_at <= 0` means
    /// live messages only, no history.  Replay runs in a background task;
    /// the returned stream seamlessly switches from history to live tail.
    pub fn subscribe(&self, start_at: i64, replay: Arc<ReplayFn<T>>) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topic = self.clone();
        tokio::spawn(async move {
            topic.catch_up(id, start_at, tx, replay).await;
        });
        Subscription { id, rx }
    }

    /// Replay history, then register at the bridge point (see module docs).
    async fn catch_up(&self, id: SubId, start_at: i64, tx: mpsc::Sender<T>, replay: Arc<ReplayFn<T>>) {
        if start_at <= 0 {
            // live only: register immediately, delivering everything
            // published from now on
            let mut st = self.state.lock().await;
            if st.cancelled.remove(&id) {
                return;
            }
            st.subs.push(Sub { id, tx, start: 0 });
            debug!(topic = %self.label, id, "live subscriber registered");
            return;
        }

        let mut from = start_at;
        loop {
            let mut guard = Some(self.state.lock().await);
            if guard.as_mut().expect("held").cancelled.remove(&id) {
                return;
            }

            // One replay pass.  `last_at` tracks the newest message sent;
            // registering with `last_at + 1` excludes it from live delivery.
            let mut last_at = from - 1;
            let mut sent = 0usize;
            'pass: loop {
                let batch = match replay(from, REPLAY_BATCH) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(topic = %self.label, id, error = %e, "replay read failed");
                        break 'pass;
                    }
                };
                if batch.is_empty() {
                    break 'pass;
                }
                for m in batch {
                    last_at = m.at();
                    sent += 1;
                    match tx.try_send(m) {
                        Ok(()) => {}
                        Err(TrySendError::Full(m)) => {
                            // the subscriber is slower than the replay;
                            // release the publisher lock before blocking
                            drop(guard.take());
                            if tx.send(m).await.is_err() {
                                debug!(topic = %self.label, id, "subscriber gone during replay");
                                return;
                            }
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!(topic = %self.label, id, "subscriber gone during replay");
                            return;
                        }
                    }
                }
                from = last_at + 1;
            }

            debug!(topic = %self.label, id, sent, "replay pass done");
            if let Some(mut st) = guard.take() {
                // lock held for the whole pass: the bridge point
                if st.cancelled.remove(&id) {
                    return;
                }
                st.subs.push(Sub { id, tx, start: last_at + 1 });
                debug!(topic = %self.label, id, start = last_at + 1, "subscriber caught up");
                return;
            }
            // lock was released mid-pass; catch whatever was published
            // meanwhile and try to bridge again
            from = last_at + 1;
        }
    }

    /// Close a subscriber's stream (exactly once) and remove it.
    /// Idempotent on unknown or already-removed IDs.
    pub async fn unsubscribe(&self, id: SubId) {
        let mut st = self.state.lock().await;
        if let Some(pos) = st.subs.iter().position(|s| s.id == id) {
            st.subs.remove(pos); // dropping the sender closes the stream
            debug!(topic = %self.label, id, "unsubscribed");
        } else {
            // replay may still be running; tell it not to register
            st.cancelled.insert(id);
        }
    }

    /// Deliver to every subscriber whose cut-off is at or before `m.at()`.
    /// Called by writers after a successful store.
    pub async fn publish(&self, m: &T) {
        let mut st = self.state.lock().await;
        let mut dead: Vec<SubId> = Vec::new();
        for i in 0..st.subs.len() {
            if m.at() >= st.subs[i].start {
                let tx = st.subs[i].tx.clone();
                if tx.send(m.clone()).await.is_err() {
                    dead.push(st.subs[i].id);
                }
            }
        }
        // receivers dropped without unsubscribing
        for id in dead {
            st.subs.retain(|s| s.id != id);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subs.len()
    }
}

// ---------------------------------------------------------------------------
// Per-sensor topic family
// ---------------------------------------------------------------------------

/// Lazily created topic per sensor name; the map itself is guarded by a
/// single mutex, each topic keeps its own publisher lock.
pub struct SensorTopics {
    topics: Arc<Mutex<HashMap<String, Topic<SensorDataValue>>>>,
}

impl Default for SensorTopics {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorTopics {
    pub fn new() -> Self {
        SensorTopics { topics: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub async fn topic(&self, name: &str) -> Topic<SensorDataValue> {
        self.topics
            .lock()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Topic::new(format!("sensor/{name}")))
            .clone()
    }

    pub async fn publish(&self, name: &str, value: &SensorDataValue) {
        self.topic(name).await.publish(value).await;
    }

    pub async fn unsubscribe(&self, name: &str, id: SubId) {
        self.topic(name).await.unsubscribe(id).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
