//! Delta broadcasting to live observers
//!
//! What this module provides
//! - Per-thread fan-out of state changes to any number of subscribers, each
//!   with its own bounded queue
//!
//! Exports
//! - Models
//!   - `BroadcastFrame { ..Snapshot, events_delta }`: what subscribers receive, as JSON
//!   - `PublishReport { delta_len, delivered, dropped, removed }`
//! - Services
//!   - `Broadcaster::{subscribe, unsubscribe, publish, cached_snapshot}`
//!   - `Subscription`: receiving end, also usable as a `Stream`
//!
//! Implementation strategy
//! - Each thread keeps its subscriber senders, the index of the first event not
//!   yet broadcast, and the last serialized frame
//! - `publish` slices `events[last_index..]`, advances the index, serializes
//!   once and `try_send`s the shared payload to every subscriber. A full queue
//!   drops that frame for that subscriber only; a closed queue unregisters it.
//!   Publishing never waits on a slow observer
//! - The index and cached frame advance even with no subscribers, so a late
//!   joiner receives the latest frame the moment it subscribes
//!
//! Testing strategy
//! - Capacity-1 subscribers to exercise drop-on-full deterministically
//! - Late-join tests: nothing before the first publish, cached frame after

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::error::{Result, TriageError};
use crate::recording::AgentEvent;
use crate::sessions::Snapshot;

/// Serialized frame shared by every subscriber of a publish.
pub type Payload = Arc<str>;

/// A snapshot plus the events appended since the previous publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastFrame {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub events_delta: Vec<AgentEvent>,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delta_len: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
}

/// Receiving end of a thread subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    thread_id: String,
    rx: mpsc::Receiver<Payload>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Next queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    /// Next queued frame, decoded.
    pub fn try_recv_frame(&mut self) -> Option<Result<BroadcastFrame>> {
        self.try_recv()
            .map(|raw| serde_json::from_str(&raw).map_err(TriageError::from))
    }
}

impl Stream for Subscription {
    type Item = Payload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Default)]
struct ThreadChannel {
    subscribers: Vec<(u64, mpsc::Sender<Payload>)>,
    last_index: usize,
    last_frame: Option<Payload>,
}

/// Per-thread subscriber registry and delta publisher.
pub struct Broadcaster {
    capacity: usize,
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, ThreadChannel>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ThreadChannel>>> {
        self.channels
            .lock()
            .map_err(|_| TriageError::Store("broadcaster lock poisoned".into()))
    }

    /// Register a subscriber; it immediately receives the cached frame, if any.
    pub fn subscribe(&self, thread_id: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.lock()?;
        let channel = channels.entry(thread_id.to_string()).or_default();
        if let Some(frame) = &channel.last_frame {
            // Fresh queue with capacity >= 1: cannot be full.
            let _ = tx.try_send(frame.clone());
        }
        channel.subscribers.push((id, tx));
        debug!(thread_id, subscriber = id, "subscriber registered");
        Ok(Subscription {
            id,
            thread_id: thread_id.to_string(),
            rx,
        })
    }

    /// Remove a subscriber; returns whether it was registered.
    pub fn unsubscribe(&self, thread_id: &str, subscriber: u64) -> Result<bool> {
        let mut channels = self.lock()?;
        let Some(channel) = channels.get_mut(thread_id) else {
            return Ok(false);
        };
        let before = channel.subscribers.len();
        channel.subscribers.retain(|(id, _)| *id != subscriber);
        Ok(channel.subscribers.len() != before)
    }

    /// Broadcast `snapshot` with the events not yet sent for its thread.
    pub fn publish(&self, snapshot: &Snapshot) -> Result<PublishReport> {
        let mut channels = self.lock()?;
        let channel = channels.entry(snapshot.thread_id.clone()).or_default();

        let start = channel.last_index.min(snapshot.events.len());
        let frame = BroadcastFrame {
            snapshot: snapshot.clone(),
            events_delta: snapshot.events[start..].to_vec(),
        };
        channel.last_index = snapshot.events.len();
        let payload: Payload = Arc::from(serde_json::to_string(&frame)?);
        channel.last_frame = Some(payload.clone());

        let mut report = PublishReport {
            delta_len: frame.events_delta.len(),
            ..Default::default()
        };
        channel.subscribers.retain(|(id, tx)| match tx.try_send(payload.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                report.dropped += 1;
                debug!(thread_id = %snapshot.thread_id, subscriber = id, "frame dropped: queue full");
                true
            }
            Err(TrySendError::Closed(_)) => {
                report.removed += 1;
                debug!(thread_id = %snapshot.thread_id, subscriber = id, "subscriber gone");
                false
            }
        });
        trace!(thread_id = %snapshot.thread_id, ?report, "published");
        Ok(report)
    }

    pub fn cached_snapshot(&self, thread_id: &str) -> Option<Payload> {
        self.lock()
            .ok()?
            .get(thread_id)
            .and_then(|c| c.last_frame.clone())
    }

    pub fn subscriber_count(&self, thread_id: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|c| c.get(thread_id).map(|c| c.subscribers.len()))
            .unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
