//! Thread-level facade over the turn runner
//!
//! What this module provides
//! - `TriageServer`, the surface callers talk to: run a turn, stream a turn,
//!   read a snapshot, subscribe to a thread's deltas
//!
//! Implementation strategy
//! - One async lock per thread id serializes turns on that thread; distinct
//!   threads never contend
//! - A turn runs on a loaded copy of the state. The copy is saved whole when
//!   the runner returns an outcome. After a hard error the history, event log
//!   and gate results the turn produced are kept (observers have already seen
//!   them) while the context and active handler roll back to the stored ones
//! - Snapshots are published after every step that appended events and once
//!   more when the turn ends, so the broadcast event log never shrinks

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, instrument, warn};

use crate::config::TriageConfig;
use crate::error::{Result, TriageError};
use crate::recording::AgentEvent;
use crate::runner::{TurnOutcome, TurnRunner};
use crate::sessions::{ConversationState, Snapshot, ThreadStore};
use crate::streaming::{Broadcaster, Subscription};

/// Result of one completed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub thread_id: String,
    pub outcome: TurnOutcome,
    /// Events appended by this turn, in production order
    pub new_events: Vec<AgentEvent>,
    pub snapshot: Snapshot,
}

/// Item of a streamed turn: events as they happen, then a final snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnStreamItem {
    Event(AgentEvent),
    Snapshot(Snapshot),
    /// The turn failed; only the error category is exposed
    Failed { category: String },
}

pub struct TriageServer {
    runner: TurnRunner,
    store: Arc<dyn ThreadStore>,
    broadcaster: Broadcaster,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for TriageServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriageServer")
            .field("runner", &self.runner)
            .field("broadcaster", &self.broadcaster)
            .finish_non_exhaustive()
    }
}

impl TriageServer {
    pub fn new(runner: TurnRunner, store: Arc<dyn ThreadStore>, config: &TriageConfig) -> Self {
        Self {
            runner,
            store,
            broadcaster: Broadcaster::new(config.broadcast.subscriber_capacity),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn runner(&self) -> &TurnRunner {
        &self.runner
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    fn thread_lock(&self, thread_id: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| TriageError::Store("thread lock table poisoned".into()))?;
        Ok(locks.entry(thread_id.to_string()).or_default().clone())
    }

    async fn load_or_new(&self, thread_id: &str) -> Result<(ConversationState, bool)> {
        Ok(match self.store.load(thread_id).await? {
            Some(state) => (state, false),
            None => (
                ConversationState::new(thread_id, self.runner.registry().entry()),
                true,
            ),
        })
    }

    fn capture(&self, state: &ConversationState) -> Snapshot {
        Snapshot::capture(state, self.runner.registry())
    }

    fn publish(&self, snapshot: &Snapshot) {
        match self.broadcaster.publish(snapshot) {
            Ok(report) if report.dropped > 0 => {
                warn!(thread_id = %snapshot.thread_id, dropped = report.dropped, "slow subscribers missed a frame");
            }
            Ok(_) => {}
            Err(e) => warn!(thread_id = %snapshot.thread_id, error = %e, "publish failed"),
        }
    }

    /// Load a thread, creating and storing it at the entry handler when
    /// `thread_id` is absent or unknown.
    pub async fn ensure_thread(&self, thread_id: Option<&str>) -> Result<ConversationState> {
        let id = thread_id
            .map(str::to_string)
            .unwrap_or_else(|| self.store.generate_id());
        let (state, created) = self.load_or_new(&id).await?;
        if created {
            self.store.save(&state).await?;
            info!(thread_id = %id, "🧵 thread created");
        }
        Ok(state)
    }

    /// Current public picture of a thread.
    pub async fn snapshot(&self, thread_id: &str) -> Result<Snapshot> {
        let state = self.ensure_thread(Some(thread_id)).await?;
        Ok(self.capture(&state))
    }

    /// Subscribe to a thread's snapshot-with-delta frames.
    pub fn subscribe(&self, thread_id: &str) -> Result<Subscription> {
        self.broadcaster.subscribe(thread_id)
    }

    pub fn unsubscribe(&self, thread_id: &str, subscriber: u64) -> Result<bool> {
        self.broadcaster.unsubscribe(thread_id, subscriber)
    }

    /// Run one turn; a missing `thread_id` starts a new thread.
    pub async fn turn(&self, thread_id: Option<&str>, message: &str) -> Result<TurnResult> {
        self.turn_with(thread_id, message, |_| {}).await
    }

    #[instrument(skip_all, fields(thread_id = tracing::field::Empty))]
    async fn turn_with<E>(
        &self,
        thread_id: Option<&str>,
        message: &str,
        mut on_event: E,
    ) -> Result<TurnResult>
    where
        E: FnMut(&AgentEvent) + Send,
    {
        let id = thread_id
            .map(str::to_string)
            .unwrap_or_else(|| self.store.generate_id());
        tracing::Span::current().record("thread_id", id.as_str());

        let lock = self.thread_lock(&id)?;
        let _guard = lock.lock().await;

        let (stored, _) = self.load_or_new(&id).await?;
        let mut state = stored.clone();
        let result = self
            .runner
            .run_turn(&mut state, message, |s, delta| {
                delta.iter().for_each(&mut on_event);
                self.publish(&self.capture(s));
            })
            .await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, category = e.category(), "turn failed; context rolled back");
                let kept = ConversationState {
                    history: state.history,
                    events: state.events,
                    guardrail_checks: state.guardrail_checks,
                    ..stored
                };
                if let Err(save_err) = self.store.save(&kept).await {
                    warn!(error = %save_err, "failed to keep log of failed turn");
                }
                self.publish(&self.capture(&kept));
                return Err(e);
            }
        };

        self.store.save(&state).await?;
        let snapshot = self.capture(&state);
        self.publish(&snapshot);
        Ok(TurnResult {
            thread_id: id,
            outcome: report.outcome,
            new_events: state.events[report.first_event..].to_vec(),
            snapshot,
        })
    }

    /// Run a turn in the background, streaming its events as they are
    /// appended and ending with the final snapshot.
    pub fn turn_stream(
        self: &Arc<Self>,
        thread_id: Option<&str>,
        message: &str,
    ) -> UnboundedReceiverStream<TurnStreamItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::clone(self);
        let thread_id = thread_id.map(str::to_string);
        let message = message.to_string();
        tokio::spawn(async move {
            let events = tx.clone();
            let result = server
                .turn_with(thread_id.as_deref(), &message, move |event| {
                    let _ = events.send(TurnStreamItem::Event(event.clone()));
                })
                .await;
            let last = match result {
                Ok(done) => TurnStreamItem::Snapshot(done.snapshot),
                Err(e) => TurnStreamItem::Failed {
                    category: e.category().to_string(),
                },
            };
            // Receiver may already be gone.
            let _ = tx.send(last);
        });
        UnboundedReceiverStream::new(rx)
    }
}
