//! # Integration Tests for SQLite Thread Storage
//!
//! These tests verify that `SqliteThreadStore` persists whole threads across
//! store instances, keeps threads isolated, and can back a `TriageServer`.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::NamedTempFile;
use tower_triage::airline::{self, data, SEAT, TRIAGE};
use tower_triage::items::InputItem;
use tower_triage::model::{HandlerDecision, ScriptedHandlerModel};
use tower_triage::provider::{FixedCompletion, SharedCompletion};
use tower_triage::recording::EventRecorder;
use tower_triage::sessions::{ConversationState, ThreadStore};
use tower_triage::sqlite_session::SqliteThreadStore;
use tower_triage::{TriageConfig, TriageServer, TurnRunner};

#[tokio::test]
async fn test_sqlite_persistence() {
    // 1. Set up a temporary database file for the test.
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path();

    let mut state = ConversationState::new("thr_persist", TRIAGE);
    state.history.push(InputItem::user("Can I change my seat?"));
    state.history.push(InputItem::assistant(SEAT, "Sure, which seat?"));
    state.current_handler = SEAT.to_string();
    state
        .events
        .push(EventRecorder::default().message(SEAT, "Sure, which seat?"));
    data::apply_itinerary_defaults(&mut state.context, None);

    // 2. Save through the first store instance.
    {
        let store = SqliteThreadStore::new(db_path).await.unwrap();
        assert!(store.load("thr_persist").await.unwrap().is_none());
        store.save(&state).await.unwrap();
    }

    // 3. A fresh instance on the same file sees the whole thread, hidden
    //    context included.
    {
        let store = SqliteThreadStore::new(db_path).await.unwrap();
        let loaded = store.load("thr_persist").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.context.scenario.as_deref(), Some("disrupted"));
        assert_eq!(loaded.context.itinerary.as_ref().map(Vec::len), Some(2));
    }
}

#[tokio::test]
async fn test_sqlite_multiple_threads_in_same_db() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = SqliteThreadStore::new(temp_file.path()).await.unwrap();

    let mut alice = ConversationState::new("alice", TRIAGE);
    alice.history.push(InputItem::user("Alice's message"));
    let mut bob = ConversationState::new("bob", TRIAGE);
    bob.history.push(InputItem::user("Bob's message"));
    store.save(&alice).await.unwrap();
    store.save(&bob).await.unwrap();

    // Saving again overwrites rather than duplicating.
    alice.history.push(InputItem::user("Alice again"));
    store.save(&alice).await.unwrap();

    let mut ids = store.thread_ids().await.unwrap();
    ids.sort();
    assert_eq!(ids, vec!["alice", "bob"]);
    assert_eq!(store.load("alice").await.unwrap().unwrap().history.len(), 2);
    assert_eq!(store.load("bob").await.unwrap().unwrap().history[0].content, "Bob's message");

    assert!(store.delete("bob").await.unwrap());
    assert!(!store.delete("bob").await.unwrap());
    assert!(store.load("bob").await.unwrap().is_none());
}

#[tokio::test]
async fn test_server_resumes_thread_from_sqlite() {
    let temp_file = NamedTempFile::new().unwrap();
    let config = TriageConfig::default();
    let gates = || {
        SharedCompletion::new(FixedCompletion::new(json!({
            "reasoning": "airline related",
            "allowed": true
        })))
    };
    let build = |model: Arc<ScriptedHandlerModel>| {
        TurnRunner::new(
            Arc::new(airline::build_registry().unwrap()),
            airline::build_gates(gates()).unwrap(),
            airline::tools::build_tools().unwrap(),
            model,
            &config,
        )
        .unwrap()
    };

    // 1. First process: hand off to Seat and persist.
    let thread_id = {
        let model = Arc::new(ScriptedHandlerModel::new());
        model.push(
            TRIAGE,
            HandlerDecision::reply("Transferring you to seating.").with_handoff(SEAT),
        );
        model.push(SEAT, HandlerDecision::reply("Which seat would you like?"));
        let store = SqliteThreadStore::new(temp_file.path()).await.unwrap();
        let server = TriageServer::new(build(model), Arc::new(store), &config);
        server.turn(None, "I want a different seat").await.unwrap().thread_id
    };

    // 2. Second process: the thread continues with Seat active.
    let model = Arc::new(ScriptedHandlerModel::new());
    model.push(SEAT, HandlerDecision::reply("Done, you're in 2A."));
    let store = SqliteThreadStore::new(temp_file.path()).await.unwrap();
    let server = TriageServer::new(build(model.clone()), Arc::new(store), &config);

    let snap = server.snapshot(&thread_id).await.unwrap();
    assert_eq!(snap.current_handler, SEAT);
    assert_eq!(snap.context["confirmation_number"], json!("IR-D204"));
    assert!(snap.context.get("itinerary").is_none());

    let done = server.turn(Some(&thread_id), "2A please").await.unwrap();
    assert_eq!(done.outcome.assistant_message(), Some("Done, you're in 2A."));
    assert_eq!(model.calls()[0].history_len, 4);
    assert!(done.snapshot.events.len() > done.new_events.len());
}
