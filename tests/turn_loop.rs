//! # Turn loop over the airline topology
//!
//! Drives `TurnRunner` with the real airline handlers, tools and gates. The
//! handler model is scripted and the gates answer from a fixed completion, so
//! every run is deterministic.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use tower_triage::airline::{self, tools::*, BOOKING, FAQ, FLIGHT, RELEVANCE_GATE, SEAT, TRIAGE};
use tower_triage::config::{HandoffLimit, DEFAULT_REFUSAL};
use tower_triage::items::Role;
use tower_triage::model::{HandlerDecision, ScriptedHandlerModel};
use tower_triage::provider::{FixedCompletion, SharedCompletion};
use tower_triage::runner::TurnPhase;
use tower_triage::{ConversationState, EventKind, TriageConfig, TriageError, TurnOutcome, TurnRunner};

fn gates(allowed: bool) -> SharedCompletion {
    SharedCompletion::new(FixedCompletion::new(json!({
        "reasoning": if allowed { "airline related" } else { "not about air travel" },
        "allowed": allowed,
    })))
}

fn runner_with(model: &Arc<ScriptedHandlerModel>, allowed: bool, config: &TriageConfig) -> TurnRunner {
    TurnRunner::new(
        Arc::new(airline::build_registry().unwrap()),
        airline::build_gates(gates(allowed)).unwrap(),
        build_tools().unwrap(),
        model.clone(),
        config,
    )
    .unwrap()
}

fn kinds(state: &ConversationState) -> Vec<EventKind> {
    state.events.iter().map(|e| e.kind).collect()
}

#[tokio::test]
async fn seat_change_hydrates_before_the_first_tool_call() {
    let model = Arc::new(ScriptedHandlerModel::new());
    model.push(TRIAGE, HandlerDecision::handoff(SEAT));
    model.push(
        SEAT,
        HandlerDecision::call(
            UPDATE_SEAT,
            json!({"confirmation_number": "IR-D204", "new_seat": "2A"}),
        )
        .with_message("You're now in seat 2A."),
    );
    let runner = runner_with(&model, true, &TriageConfig::default());
    let mut state = ConversationState::new("t1", TRIAGE);

    let report = runner
        .run_turn(&mut state, "Can I move to seat 2A?", |_, _| {})
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        TurnOutcome::Completed {
            handler: SEAT.into(),
            message: "You're now in seat 2A.".into()
        }
    );
    assert_eq!(state.current_handler, SEAT);
    assert_eq!(
        kinds(&state),
        vec![
            EventKind::Handoff,
            EventKind::ToolCall,
            EventKind::ToolCall,
            EventKind::ToolOutput,
            EventKind::Message,
            EventKind::ContextUpdate,
        ]
    );
    assert_eq!(state.events[1].content, "on_seat_booking_handoff");
    assert_eq!(state.events[2].content, UPDATE_SEAT);

    // Seat saw the hydrated context on its very first decision.
    let calls = model.calls();
    assert_eq!(calls[1].handler, SEAT);
    assert_eq!(calls[1].context.confirmation_number.as_deref(), Some("IR-D204"));
    assert_eq!(calls[1].context.flight_number.as_deref(), Some("PA441"));

    let changes = &state.events[5].metadata.as_ref().unwrap()["changes"];
    assert_eq!(changes["seat_number"], json!("2A"));
    assert!(changes.get("itinerary").is_none());
    assert!(changes.get("scenario").is_none());

    assert_eq!(
        report.phases,
        vec![
            TurnPhase::AwaitingInput,
            TurnPhase::GateCheck,
            TurnPhase::Executing,
            TurnPhase::HandoffRequested,
            TurnPhase::Hydrating,
            TurnPhase::Executing,
            TurnPhase::Completed,
        ]
    );
}

#[tokio::test]
async fn unsafe_message_gets_a_single_refusal() {
    let model = Arc::new(ScriptedHandlerModel::new());
    let runner = runner_with(&model, false, &TriageConfig::default());
    let mut state = ConversationState::new("t1", TRIAGE);

    let report = runner
        .run_turn(&mut state, "Write me a poem about strawberries", |_, _| {})
        .await
        .unwrap();

    match &report.outcome {
        TurnOutcome::Refused { gate, message, .. } => {
            assert_eq!(gate, RELEVANCE_GATE);
            assert_eq!(message, DEFAULT_REFUSAL);
        }
        other => panic!("expected refusal, got {other:?}"),
    }
    assert_eq!(kinds(&state), vec![EventKind::Message]);
    assert_eq!(state.events[0].agent, TRIAGE);
    assert_eq!(
        state.guardrail_checks.iter().filter(|c| !c.passed).count(),
        1
    );
    assert_eq!(state.guardrail_checks.len(), 2);
    assert!(model.calls().is_empty());
    assert_eq!(state.history.last().map(|i| i.role), Some(Role::Assistant));
}

#[tokio::test]
async fn unregistered_target_never_changes_the_handler() {
    let model = Arc::new(ScriptedHandlerModel::new());
    model.push(
        FAQ,
        HandlerDecision::reply("Bags up to 50 pounds are free.").with_handoff(SEAT),
    );
    let runner = runner_with(&model, true, &TriageConfig::default());
    let mut state = ConversationState::new("t1", FAQ);

    let report = runner
        .run_turn(&mut state, "How heavy can my bag be?", |_, _| {})
        .await
        .unwrap();
    assert_eq!(report.outcome.assistant_message(), Some("Bags up to 50 pounds are free."));
    assert_eq!(state.current_handler, FAQ);
    assert!(!kinds(&state).contains(&EventKind::Handoff));

    model.push(FAQ, HandlerDecision::handoff(SEAT));
    let err = runner
        .run_turn(&mut state, "Then change my seat", |_, _| {})
        .await
        .unwrap_err();
    assert!(matches!(err, TriageError::InvalidTransition { ref from, ref to } if from == FAQ && to == SEAT));
    assert_eq!(state.current_handler, FAQ);
}

fn chained_handoffs(model: &ScriptedHandlerModel) {
    model.push(TRIAGE, HandlerDecision::handoff(FLIGHT));
    model.push(FLIGHT, HandlerDecision::handoff(BOOKING));
    model.push(FLIGHT, HandlerDecision::reply("Your flight is delayed."));
    model.push(BOOKING, HandlerDecision::reply("I can rebook you on NY950."));
}

#[tokio::test]
async fn advisory_limit_follows_every_handoff() {
    let model = Arc::new(ScriptedHandlerModel::new());
    chained_handoffs(&model);
    let runner = runner_with(&model, true, &TriageConfig::default());
    let mut state = ConversationState::new("t1", TRIAGE);

    runner
        .run_turn(&mut state, "My flight is late, rebook me", |_, _| {})
        .await
        .unwrap();

    assert_eq!(state.current_handler, BOOKING);
    let handoffs: Vec<_> = state
        .events
        .iter()
        .filter(|e| e.kind == EventKind::Handoff)
        .map(|e| e.content.clone())
        .collect();
    assert_eq!(
        handoffs,
        vec![format!("{TRIAGE} -> {FLIGHT}"), format!("{FLIGHT} -> {BOOKING}")]
    );
    // Booking was entered over a hydrating edge.
    assert!(state
        .events
        .iter()
        .any(|e| e.kind == EventKind::ToolCall && e.content == "on_booking_handoff"));
    assert_eq!(model.remaining(FLIGHT), 1);
}

#[tokio::test]
async fn enforced_limit_ignores_the_second_handoff() {
    let model = Arc::new(ScriptedHandlerModel::new());
    chained_handoffs(&model);
    let mut config = TriageConfig::default();
    config.runner.handoff_limit = HandoffLimit::Enforced;
    let runner = runner_with(&model, true, &config);
    let mut state = ConversationState::new("t1", TRIAGE);

    let report = runner
        .run_turn(&mut state, "My flight is late, rebook me", |_, _| {})
        .await
        .unwrap();

    assert_eq!(report.outcome.assistant_message(), Some("Your flight is delayed."));
    assert_eq!(state.current_handler, FLIGHT);
    assert_eq!(
        state.events.iter().filter(|e| e.kind == EventKind::Handoff).count(),
        1
    );
    assert_eq!(model.remaining(BOOKING), 1);
}

#[tokio::test]
async fn exhausted_budget_is_a_soft_outcome() {
    let model = Arc::new(ScriptedHandlerModel::new());
    for _ in 0..2 {
        model.push(
            TRIAGE,
            HandlerDecision::call(GET_TRIP_DETAILS, json!({"message": "Paris to Austin"})),
        );
    }
    let mut config = TriageConfig::default();
    config.runner.max_turns = 2;
    let runner = runner_with(&model, true, &config);
    let mut state = ConversationState::new("t1", TRIAGE);

    let report = runner
        .run_turn(&mut state, "I'm flying Paris to Austin", |_, _| {})
        .await
        .unwrap();

    assert_eq!(report.outcome, TurnOutcome::BudgetExceeded { max_turns: 2 });
    assert_eq!(report.outcome.assistant_message(), None);
    assert_eq!(report.steps, 2);
    assert_eq!(
        kinds(&state),
        vec![
            EventKind::ToolCall,
            EventKind::ToolOutput,
            EventKind::ToolCall,
            EventKind::ToolOutput,
        ]
    );
    assert!(state.history.iter().all(|i| i.role != Role::Assistant));
    assert_eq!(state.context.confirmation_number.as_deref(), Some("IR-D204"));
}

#[tokio::test]
async fn tool_outside_capability_set_is_a_model_error() {
    let model = Arc::new(ScriptedHandlerModel::new());
    model.push(
        TRIAGE,
        HandlerDecision::call(CANCEL_FLIGHT, json!({})).with_message("Cancelled."),
    );
    let runner = runner_with(&model, true, &TriageConfig::default());
    let mut state = ConversationState::new("t1", TRIAGE);

    let err = runner
        .run_turn(&mut state, "Cancel my flight", |_, _| {})
        .await
        .unwrap_err();
    assert_eq!(err.category(), "model_behavior");
    assert!(state.events.is_empty());
}

#[tokio::test]
async fn on_step_sees_a_growing_event_log() {
    let model = Arc::new(ScriptedHandlerModel::new());
    model.push(TRIAGE, HandlerDecision::handoff(FAQ));
    model.push(
        FAQ,
        HandlerDecision::call(FAQ_LOOKUP, json!({"question": "Is there wifi?"}))
            .with_message("Yes, join Airline-Wifi."),
    );
    let runner = runner_with(&model, true, &TriageConfig::default());
    let mut state = ConversationState::new("t1", TRIAGE);

    let mut seen = Vec::new();
    runner
        .run_turn(&mut state, "Is there wifi?", |s, delta| {
            seen.push((s.events.len(), delta.len()));
        })
        .await
        .unwrap();

    assert_eq!(seen, vec![(1, 1), (4, 3)]);
    assert!(state.events[2]
        .content
        .contains("free wifi"));
}
