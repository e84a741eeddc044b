//! Property tests for the public context view.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use tower_triage::airline::tools::*;
use tower_triage::context::{diff_public, SharedContext, HIDDEN_KEYS};
use tower_triage::tool::Tool;

fn opt_text() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[A-Z0-9-]{1,8}")
}

prop_compose! {
    fn any_context()(
        passenger_name in opt_text(),
        confirmation_number in opt_text(),
        seat_number in opt_text(),
        flight_number in opt_text(),
        baggage_claim_id in opt_text(),
        compensation_case_id in opt_text(),
        scenario in prop::option::of(prop::sample::select(vec!["disrupted", "on_time"])),
        vouchers in prop::option::of(prop::collection::vec("[a-z ]{1,12}", 0..3)),
    ) -> SharedContext {
        SharedContext {
            passenger_name,
            confirmation_number,
            seat_number,
            flight_number,
            baggage_claim_id,
            compensation_case_id,
            scenario: scenario.map(str::to_string),
            vouchers,
            ..Default::default()
        }
    }
}

fn assert_public(view: &Map<String, Value>) -> Result<(), TestCaseError> {
    for key in HIDDEN_KEYS {
        prop_assert!(!view.contains_key(key), "{} leaked", key);
    }
    if let Some(v) = view.get("vouchers") {
        prop_assert!(matches!(v, Value::Array(a) if !a.is_empty()));
    }
    Ok(())
}

/// Tool calls a handler could plausibly make, by index.
fn calls() -> Vec<(&'static str, Value)> {
    vec![
        (GET_TRIP_DETAILS, json!({"message": "Paris to Austin"})),
        (GET_TRIP_DETAILS, json!({"message": "San Francisco"})),
        (UPDATE_SEAT, json!({"confirmation_number": "ABC123", "new_seat": "7F"})),
        (FLIGHT_STATUS, json!({"flight_number": "PA441"})),
        (BAGGAGE, json!({"query": "where is my bag"})),
        (BOOK_NEW_FLIGHT, json!({})),
        (ASSIGN_SPECIAL_SERVICE_SEAT, json!({"seat_request": "front row"})),
        (ISSUE_COMPENSATION, json!({})),
        (CANCEL_FLIGHT, json!({})),
    ]
}

proptest! {
    #[test]
    fn public_view_never_leaks_hidden_fields(ctx in any_context()) {
        assert_public(&ctx.public_view())?;
    }

    #[test]
    fn diff_replays_one_view_into_the_next(a in any_context(), b in any_context()) {
        let (before, after) = (a.public_view(), b.public_view());
        let mut replayed = before.clone();
        for (k, v) in diff_public(&before, &after) {
            replayed.insert(k, v);
        }
        // Keys only `before` had come back as null.
        replayed.retain(|k, v| after.contains_key(k) || !v.is_null());
        prop_assert_eq!(replayed, after);
    }

    #[test]
    fn tool_sequences_keep_the_view_public(picks in prop::collection::vec(0usize..9, 1..6)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let tools = build_tools().unwrap();
        let calls = calls();
        let mut ctx = SharedContext::default();
        for i in picks {
            let (name, args) = &calls[i];
            let tool = tools.get(name).unwrap();
            let before = ctx.public_view();
            rt.block_on(tool.execute(args.clone(), &mut ctx)).unwrap();
            let after = ctx.public_view();
            assert_public(&after)?;
            for key in diff_public(&before, &after).keys() {
                prop_assert!(!HIDDEN_KEYS.contains(&key.as_str()));
            }
        }
    }
}
