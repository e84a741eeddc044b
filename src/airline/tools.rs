//! Airline tools. Each is a [`tool_typed`] function over the shared context.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use super::data::{
    active_itinerary, apply_itinerary_defaults, itinerary_for_flight, random_confirmation,
    Scenario,
};
use crate::context::{ItinerarySegment, SharedContext};
use crate::error::{Result, TriageError};
use crate::tool::{tool_typed, FunctionTool, ToolBox};

pub const FAQ_LOOKUP: &str = "faq_lookup_tool";
pub const GET_TRIP_DETAILS: &str = "get_trip_details";
pub const UPDATE_SEAT: &str = "update_seat";
pub const FLIGHT_STATUS: &str = "flight_status_tool";
pub const BAGGAGE: &str = "baggage_tool";
pub const GET_MATCHING_FLIGHTS: &str = "get_matching_flights";
pub const BOOK_NEW_FLIGHT: &str = "book_new_flight";
pub const ASSIGN_SPECIAL_SERVICE_SEAT: &str = "assign_special_service_seat";
pub const ISSUE_COMPENSATION: &str = "issue_compensation";
pub const DISPLAY_SEAT_MAP: &str = "display_seat_map";
pub const CANCEL_FLIGHT: &str = "cancel_flight";

/// Keyword FAQ answers; `None` when nothing matches.
pub fn faq_answer(question: &str) -> Option<&'static str> {
    let q = question.to_lowercase();
    if q.contains("bag") {
        Some(
            "You are allowed to bring one bag on the plane. \
             It must be under 50 pounds and 22 inches x 14 inches x 9 inches. \
             If a bag is delayed or missing, file a baggage claim and we will track it for delivery.",
        )
    } else if q.contains("compensation") || q.contains("delay") || q.contains("voucher") {
        Some(
            "For lengthy delays we provide duty-of-care: hotel and meal vouchers plus ground transport where needed. \
             If the delay is over 3 hours or causes a missed connection, we also open a compensation case and can offer miles or travel credit. \
             A Refunds & Compensation agent can submit the case and share the voucher details with you.",
        )
    } else if q.contains("seats") || q.contains("plane") {
        Some(
            "There are 120 seats on the plane. \
             There are 22 business class seats and 98 economy seats. \
             Exit rows are rows 4 and 16. \
             Rows 5-8 are Economy Plus, with extra legroom.",
        )
    } else if q.contains("wifi") {
        Some("We have free wifi on the plane, join Airline-Wifi")
    } else {
        None
    }
}

pub const FAQ_UNKNOWN: &str = "I'm sorry, I don't know the answer to that question.";

#[derive(Debug, Deserialize, JsonSchema)]
struct QuestionArgs {
    question: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TripArgs {
    /// The customer's message
    message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SeatArgs {
    confirmation_number: String,
    new_seat: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FlightArgs {
    flight_number: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct BaggageArgs {
    query: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MatchArgs {
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    destination: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct BookArgs {
    #[serde(default)]
    flight_number: Option<String>,
}

fn default_seat_request() -> String {
    "front row for medical needs".into()
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SpecialSeatArgs {
    #[serde(default = "default_seat_request")]
    seat_request: String,
}

fn default_reason() -> String {
    "Delay causing missed connection".into()
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CompensationArgs {
    #[serde(default = "default_reason")]
    reason: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct NoArgs {}

fn text(s: String) -> Result<Value> {
    Ok(json!(s))
}

fn ensure_confirmation(ctx: &mut SharedContext) -> String {
    ctx.confirmation_number
        .get_or_insert_with(random_confirmation)
        .clone()
}

fn faq_lookup() -> FunctionTool {
    tool_typed(FAQ_LOOKUP, "Lookup frequently asked questions.", |a: QuestionArgs, _ctx| {
        text(faq_answer(&a.question).unwrap_or(FAQ_UNKNOWN).to_string())
    })
}

fn get_trip_details() -> FunctionTool {
    tool_typed(
        GET_TRIP_DETAILS,
        "Infer the disrupted Paris->New York->Austin trip from user text and hydrate context.",
        |a: TripArgs, ctx| {
            let lowered = a.message.to_lowercase();
            let scenario = if ["paris", "new york", "austin"]
                .iter()
                .any(|k| lowered.contains(k))
            {
                Scenario::Disrupted
            } else {
                Scenario::OnTime
            };
            apply_itinerary_defaults(ctx, Some(scenario));
            let summary = match ctx.itinerary.as_deref() {
                Some(segments) if !segments.is_empty() => segments
                    .iter()
                    .map(|s| {
                        format!(
                            "{} {} -> {} status: {}",
                            s.flight_number, s.origin, s.destination, s.status
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
                _ => "No segment details available".to_string(),
            };
            let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "None".into());
            text(format!(
                "Hydrated {} itinerary: flight {}, confirmation {}, origin {}, destination {}. {}",
                scenario.key(),
                show(&ctx.flight_number),
                show(&ctx.confirmation_number),
                show(&ctx.origin),
                show(&ctx.destination),
                summary
            ))
        },
    )
}

fn update_seat() -> FunctionTool {
    tool_typed(
        UPDATE_SEAT,
        "Update the seat for a given confirmation number.",
        |a: SeatArgs, ctx| {
            apply_itinerary_defaults(ctx, None);
            ctx.confirmation_number = Some(a.confirmation_number.clone());
            ctx.seat_number = Some(a.new_seat.clone());
            if ctx.flight_number.is_none() {
                return Err(TriageError::ToolExecution {
                    tool: UPDATE_SEAT.into(),
                    message: "flight number is required".into(),
                });
            }
            text(format!(
                "Updated seat to {} for confirmation number {}",
                a.new_seat, a.confirmation_number
            ))
        },
    )
}

fn flight_status() -> FunctionTool {
    tool_typed(FLIGHT_STATUS, "Lookup status for a flight.", |a: FlightArgs, ctx| {
        let flight = a.flight_number;
        ctx.flight_number = Some(flight.clone());
        if let Some((scenario, data)) = itinerary_for_flight(&flight) {
            apply_itinerary_defaults(ctx, Some(scenario));
            if let Some(seg) = data
                .segments
                .iter()
                .find(|s| s.flight_number.eq_ignore_ascii_case(&flight))
            {
                let mut details = vec![
                    format!("Flight {flight} ({} to {})", seg.origin, seg.destination),
                    format!("Status: {}", seg.status),
                ];
                if !seg.gate.is_empty() {
                    details.push(format!("Gate: {}", seg.gate));
                }
                if !seg.departure.is_empty() && !seg.arrival.is_empty() {
                    details.push(format!("Scheduled {} -> {}", seg.departure, seg.arrival));
                }
                if scenario == Scenario::Disrupted && seg.flight_number == "PA441" {
                    details.push(
                        "This delay will cause a missed connection to NY802. Reaccommodation is recommended."
                            .into(),
                    );
                }
                return text(details.join(" | "));
            }
            if let Some(opt) = data
                .rebook_options
                .iter()
                .find(|o| o.flight_number.eq_ignore_ascii_case(&flight))
            {
                return text(format!(
                    "Replacement flight {flight} ({} to {}) is available. \
                     Departure {} arriving {}. Seat {} held.",
                    opt.origin, opt.destination, opt.departure, opt.arrival, opt.seat
                ));
            }
        }
        text(format!(
            "Flight {flight} is on time and scheduled to depart at gate A10."
        ))
    })
}

fn baggage() -> FunctionTool {
    tool_typed(BAGGAGE, "Lookup baggage allowance and fees.", |a: BaggageArgs, _ctx| {
        let q = a.query.to_lowercase();
        let answer = if q.contains("fee") {
            "Overweight bag fee is $75."
        } else if q.contains("allowance") {
            "One carry-on and one checked bag (up to 50 lbs) are included."
        } else if q.contains("missing") || q.contains("lost") {
            "If a bag is missing, file a baggage claim at the airport or with the Baggage Agent so we can track and deliver it."
        } else {
            "Please provide details about your baggage inquiry."
        };
        text(answer.to_string())
    })
}

fn get_matching_flights() -> FunctionTool {
    tool_typed(
        GET_MATCHING_FLIGHTS,
        "Find replacement flights when a segment is delayed or cancelled.",
        |a: MatchArgs, ctx| {
            let (scenario, data) = active_itinerary(ctx);
            apply_itinerary_defaults(ctx, Some(scenario));
            if data.rebook_options.is_empty() {
                return text("All flights are operating on time. No alternate flights are needed.".into());
            }
            let matches = |field: &str, wanted: &Option<String>| {
                wanted
                    .as_deref()
                    .map_or(true, |w| field.to_lowercase().contains(&w.to_lowercase()))
            };
            let filtered: Vec<_> = data
                .rebook_options
                .iter()
                .filter(|o| matches(&o.origin, &a.origin) && matches(&o.destination, &a.destination))
                .collect();
            let options = if filtered.is_empty() {
                data.rebook_options.iter().collect()
            } else {
                filtered
            };
            let mut lines: Vec<String> = options
                .iter()
                .map(|o| {
                    format!(
                        "{} {} -> {} dep {} arr {} | seat {} | {}",
                        o.flight_number, o.origin, o.destination, o.departure, o.arrival, o.seat, o.note
                    )
                })
                .collect();
            if scenario == Scenario::Disrupted {
                lines.push(
                    "These options arrive in Austin the next day. Overnight hotel and meals are covered."
                        .into(),
                );
            }
            ctx.itinerary.get_or_insert(data.segments);
            text(format!("Matching flights:\n{}", lines.join("\n")))
        },
    )
}

fn book_new_flight() -> FunctionTool {
    tool_typed(
        BOOK_NEW_FLIGHT,
        "Book a new or replacement flight and auto-assign a seat.",
        |a: BookArgs, ctx| {
            let (scenario, data) = active_itinerary(ctx);
            apply_itinerary_defaults(ctx, Some(scenario));
            let requested = a.flight_number.as_deref();
            let selection = requested
                .and_then(|f| {
                    data.rebook_options
                        .iter()
                        .find(|o| o.flight_number.eq_ignore_ascii_case(f))
                })
                .or_else(|| data.rebook_options.first())
                .cloned();

            let Some(choice) = selection else {
                let seat = ctx.seat_number.clone().unwrap_or_else(|| "auto-assign".into());
                let confirmation = ensure_confirmation(ctx);
                return text(format!(
                    "Booked flight {} with confirmation {confirmation}. Seat assignment: {seat}.",
                    requested.unwrap_or("TBD")
                ));
            };

            ctx.flight_number = Some(choice.flight_number.clone());
            ctx.seat_number = Some(choice.seat.clone());
            let mut segments = ctx.itinerary.take().unwrap_or(data.segments);
            if scenario == Scenario::Disrupted {
                segments.retain(|s| {
                    !(s.origin.starts_with("New York") && s.destination.starts_with("Austin"))
                });
            }
            segments.push(ItinerarySegment {
                flight_number: choice.flight_number.clone(),
                origin: choice.origin.clone(),
                destination: choice.destination.clone(),
                departure: choice.departure.clone(),
                arrival: choice.arrival.clone(),
                status: "Confirmed replacement flight".into(),
                gate: "TBD".into(),
            });
            ctx.itinerary = Some(segments);
            let confirmation = ensure_confirmation(ctx);
            text(format!(
                "Rebooked to {} from {} to {}. Departure {}, arrival {} (next day arrival in Austin). \
                 Seat assigned: {}. Confirmation {confirmation}.",
                choice.flight_number,
                choice.origin,
                choice.destination,
                choice.departure,
                choice.arrival,
                choice.seat
            ))
        },
    )
}

fn assign_special_service_seat() -> FunctionTool {
    tool_typed(
        ASSIGN_SPECIAL_SERVICE_SEAT,
        "Assign front row or special service seating for medical needs.",
        |a: SpecialSeatArgs, ctx| {
            apply_itinerary_defaults(ctx, None);
            let seat = if a.seat_request.to_lowercase().contains("front") {
                "1A"
            } else {
                "2A"
            };
            ctx.seat_number = Some(seat.into());
            ctx.special_service_note = Some(a.seat_request.clone());
            let confirmation = ensure_confirmation(ctx);
            text(format!(
                "Secured {} seat {seat} on flight {}. Confirmation {confirmation} noted with special service flag.",
                a.seat_request,
                ctx.flight_number.as_deref().unwrap_or("upcoming segment")
            ))
        },
    )
}

fn issue_compensation() -> FunctionTool {
    tool_typed(
        ISSUE_COMPENSATION,
        "Create a compensation case and issue hotel/meal vouchers.",
        |a: CompensationArgs, ctx| {
            let (scenario, data) = active_itinerary(ctx);
            apply_itinerary_defaults(ctx, Some(scenario));
            let case_id = ctx
                .compensation_case_id
                .get_or_insert_with(|| {
                    format!("CMP-{}", rand::Rng::gen_range(&mut rand::thread_rng(), 1000..=9999))
                })
                .clone();
            if !data.vouchers.is_empty() {
                ctx.vouchers = Some(data.vouchers);
            }
            let vouchers = ctx.vouchers.get_or_insert_with(Vec::new);
            let issued = if vouchers.is_empty() {
                "Documented compensation with no vouchers required.".to_string()
            } else {
                vouchers.join("; ")
            };
            text(format!(
                "Opened compensation case {case_id} for: {}. Issued: {issued}. \
                 Keep receipts for any hotel or meal costs and attach them to this case.",
                a.reason
            ))
        },
    )
}

fn display_seat_map() -> FunctionTool {
    tool_typed(
        DISPLAY_SEAT_MAP,
        "Display an interactive seat map to the customer so they can choose a new seat.",
        // The client opens its seat selector on this marker.
        |_: NoArgs, _ctx| text("DISPLAY_SEAT_MAP".into()),
    )
}

fn cancel_flight() -> FunctionTool {
    tool_typed(CANCEL_FLIGHT, "Cancel a flight.", |_: NoArgs, ctx| {
        apply_itinerary_defaults(ctx, None);
        let flight = ctx.flight_number.clone().ok_or_else(|| TriageError::ToolExecution {
            tool: CANCEL_FLIGHT.into(),
            message: "flight number is required".into(),
        })?;
        let confirmation = ensure_confirmation(ctx);
        text(format!(
            "Flight {flight} successfully cancelled for confirmation {confirmation}"
        ))
    })
}

/// Every airline tool.
pub fn build_tools() -> Result<ToolBox> {
    [
        faq_lookup(),
        get_trip_details(),
        update_seat(),
        flight_status(),
        baggage(),
        get_matching_flights(),
        book_new_flight(),
        assign_special_service_seat(),
        issue_compensation(),
        display_seat_map(),
        cancel_flight(),
    ]
    .into_iter()
    .try_fold(ToolBox::new(), |tools, tool| tools.with_tool(tool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::Tool;
    use pretty_assertions::assert_eq;

    async fn call(name: &str, args: Value, ctx: &mut SharedContext) -> String {
        let tools = build_tools().unwrap();
        let out = tools.get(name).unwrap().execute(args, ctx).await.unwrap();
        out.as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn faq_matches_keywords() {
        let mut ctx = SharedContext::default();
        let seats = call(FAQ_LOOKUP, json!({"question": "How many seats on the plane?"}), &mut ctx).await;
        assert!(seats.starts_with("There are 120 seats"));
        let none = call(FAQ_LOOKUP, json!({"question": "Do you serve pizza?"}), &mut ctx).await;
        assert_eq!(none, FAQ_UNKNOWN);
        assert_eq!(ctx, SharedContext::default());
    }

    #[tokio::test]
    async fn trip_details_pick_scenario_from_text() {
        let mut ctx = SharedContext::default();
        let out = call(
            GET_TRIP_DETAILS,
            json!({"message": "My Paris flight is delayed"}),
            &mut ctx,
        )
        .await;
        assert!(out.starts_with("Hydrated disrupted itinerary: flight PA441, confirmation IR-D204"));
        assert_eq!(ctx.scenario.as_deref(), Some("disrupted"));

        let mut other = SharedContext::default();
        call(GET_TRIP_DETAILS, json!({"message": "hello"}), &mut other).await;
        assert_eq!(other.flight_number.as_deref(), Some("FLT-123"));
    }

    #[tokio::test]
    async fn flight_status_variants() {
        let mut ctx = SharedContext::default();
        let delayed = call(FLIGHT_STATUS, json!({"flight_number": "PA441"}), &mut ctx).await;
        assert!(delayed.contains("Status: Delayed 5 hours"));
        assert!(delayed.ends_with("Reaccommodation is recommended."));
        assert_eq!(delayed.split(" | ").count(), 5);

        let replacement = call(FLIGHT_STATUS, json!({"flight_number": "ny950"}), &mut ctx).await;
        assert!(replacement.starts_with("Replacement flight ny950"));

        let unknown = call(FLIGHT_STATUS, json!({"flight_number": "XY1"}), &mut ctx).await;
        assert_eq!(unknown, "Flight XY1 is on time and scheduled to depart at gate A10.");
    }

    #[tokio::test]
    async fn booking_replaces_missed_leg() {
        let mut ctx = SharedContext::default();
        let out = call(BOOK_NEW_FLIGHT, json!({"flight_number": "NY982"}), &mut ctx).await;
        assert!(out.starts_with("Rebooked to NY982"));
        assert_eq!(ctx.flight_number.as_deref(), Some("NY982"));
        assert_eq!(ctx.seat_number.as_deref(), Some("3C"));
        let flights: Vec<_> = ctx
            .itinerary
            .unwrap()
            .into_iter()
            .map(|s| s.flight_number)
            .collect();
        assert_eq!(flights, vec!["PA441", "NY982"]);
    }

    #[tokio::test]
    async fn matching_flights_for_on_time_trip() {
        let mut ctx = SharedContext {
            scenario: Some("on_time".into()),
            ..Default::default()
        };
        let out = call(GET_MATCHING_FLIGHTS, json!({}), &mut ctx).await;
        assert_eq!(out, "All flights are operating on time. No alternate flights are needed.");
    }

    #[tokio::test]
    async fn compensation_opens_case_with_vouchers() {
        let mut ctx = SharedContext::default();
        let out = call(ISSUE_COMPENSATION, Value::Null, &mut ctx).await;
        let case = ctx.compensation_case_id.clone().unwrap();
        assert!(case.starts_with("CMP-") && case.len() == 8);
        assert!(out.contains("Delay causing missed connection"));
        assert_eq!(ctx.vouchers.as_ref().map(Vec::len), Some(3));
        assert!(ctx.public_view().contains_key("vouchers"));
        assert!(!ctx.public_view().contains_key("compensation_case_id"));
    }

    #[tokio::test]
    async fn special_service_seat_and_seat_map() {
        let mut ctx = SharedContext::default();
        call(
            ASSIGN_SPECIAL_SERVICE_SEAT,
            json!({"seat_request": "Front row please"}),
            &mut ctx,
        )
        .await;
        assert_eq!(ctx.seat_number.as_deref(), Some("1A"));
        assert_eq!(ctx.special_service_note.as_deref(), Some("Front row please"));
        assert_eq!(call(DISPLAY_SEAT_MAP, json!({}), &mut ctx).await, "DISPLAY_SEAT_MAP");
    }

    #[tokio::test]
    async fn baggage_and_cancel() {
        let mut ctx = SharedContext::default();
        assert_eq!(
            call(BAGGAGE, json!({"query": "What is the fee?"}), &mut ctx).await,
            "Overweight bag fee is $75."
        );
        let cancelled = call(CANCEL_FLIGHT, json!({}), &mut ctx).await;
        assert_eq!(cancelled, "Flight PA441 successfully cancelled for confirmation IR-D204");
    }
}
