//! Demo itineraries used by the airline tools and hydration callbacks.

use rand::Rng;

use crate::context::{ItinerarySegment, SharedContext};

const CONFIRMATION_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Paris → New York → Austin with a weather delay and a missed connection
    Disrupted,
    OnTime,
}

impl Scenario {
    pub fn key(self) -> &'static str {
        match self {
            Scenario::Disrupted => "disrupted",
            Scenario::OnTime => "on_time",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "disrupted" => Some(Scenario::Disrupted),
            "on_time" => Some(Scenario::OnTime),
            _ => None,
        }
    }
}

/// A flight offered when a segment is disrupted.
#[derive(Debug, Clone, PartialEq)]
pub struct RebookOption {
    pub flight_number: String,
    pub origin: String,
    pub destination: String,
    pub departure: String,
    pub arrival: String,
    pub seat: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Itinerary {
    pub passenger_name: String,
    pub confirmation_number: String,
    pub seat_number: String,
    pub baggage_tag: String,
    pub segments: Vec<ItinerarySegment>,
    pub rebook_options: Vec<RebookOption>,
    /// Hotel, meal and ground transport support, in that order
    pub vouchers: Vec<String>,
}

fn segment(
    flight_number: &str,
    origin: &str,
    destination: &str,
    departure: &str,
    arrival: &str,
    status: &str,
    gate: &str,
) -> ItinerarySegment {
    ItinerarySegment {
        flight_number: flight_number.into(),
        origin: origin.into(),
        destination: destination.into(),
        departure: departure.into(),
        arrival: arrival.into(),
        status: status.into(),
        gate: gate.into(),
    }
}

fn rebook(
    flight_number: &str,
    departure: &str,
    arrival: &str,
    seat: &str,
    note: &str,
) -> RebookOption {
    RebookOption {
        flight_number: flight_number.into(),
        origin: "New York (JFK)".into(),
        destination: "Austin (AUS)".into(),
        departure: departure.into(),
        arrival: arrival.into(),
        seat: seat.into(),
        note: note.into(),
    }
}

pub fn itinerary(scenario: Scenario) -> Itinerary {
    match scenario {
        Scenario::Disrupted => Itinerary {
            passenger_name: "Morgan Lee".into(),
            confirmation_number: "IR-D204".into(),
            seat_number: "14C".into(),
            baggage_tag: "BG20488".into(),
            segments: vec![
                segment(
                    "PA441",
                    "Paris (CDG)",
                    "New York (JFK)",
                    "2024-12-09 14:10",
                    "2024-12-09 17:40",
                    "Delayed 5 hours due to weather, expected departure 19:55",
                    "B18",
                ),
                segment(
                    "NY802",
                    "New York (JFK)",
                    "Austin (AUS)",
                    "2024-12-09 19:10",
                    "2024-12-09 22:35",
                    "Connection missed because of first leg delay",
                    "C7",
                ),
            ],
            rebook_options: vec![
                rebook(
                    "NY950",
                    "2024-12-10 09:45",
                    "2024-12-10 12:30",
                    "2A (front row)",
                    "Partner flight secured with auto-reaccommodation for disrupted travelers",
                ),
                rebook(
                    "NY982",
                    "2024-12-10 13:20",
                    "2024-12-10 16:05",
                    "3C",
                    "Backup option if the morning flight is full",
                ),
            ],
            vouchers: vec![
                "Overnight hotel covered up to $180 near JFK Terminal 5 partner hotel".into(),
                "$60 meal credit for the delay".into(),
                "$40 ground transport credit to the hotel".into(),
            ],
        },
        Scenario::OnTime => Itinerary {
            passenger_name: "Taylor Lee".into(),
            confirmation_number: "LL0EZ6".into(),
            seat_number: "23A".into(),
            baggage_tag: "BG55678".into(),
            segments: vec![segment(
                "FLT-123",
                "San Francisco (SFO)",
                "Los Angeles (LAX)",
                "2024-12-09 16:10",
                "2024-12-09 17:35",
                "On time and operating as scheduled",
                "A10",
            )],
            rebook_options: vec![],
            vouchers: vec![],
        },
    }
}

/// Fill unset booking fields from the scenario's itinerary.
///
/// The scenario is `scenario`, else the one already on the context, else
/// disrupted. Fields already set are kept.
pub fn apply_itinerary_defaults(ctx: &mut SharedContext, scenario: Option<Scenario>) {
    let target = scenario
        .or_else(|| ctx.scenario.as_deref().and_then(Scenario::from_key))
        .unwrap_or(Scenario::Disrupted);
    let data = itinerary(target);
    ctx.scenario = Some(target.key().to_string());
    ctx.passenger_name.get_or_insert(data.passenger_name);
    ctx.confirmation_number.get_or_insert(data.confirmation_number);
    ctx.seat_number.get_or_insert(data.seat_number);
    if let (Some(first), Some(last)) = (data.segments.first(), data.segments.last()) {
        ctx.flight_number.get_or_insert_with(|| first.flight_number.clone());
        ctx.origin.get_or_insert_with(|| first.origin.clone());
        ctx.destination.get_or_insert_with(|| last.destination.clone());
    }
    ctx.itinerary.get_or_insert(data.segments);
}

/// Scenario whose segments or rebook options include `flight_number`.
pub fn itinerary_for_flight(flight_number: &str) -> Option<(Scenario, Itinerary)> {
    if flight_number.is_empty() {
        return None;
    }
    [Scenario::Disrupted, Scenario::OnTime]
        .into_iter()
        .map(|s| (s, itinerary(s)))
        .find(|(_, it)| {
            it.segments
                .iter()
                .any(|seg| seg.flight_number.eq_ignore_ascii_case(flight_number))
                || it
                    .rebook_options
                    .iter()
                    .any(|opt| opt.flight_number.eq_ignore_ascii_case(flight_number))
        })
}

/// Itinerary the context refers to, recording the scenario when it was unset.
pub fn active_itinerary(ctx: &mut SharedContext) -> (Scenario, Itinerary) {
    if let Some(s) = ctx.scenario.as_deref().and_then(Scenario::from_key) {
        return (s, itinerary(s));
    }
    let found = ctx.flight_number.as_deref().and_then(itinerary_for_flight);
    let (scenario, data) = found.unwrap_or_else(|| (Scenario::Disrupted, itinerary(Scenario::Disrupted)));
    ctx.scenario = Some(scenario.key().to_string());
    (scenario, data)
}

/// Six uppercase letters or digits.
pub fn random_confirmation() -> String {
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| CONFIRMATION_ALPHABET[rng.gen_range(0..CONFIRMATION_ALPHABET.len())] as char)
        .collect()
}

/// `FLT-` followed by three digits.
pub fn random_flight_number() -> String {
    format!("FLT-{}", rand::thread_rng().gen_range(100..=999))
}
