use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use futures_util::{Stream, StreamExt};

use fil_bus::EventFilter;

use super::state::ApiState;
use super::types::{EventStreamQuery, RecentEventsQuery};

/// GET /api/v1/events/stream -- long-lived SSE feed of bus events.
///
/// Framing: an initial `event: connected` handshake, then one
/// `event: <type>` frame per bus event, with `: keepalive` comment lines
/// between. Client disconnect drops the subscription; the bus prunes it
/// on its next publish.
pub(crate) async fn event_stream(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let filter = EventFilter {
        project_id: query.project_id,
        type_prefix: query.type_prefix,
    };
    let subscription = state.bus.subscribe(filter);
    tracing::debug!(subscriber = %subscription.id, "sse subscriber connected");

    let connected = Event::default()
        .event("connected")
        .data(format!("{{\"subscriber_id\":\"{}\"}}", subscription.id));

    let feed = subscription.receiver.into_stream().map(|bus_event| {
        let data = serde_json::to_string(&bus_event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(bus_event.event_type).data(data))
    });

    let stream = futures_util::stream::once(async move { Ok(connected) }).chain(feed);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(state.config.bridge.sse_keepalive_secs.max(1)))
            .text("keepalive"),
    )
}

/// GET /api/v1/events/recent -- ring-buffered history.
pub(crate) async fn recent_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RecentEventsQuery>,
) -> impl IntoResponse {
    let events = state
        .bus
        .recent(query.n, query.project_id, query.type_prefix.as_deref());
    Json(events)
}

/// GET /api/v1/events/subscribers -- observability.
pub(crate) async fn subscriber_count(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "subscribers": state.bus.subscriber_count() }))
}
