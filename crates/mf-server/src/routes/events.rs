//! Server-Sent Events (SSE) handler.
//!
//! Subscribes to the [`mf_core::events::EventBus`], optionally filters by job,
//! replays recent events for late joiners, and sends keepalive heartbeats.

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use mf_core::events::Event as BusEvent;
use mf_core::JobId;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;

use crate::context::AppContext;

/// Optional query parameter for job filtering.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Only stream events for this job.
    pub job_id: Option<JobId>,
}

/// GET /api/events -- SSE stream of job lifecycle events.
pub async fn events_handler(
    State(ctx): State<AppContext>,
    Query(params): Query<EventsQuery>,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>> {
    let job_filter = params.job_id;

    // Replay recent events for late joiners.
    let recent = ctx.event_bus.recent_events(50);
    let mut rx = ctx.event_bus.subscribe();

    let stream = async_stream::stream! {
        for event in recent.into_iter().rev() {
            if let Some(sse) = to_sse(&event, job_filter) {
                yield Ok(sse);
            }
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(sse) = to_sse(&event, job_filter) {
                        yield Ok(sse);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("SSE client lagged by {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_sse(event: &BusEvent, job_filter: Option<JobId>) -> Option<Event> {
    if job_filter.is_some_and(|id| id != event.payload.job_id()) {
        return None;
    }
    let data = serde_json::to_string(event).ok()?;
    Some(Event::default().id(event.id.to_string()).data(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::events::EventPayload;

    #[test]
    fn filter_by_job() {
        let job_id = JobId::new();
        let event = BusEvent::new(EventPayload::JobQueued { job_id });
        assert!(to_sse(&event, None).is_some());
        assert!(to_sse(&event, Some(job_id)).is_some());
        assert!(to_sse(&event, Some(JobId::new())).is_none());
    }
}
