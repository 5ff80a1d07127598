//! `GET /models/stream`: emits an initial snapshot, then forwards the
//! progress bus verbatim as `data: <json>\n\n`, with a
//! `: keep-alive\n\n` comment every 15 seconds of idleness.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};

use super::{AppState, KEEP_ALIVE_INTERVAL};
use crate::registry::bus::BusEvent;
use crate::registry::ModelRegistry;

/// Wraps a subscription's receiver so that, however the stream ends —
/// the client disconnects and axum drops the response body, or the
/// bus itself closes the channel — the subscription is removed from
/// the bus's fan-out list exactly once.
struct ProgressEventStream {
    subscription: Option<crate::registry::bus::Subscription>,
    registry: ModelRegistry,
}

impl Stream for ProgressEventStream {
    type Item = Result<Event, std::convert::Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(subscription) = self.subscription.as_mut() else {
            return Poll::Ready(None);
        };
        match subscription.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event_to_sse(&event)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ProgressEventStream {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            let registry = self.registry.clone();
            tokio::spawn(async move {
                registry.unsubscribe_progress(subscription.id).await;
            });
        }
    }
}

fn event_to_sse(event: &BusEvent) -> Event {
    Event::default().data(event.to_json().to_string())
}

pub async fn stream_models(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let models = state.registry.list_models().await;
    let progress = state.registry.progress_snapshot().await;
    let snapshot = serde_json::json!({
        "type": "snapshot",
        "models": models,
        "progress": progress,
    });
    let snapshot_event: Result<Event, std::convert::Infallible> = Ok(Event::default().data(snapshot.to_string()));

    let subscription = state.registry.subscribe_progress().await;
    let bus_stream = ProgressEventStream {
        subscription: Some(subscription),
        registry: state.registry.clone(),
    };

    let stream = futures_util::stream::once(async move { snapshot_event }).chain(bus_stream);

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("keep-alive"))
}
