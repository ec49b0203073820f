//! Server-sent event streams for the status and log-update channels.
//!
//! A stream opens with a `retry:` hint, then relays whatever the underlying
//! [`Subscription`] yields (the first item is always the current-state
//! snapshot) interleaved with `ping` events carrying the epoch-ms clock.

use axum::response::sse::{Event, Sse};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use wa_session::{LogPulse, SessionEvent, Subscription};

use crate::config::SseConfig;
use crate::metrics::{RelayMetrics, StreamGuard};

/// Anything that can be written to a push channel.
pub trait PushEvent: Send + 'static {
    fn event_name(&self) -> &'static str;
    fn event_data(&self) -> serde_json::Value;
}

impl PushEvent for SessionEvent {
    fn event_name(&self) -> &'static str {
        self.name()
    }

    fn event_data(&self) -> serde_json::Value {
        self.payload()
    }
}

impl PushEvent for LogPulse {
    fn event_name(&self) -> &'static str {
        self.name()
    }

    fn event_data(&self) -> serde_json::Value {
        self.payload()
    }
}

struct StreamState<E> {
    subscription: Subscription<E>,
    ticker: Interval,
    _guard: StreamGuard,
}

fn ping_event() -> Event {
    Event::default()
        .event("ping")
        .data(chrono::Utc::now().timestamp_millis().to_string())
}

fn to_event<E: PushEvent>(event: &E) -> Event {
    Event::default()
        .event(event.event_name())
        .data(event.event_data().to_string())
}

/// Event stream for one subscription. Ends when the publisher goes away.
pub fn event_stream<E: PushEvent>(
    subscription: Subscription<E>,
    config: &SseConfig,
    metrics: Arc<RelayMetrics>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + use<E> {
    let mut ticker = tokio::time::interval_at(Instant::now() + config.keepalive, config.keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = StreamState {
        subscription,
        ticker,
        _guard: StreamGuard::new(metrics),
    };

    let retry = stream::iter([Ok(Event::default().retry(config.retry))]);
    let events = stream::unfold(state, |mut state| async move {
        let event = tokio::select! {
            next = state.subscription.recv() => match next {
                Some(event) => to_event(&event),
                None => return None,
            },
            _ = state.ticker.tick() => ping_event(),
        };
        Some((Ok(event), state))
    });
    retry.chain(events)
}

/// Wrap a subscription into an SSE response.
pub fn push_response<E: PushEvent>(
    subscription: Subscription<E>,
    config: &SseConfig,
    metrics: Arc<RelayMetrics>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + use<E>> {
    Sse::new(event_stream(subscription, config, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use std::time::Duration;
    use wa_session::Notifier;

    fn fast_config() -> SseConfig {
        SseConfig {
            keepalive: Duration::from_millis(30),
            retry: Duration::from_millis(5000),
        }
    }

    async fn next_chunk(body: &mut axum::body::BodyDataStream) -> String {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_stream_opens_with_retry_then_snapshot() {
        let notifier: Notifier<LogPulse> = Notifier::new();
        let metrics = Arc::new(RelayMetrics::new());
        let sub = notifier.subscribe(LogPulse::Init { last_ts: 42 });

        let response = push_response(sub, &fast_config(), metrics.clone()).into_response();
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );
        let mut body = response.into_body().into_data_stream();

        assert_eq!(next_chunk(&mut body).await, "retry: 5000\n\n");
        let init = next_chunk(&mut body).await;
        assert!(init.starts_with("event: init\n"), "{}", init);
        assert!(init.contains("\"lastTs\":42"));

        notifier.broadcast(LogPulse::New { ts: 43 });
        let new = next_chunk(&mut body).await;
        assert!(new.starts_with("event: new\n"));
        assert!(new.contains("\"ts\":43"));

        assert_eq!(metrics.snapshot().streams.active, 1);
        assert_eq!(notifier.subscriber_count(), 1);
        drop(body);
        assert_eq!(metrics.snapshot().streams.active, 0);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_stream_sends_pings() {
        let notifier: Notifier<LogPulse> = Notifier::new();
        let sub = notifier.subscribe(LogPulse::Init { last_ts: 0 });
        let mut body = push_response(sub, &fast_config(), Arc::new(RelayMetrics::new()))
            .into_response()
            .into_body()
            .into_data_stream();

        next_chunk(&mut body).await;
        next_chunk(&mut body).await;
        let ping = next_chunk(&mut body).await;
        assert!(ping.starts_with("event: ping\ndata: "), "{}", ping);
        let ms: i64 = ping
            .trim_start_matches("event: ping\ndata: ")
            .trim()
            .parse()
            .unwrap();
        assert!(ms > 0);
    }

    #[tokio::test]
    async fn test_stream_ends_with_publisher() {
        let notifier: Notifier<LogPulse> = Notifier::new();
        let sub = notifier.subscribe(LogPulse::Init { last_ts: 0 });
        let config = SseConfig {
            keepalive: Duration::from_secs(60),
            retry: Duration::from_millis(1),
        };
        let stream = event_stream(sub, &config, Arc::new(RelayMetrics::new()));
        drop(notifier);
        // retry hint and the queued snapshot still come through
        assert_eq!(stream.count().await, 2);
    }
}
