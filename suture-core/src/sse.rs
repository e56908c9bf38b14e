//! Server-sent events body over a fabric subscription.
//!
//! Frame order: the `connected` sentinel, the replay snapshot, then live
//! thoughts as they are emitted. A `: keepalive` comment is written after
//! every quiet period.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use hyper::body::{Body, Frame};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::warn;

use crate::events::{Subscription, Thought};

pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

const CONNECTED_FRAME: &str =
    "data: {\"type\":\"connected\",\"message\":\"Agent stream connected\"}\n\n";
const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

/// Encode one thought as an SSE `data:` frame.
pub fn encode_thought(thought: &Thought) -> Bytes {
    match serde_json::to_string(thought) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(e) => {
            warn!(id = %thought.id, error = %e, "Failed to encode thought");
            Bytes::from_static(KEEPALIVE_FRAME.as_bytes())
        }
    }
}

/// Streaming response body for `GET /v1/stream`.
pub struct ThoughtStream {
    subscription: Subscription,
    queued: VecDeque<Bytes>,
    keepalive: Interval,
}

impl ThoughtStream {
    pub fn new(subscription: Subscription) -> Self {
        Self::with_keepalive(subscription, KEEPALIVE_PERIOD)
    }

    pub fn with_keepalive(mut subscription: Subscription, period: Duration) -> Self {
        let mut queued = VecDeque::new();
        queued.push_back(Bytes::from_static(CONNECTED_FRAME.as_bytes()));
        queued.extend(subscription.take_replay().iter().map(|t| encode_thought(t)));

        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            subscription,
            queued,
            keepalive,
        }
    }
}

impl Body for ThoughtStream {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(frame) = this.queued.pop_front() {
            return Poll::Ready(Some(Ok(Frame::data(frame))));
        }

        match this.subscription.receiver_mut().poll_recv(cx) {
            Poll::Ready(Some(thought)) => {
                this.keepalive.reset();
                Poll::Ready(Some(Ok(Frame::data(encode_thought(&thought)))))
            }
            // fabric dropped us; the client reconnects
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match this.keepalive.poll_tick(cx) {
                Poll::Ready(_) => Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(
                    KEEPALIVE_FRAME.as_bytes(),
                ))))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFabric, FabricConfig, ThoughtType};
    use http_body_util::BodyExt;
    use std::sync::Arc;

    async fn next_text(stream: &mut ThoughtStream) -> String {
        let frame = stream.frame().await.unwrap().unwrap();
        String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_connected_then_replay_then_live() {
        let fabric = Arc::new(EventFabric::new(FabricConfig::default()));
        fabric.emit(Thought::new(ThoughtType::Info, "before"));

        let mut stream = ThoughtStream::new(fabric.subscribe());
        assert!(next_text(&mut stream).await.contains("\"connected\""));
        assert!(next_text(&mut stream).await.contains("before"));

        fabric.emit(Thought::new(ThoughtType::Alert, "live"));
        let live = next_text(&mut stream).await;
        assert!(live.starts_with("data: "));
        assert!(live.contains("\"type\":\"alert\""));
        assert!(live.ends_with("\n\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_when_idle() {
        let fabric = Arc::new(EventFabric::new(FabricConfig::default()));
        let mut stream = ThoughtStream::with_keepalive(fabric.subscribe(), Duration::from_secs(1));
        next_text(&mut stream).await;
        assert_eq!(next_text(&mut stream).await, ": keepalive\n\n");
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let fabric = Arc::new(EventFabric::new(FabricConfig::default()));
        let stream = ThoughtStream::new(fabric.subscribe());
        assert_eq!(fabric.subscriber_count(), 1);
        drop(stream);
        assert_eq!(fabric.subscriber_count(), 0);
    }
}
