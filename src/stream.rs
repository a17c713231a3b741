use std::{convert::Infallible, sync::Arc};

use axum::response::{
    Sse,
    sse::{Event, KeepAlive},
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::{io::AsyncReadExt, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::session::SessionManager;

/// One ordered channel per run carries these. Stdout and stderr are merged
/// onto the same channel in production order; `End` is sent exactly once,
/// after both pipes have drained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Output(String),
    Error(String),
    End,
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Output(_) => "output",
            Self::Error(_) => "error",
            Self::End => "end",
        }
    }
}

/// Tears the run down when the consumer goes away. Held by the SSE stream;
/// dropping the response body (client disconnect or normal close) stops the
/// generation it belongs to. Teardown is idempotent, so the normal-close
/// case is absorbed by the same path.
pub struct StopGuard {
    manager: Arc<SessionManager>,
    session_id: String,
    generation: Uuid,
}

impl StopGuard {
    pub fn new(manager: Arc<SessionManager>, session_id: String, generation: Uuid) -> Self {
        Self {
            manager,
            session_id,
            generation,
        }
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let generation = self.generation;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                manager.stop_generation(&session_id, generation).await;
            });
        }
    }
}

pub fn sse_response(
    events: mpsc::Receiver<StreamEvent>,
    guard: StopGuard,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = ReceiverStream::new(events).map(move |event| {
        let _held_until_stream_drops = &guard;
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<Event, Infallible>(Event::default().event(event.name()).data(payload))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Forwards chunks from one process pipe onto the event channel until EOF.
/// After `limit` bytes a single notice is sent and the rest is drained
/// without forwarding, so a runaway program still reaches EOF and exits.
pub async fn pump_reader<R>(
    mut reader: R,
    events: mpsc::Sender<StreamEvent>,
    make: fn(String) -> StreamEvent,
    limit: usize,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut sent = 0usize;
    let mut truncated = false;
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if truncated {
                    continue;
                }
                let take = n.min(limit - sent);
                sent += take;
                let text = String::from_utf8_lossy(&chunk[..take]).into_owned();
                if events.send(make(text)).await.is_err() {
                    break;
                }
                if sent >= limit {
                    truncated = true;
                    let _ = events
                        .send(StreamEvent::Error(
                            "output limit exceeded; further output dropped\n".to_string(),
                        ))
                        .await;
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag_and_payload() {
        let json = serde_json::to_string(&StreamEvent::Output("hi\n".to_string())).unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hi\n"}"#);
        let json = serde_json::to_string(&StreamEvent::End).unwrap();
        assert_eq!(json, r#"{"type":"end"}"#);
    }

    #[tokio::test]
    async fn pump_preserves_chunk_order() {
        let (tx, mut rx) = mpsc::channel(8);
        pump_reader(&b"AB"[..], tx, StreamEvent::Output, 1024).await;
        assert_eq!(rx.recv().await, Some(StreamEvent::Output("AB".to_string())));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn pump_truncates_at_output_limit() {
        let (tx, mut rx) = mpsc::channel(8);
        pump_reader(&b"abcdef"[..], tx, StreamEvent::Output, 4).await;
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Output("abcd".to_string()))
        );
        match rx.recv().await {
            Some(StreamEvent::Error(notice)) => assert!(notice.contains("output limit")),
            other => panic!("expected truncation notice, got {other:?}"),
        }
        assert_eq!(rx.recv().await, None);
    }
}
