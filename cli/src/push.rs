use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::api::Client;
use crate::error::ApiError;
use crate::types::PushEvent;

pub type PushStream = BoxStream<'static, Result<PushEvent, ApiError>>;

/// Source of server-pushed task events. A subscription ends when the
/// connection drops; the caller decides whether to reconnect.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn subscribe(&self, task_id: &str) -> Result<PushStream, ApiError>;
}

/// Push events over the service websocket.
#[derive(Debug, Clone)]
pub struct WsPushTransport {
    url: Url,
}

impl WsPushTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn for_client(client: &Client) -> Result<Self, ApiError> {
        Ok(Self::new(client.ws_url()?))
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    async fn subscribe(&self, task_id: &str) -> Result<PushStream, ApiError> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| ApiError::Push(format!("connect {}: {err}", self.url)))?;
        let hello = json!({ "type": "subscribe", "task_id": task_id }).to_string();
        ws.send(Message::Text(hello))
            .await
            .map_err(|err| ApiError::Push(format!("subscribe failed: {err}")))?;
        debug!("subscribed to push events for {task_id}");

        let task_id = task_id.to_string();
        let events = ws.filter_map(move |frame| {
            let decoded = decode_frame(&task_id, frame);
            async move { decoded }
        });
        Ok(events.boxed())
    }
}

/// Frames for other tasks and frames that are not task events are skipped.
fn decode_frame(
    task_id: &str,
    frame: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<PushEvent, ApiError>> {
    match frame {
        Ok(Message::Text(text)) => match serde_json::from_str::<PushEvent>(&text) {
            Ok(event) if event.task_id() == task_id => Some(Ok(event)),
            Ok(_) => None,
            Err(err) => {
                debug!("ignoring push frame: {err}");
                None
            }
        },
        Ok(_) => None,
        Err(err) => Some(Err(ApiError::Push(err.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_frames_for_other_tasks() {
        let frame = Ok(Message::Text(
            json!({"type": "progress", "task_id": "other", "progress": 0.2}).to_string(),
        ));
        assert!(decode_frame("mine", frame).is_none());
    }

    #[test]
    fn decodes_matching_completion() {
        let frame = Ok(Message::Text(
            json!({"type": "completed", "task_id": "mine", "result": null}).to_string(),
        ));
        match decode_frame("mine", frame) {
            Some(Ok(PushEvent::Completed { task_id, result })) => {
                assert_eq!(task_id, "mine");
                assert!(result.is_none());
            }
            other => panic!("unexpected frame decode {other:?}"),
        }
    }

    #[tokio::test]
    async fn secure_urls_reach_the_tls_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let url = Url::parse(&format!("wss://127.0.0.1:{port}/api/ws")).unwrap();
        let attempt = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            WsPushTransport::new(url).subscribe("t1"),
        )
        .await
        .unwrap();
        match attempt {
            Err(ApiError::Push(message)) => {
                assert!(!message.contains("TLS support not compiled in"), "{message}");
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("handshake against a plain TCP socket should fail"),
        }
    }

    #[test]
    fn skips_unknown_message_types() {
        let frame = Ok(Message::Text(json!({"type": "hello"}).to_string()));
        assert!(decode_frame("mine", frame).is_none());
        assert!(decode_frame("mine", Ok(Message::Ping(Vec::new()))).is_none());
    }
}
