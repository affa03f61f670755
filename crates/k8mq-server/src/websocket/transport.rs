//! [`Transport`] over an upgraded axum WebSocket.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket, close_code};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use k8mq_core::{Message, Transport, TransportError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Server half of one que connection.
///
/// Text and binary frames both surface from `read`. `write` sends UTF-8
/// payloads as text and any other bytes as binary.
pub struct SocketTransport {
    id: String,
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closed: CancellationToken,
}

impl SocketTransport {
    /// Wrap an upgraded socket.
    pub fn new(id: impl Into<String>, socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            id: id.into(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: CancellationToken::new(),
        }
    }
}

/// Map a peer's close frame: normal closures become `Closed`, anything else
/// carries the code so it can be reported.
fn close_error(frame: Option<&CloseFrame>) -> TransportError {
    match frame {
        None => TransportError::Closed,
        Some(f) if f.code == close_code::NORMAL => TransportError::Closed,
        Some(f) => TransportError::Io(format!("close {}: {}", f.code, f.reason)),
    }
}

fn to_frame(message: &Message) -> WsMessage {
    match message.as_str() {
        Some(text) => WsMessage::Text(Utf8Bytes::from(text.to_owned())),
        None => WsMessage::Binary(message.payload().clone()),
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read(&self) -> Result<Message, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            let frame = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(TransportError::Closed),
                frame = stream.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Message::new(Bytes::copy_from_slice(text.as_bytes())));
                }
                Some(Ok(WsMessage::Binary(data))) => return Ok(Message::new(data)),
                Some(Ok(WsMessage::Close(frame))) => return Err(close_error(frame.as_ref())),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn write(&self, message: &Message) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(to_frame(message))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
    }
}
