//! WebSocket transport over `tokio-tungstenite`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use k8mq_core::{Connector, Message, SharedTransport, Transport, TransportError};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the broker's que endpoint.
pub struct WsConnector {
    url: String,
    dials: AtomicU64,
}

impl WsConnector {
    /// Connector for a full `ws://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dials: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn target(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<SharedTransport, TransportError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let n = self.dials.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Arc::new(WsTransport::new(format!("{}#{n}", self.url), ws)))
    }
}

/// A dialed WebSocket, split so reads and writes lock independently.
pub struct WsTransport {
    id: String,
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: CancellationToken,
}

impl WsTransport {
    fn new(id: String, ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            id,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: CancellationToken::new(),
        }
    }
}

/// Text frame when the payload is UTF-8, binary otherwise.
pub(crate) fn to_frame(message: &Message) -> WsMessage {
    match message.as_str() {
        Some(text) => WsMessage::text(text.to_owned()),
        None => WsMessage::binary(message.payload().clone()),
    }
}

#[async_trait]
impl Transport for WsTransport {
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
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(id = %self.id, ?frame, "broker closed connection");
                    return Err(TransportError::Closed);
                }
                // Pings are answered by tungstenite itself.
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
