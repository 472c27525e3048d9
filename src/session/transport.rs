//! Push transport seam for `ClientSession`, with a tungstenite implementation.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::events::model::{ClientMessage, PushEvent};

/// Opens push connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushConnection>, TransportError>;
}

/// One open push connection.
#[async_trait]
pub trait PushConnection: Send {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError>;

    /// Next pushed event; `None` once the connection is closed.
    async fn next_event(&mut self) -> Option<PushEvent>;
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn PushConnection>, TransportError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, "Push connection open");
        Ok(Box::new(WsConnection { ws }))
    }
}

struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(message)?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::TransportUnavailable)
    }

    async fn next_event(&mut self) -> Option<PushEvent> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<PushEvent>(&text) {
                    Ok(event) => return Some(event),
                    Err(e) => debug!(error = %e, "Unrecognized push message"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Push connection error");
                    return None;
                }
            }
        }
    }
}
