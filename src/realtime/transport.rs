//! WebSocket transport and the connector seam

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{ChatError, ChatResult};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// One open bidirectional text-frame link.
pub trait Transport: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, ChatResult<()>>;

    /// Next text frame, or `None` once the peer closed the link.
    fn recv_frame(&mut self) -> BoxFuture<'_, ChatResult<Option<String>>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens transports for a user. The user id travels as connection metadata.
pub trait Connector: Send + Sync {
    fn open(&self, user_id: &str) -> BoxFuture<'static, ChatResult<Box<dyn Transport>>>;
}

/// Connector for a socket.io server reached over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }
}

/// Build the engine.io WebSocket URL for `user_id`.
pub fn socket_url(server_url: &str, user_id: &str) -> ChatResult<url::Url> {
    let base = server_url
        .trim_end_matches('/')
        .replace("https://", "wss://")
        .replace("http://", "ws://");

    let mut url = url::Url::parse(&format!("{}/socket.io/", base))
        .map_err(|e| ChatError::Connection(format!("invalid server url {}: {}", server_url, e)))?;
    url.query_pairs_mut()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket")
        .append_pair("userId", user_id);
    Ok(url)
}

impl Connector for WsConnector {
    fn open(&self, user_id: &str) -> BoxFuture<'static, ChatResult<Box<dyn Transport>>> {
        let url = socket_url(&self.server_url, user_id);
        Box::pin(async move {
            let url = url?;
            tracing::info!("Connecting WebSocket to {}", url);

            let (stream, response) = connect_async(url.as_str()).await?;
            tracing::info!("WebSocket connected (status={})", response.status());

            Ok(Box::new(WsTransport { stream }) as Box<dyn Transport>)
        })
    }
}

pub struct WsTransport {
    stream: WsStream,
}

impl Transport for WsTransport {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            tracing::debug!("WS send: {}", text);
            self.stream.send(Message::Text(text)).await?;
            Ok(())
        })
    }

    /// Receive the next text frame, answering WebSocket-level pings.
    fn recv_frame(&mut self) -> BoxFuture<'_, ChatResult<Option<String>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("WS recv: {}", text);
                        return Ok(Some(text));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        self.stream.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("WebSocket closed: {:?}", frame);
                        return Ok(None);
                    }
                    Some(Ok(other)) => {
                        tracing::debug!("WS frame (ignored): {:?}", other);
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(None),
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.stream.close(None).await {
                tracing::debug!("WebSocket close failed: {}", e);
            }
        })
    }
}
