//! In-memory transport for driving a session without a network.
//!
//! `MemoryConnector` plays the server side of the engine.io/socket.io
//! handshake according to its `Handshake` mode and hands every accepted link
//! to a `MemoryServer` as a `ServerEnd`.
//!
//! Compiled for tests and behind the `memory-transport` feature.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use super::frame::{OpenInfo, Packet, SocketPacket};
use super::transport::{Connector, Transport};
use crate::error::{ChatError, ChatResult};

/// How the fake server answers new links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Open packet, then ack the namespace connect.
    Accept,
    /// Open packet, then a connect_error with this message.
    Reject(String),
    /// Open packet, then never ack.
    Silent,
    /// Fail the transport open itself.
    Refuse,
}

#[derive(Debug)]
struct ConnectorState {
    handshake: Handshake,
    opened: Vec<String>,
    ping_interval: u64,
    ping_timeout: u64,
}

#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(Mutex::new(ConnectorState {
                handshake: Handshake::Accept,
                opened: Vec::new(),
                ping_interval: 25_000,
                ping_timeout: 20_000,
            })),
            accepted: tx,
        };
        (connector, MemoryServer { accepted: rx })
    }

    pub fn set_handshake(&self, mode: Handshake) {
        self.lock().handshake = mode;
    }

    /// Ping interval/timeout (ms) advertised in the open packet.
    pub fn set_ping(&self, interval: u64, timeout: u64) {
        let mut state = self.lock();
        state.ping_interval = interval;
        state.ping_timeout = timeout;
    }

    /// User ids of every transport opened so far, in order.
    pub fn opened(&self) -> Vec<String> {
        self.lock().opened.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Connector for MemoryConnector {
    fn open(&self, user_id: &str) -> BoxFuture<'static, ChatResult<Box<dyn Transport>>> {
        let user_id = user_id.to_string();
        let (handshake, open) = {
            let mut state = self.lock();
            state.opened.push(user_id.clone());
            let open = OpenInfo {
                sid: format!("sid-{}", state.opened.len()),
                ping_interval: state.ping_interval,
                ping_timeout: state.ping_timeout,
            };
            (state.handshake.clone(), open)
        };
        let accepted = self.accepted.clone();

        Box::pin(async move {
            if handshake == Handshake::Refuse {
                return Err(ChatError::Connection("connection refused".into()));
            }

            let (to_client, inbound) = mpsc::unbounded_channel();
            let (outbound, from_client) = mpsc::unbounded_channel();
            let _ = to_client.send(Packet::Open(open).encode());

            let _ = accepted.send(ServerEnd {
                user_id,
                to_client: Some(to_client.clone()),
                from_client,
            });

            Ok(Box::new(MemoryTransport {
                inbound,
                outbound,
                loopback: to_client,
                handshake,
            }) as Box<dyn Transport>)
        })
    }
}

impl MemoryServer {
    /// Wait up to `timeout` for the next link the client opens.
    pub async fn accept_within(&mut self, timeout: Duration) -> Option<ServerEnd> {
        tokio::time::timeout(timeout, self.accepted.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the next link, up to five seconds.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accept_within(Duration::from_secs(5)).await
    }
}

struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
    loopback: mpsc::UnboundedSender<String>,
    handshake: Handshake,
}

impl Transport for MemoryTransport {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            if text == Packet::Message(SocketPacket::Connect(None)).encode() {
                let reply = match &self.handshake {
                    Handshake::Accept => Some(Packet::Message(SocketPacket::Connect(Some(
                        serde_json::json!({"sid": "mem"}),
                    )))),
                    Handshake::Reject(reason) => Some(Packet::Message(SocketPacket::ConnectError(
                        serde_json::json!({"message": reason}),
                    ))),
                    Handshake::Silent | Handshake::Refuse => None,
                };
                if let Some(reply) = reply {
                    let _ = self.loopback.send(reply.encode());
                }
            }
            self.outbound
                .send(text)
                .map_err(|_| ChatError::Connection("peer gone".into()))
        })
    }

    fn recv_frame(&mut self) -> BoxFuture<'_, ChatResult<Option<String>>> {
        Box::pin(async move { Ok(self.inbound.recv().await) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inbound.close();
        })
    }
}

/// Server side of one in-memory link.
pub struct ServerEnd {
    pub user_id: String,
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn send_raw(&self, frame: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(frame.to_string());
        }
    }

    /// Emit a socket.io event to the client.
    pub fn emit(&self, name: &str, payload: Value) {
        self.send_raw(&Packet::event(name, vec![payload]).encode());
    }

    /// Next event frame the client sent, skipping handshake and pongs.
    pub async fn next_event(&mut self) -> Option<String> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
                .await
                .ok()??;
            if frame.starts_with("42") {
                return Some(frame);
            }
        }
    }

    /// Event frames already sent by the client, without waiting.
    pub fn drain_events(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            if frame.starts_with("42") {
                frames.push(frame);
            }
        }
        frames
    }

    /// Next raw frame from the client, including pongs.
    pub async fn next_raw(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .ok()?
    }

    /// Drop the link from the server side.
    ///
    /// The client's own loopback sender keeps the channel open, so a close
    /// packet is sent to signal the drop.
    pub fn drop_link(&mut self) {
        self.send_raw(&Packet::Close.encode());
        self.to_client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accept_without_connection_is_none() {
        let (_connector, mut server) = MemoryConnector::new();
        assert!(server
            .accept_within(Duration::from_millis(20))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_refused_open_reaches_no_server() {
        let (connector, mut server) = MemoryConnector::new();
        connector.set_handshake(Handshake::Refuse);

        assert!(connector.open("u1").await.is_err());
        assert_eq!(connector.opened(), vec!["u1"]);
        assert!(server
            .accept_within(Duration::from_millis(20))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_open_packet_sent_first() {
        let (connector, mut server) = MemoryConnector::new();
        connector.set_ping(100, 50);

        let mut transport = connector.open("u1").await.unwrap();
        let end = server.accept().await.unwrap();
        assert_eq!(end.user_id, "u1");

        let frame = transport.recv_frame().await.unwrap().unwrap();
        match Packet::decode(&frame).unwrap() {
            Packet::Open(info) => {
                assert_eq!(info.ping_interval, 100);
                assert_eq!(info.ping_timeout, 50);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
