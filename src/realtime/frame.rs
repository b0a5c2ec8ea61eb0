//! engine.io v4 / socket.io v4 text frame codec
//!
//! Only the default namespace and text payloads are supported. Frame layout:
//!
//! ```text
//! 0{"sid":..,"pingInterval":..,"pingTimeout":..}   engine open
//! 2 / 3                                            engine ping / pong
//! 4<socket packet>                                 engine message
//!   40 / 40{"sid":..}                              namespace connect
//!   42["event",arg..] / 42<ack>["event",arg..]     event
//!   43<ack>[arg..]                                 ack
//!   44{"message":..}                               connect_error
//! ```

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ChatError, ChatResult};

/// Parameters from the engine.io open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    /// Milliseconds between server pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

/// engine.io packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Noop,
}

/// socket.io packet carried in an engine.io message.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        name: String,
        args: Vec<Value>,
        ack: Option<u64>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

impl Packet {
    /// Decode a single text frame.
    pub fn decode(frame: &str) -> ChatResult<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ChatError::Protocol("empty frame".into()))?;
        let rest = chars.as_str();

        match kind {
            '0' => {
                let info: OpenInfo = serde_json::from_str(rest)
                    .map_err(|e| ChatError::Protocol(format!("bad open packet: {}", e)))?;
                Ok(Packet::Open(info))
            }
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => Ok(Packet::Message(SocketPacket::decode(rest)?)),
            '6' => Ok(Packet::Noop),
            other => Err(ChatError::Protocol(format!(
                "unsupported engine.io packet type '{}'",
                other
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Open(info) => format!(
                "0{}",
                serde_json::json!({
                    "sid": info.sid,
                    "pingInterval": info.ping_interval,
                    "pingTimeout": info.ping_timeout,
                })
            ),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Message(p) => format!("4{}", p.encode()),
            Packet::Noop => "6".to_string(),
        }
    }

    /// Shorthand for an outbound `42["name",args..]` frame.
    pub fn event(name: &str, args: Vec<Value>) -> Self {
        Packet::Message(SocketPacket::Event {
            name: name.to_string(),
            args,
            ack: None,
        })
    }
}

impl SocketPacket {
    fn decode(body: &str) -> ChatResult<Self> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ChatError::Protocol("empty socket.io packet".into()))?;
        let mut rest = chars.as_str();

        // Namespace other than "/" is written as "/name," before the payload.
        if rest.starts_with('/') {
            rest = rest.find(',').map_or("", |pos| &rest[pos + 1..]);
        }

        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        let ack = if digits > 0 {
            rest[..digits].parse::<u64>().ok()
        } else {
            None
        };
        rest = &rest[digits..];

        let payload = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str::<Value>(rest)
                    .map_err(|e| ChatError::Protocol(format!("bad socket.io payload: {}", e)))?,
            )
        };

        match kind {
            '0' => Ok(SocketPacket::Connect(payload)),
            '1' => Ok(SocketPacket::Disconnect),
            '2' => {
                let mut args = match payload {
                    Some(Value::Array(items)) => items,
                    _ => return Err(ChatError::Protocol("event payload is not an array".into())),
                };
                if args.is_empty() {
                    return Err(ChatError::Protocol("event without a name".into()));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(ChatError::Protocol(format!(
                            "event name is not a string: {}",
                            other
                        )))
                    }
                };
                Ok(SocketPacket::Event { name, args, ack })
            }
            '3' => {
                let id = ack.ok_or_else(|| ChatError::Protocol("ack without id".into()))?;
                let args = match payload {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                Ok(SocketPacket::Ack { id, args })
            }
            '4' => Ok(SocketPacket::ConnectError(payload.unwrap_or(Value::Null))),
            '5' | '6' => Err(ChatError::Protocol("binary packets are not supported".into())),
            other => Err(ChatError::Protocol(format!(
                "unsupported socket.io packet type '{}'",
                other
            ))),
        }
    }

    fn encode(&self) -> String {
        match self {
            SocketPacket::Connect(None) => "0".to_string(),
            SocketPacket::Connect(Some(auth)) => format!("0{}", auth),
            SocketPacket::Disconnect => "1".to_string(),
            SocketPacket::Event { name, args, ack } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                let ack = ack.map(|id| id.to_string()).unwrap_or_default();
                format!("2{}{}", ack, Value::Array(items))
            }
            SocketPacket::Ack { id, args } => format!("3{}{}", id, Value::Array(args.clone())),
            SocketPacket::ConnectError(v) => format!("4{}", v),
        }
    }

    /// Human-readable reason from a connect_error payload.
    pub fn error_reason(payload: &Value) -> String {
        payload
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string())
    }
}
