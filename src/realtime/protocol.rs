//! Chat events carried over socket.io

use serde_json::Value;

use super::frame::{Packet, SocketPacket};
use crate::models::{ChatMessage, NotificationEvent};

pub const EVENT_JOIN_ROOM: &str = "join_room";
pub const EVENT_LEAVE_ROOM: &str = "leave_room";
pub const EVENT_NEW_MESSAGE: &str = "new_message";
pub const EVENT_NOTIFICATION: &str = "notification";

/// Event names relayed as notifications unless configured otherwise.
pub const DEFAULT_NOTIFICATION_EVENTS: &[&str] = &[EVENT_NOTIFICATION, "application_accepted"];

/// Outbound command, fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    JoinRoom(String),
    LeaveRoom(String),
}

impl ClientCommand {
    pub fn to_packet(&self) -> Packet {
        match self {
            ClientCommand::JoinRoom(room) => {
                Packet::event(EVENT_JOIN_ROOM, vec![Value::String(room.clone())])
            }
            ClientCommand::LeaveRoom(room) => {
                Packet::event(EVENT_LEAVE_ROOM, vec![Value::String(room.clone())])
            }
        }
    }
}

/// Inbound application event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    NewMessage(ChatMessage),
    Notification(NotificationEvent),
}

impl ServerEvent {
    /// Interpret a socket.io event. Only events named in
    /// `notification_events` become notifications; anything else this client
    /// does not understand yields `None`.
    pub fn from_socket(packet: &SocketPacket, notification_events: &[String]) -> Option<Self> {
        let SocketPacket::Event { name, args, .. } = packet else {
            return None;
        };
        let payload = args.first()?;

        if name == EVENT_NEW_MESSAGE {
            return match serde_json::from_value::<ChatMessage>(payload.clone()) {
                Ok(msg) => Some(ServerEvent::NewMessage(msg)),
                Err(e) => {
                    tracing::warn!("Malformed {} payload: {}", EVENT_NEW_MESSAGE, e);
                    None
                }
            };
        }

        if !notification_events.iter().any(|n| n == name) {
            tracing::debug!("Unhandled event {}", name);
            return None;
        }
        NotificationEvent::from_event(name, payload).map(ServerEvent::Notification)
    }
}
