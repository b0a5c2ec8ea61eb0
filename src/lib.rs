//! bidchat - real-time chat sessions for bid negotiation rooms
//!
//! One socket per signed-in user carries room messages and global
//! notifications. Sends go through the REST API in `api`.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod realtime;

pub use error::{ChatError, ChatResult, Ignored};
pub use realtime::{ChatSession, ConnectionState, RoomEvent};
