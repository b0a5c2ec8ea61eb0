//! Real-time chat client over socket.io
//!
//! `ChatSession` ties together the connection lifecycle, room membership,
//! per-room de-duplicated message delivery and global notifications, all
//! sharing a single socket.

pub mod connection;
pub mod frame;
#[cfg(any(test, feature = "memory-transport"))]
pub mod memory;
pub mod notify;
pub mod protocol;
pub mod pubsub;
pub mod rooms;
pub mod session;
pub mod stream;
pub mod transport;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, LinkHandle, LinkObserver};
pub use notify::NotificationRelay;
pub use pubsub::{Subscription, SubscriptionId};
pub use rooms::{JoinOutcome, LeaveOutcome, RoomCoordinator, RoomGuard};
pub use session::ChatSession;
pub use stream::{Delivery, MessageStream, RoomEvent};
pub use transport::{Connector, Transport, WsConnector};
