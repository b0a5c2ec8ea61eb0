//! Chat session: one connection shared by rooms, messages and notifications
//!
//! A `ChatSession` is constructed at login and passed to whatever needs it;
//! dropping it closes the connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use super::connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, LinkHandle, LinkObserver,
};
use super::notify::NotificationRelay;
use super::protocol::ServerEvent;
use super::pubsub::{Subscription, SubscriptionId};
use super::rooms::{JoinOutcome, LeaveOutcome, RoomCoordinator, RoomGuard};
use super::stream::{MessageStream, RoomEvent};
use super::transport::{Connector, WsConnector};
use crate::config::SessionConfig;
use crate::error::Ignored;
use crate::models::{ChatMessage, NotificationEvent};

/// Routes driver callbacks to the room, message and notification components.
struct Router {
    rooms: RoomCoordinator,
    stream: MessageStream,
    relay: NotificationRelay,
}

impl LinkObserver for Router {
    fn on_connected(&self, generation: u64) {
        self.rooms.flush_queued(generation);
    }

    fn on_link_lost(&self, generation: u64) {
        self.rooms.reset(generation);
    }

    fn on_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(message) => {
                if !self.rooms.is_joined(&message.room) {
                    tracing::trace!(
                        "Message {} for room {}: {}",
                        message.id,
                        message.room,
                        Ignored::UnknownRoomEvent
                    );
                    return;
                }
                self.stream.deliver(message);
            }
            ServerEvent::Notification(notification) => {
                self.relay.publish(notification);
            }
        }
    }
}

pub struct ChatSession {
    connection: ConnectionManager,
    rooms: RoomCoordinator,
    stream: MessageStream,
    relay: NotificationRelay,
}

impl ChatSession {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let link = LinkHandle::new();
        let rooms = RoomCoordinator::new(link.clone());
        let stream = MessageStream::new(config.dedup_capacity, config.reconcile_window);
        let relay = NotificationRelay::new();

        let router = Arc::new(Router {
            rooms: rooms.clone(),
            stream: stream.clone(),
            relay: relay.clone(),
        });
        let connection = ConnectionManager::new(link, connector, router, config);

        Self {
            connection,
            rooms,
            stream,
            relay,
        }
    }

    /// Session talking to a socket.io server over WebSocket.
    pub fn with_server(server_url: &str, config: SessionConfig) -> Self {
        Self::new(Arc::new(WsConnector::new(server_url)), config)
    }

    // Connection

    pub fn connect(&self, user_id: &str) -> ConnectionState {
        self.connection.connect(user_id)
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Disconnect once pending commands (leaves from dropped guards) are on
    /// the wire.
    pub async fn close(&self) {
        self.connection.close().await;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn user_id(&self) -> Option<String> {
        self.connection.user_id()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.events()
    }

    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.connection.wait_connected(timeout).await
    }

    // Rooms

    pub fn join(&self, room: &str) -> JoinOutcome {
        self.rooms.join(room)
    }

    pub fn leave(&self, room: &str) -> LeaveOutcome {
        self.rooms.leave(room)
    }

    pub fn enter(&self, room: &str) -> RoomGuard {
        self.rooms.enter(room)
    }

    pub fn is_joined(&self, room: &str) -> bool {
        self.rooms.is_joined(room)
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.rooms.joined_rooms()
    }

    // Messages

    pub fn subscribe<F>(&self, room: &str, handler: F) -> Subscription
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.stream.subscribe(room, handler)
    }

    pub fn unsubscribe(&self, room: &str, id: SubscriptionId) -> bool {
        self.stream.unsubscribe(room, id)
    }

    /// Optimistically show a message from the connected user.
    ///
    /// The actual send goes through the REST API; pass its response to
    /// `confirm_sent`, or call `discard_provisional` if it failed. Returns
    /// `None` with no session.
    pub fn post_provisional(
        &self,
        room: &str,
        sender_name: Option<&str>,
        body: &str,
    ) -> Option<ChatMessage> {
        let user_id = self.connection.user_id()?;
        Some(
            self.stream
                .post_provisional(room, &user_id, sender_name, body),
        )
    }

    pub fn confirm_sent(&self, provisional_id: &str, confirmed: ChatMessage) -> bool {
        self.stream.confirm_sent(provisional_id, confirmed)
    }

    pub fn discard_provisional(&self, provisional_id: &str) -> bool {
        self.stream.discard_provisional(provisional_id)
    }

    /// Mark history loaded over REST as already displayed.
    pub fn seed_history(&self, room: &str, history: &[ChatMessage]) {
        self.stream.seed(room, history);
    }

    // Notifications

    pub fn on_notification<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        self.relay.subscribe(handler)
    }

    pub fn notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.relay.listen()
    }

    pub fn messages(&self) -> &MessageStream {
        &self.stream
    }

    pub fn rooms(&self) -> &RoomCoordinator {
        &self.rooms
    }

    pub fn relay(&self) -> &NotificationRelay {
        &self.relay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::memory::{MemoryConnector, MemoryServer, ServerEnd};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time;

    fn session_with(config: SessionConfig) -> (ChatSession, MemoryConnector, MemoryServer) {
        let (connector, server) = MemoryConnector::new();
        let session = ChatSession::new(Arc::new(connector.clone()), config);
        (session, connector, server)
    }

    fn session() -> (ChatSession, MemoryConnector, MemoryServer) {
        session_with(SessionConfig {
            auto_reconnect: false,
            ..SessionConfig::default()
        })
    }

    async fn connected(
        session: &ChatSession,
        server: &mut MemoryServer,
        user: &str,
    ) -> ServerEnd {
        session.connect(user);
        let end = server.accept().await.expect("connection accepted");
        assert!(session.wait_connected(Duration::from_secs(5)).await);
        end
    }

    fn listen(
        session: &ChatSession,
        room: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<RoomEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = session.subscribe(room, move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<RoomEvent>) -> RoomEvent {
        time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no room event")
            .expect("room channel closed")
    }

    fn message_id(event: &RoomEvent) -> &str {
        match event {
            RoomEvent::Message(m) => &m.id,
            RoomEvent::Reconciled { message, .. } => &message.id,
            other => panic!("not a server message: {:?}", other),
        }
    }

    fn emit_message(end: &ServerEnd, id: &str, room: &str, sender: &str, body: &str) {
        end.emit(
            "new_message",
            json!({
                "_id": id,
                "bidId": room,
                "senderId": sender,
                "senderName": "Sam",
                "content": body,
                "createdAt": "2024-05-01T12:00:00Z"
            }),
        );
    }

    #[tokio::test]
    async fn test_duplicate_broadcast_delivered_once() {
        let (session, _connector, mut server) = session();
        let end = connected(&session, &mut server, "u1").await;
        assert_eq!(session.join("bid_42"), JoinOutcome::Sent);
        let (_sub, mut rx) = listen(&session, "bid_42");

        emit_message(&end, "m1", "bid_42", "u2", "hello");
        emit_message(&end, "m1", "bid_42", "u2", "hello");
        emit_message(&end, "m2", "bid_42", "u2", "sentinel");

        assert_eq!(message_id(&next(&mut rx).await), "m1");
        assert_eq!(message_id(&next(&mut rx).await), "m2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_message_for_other_room_not_delivered() {
        let (session, _connector, mut server) = session();
        let end = connected(&session, &mut server, "u1").await;
        session.join("bid_42");
        session.join("bid_43");
        let (_s42, mut rx42) = listen(&session, "bid_42");
        let (_s43, mut rx43) = listen(&session, "bid_43");

        emit_message(&end, "m1", "bid_43", "u2", "for 43");
        emit_message(&end, "m2", "bid_43", "u2", "sentinel");

        assert_eq!(message_id(&next(&mut rx43).await), "m1");
        assert_eq!(message_id(&next(&mut rx43).await), "m2");
        assert!(rx42.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notification_without_open_room() {
        let (session, _connector, mut server) = session();
        let end = connected(&session, &mut server, "u1").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = session.on_notification(move |n| {
            let _ = tx.send(n.clone());
        });
        let mut channel = session.notifications();

        end.emit(
            "application_accepted",
            json!({"title": "Application accepted", "message": "Start anytime", "autoClose": true, "autoCloseDelay": 4000}),
        );

        let handled = time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handled.kind, "application_accepted");
        assert_eq!(handled.hint.auto_close_delay, Some(4000));

        let listened = time::timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listened, handled);
        assert!(session.joined_rooms().is_empty());
    }

    #[tokio::test]
    async fn test_connect_twice_opens_one_transport() {
        let (session, connector, mut server) = session();
        connected(&session, &mut server, "u1").await;

        assert_eq!(session.connect("u1"), ConnectionState::Connected);
        assert_eq!(connector.opened(), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_double_join_sends_one_command() {
        let (session, _connector, mut server) = session();
        let mut end = connected(&session, &mut server, "u1").await;

        assert_eq!(session.join("bid_42"), JoinOutcome::Sent);
        assert_eq!(session.join("bid_42"), JoinOutcome::AlreadyJoined);
        assert_eq!(session.leave("never"), LeaveOutcome::NotJoined);
        session.join("bid_99");

        assert_eq!(end.next_event().await.as_deref(), Some(r#"42["join_room","bid_42"]"#));
        assert_eq!(end.next_event().await.as_deref(), Some(r#"42["join_room","bid_99"]"#));
    }

    #[tokio::test]
    async fn test_rooms_not_joined_after_reconnect() {
        let (session, _connector, mut server) = session();
        let first = connected(&session, &mut server, "u1").await;
        session.join("bid_42");
        let (_sub, mut rx) = listen(&session, "bid_42");
        let (_other_sub, mut other) = listen(&session, "bid_7");

        session.disconnect();
        drop(first);
        assert!(!session.is_joined("bid_42"));
        assert_eq!(
            session.join("bid_42"),
            JoinOutcome::Ignored(Ignored::StaleJoin)
        );

        let mut end = connected(&session, &mut server, "u1").await;
        assert!(!session.is_joined("bid_42"));
        session.join("bid_7");

        emit_message(&end, "m1", "bid_42", "u2", "missed");
        emit_message(&end, "s1", "bid_7", "u2", "sentinel");
        assert_eq!(message_id(&next(&mut other).await), "s1");
        assert!(rx.try_recv().is_err());

        assert_eq!(session.join("bid_42"), JoinOutcome::Sent);
        emit_message(&end, "m2", "bid_42", "u2", "after rejoin");
        assert_eq!(message_id(&next(&mut rx).await), "m2");

        let frames = [end.next_event().await, end.next_event().await];
        assert_eq!(frames[0].as_deref(), Some(r#"42["join_room","bid_7"]"#));
        assert_eq!(frames[1].as_deref(), Some(r#"42["join_room","bid_42"]"#));
    }

    #[tokio::test]
    async fn test_join_while_connecting_is_flushed() {
        let (session, _connector, mut server) = session();
        session.connect("u1");
        assert_eq!(session.join("bid_1"), JoinOutcome::Queued);

        let mut end = server.accept().await.expect("connection accepted");
        assert!(session.wait_connected(Duration::from_secs(5)).await);
        assert_eq!(end.next_event().await.as_deref(), Some(r#"42["join_room","bid_1"]"#));
        assert!(session.is_joined("bid_1"));
    }

    #[tokio::test]
    async fn test_transport_drop_invalidates_joins() {
        let (session, _connector, mut server) = session_with(SessionConfig::default());
        let mut end = connected(&session, &mut server, "u1").await;
        let guard = session.enter("bid_42");
        assert_eq!(guard.outcome(), JoinOutcome::Sent);

        let mut events = session.connection_events();
        end.drop_link();
        loop {
            let event = time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ConnectionEvent::Dropped { .. } = event {
                break;
            }
        }
        assert!(!session.is_joined("bid_42"));

        let mut second = server.accept().await.expect("connection accepted");
        assert!(session.wait_connected(Duration::from_secs(5)).await);
        assert!(!session.is_joined("bid_42"));
        assert_eq!(guard.rejoin(), JoinOutcome::Sent);
        assert_eq!(second.next_event().await.as_deref(), Some(r#"42["join_room","bid_42"]"#));

        drop(guard);
        assert_eq!(second.next_event().await.as_deref(), Some(r#"42["leave_room","bid_42"]"#));
    }

    #[tokio::test]
    async fn test_optimistic_send_reconciled_with_echo() {
        let (session, _connector, mut server) = session();
        let end = connected(&session, &mut server, "u1").await;
        session.join("bid_42");
        let (_sub, mut rx) = listen(&session, "bid_42");

        let provisional = session.post_provisional("bid_42", Some("Me"), "I can start Monday").unwrap();
        assert_eq!(provisional.sender_id, "u1");
        assert!(matches!(next(&mut rx).await, RoomEvent::Provisional(_)));

        emit_message(&end, "srv-1", "bid_42", "u1", "I can start Monday");
        match next(&mut rx).await {
            RoomEvent::Reconciled { provisional_id, message } => {
                assert_eq!(provisional_id, provisional.id);
                assert_eq!(message.id, "srv-1");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_operations_are_noops_after_disconnect() {
        let (session, _connector, mut server) = session();
        let mut end = connected(&session, &mut server, "u1").await;
        session.join("bid_1");
        assert_eq!(end.next_event().await.as_deref(), Some(r#"42["join_room","bid_1"]"#));

        session.disconnect();
        assert!(session.post_provisional("bid_1", None, "hi").is_none());
        assert_eq!(session.leave("bid_1"), LeaveOutcome::NotJoined);
        assert!(end.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_drop_session_closes_connection() {
        let (session, _connector, mut server) = session();
        let mut end = connected(&session, &mut server, "u1").await;
        let guard = session.enter("bid_1");
        assert_eq!(end.next_event().await.as_deref(), Some(r#"42["join_room","bid_1"]"#));

        drop(guard);
        drop(session);
        // Leave is written before the driver sees the closed command channel.
        assert_eq!(end.next_event().await.as_deref(), Some(r#"42["leave_room","bid_1"]"#));
    }

    #[tokio::test]
    async fn test_close_sends_leave_before_disconnecting() {
        let (session, _connector, mut server) = session();
        let mut end = connected(&session, &mut server, "u1").await;
        let guard = session.enter("bid_1");
        assert_eq!(end.next_event().await.as_deref(), Some(r#"42["join_room","bid_1"]"#));

        drop(guard);
        session.close().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(end.drain_events(), vec![r#"42["leave_room","bid_1"]"#]);
    }
}
