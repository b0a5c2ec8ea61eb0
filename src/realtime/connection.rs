//! Connection lifecycle for the chat socket
//!
//! One `ConnectionManager` owns at most one live link. Each `connect` starts a
//! driver task tagged with a generation number; tearing the link down bumps
//! the generation so a superseded driver can never publish state or events.
//!
//! The driver performs the engine.io/socket.io handshake (bounded by
//! `handshake_timeout`), then pumps frames: server pings are answered,
//! outbound commands are written in order, inbound events are dispatched
//! synchronously to the `LinkObserver`. A dropped link clears room state
//! through the observer and, when enabled, reconnects with exponential
//! backoff (1s doubling to `max_backoff`, reset once a link stayed up 60s).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use super::frame::{OpenInfo, Packet, SocketPacket};
use super::protocol::{ClientCommand, ServerEvent};
use super::transport::{Connector, Transport};
use crate::config::SessionConfig;
use crate::error::{ChatError, ChatResult};

/// A link that survived this long resets the reconnect backoff.
const STABLE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Observable lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Connected { user_id: String },
    ConnectError { reason: String, retryable: bool },
    Dropped { reason: String },
}

/// Receives link lifecycle and inbound events on the driver task.
///
/// Callbacks run in arrival order and must not block. Lifecycle callbacks
/// carry the generation they belong to; they may arrive after a newer
/// session has started, so implementations must check it with
/// `LinkHandle::is_current`.
pub trait LinkObserver: Send + Sync {
    fn on_connected(&self, generation: u64);
    fn on_link_lost(&self, generation: u64);
    fn on_event(&self, event: ServerEvent);
}

struct Link {
    user_id: Option<String>,
    generation: u64,
    commands: Option<mpsc::UnboundedSender<ClientCommand>>,
}

struct Shared {
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

/// Shared view of the single connection, used by components that send
/// commands through it.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<Shared>,
}

impl Default for LinkHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkHandle {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                link: Mutex::new(Link {
                    user_id: None,
                    generation: 0,
                    commands: None,
                }),
                state_tx,
                events_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        self.shared.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// True between `connect` and `disconnect`, including reconnect cycles.
    pub fn has_session(&self) -> bool {
        self.lock().commands.is_some()
    }

    pub fn user_id(&self) -> Option<String> {
        self.lock().user_id.clone()
    }

    /// Queue a command for the driver while `generation` still owns the
    /// link. Returns false otherwise or with no session.
    pub(crate) fn send_at(&self, generation: u64, cmd: ClientCommand) -> bool {
        let link = self.lock();
        if link.generation != generation {
            return false;
        }
        match &link.commands {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }

    /// Bumped by every `connect` and teardown.
    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Publish `state` if `generation` still owns the link.
    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let link = self.lock();
        if link.generation != generation {
            return false;
        }
        self.publish_state(state);
        true
    }

    fn publish_state(&self, state: ConnectionState) {
        let prev = self.shared.state_tx.send_replace(state);
        if prev != state {
            tracing::debug!("Connection state {} -> {}", prev, state);
            let _ = self
                .shared
                .events_tx
                .send(ConnectionEvent::StateChanged(state));
        }
    }

    fn emit(&self, generation: u64, event: ConnectionEvent) {
        if self.is_current(generation) {
            let _ = self.shared.events_tx.send(event);
        }
    }

    /// Record a connect that could not start, leaving no session behind.
    fn fail_start(&self, reason: String) {
        {
            let mut link = self.lock();
            link.generation += 1;
            link.user_id = None;
            link.commands = None;
            self.publish_state(ConnectionState::Error);
        }
        let _ = self.shared.events_tx.send(ConnectionEvent::ConnectError {
            reason,
            retryable: true,
        });
    }
}

#[cfg(test)]
impl LinkHandle {
    pub(crate) fn send(&self, cmd: ClientCommand) -> bool {
        let generation = self.generation();
        self.send_at(generation, cmd)
    }

    /// Session-bearing link in `state` whose commands land in the receiver.
    pub(crate) fn detached(
        state: ConnectionState,
    ) -> (Self, mpsc::UnboundedReceiver<ClientCommand>) {
        let handle = Self::new();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut link = handle.lock();
            link.commands = Some(tx);
            link.user_id = Some("test".into());
        }
        handle.publish_state(state);
        (handle, rx)
    }

    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.publish_state(state);
    }

    pub(crate) fn end_session(&self) {
        let mut link = self.lock();
        link.commands = None;
        link.generation += 1;
        self.publish_state(ConnectionState::Disconnected);
    }

    /// Replace the session with a fresh one in `state`.
    pub(crate) fn restart_session(
        &self,
        state: ConnectionState,
    ) -> mpsc::UnboundedReceiver<ClientCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut link = self.lock();
        link.commands = Some(tx);
        link.generation += 1;
        self.publish_state(state);
        rx
    }
}

/// Owns the connection lifecycle.
pub struct ConnectionManager {
    link: LinkHandle,
    connector: Arc<dyn Connector>,
    observer: Arc<dyn LinkObserver>,
    config: SessionConfig,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        link: LinkHandle,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn LinkObserver>,
        config: SessionConfig,
    ) -> Self {
        Self {
            link,
            connector,
            observer,
            config,
            driver: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> LinkHandle {
        self.link.clone()
    }

    /// Open the connection for `user_id`.
    ///
    /// A connecting or connected link for the same user is returned
    /// unchanged. Anything else is torn down and replaced. The handshake runs
    /// on a task spawned on the current tokio runtime; without one the state
    /// moves to `Error` and a retryable `ConnectError` is emitted.
    pub fn connect(&self, user_id: &str) -> ConnectionState {
        {
            let link = self.link.lock();
            let state = self.link.state();
            if link.commands.is_some()
                && link.user_id.as_deref() == Some(user_id)
                && matches!(
                    state,
                    ConnectionState::Connecting | ConnectionState::Connected
                )
            {
                tracing::debug!("Already {} as {}", state, user_id);
                return state;
            }
        }

        if self.teardown() {
            tracing::info!("Replacing stale connection");
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!("Cannot connect as {}: {}", user_id, e);
                self.link.fail_start(format!("no async runtime: {}", e));
                return ConnectionState::Error;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut link = self.link.lock();
            link.generation += 1;
            link.user_id = Some(user_id.to_string());
            link.commands = Some(tx);
            self.link.publish_state(ConnectionState::Connecting);
            link.generation
        };

        tracing::info!("Connecting as {}", user_id);
        let driver = Driver {
            generation,
            user_id: user_id.to_string(),
            link: self.link.clone(),
            connector: self.connector.clone(),
            observer: self.observer.clone(),
            config: self.config.clone(),
            commands: rx,
        };
        let task = runtime.spawn(driver.run());
        *self.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        ConnectionState::Connecting
    }

    /// Tear the connection down and forget all room joins.
    pub fn disconnect(&self) {
        if self.teardown() {
            tracing::info!("Disconnected");
        }
    }

    /// Disconnect and wait for the driver to write already queued commands
    /// (such as `leave_room`) and close its transport.
    pub async fn close(&self) {
        let task = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.disconnect();
        if let Some(task) = task {
            if time::timeout(self.config.handshake_timeout, task)
                .await
                .is_err()
            {
                tracing::warn!("Driver did not stop within {:?}", self.config.handshake_timeout);
            }
        }
    }

    fn teardown(&self) -> bool {
        let ended = {
            let mut link = self.link.lock();
            if link.commands.is_none() {
                return false;
            }
            // Dropping the sender makes the driver close its transport.
            link.commands = None;
            link.user_id = None;
            let ended = link.generation;
            link.generation += 1;
            self.link.publish_state(ConnectionState::Disconnected);
            ended
        };
        self.observer.on_link_lost(ended);
        true
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn user_id(&self) -> Option<String> {
        self.link.user_id()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.shared.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.link.shared.events_tx.subscribe()
    }

    /// Wait until the link is connected. False on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == ConnectionState::Connected {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Why the frame pump stopped.
enum Exit {
    /// Session torn down locally. Do not reconnect.
    Shutdown,
    /// Link lost. May reconnect.
    Dropped(String),
}

struct Driver {
    generation: u64,
    user_id: String,
    link: LinkHandle,
    connector: Arc<dyn Connector>,
    observer: Arc<dyn LinkObserver>,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
}

impl Driver {
    async fn run(mut self) {
        let gen = self.generation;
        let mut backoff = Duration::from_secs(1);

        loop {
            if !self.link.set_state(gen, ConnectionState::Connecting) {
                return;
            }

            let attempt = time::timeout(
                self.config.handshake_timeout,
                handshake(self.connector.as_ref(), &self.user_id),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ChatError::HandshakeTimeout(
                    self.config.handshake_timeout.as_secs(),
                ))
            });

            match attempt {
                Ok((mut transport, open)) => {
                    if !self.link.set_state(gen, ConnectionState::Connected) {
                        transport.close().await;
                        return;
                    }
                    tracing::info!("Connected as {} (sid={})", self.user_id, open.sid);
                    self.observer.on_connected(gen);
                    self.link.emit(
                        gen,
                        ConnectionEvent::Connected {
                            user_id: self.user_id.clone(),
                        },
                    );

                    let connected_at = Instant::now();
                    match self.pump(transport.as_mut(), &open).await {
                        Exit::Shutdown => {
                            self.drain_commands(transport.as_mut()).await;
                            transport.close().await;
                            tracing::debug!("Driver for {} stopped", self.user_id);
                            return;
                        }
                        Exit::Dropped(reason) => {
                            if !self.link.set_state(gen, ConnectionState::Disconnected) {
                                return;
                            }
                            tracing::warn!("Connection dropped: {}", reason);
                            self.observer.on_link_lost(gen);
                            self.link.emit(gen, ConnectionEvent::Dropped { reason });
                            if connected_at.elapsed() >= STABLE_AFTER {
                                backoff = Duration::from_secs(1);
                            }
                        }
                    }
                }
                Err(e) => {
                    if !self.link.set_state(gen, ConnectionState::Error) {
                        return;
                    }
                    tracing::warn!("Connection attempt failed: {}", e);
                    self.link.emit(
                        gen,
                        ConnectionEvent::ConnectError {
                            reason: e.to_string(),
                            retryable: e.retryable(),
                        },
                    );
                    if !e.retryable() {
                        return;
                    }
                }
            }

            if !self.config.auto_reconnect || !self.wait_backoff(backoff).await {
                return;
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Sleep before the next attempt. False if the session ended meanwhile.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        tracing::info!("Reconnecting in {}s...", delay.as_secs());
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return self.link.is_current(self.generation),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => tracing::debug!("Dropping {:?} while reconnecting", cmd),
                    None => return false,
                },
            }
        }
    }

    /// Write commands queued before the session ended.
    async fn drain_commands(&mut self, transport: &mut dyn Transport) {
        while let Ok(cmd) = self.commands.try_recv() {
            tracing::debug!("Sending {:?} before close", cmd);
            if transport.send_text(cmd.to_packet().encode()).await.is_err() {
                return;
            }
        }
    }

    async fn pump(&mut self, transport: &mut dyn Transport, open: &OpenInfo) -> Exit {
        let silence = Duration::from_millis(open.ping_interval + open.ping_timeout);
        let deadline = time::sleep(silence);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                frame = transport.recv_frame() => {
                    let text = match frame {
                        Ok(Some(text)) => text,
                        Ok(None) => return Exit::Dropped("closed by server".into()),
                        Err(e) => return Exit::Dropped(e.to_string()),
                    };
                    deadline.as_mut().reset(time::Instant::now() + silence);

                    match Packet::decode(&text) {
                        Ok(Packet::Ping) => {
                            if let Err(e) = transport.send_text(Packet::Pong.encode()).await {
                                return Exit::Dropped(e.to_string());
                            }
                        }
                        Ok(Packet::Close) => return Exit::Dropped("server closed transport".into()),
                        Ok(Packet::Message(SocketPacket::Disconnect)) => {
                            return Exit::Dropped("server disconnected namespace".into());
                        }
                        Ok(Packet::Message(packet)) => {
                            if !self.link.is_current(self.generation) {
                                return Exit::Shutdown;
                            }
                            let names = &self.config.notification_events;
                            match ServerEvent::from_socket(&packet, names) {
                                Some(event) => self.observer.on_event(event),
                                None => tracing::debug!("Unhandled packet: {:?}", packet),
                            }
                        }
                        Ok(other) => tracing::debug!("Ignoring packet: {:?}", other),
                        Err(e) => tracing::warn!("Malformed frame {:?}: {}", text, e),
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        tracing::debug!("Sending {:?}", cmd);
                        if let Err(e) = transport.send_text(cmd.to_packet().encode()).await {
                            return Exit::Dropped(e.to_string());
                        }
                    }
                    None => return Exit::Shutdown,
                },
                _ = &mut deadline => {
                    return Exit::Dropped("ping timeout".into());
                }
            }
        }
    }
}

/// Open a transport and complete the socket.io namespace connect.
async fn handshake(
    connector: &dyn Connector,
    user_id: &str,
) -> ChatResult<(Box<dyn Transport>, OpenInfo)> {
    let mut transport = connector.open(user_id).await?;

    let open = loop {
        let text = transport
            .recv_frame()
            .await?
            .ok_or_else(|| ChatError::Connection("closed before open packet".into()))?;
        match Packet::decode(&text)? {
            Packet::Open(info) => break info,
            other => tracing::debug!("Ignoring pre-open packet: {:?}", other),
        }
    };

    transport
        .send_text(Packet::Message(SocketPacket::Connect(None)).encode())
        .await?;

    loop {
        let text = transport
            .recv_frame()
            .await?
            .ok_or_else(|| ChatError::Connection("closed during handshake".into()))?;
        match Packet::decode(&text)? {
            Packet::Message(SocketPacket::Connect(_)) => return Ok((transport, open)),
            Packet::Message(SocketPacket::ConnectError(payload)) => {
                return Err(ChatError::Rejected(SocketPacket::error_reason(&payload)));
            }
            Packet::Ping => transport.send_text(Packet::Pong.encode()).await?,
            other => tracing::debug!("Ignoring handshake packet: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::memory::{Handshake, MemoryConnector, MemoryServer};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        notify: Notify,
    }

    impl Recorder {
        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
            self.notify.notify_waiters();
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// Wait until at least `n` callbacks were recorded.
        async fn settle(&self, n: usize) -> Vec<String> {
            let wait = async {
                loop {
                    let notified = self.notify.notified();
                    if self.calls.lock().unwrap().len() >= n {
                        return;
                    }
                    notified.await;
                }
            };
            time::timeout(Duration::from_secs(5), wait)
                .await
                .expect("observer callbacks did not arrive");
            self.calls()
        }
    }

    impl LinkObserver for Recorder {
        fn on_connected(&self, _generation: u64) {
            self.push("connected".into());
        }
        fn on_link_lost(&self, _generation: u64) {
            self.push("lost".into());
        }
        fn on_event(&self, event: ServerEvent) {
            let tag = match event {
                ServerEvent::NewMessage(m) => format!("message:{}", m.id),
                ServerEvent::Notification(n) => format!("notification:{}", n.kind),
            };
            self.push(tag);
        }
    }

    fn manager(
        config: SessionConfig,
    ) -> (ConnectionManager, MemoryConnector, MemoryServer, Arc<Recorder>) {
        let (connector, server) = MemoryConnector::new();
        let recorder = Arc::new(Recorder::default());
        let mgr = ConnectionManager::new(
            LinkHandle::new(),
            Arc::new(connector.clone()),
            recorder.clone(),
            config,
        );
        (mgr, connector, server, recorder)
    }

    fn no_retry() -> SessionConfig {
        SessionConfig {
            auto_reconnect: false,
            ..SessionConfig::default()
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_state(mgr: &ConnectionManager, want: ConnectionState) {
        let mut state = mgr.watch_state();
        time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let (mgr, _connector, mut server, recorder) = manager(no_retry());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        assert_eq!(mgr.connect("u1"), ConnectionState::Connecting);
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);
        assert!(mgr.is_connected());
        assert_eq!(mgr.user_id().as_deref(), Some("u1"));

        let end = server.accept().await.expect("connection accepted");
        assert_eq!(end.user_id, "u1");
        assert_eq!(recorder.settle(1).await, vec!["connected"]);
    }

    #[tokio::test]
    async fn test_connect_twice_same_user_is_noop() {
        let (mgr, connector, _server, _recorder) = manager(no_retry());
        mgr.connect("u1");
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);

        assert_eq!(mgr.connect("u1"), ConnectionState::Connected);
        assert_eq!(connector.opened(), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_connect_other_user_replaces_link() {
        let (mgr, connector, _server, recorder) = manager(no_retry());
        mgr.connect("u1");
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);
        recorder.settle(1).await;

        mgr.connect("u2");
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);
        assert_eq!(connector.opened(), vec!["u1", "u2"]);
        assert_eq!(mgr.user_id().as_deref(), Some("u2"));
        assert_eq!(
            recorder.settle(3).await,
            vec!["connected", "lost", "connected"]
        );
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_observable() {
        let (mgr, connector, _server, _recorder) = manager(no_retry());
        connector.set_handshake(Handshake::Reject("Not authorized".into()));
        let mut events = mgr.events();

        mgr.connect("u1");
        loop {
            if let ConnectionEvent::ConnectError { reason, retryable } =
                next_event(&mut events).await
            {
                assert!(reason.contains("Not authorized"));
                assert!(retryable);
                break;
            }
        }
        assert_eq!(mgr.state(), ConnectionState::Error);
        assert!(!mgr.is_connected());
    }

    #[tokio::test]
    async fn test_handshake_timeout_moves_to_error() {
        let config = SessionConfig {
            handshake_timeout: Duration::from_millis(100),
            ..no_retry()
        };
        let (mgr, connector, _server, _recorder) = manager(config);
        connector.set_handshake(Handshake::Silent);
        let mut events = mgr.events();

        mgr.connect("u1");
        loop {
            if let ConnectionEvent::ConnectError { reason, .. } = next_event(&mut events).await {
                assert!(reason.contains("timed out"));
                break;
            }
        }
        assert_eq!(mgr.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_error_recovers_on_explicit_connect() {
        let (mgr, connector, _server, _recorder) = manager(no_retry());
        connector.set_handshake(Handshake::Refuse);

        mgr.connect("u1");
        wait_state(&mgr, ConnectionState::Error).await;

        connector.set_handshake(Handshake::Accept);
        mgr.connect("u1");
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);
        assert_eq!(connector.opened().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_clears_session() {
        let (mgr, _connector, _server, recorder) = manager(no_retry());
        mgr.connect("u1");
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);
        recorder.settle(1).await;

        mgr.disconnect();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(!mgr.handle().has_session());
        assert!(!mgr.handle().send(ClientCommand::JoinRoom("bid_1".into())));
        assert_eq!(recorder.calls(), vec!["connected", "lost"]);

        // Second disconnect is a no-op.
        mgr.disconnect();
        assert_eq!(recorder.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_server_ping_answered_with_pong() {
        let (mgr, _connector, mut server, _recorder) = manager(no_retry());
        mgr.connect("u1");
        let mut end = server.accept().await.expect("connection accepted");
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);

        assert_eq!(end.next_raw().await.as_deref(), Some("40"));
        end.send_raw("2");
        assert_eq!(end.next_raw().await.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_inbound_events_reach_observer_in_order() {
        let (mgr, _connector, mut server, recorder) = manager(no_retry());
        mgr.connect("u1");
        let mut end = server.accept().await.expect("connection accepted");
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);

        end.emit(
            "new_message",
            serde_json::json!({"id": "m1", "bidId": "b", "senderId": "u2", "body": "a"}),
        );
        end.send_raw("42[\"unparseable\"");
        end.emit("application_accepted", serde_json::json!({"title": "ok"}));
        end.drop_link();

        assert_eq!(
            recorder.settle(4).await,
            vec![
                "connected",
                "message:m1",
                "notification:application_accepted",
                "lost"
            ]
        );
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_ping_timeout_drops_link() {
        let (mgr, connector, _server, recorder) = manager(no_retry());
        connector.set_ping(50, 50);
        let mut events = mgr.events();

        mgr.connect("u1");
        loop {
            if let ConnectionEvent::Dropped { reason } = next_event(&mut events).await {
                assert_eq!(reason, "ping timeout");
                break;
            }
        }
        assert_eq!(recorder.settle(2).await, vec!["connected", "lost"]);
    }

    #[tokio::test]
    async fn test_auto_reconnect_after_drop() {
        let (mgr, connector, mut server, recorder) = manager(SessionConfig::default());
        mgr.connect("u1");
        let mut end = server.accept().await.expect("connection accepted");
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);
        recorder.settle(1).await;

        end.drop_link();
        recorder.settle(2).await;

        // First retry waits one second.
        let _second = server.accept().await.expect("connection accepted");
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);
        assert_eq!(connector.opened(), vec!["u1", "u1"]);
        assert_eq!(
            recorder.settle(3).await,
            vec!["connected", "lost", "connected"]
        );
    }

    #[tokio::test]
    async fn test_close_writes_queued_commands() {
        let (mgr, _connector, mut server, _recorder) = manager(no_retry());
        mgr.connect("u1");
        let mut end = server.accept().await.expect("connection accepted");
        assert!(mgr.wait_connected(Duration::from_secs(5)).await);

        assert!(mgr.handle().send(ClientCommand::LeaveRoom("bid_1".into())));
        mgr.close().await;

        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(end.drain_events(), vec![r#"42["leave_room","bid_1"]"#]);
    }

    #[test]
    fn test_connect_without_runtime_reports_error() {
        let (mgr, _connector, mut server, _recorder) = manager(no_retry());
        let mut events = mgr.events();

        assert_eq!(mgr.connect("u1"), ConnectionState::Error);
        assert_eq!(mgr.state(), ConnectionState::Error);
        assert!(!mgr.handle().has_session());

        let mut reported = None;
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::ConnectError { reason, retryable } = event {
                reported = Some((reason, retryable));
            }
        }
        let (reason, retryable) = reported.expect("connect error event");
        assert!(reason.contains("runtime"));
        assert!(retryable);

        // The failed attempt leaves nothing behind that blocks a retry.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            assert_eq!(mgr.connect("u1"), ConnectionState::Connecting);
            assert!(server.accept().await.is_some());
            assert!(mgr.wait_connected(Duration::from_secs(5)).await);
        });
    }
}
