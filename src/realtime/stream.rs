//! Per-room message delivery with de-duplication
//!
//! Every room keeps a bounded record of delivered message ids; an id already
//! in the record is dropped. Display order is arrival order.
//!
//! Optimistic sends are reconciled by sender and body: a provisional message
//! waits up to `reconcile_window` for either the REST confirmation
//! (`confirm_sent`) or a broadcast from the same sender with the same body.
//! Whichever comes first replaces the provisional entry; the other is then a
//! duplicate by id. Provisional entries that outlive the window are retracted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::pubsub::{Subscription, SubscriptionId, Topics};
use crate::error::Ignored;
use crate::models::ChatMessage;

/// What a room subscriber sees.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Message(ChatMessage),
    /// Locally composed message not yet confirmed by the server.
    Provisional(ChatMessage),
    /// Authoritative copy replacing a provisional message.
    Reconciled {
        provisional_id: String,
        message: ChatMessage,
    },
    /// Provisional message withdrawn (send failed or never confirmed).
    Retracted { provisional_id: String },
}

/// Result of handing an inbound message to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Forwarded to this many handlers.
    Delivered(usize),
    /// Replaced a provisional message; forwarded to this many handlers.
    Reconciled(usize),
    Ignored(Ignored),
}

/// Bounded insertion-ordered id set.
struct SeenSet {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Record `id`. False if already present.
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Pending {
    message: ChatMessage,
    posted_at: Instant,
}

#[derive(Default)]
struct StreamState {
    seen: HashMap<String, SeenSet>,
    pending: HashMap<String, Vec<Pending>>,
}

impl StreamState {
    fn seen_mut(&mut self, room: &str, capacity: usize) -> &mut SeenSet {
        self.seen
            .entry(room.to_string())
            .or_insert_with(|| SeenSet::new(capacity))
    }

    /// Remove pending entries of `room` older than `window`.
    fn take_expired(&mut self, room: &str, window: Duration) -> Vec<RoomEvent> {
        let Some(list) = self.pending.get_mut(room) else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        list.retain(|p| {
            if p.posted_at.elapsed() > window {
                expired.push(RoomEvent::Retracted {
                    provisional_id: p.message.id.clone(),
                });
                false
            } else {
                true
            }
        });
        expired
    }

    fn take_pending(
        &mut self,
        room: &str,
        pred: impl Fn(&ChatMessage) -> bool,
    ) -> Option<ChatMessage> {
        let list = self.pending.get_mut(room)?;
        let pos = list.iter().position(|p| pred(&p.message))?;
        Some(list.remove(pos).message)
    }
}

#[derive(Clone)]
pub struct MessageStream {
    topics: Topics<String, RoomEvent>,
    state: Arc<Mutex<StreamState>>,
    capacity: usize,
    window: Duration,
}

impl MessageStream {
    pub fn new(capacity: usize, reconcile_window: Duration) -> Self {
        Self {
            topics: Topics::new(),
            state: Arc::new(Mutex::new(StreamState::default())),
            capacity: capacity.max(1),
            window: reconcile_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe<F>(&self, room: &str, handler: F) -> Subscription
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        let stream = self.clone();
        let key = room.to_string();
        self.topics
            .subscribe(key.clone(), handler)
            .on_release(move || stream.release(&key))
    }

    pub fn unsubscribe(&self, room: &str, id: SubscriptionId) -> bool {
        let removed = self.topics.unsubscribe(&room.to_string(), id);
        if removed {
            self.release(room);
        }
        removed
    }

    /// Drop a room's state once its last subscriber is gone.
    fn release(&self, room: &str) {
        if !self.has_subscribers(room) {
            self.forget(room);
        }
    }

    /// Drop remembered ids and pending provisional messages of `room`.
    pub fn forget(&self, room: &str) {
        let mut state = self.lock();
        let seen = state.seen.remove(room).map_or(0, |s| s.len());
        let pending = state.pending.remove(room).map_or(0, |p| p.len());
        if seen + pending > 0 {
            tracing::debug!("Forgot room {} ({} seen, {} pending)", room, seen, pending);
        }
    }

    pub fn has_subscribers(&self, room: &str) -> bool {
        self.topics.has_subscribers(&room.to_string())
    }

    /// Publish in order; returns the handler count of the last event.
    fn publish(&self, room: &str, events: &[RoomEvent]) -> usize {
        let key = room.to_string();
        let mut count = 0;
        for event in events {
            count = self.topics.publish(&key, event);
        }
        count
    }

    /// Hand an inbound message to the subscribers of its room.
    pub fn deliver(&self, message: ChatMessage) -> Delivery {
        let room = message.room.clone();
        if !self.has_subscribers(&room) {
            tracing::trace!("Message {} for room {}: {}", message.id, room, Ignored::UnknownRoomEvent);
            return Delivery::Ignored(Ignored::UnknownRoomEvent);
        }

        let (events, reconciled) = {
            let mut state = self.lock();
            let expired = state.take_expired(&room, self.window);

            if !state.seen_mut(&room, self.capacity).insert(&message.id) {
                drop(state);
                self.publish(&room, &expired);
                tracing::trace!("Message {} in room {}: {}", message.id, room, Ignored::DuplicateDelivery);
                return Delivery::Ignored(Ignored::DuplicateDelivery);
            }

            let echo = state.take_pending(&room, |p| {
                p.sender_id == message.sender_id && p.body.trim() == message.body.trim()
            });
            let mut events = expired;
            let reconciled = echo.is_some();
            events.push(match echo {
                Some(provisional) => RoomEvent::Reconciled {
                    provisional_id: provisional.id,
                    message,
                },
                None => RoomEvent::Message(message),
            });
            (events, reconciled)
        };

        let count = self.publish(&room, &events);
        if reconciled {
            Delivery::Reconciled(count)
        } else {
            Delivery::Delivered(count)
        }
    }

    /// Show a locally composed message before the server confirms it.
    pub fn post_provisional(
        &self,
        room: &str,
        sender_id: &str,
        sender_name: Option<&str>,
        body: &str,
    ) -> ChatMessage {
        let message = ChatMessage::provisional(room, sender_id, sender_name, body);
        let expired = {
            let mut state = self.lock();
            let expired = state.take_expired(room, self.window);
            state
                .pending
                .entry(room.to_string())
                .or_default()
                .push(Pending {
                    message: message.clone(),
                    posted_at: Instant::now(),
                });
            expired
        };

        let mut events = expired;
        events.push(RoomEvent::Provisional(message.clone()));
        self.publish(room, &events);
        message
    }

    /// Apply the REST confirmation of an optimistic send.
    ///
    /// Returns false when the broadcast echo already took care of it.
    pub fn confirm_sent(&self, provisional_id: &str, confirmed: ChatMessage) -> bool {
        let room = confirmed.room.clone();
        let event = {
            let mut state = self.lock();
            let provisional = state.take_pending(&room, |p| p.id == provisional_id);
            let fresh = state.seen_mut(&room, self.capacity).insert(&confirmed.id);

            match (provisional, fresh) {
                (Some(p), true) => RoomEvent::Reconciled {
                    provisional_id: p.id,
                    message: confirmed,
                },
                // Echo arrived first but did not match by body.
                (Some(p), false) => RoomEvent::Retracted {
                    provisional_id: p.id,
                },
                (None, true) => RoomEvent::Message(confirmed),
                (None, false) => return false,
            }
        };

        self.publish(&room, &[event]);
        true
    }

    /// Withdraw a provisional message, e.g. after a failed send.
    pub fn discard_provisional(&self, provisional_id: &str) -> bool {
        let room = {
            let mut state = self.lock();
            let room = state.pending.iter().find_map(|(room, list)| {
                list.iter()
                    .any(|p| p.message.id == provisional_id)
                    .then(|| room.clone())
            });
            let Some(room) = room else {
                return false;
            };
            state.take_pending(&room, |p| p.id == provisional_id);
            room
        };

        self.publish(
            &room,
            &[RoomEvent::Retracted {
                provisional_id: provisional_id.to_string(),
            }],
        );
        true
    }

    /// Retract provisional messages in `room` that outlived the window.
    pub fn prune_expired(&self, room: &str) -> usize {
        let expired = self.lock().take_expired(room, self.window);
        let n = expired.len();
        self.publish(room, &expired);
        n
    }

    /// Mark already-displayed history as delivered.
    pub fn seed(&self, room: &str, history: &[ChatMessage]) {
        let mut state = self.lock();
        let seen = state.seen_mut(room, self.capacity);
        for message in history {
            seen.insert(&message.id);
        }
    }

    pub fn has_seen(&self, room: &str, id: &str) -> bool {
        self.lock().seen.get(room).is_some_and(|s| s.contains(id))
    }

    pub fn seen_count(&self, room: &str) -> usize {
        self.lock().seen.get(room).map_or(0, SeenSet::len)
    }

    pub fn pending_count(&self, room: &str) -> usize {
        self.lock().pending.get(room).map_or(0, Vec::len)
    }
}
