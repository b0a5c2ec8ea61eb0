//! Room membership bookkeeping
//!
//! A room is either queued (join requested while the link is still
//! handshaking) or joined (join command written). Joins are idempotent per
//! key and forgotten whenever the link is lost.
//!
//! Join state belongs to one link generation. Entries recorded under an
//! older generation are discarded on the next access, so callbacks from a
//! superseded driver cannot touch a newer session's rooms.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::connection::{ConnectionState, LinkHandle};
use super::protocol::ClientCommand;
use crate::error::Ignored;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoomState {
    Queued,
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Join command written to the link.
    Sent,
    /// Link still handshaking; join goes out once connected.
    Queued,
    AlreadyJoined,
    Ignored(Ignored),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Sent,
    /// Queued join dropped before reaching the wire.
    Dequeued,
    NotJoined,
}

#[derive(Default)]
struct Rooms {
    /// Link generation `states` was recorded under.
    generation: u64,
    states: HashMap<String, RoomState>,
    /// Live `RoomGuard`s per key.
    holders: HashMap<String, usize>,
}

#[derive(Clone)]
pub struct RoomCoordinator {
    link: LinkHandle,
    rooms: Arc<Mutex<Rooms>>,
}

impl RoomCoordinator {
    pub fn new(link: LinkHandle) -> Self {
        Self {
            link,
            rooms: Arc::new(Mutex::new(Rooms::default())),
        }
    }

    /// Lock room state, dropping joins left over from an older generation.
    ///
    /// Lock order is rooms, then link.
    fn lock(&self) -> MutexGuard<'_, Rooms> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.link.generation();
        if rooms.generation != current {
            if !rooms.states.is_empty() {
                tracing::debug!("Dropping {} room join(s) from an ended session", rooms.states.len());
            }
            rooms.states.clear();
            rooms.generation = current;
        }
        rooms
    }

    pub fn join(&self, room: &str) -> JoinOutcome {
        let mut rooms = self.lock();
        match rooms.states.get(room) {
            Some(RoomState::Joined) => return JoinOutcome::AlreadyJoined,
            Some(RoomState::Queued) => return JoinOutcome::Queued,
            None => {}
        }

        // State is read under the rooms lock so a concurrent link loss
        // cannot leave a stale Joined entry behind.
        let state = self.link.state();
        if state == ConnectionState::Connected {
            if self
                .link
                .send_at(rooms.generation, ClientCommand::JoinRoom(room.to_string()))
            {
                tracing::info!("Joined room {}", room);
                rooms.states.insert(room.to_string(), RoomState::Joined);
                return JoinOutcome::Sent;
            }
        } else if self.link.has_session() {
            tracing::debug!("Queued join for room {} ({})", room, state);
            rooms.states.insert(room.to_string(), RoomState::Queued);
            return JoinOutcome::Queued;
        }

        tracing::trace!("Join for room {}: {}", room, Ignored::StaleJoin);
        JoinOutcome::Ignored(Ignored::StaleJoin)
    }

    pub fn leave(&self, room: &str) -> LeaveOutcome {
        let mut rooms = self.lock();
        rooms.holders.remove(room);
        match rooms.states.remove(room) {
            Some(RoomState::Joined) => {
                self.link
                    .send_at(rooms.generation, ClientCommand::LeaveRoom(room.to_string()));
                tracing::info!("Left room {}", room);
                LeaveOutcome::Sent
            }
            Some(RoomState::Queued) => LeaveOutcome::Dequeued,
            None => LeaveOutcome::NotJoined,
        }
    }

    /// Join `room` for the lifetime of the returned guard.
    pub fn enter(&self, room: &str) -> RoomGuard {
        *self.lock().holders.entry(room.to_string()).or_insert(0) += 1;
        let outcome = self.join(room);
        RoomGuard {
            coordinator: self.clone(),
            room: room.to_string(),
            outcome,
        }
    }

    fn release(&self, room: &str) {
        let last = {
            let mut rooms = self.lock();
            match rooms.holders.get_mut(room) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    rooms.holders.remove(room);
                    true
                }
                None => false,
            }
        };
        if last {
            self.leave(room);
        }
    }

    pub fn is_joined(&self, room: &str) -> bool {
        self.lock().states.get(room) == Some(&RoomState::Joined)
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        let mut joined: Vec<String> = self
            .lock()
            .states
            .iter()
            .filter(|(_, state)| **state == RoomState::Joined)
            .map(|(room, _)| room.clone())
            .collect();
        joined.sort();
        joined
    }

    /// Write queued joins once the link of `generation` is up.
    pub(crate) fn flush_queued(&self, generation: u64) {
        let mut rooms = self.lock();
        if rooms.generation != generation {
            tracing::debug!("Skipping join flush for ended session {}", generation);
            return;
        }
        let queued: Vec<String> = rooms
            .states
            .iter()
            .filter(|(_, state)| **state == RoomState::Queued)
            .map(|(room, _)| room.clone())
            .collect();

        for room in queued {
            if self
                .link
                .send_at(generation, ClientCommand::JoinRoom(room.clone()))
            {
                tracing::info!("Joined room {} (queued)", room);
                rooms.states.insert(room, RoomState::Joined);
            }
        }
    }

    /// Forget every join made over the lost link of `generation`. Guards
    /// stay alive and may `rejoin`.
    pub(crate) fn reset(&self, generation: u64) {
        let mut rooms = self.lock();
        if rooms.generation != generation {
            return;
        }
        if !rooms.states.is_empty() {
            tracing::debug!("Clearing {} room join(s)", rooms.states.len());
        }
        rooms.states.clear();
    }
}

/// Scoped room membership. Dropping the last guard for a key leaves it.
pub struct RoomGuard {
    coordinator: RoomCoordinator,
    room: String,
    outcome: JoinOutcome,
}

impl RoomGuard {
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Result of the join issued when the guard was created.
    pub fn outcome(&self) -> JoinOutcome {
        self.outcome
    }

    /// Re-issue the join after a reconnect.
    pub fn rejoin(&self) -> JoinOutcome {
        self.coordinator.join(&self.room)
    }
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        self.coordinator.release(&self.room);
    }
}
