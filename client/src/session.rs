//! Client-side session protocol
//!
//! [`ClientSession`] tracks where this client is in the join handshake,
//! keeps its own authoritative id and position, and maintains the local
//! roster of remote participants through an injected [`ViewSink`].
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─transport up─▶ AwaitingAccept ─JoinAccept─▶ Joined
//!       ▲                                                                           │
//!       └──────────────────────────── any disconnect ◀──────────────────────────────┘
//! ```
//!
//! Like the server session it never talks to the transport directly;
//! outgoing messages are queued and drained by the client loop.

use log::{debug, info, warn};
use shared::{Message, ParticipantId, PlayerState, Vec2};
use std::collections::HashMap;

use crate::view::ViewSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Transport connect issued
    Connecting,
    /// Transport connected, JoinRequest sent
    AwaitingAccept,
    Joined,
}

struct Remote<H> {
    username: String,
    position: Vec2,
    handle: H,
}

pub struct ClientSession<V: ViewSink> {
    username: String,
    state: SessionState,
    local: Option<PlayerState>,
    position: Vec2,
    remotes: HashMap<ParticipantId, Remote<V::Handle>>,
    view: V,
    outbox: Vec<Message>,
}

impl<V: ViewSink> ClientSession<V> {
    pub fn new(username: impl Into<String>, view: V) -> Self {
        Self {
            username: username.into(),
            state: SessionState::Disconnected,
            local: None,
            position: Vec2::ZERO,
            remotes: HashMap::new(),
            view,
            outbox: Vec::new(),
        }
    }

    /// Marks the transport connect as issued
    pub fn connect(&mut self) {
        if self.state != SessionState::Disconnected {
            warn!("connect() called while {:?}, ignoring", self.state);
            return;
        }
        self.state = SessionState::Connecting;
    }

    /// Transport connected: ask to join right away
    pub fn handle_connected(&mut self) {
        if self.state != SessionState::Connecting {
            warn!("Transport connected while {:?}, ignoring", self.state);
            return;
        }

        info!("Connected to server, joining as '{}'", self.username);
        self.outbox.push(Message::JoinRequest {
            username: self.username.clone(),
        });
        self.state = SessionState::AwaitingAccept;
    }

    /// Decodes and applies one inbound payload; malformed payloads are dropped
    pub fn handle_message(&mut self, bytes: &[u8]) {
        match Message::decode(bytes) {
            Ok(message) => self.apply(message),
            Err(e) => warn!("Discarding payload from server: {}", e),
        }
    }

    pub fn apply(&mut self, message: Message) {
        match message {
            Message::JoinAccept { state } => self.on_join_accept(state),
            Message::SnapshotUpdate { states } => self.on_snapshot(states),
            Message::ParticipantJoined { identity } => {
                if self.state != SessionState::Joined {
                    warn!(
                        "ParticipantJoined for {} before our own JoinAccept, ignoring",
                        identity.id()
                    );
                    return;
                }
                let id = identity.id();
                if Some(id) == self.local_id() || self.remotes.contains_key(&id) {
                    debug!("Participant {} already known", id);
                    return;
                }
                let handle = self.view.spawn_remote(&identity);
                self.remotes.insert(
                    id,
                    Remote {
                        username: identity.username,
                        position: identity.state.position,
                        handle,
                    },
                );
            }
            Message::ParticipantLeft { id } => {
                if let Some(remote) = self.remotes.remove(&id) {
                    self.view.despawn_remote(remote.handle);
                }
            }
            other => {
                warn!("Unexpected {} from server, ignoring", other.kind());
            }
        }
    }

    fn on_join_accept(&mut self, state: PlayerState) {
        if self.state != SessionState::AwaitingAccept {
            warn!("JoinAccept while {:?}, ignoring", self.state);
            return;
        }

        info!("Join accepted by server (pid: {})", state.id);
        self.local = Some(state);
        self.position = state.position;
        self.view.local_joined(&state);
        self.state = SessionState::Joined;
    }

    /// Moves every known remote; own entry and unknown ids are skipped
    ///
    /// A snapshot can overtake the ParticipantJoined for a newcomer, since
    /// the two travel on different channels. The newcomer simply shows up
    /// in a later snapshot once the join notice has been applied.
    fn on_snapshot(&mut self, states: Vec<PlayerState>) {
        if self.state != SessionState::Joined {
            debug!("Snapshot before joining, ignoring");
            return;
        }

        let own = self.local_id();
        for state in states {
            if Some(state.id) == own {
                continue;
            }
            match self.remotes.get_mut(&state.id) {
                Some(remote) => {
                    remote.position = state.position;
                    self.view.move_remote(&mut remote.handle, state.position);
                }
                None => debug!("Snapshot entry for unknown participant {}", state.id),
            }
        }
    }

    /// Transport lost: tear down every remote and forget our id
    pub fn handle_disconnected(&mut self) {
        for (_, remote) in self.remotes.drain() {
            self.view.despawn_remote(remote.handle);
        }
        if self.state != SessionState::Disconnected {
            info!("Disconnected from server");
        }
        self.local = None;
        self.state = SessionState::Disconnected;
    }

    /// Queues this tick's position update; returns false when not joined
    pub fn tick(&mut self) -> bool {
        if self.state != SessionState::Joined {
            return false;
        }
        self.outbox.push(Message::PositionUpdate {
            position: self.position,
        });
        true
    }

    pub fn set_position(&mut self, position: Vec2) {
        self.position = position;
    }

    pub fn move_by(&mut self, delta: Vec2) {
        self.position += delta;
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local.map(|state| state.id)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn remote_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.remotes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn remote_position(&self, id: ParticipantId) -> Option<Vec2> {
        self.remotes.get(&id).map(|remote| remote.position)
    }

    pub fn remote_username(&self, id: ParticipantId) -> Option<&str> {
        self.remotes.get(&id).map(|remote| remote.username.as_str())
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    /// Takes every queued message, oldest first
    pub fn drain_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }
}
