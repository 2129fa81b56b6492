//! Authoritative player registry for the replication server
//!
//! This module holds the server's canonical view of every participant that
//! has completed the join handshake:
//! - Admission of a participant at its spawn position
//! - Position updates reported by the owning client
//! - Removal on disconnect (graceful or timed out)
//! - Point-in-time copies for the per-tick snapshot broadcast
//!
//! The registry is owned by the server session and only ever touched from
//! the server's control loop, so it needs no internal locking. Readers always
//! receive copies, never references into the map.

use log::info;
use shared::{ClientIdentity, ParticipantId, PlayerState, ProtocolError, Vec2};
use std::collections::HashMap;

/// Maps participant ids to their identity and authoritative state
///
/// An id is present if and only if its connection is admitted and has
/// completed the join handshake.
#[derive(Debug, Default)]
pub struct Registry {
    /// Registered participants indexed by their id
    entries: HashMap<ParticipantId, ClientIdentity>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a participant at the given spawn position
    ///
    /// Fails with `DuplicateParticipant` if the id is already registered,
    /// which means the id allocator handed out an id that is still in use.
    /// Returns a copy of the new entry for join notifications.
    pub fn admit(
        &mut self,
        id: ParticipantId,
        username: impl Into<String>,
        spawn_position: Vec2,
    ) -> Result<ClientIdentity, ProtocolError> {
        if self.entries.contains_key(&id) {
            return Err(ProtocolError::DuplicateParticipant(id));
        }

        let identity = ClientIdentity::new(PlayerState::new(id, spawn_position), username);
        info!(
            "Registered participant {} '{}' at ({}, {})",
            id, identity.username, spawn_position.x, spawn_position.y
        );
        self.entries.insert(id, identity.clone());

        Ok(identity)
    }

    /// Overwrites the position of a registered participant
    ///
    /// Fails with `UnknownParticipant` if the id is absent, typically an
    /// update that arrived after its connection closed. Callers treat that
    /// as a benign no-op.
    pub fn update_position(
        &mut self,
        id: ParticipantId,
        position: Vec2,
    ) -> Result<(), ProtocolError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(ProtocolError::UnknownParticipant(id))?;
        entry.state.position = position;
        Ok(())
    }

    /// Removes a participant, returning its last entry if it was registered
    pub fn remove(&mut self, id: ParticipantId) -> Option<ClientIdentity> {
        let removed = self.entries.remove(&id);
        if let Some(identity) = &removed {
            info!("Unregistered participant {} '{}'", id, identity.username);
        }
        removed
    }

    /// Copies every participant's state, ordered by id
    pub fn snapshot(&self) -> Vec<PlayerState> {
        let mut states: Vec<PlayerState> =
            self.entries.values().map(|identity| identity.state).collect();
        states.sort_by_key(|state| state.id);
        states
    }

    /// Copies every participant's full identity, ordered by id
    pub fn all(&self) -> Vec<ClientIdentity> {
        let mut identities: Vec<ClientIdentity> = self.entries.values().cloned().collect();
        identities.sort_by_key(|identity| identity.id());
        identities
    }

    pub fn get(&self, id: ParticipantId) -> Option<&ClientIdentity> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
