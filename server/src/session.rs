//! Server-side session protocol
//!
//! [`ServerSession`] is the per-connection state machine of the server and
//! the sole owner of the [`Registry`]. It is driven entirely by the server
//! loop through typed calls (admission, inbound bytes, disconnects, ticks)
//! and never touches the transport: every message it wants to send is
//! queued in an outbox that the loop drains and flushes after the handler
//! returns.
//!
//! Connection lifecycle:
//!
//! ```text
//! admit_connection ──▶ Pending ──JoinRequest──▶ Active ──disconnect──▶ (removed)
//!                         └──────────────disconnect──────────────────▶ (removed)
//! ```

use log::{debug, info, warn};
use shared::{
    clamp_username, ConnectionId, Delivery, Message, ParticipantId, ProtocolError, Vec2,
};
use std::collections::HashMap;

use crate::config::ServerConfig;
use crate::registry::Registry;

/// Participant ids are the transport connection handles themselves
pub fn participant_id(connection: ConnectionId) -> ParticipantId {
    connection
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Admitted by the transport, no JoinRequest processed yet
    Pending,
    /// Joined; a registry entry exists
    Active,
}

/// A message queued for one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub connection: ConnectionId,
    pub message: Message,
}

impl Outgoing {
    pub fn delivery(&self) -> Delivery {
        self.message.delivery()
    }
}

pub struct ServerSession {
    max_connections: usize,
    spawn_position: Vec2,
    connections: HashMap<ConnectionId, ConnectionState>,
    registry: Registry,
    outbox: Vec<Outgoing>,
    tick: u64,
}

impl ServerSession {
    pub fn new(max_connections: usize, spawn_position: Vec2) -> Self {
        Self {
            max_connections,
            spawn_position,
            connections: HashMap::new(),
            registry: Registry::new(),
            outbox: Vec::new(),
            tick: 0,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.max_connections, config.spawn_position)
    }

    /// Admission policy, called by the transport before it accepts a connection
    ///
    /// Pending and active connections both count toward the limit. A refused
    /// connection never gets a state here and never exchanges a protocol
    /// message.
    pub fn admit_connection(&mut self, connection: ConnectionId) -> Result<(), ProtocolError> {
        if self.connections.contains_key(&connection) {
            return Err(ProtocolError::DuplicateParticipant(participant_id(
                connection,
            )));
        }

        if self.connections.len() >= self.max_connections {
            info!(
                "Connection {} refused, {} of {} slots in use",
                connection,
                self.connections.len(),
                self.max_connections
            );
            return Err(ProtocolError::ConnectionRejected(format!(
                "server full ({} connections)",
                self.max_connections
            )));
        }

        info!("Connection {} admitted, awaiting join", connection);
        self.connections.insert(connection, ConnectionState::Pending);
        Ok(())
    }

    /// Decodes and applies one inbound payload
    ///
    /// Malformed payloads are dropped; the connection stays open.
    pub fn handle_message(&mut self, connection: ConnectionId, bytes: &[u8]) {
        match Message::decode(bytes) {
            Ok(message) => self.apply(connection, message),
            Err(e) => warn!("Discarding payload from connection {}: {}", connection, e),
        }
    }

    pub fn apply(&mut self, connection: ConnectionId, message: Message) {
        let Some(state) = self.connections.get(&connection).copied() else {
            debug!(
                "{} from unknown connection {}, ignoring",
                message.kind(),
                connection
            );
            return;
        };

        match (state, message) {
            (ConnectionState::Pending, Message::JoinRequest { username }) => {
                self.join(connection, username);
            }
            (ConnectionState::Active, Message::JoinRequest { username }) => {
                warn!(
                    "Connection {} sent a second JoinRequest ('{}'), ignoring",
                    connection, username
                );
            }
            (ConnectionState::Active, Message::PositionUpdate { position }) => {
                let id = participant_id(connection);
                if let Err(e) = self.registry.update_position(id, position) {
                    if e.is_benign() {
                        debug!("Dropping position update: {}", e);
                    } else {
                        warn!("Dropping position update: {}", e);
                    }
                }
            }
            (ConnectionState::Pending, Message::PositionUpdate { .. }) => {
                debug!(
                    "Position update from connection {} before joining, ignoring",
                    connection
                );
            }
            (_, other) => {
                warn!(
                    "Unexpected {} from connection {}, ignoring",
                    other.kind(),
                    connection
                );
            }
        }
    }

    /// Join handshake for a pending connection
    ///
    /// The requester gets its JoinAccept before anything else, then one
    /// ParticipantJoined per existing entrant. Every other active connection
    /// gets one ParticipantJoined for the newcomer. All of these go out on
    /// the reliable-ordered channel.
    fn join(&mut self, connection: ConnectionId, username: String) {
        let id = participant_id(connection);
        let requested_len = username.len();
        let username = clamp_username(username);
        if username.len() < requested_len {
            warn!(
                "Username from connection {} is {} bytes, keeping the first {}",
                connection,
                requested_len,
                username.len()
            );
        }

        let identity = match self.registry.admit(id, username, self.spawn_position) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Rejecting join from connection {}: {}", connection, e);
                return;
            }
        };

        let others = self.active_connections();
        self.connections.insert(connection, ConnectionState::Active);

        self.queue(
            connection,
            Message::JoinAccept {
                state: identity.state,
            },
        );

        for &other in &others {
            self.queue(
                other,
                Message::ParticipantJoined {
                    identity: identity.clone(),
                },
            );
        }

        for existing in self.registry.all() {
            if existing.id() != id {
                self.queue(connection, Message::ParticipantJoined { identity: existing });
            }
        }

        info!(
            "Participant {} '{}' joined ({} in session)",
            id,
            identity.username,
            self.registry.len()
        );
    }

    /// Releases a closed connection
    ///
    /// Safe to call more than once and for connections that never joined;
    /// only the first call for an active connection notifies the others.
    pub fn handle_disconnect(&mut self, connection: ConnectionId) {
        match self.connections.remove(&connection) {
            Some(ConnectionState::Active) => {
                let id = participant_id(connection);
                if self.registry.remove(id).is_some() {
                    for other in self.active_connections() {
                        self.queue(other, Message::ParticipantLeft { id });
                    }
                    info!(
                        "Participant {} left ({} in session)",
                        id,
                        self.registry.len()
                    );
                }
            }
            Some(ConnectionState::Pending) => {
                debug!("Connection {} closed before joining", connection);
            }
            None => {
                debug!("Connection {} already closed", connection);
            }
        }
    }

    /// Queues one snapshot of the whole registry for every active connection
    ///
    /// Returns the number of connections the snapshot was queued for.
    pub fn broadcast_tick(&mut self) -> usize {
        self.tick += 1;

        let recipients = self.active_connections();
        if recipients.is_empty() {
            return 0;
        }

        let states = self.registry.snapshot();
        for &connection in &recipients {
            self.queue(
                connection,
                Message::SnapshotUpdate {
                    states: states.clone(),
                },
            );
        }

        recipients.len()
    }

    /// Takes every queued message, oldest first
    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection_state(&self, connection: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&connection).copied()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    fn active_connections(&self) -> Vec<ConnectionId> {
        let mut active: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, state)| **state == ConnectionState::Active)
            .map(|(connection, _)| *connection)
            .collect();
        active.sort_unstable();
        active
    }

    fn queue(&mut self, connection: ConnectionId, message: Message) {
        self.outbox.push(Outgoing {
            connection,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::{ClientIdentity, PlayerState};

    const A: ConnectionId = 1;
    const B: ConnectionId = 2;
    const C: ConnectionId = 3;

    fn session() -> ServerSession {
        ServerSession::new(8, Vec2::ZERO)
    }

    fn join(session: &mut ServerSession, connection: ConnectionId, username: &str) {
        session.admit_connection(connection).unwrap();
        let bytes = Message::JoinRequest {
            username: username.to_string(),
        }
        .encode()
        .unwrap();
        session.handle_message(connection, &bytes);
    }

    fn messages_for(outbox: &[Outgoing], connection: ConnectionId) -> Vec<Message> {
        outbox
            .iter()
            .filter(|out| out.connection == connection)
            .map(|out| out.message.clone())
            .collect()
    }

    #[test]
    fn test_first_join_gets_accept_at_spawn() {
        let mut session = session();

        join(&mut session, A, "Player 1");
        let outbox = session.drain_outbox();

        assert_eq!(
            outbox,
            vec![Outgoing {
                connection: A,
                message: Message::JoinAccept {
                    state: PlayerState::new(A, Vec2::new(0.0, 0.0)),
                },
            }]
        );
        assert_eq!(outbox[0].delivery(), Delivery::ReliableOrdered);
        assert_eq!(session.connection_state(A), Some(ConnectionState::Active));
        assert_eq!(session.registry().len(), 1);
    }

    #[test]
    fn test_configured_spawn_position() {
        let mut session = ServerSession::new(4, Vec2::new(10.0, -4.0));

        join(&mut session, A, "Player 1");

        match &session.drain_outbox()[0].message {
            Message::JoinAccept { state } => {
                assert_approx_eq!(state.position.x, 10.0);
                assert_approx_eq!(state.position.y, -4.0);
            }
            other => panic!("Unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_second_join_notifies_both_sides() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        session.drain_outbox();

        join(&mut session, B, "Player 2");
        let outbox = session.drain_outbox();

        let to_b = messages_for(&outbox, B);
        assert_eq!(
            to_b,
            vec![
                Message::JoinAccept {
                    state: PlayerState::new(B, Vec2::ZERO),
                },
                Message::ParticipantJoined {
                    identity: ClientIdentity::new(PlayerState::new(A, Vec2::ZERO), "Player 1"),
                },
            ]
        );

        let to_a = messages_for(&outbox, A);
        assert_eq!(
            to_a,
            vec![Message::ParticipantJoined {
                identity: ClientIdentity::new(PlayerState::new(B, Vec2::ZERO), "Player 2"),
            }]
        );

        assert_ne!(A, B);
        assert!(outbox
            .iter()
            .all(|out| out.delivery() == Delivery::ReliableOrdered));
    }

    #[test]
    fn test_position_update_reaches_next_snapshot() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        join(&mut session, B, "Player 2");
        session.drain_outbox();

        let bytes = Message::PositionUpdate {
            position: Vec2::new(5.0, 3.0),
        }
        .encode()
        .unwrap();
        session.handle_message(A, &bytes);

        assert_eq!(session.broadcast_tick(), 2);
        let outbox = session.drain_outbox();

        let to_b = messages_for(&outbox, B);
        assert_eq!(to_b.len(), 1);
        match &to_b[0] {
            Message::SnapshotUpdate { states } => {
                assert_eq!(states.len(), 2);
                let a = states.iter().find(|s| s.id == A).unwrap();
                assert_approx_eq!(a.position.x, 5.0);
                assert_approx_eq!(a.position.y, 3.0);
            }
            other => panic!("Unexpected message {:?}", other),
        }
        assert!(outbox.iter().all(|out| out.delivery() == Delivery::Unreliable));
    }

    #[test]
    fn test_snapshot_includes_recipient() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        session.drain_outbox();

        session.broadcast_tick();
        let outbox = session.drain_outbox();

        assert_eq!(
            messages_for(&outbox, A),
            vec![Message::SnapshotUpdate {
                states: vec![PlayerState::new(A, Vec2::ZERO)],
            }]
        );
    }

    #[test]
    fn test_disconnect_notifies_remaining_once() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        join(&mut session, B, "Player 2");
        session.drain_outbox();

        session.handle_disconnect(A);
        session.handle_disconnect(A);
        let outbox = session.drain_outbox();

        assert_eq!(outbox.len(), 1);
        assert_eq!(
            outbox[0],
            Outgoing {
                connection: B,
                message: Message::ParticipantLeft { id: A },
            }
        );
        assert_eq!(outbox[0].delivery(), Delivery::ReliableOrdered);

        assert!(session.registry().snapshot().iter().all(|s| s.id != A));
        assert_eq!(session.connection_state(A), None);
    }

    #[test]
    fn test_admission_limit() {
        let mut session = ServerSession::new(1, Vec2::ZERO);
        join(&mut session, A, "Player 1");

        let result = session.admit_connection(B);
        assert!(matches!(result, Err(ProtocolError::ConnectionRejected(_))));
        let result = session.admit_connection(C);
        assert!(matches!(result, Err(ProtocolError::ConnectionRejected(_))));

        assert_eq!(session.registry().len(), 1);
        assert_eq!(session.connection_count(), 1);
        assert_eq!(session.connection_state(B), None);

        // A JoinRequest from the refused connection changes nothing
        session.drain_outbox();
        let bytes = Message::JoinRequest {
            username: "Player 2".to_string(),
        }
        .encode()
        .unwrap();
        session.handle_message(B, &bytes);
        assert!(session.drain_outbox().is_empty());
        assert_eq!(session.registry().len(), 1);
    }

    #[test]
    fn test_pending_connections_count_toward_limit() {
        let mut session = ServerSession::new(1, Vec2::ZERO);
        session.admit_connection(A).unwrap();

        assert!(session.admit_connection(B).is_err());
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_disconnect_frees_slot() {
        let mut session = ServerSession::new(1, Vec2::ZERO);
        join(&mut session, A, "Player 1");
        session.handle_disconnect(A);

        assert!(session.admit_connection(B).is_ok());
    }

    #[test]
    fn test_reclaimed_connection_id_can_join_again() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        session.handle_disconnect(A);
        session.drain_outbox();

        join(&mut session, A, "Player 1 again");
        let outbox = session.drain_outbox();

        assert_eq!(outbox.len(), 1);
        assert_eq!(session.registry().get(A).unwrap().username, "Player 1 again");
    }

    #[test]
    fn test_pending_disconnect_needs_no_cleanup() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        session.admit_connection(B).unwrap();
        session.drain_outbox();

        session.handle_disconnect(B);

        assert!(session.drain_outbox().is_empty());
        assert_eq!(session.registry().len(), 1);
        assert_eq!(session.connection_count(), 1);
    }

    #[test]
    fn test_position_update_from_pending_is_ignored() {
        let mut session = session();
        session.admit_connection(A).unwrap();

        session.apply(
            A,
            Message::PositionUpdate {
                position: Vec2::new(1.0, 1.0),
            },
        );

        assert!(session.registry().is_empty());
        assert_eq!(session.connection_state(A), Some(ConnectionState::Pending));
    }

    #[test]
    fn test_malformed_payload_keeps_connection() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        session.drain_outbox();

        session.handle_message(A, &[0xff, 0xff, 0xff, 0xff]);
        session.handle_message(A, &[]);

        assert_eq!(session.connection_state(A), Some(ConnectionState::Active));
        assert!(session.drain_outbox().is_empty());

        let bytes = Message::PositionUpdate {
            position: Vec2::new(2.0, 2.0),
        }
        .encode()
        .unwrap();
        session.handle_message(A, &bytes);
        assert_eq!(session.registry().snapshot()[0].position, Vec2::new(2.0, 2.0));
    }

    #[test]
    fn test_second_join_request_is_ignored() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        session.drain_outbox();

        session.apply(
            A,
            Message::JoinRequest {
                username: "Renamed".to_string(),
            },
        );

        assert!(session.drain_outbox().is_empty());
        assert_eq!(session.registry().get(A).unwrap().username, "Player 1");
    }

    #[test]
    fn test_server_bound_only_kinds_are_ignored() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        session.drain_outbox();

        session.apply(A, Message::ParticipantLeft { id: A });
        session.apply(A, Message::SnapshotUpdate { states: vec![] });

        assert!(session.drain_outbox().is_empty());
        assert_eq!(session.registry().len(), 1);
    }

    #[test]
    fn test_message_from_unknown_connection_is_ignored() {
        let mut session = session();

        session.apply(
            C,
            Message::JoinRequest {
                username: "Ghost".to_string(),
            },
        );

        assert!(session.registry().is_empty());
        assert!(session.drain_outbox().is_empty());
    }

    #[test]
    fn test_broadcast_skips_pending_connections() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        session.admit_connection(B).unwrap();
        session.drain_outbox();

        assert_eq!(session.broadcast_tick(), 1);
        let outbox = session.drain_outbox();
        assert!(messages_for(&outbox, B).is_empty());
        assert_eq!(session.tick(), 1);
    }

    #[test]
    fn test_broadcast_with_nobody_joined() {
        let mut session = session();
        assert_eq!(session.broadcast_tick(), 0);
        assert!(session.drain_outbox().is_empty());
    }

    #[test]
    fn test_oversized_username_is_clamped_so_notices_encode() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        session.drain_outbox();

        // Fits a JoinRequest but not a ParticipantJoined unless shortened
        let long_name = "x".repeat(2015);
        join(&mut session, B, &long_name);
        let outbox = session.drain_outbox();

        assert_eq!(session.registry().len(), 2);
        assert_eq!(
            session.registry().get(B).unwrap().username.len(),
            shared::MAX_USERNAME_LEN
        );
        for out in &outbox {
            assert!(
                out.message.encode().is_ok(),
                "{} to {} does not encode",
                out.message.kind(),
                out.connection
            );
        }
        assert!(matches!(
            messages_for(&outbox, A).as_slice(),
            [Message::ParticipantJoined { identity }] if identity.id() == B
        ));
    }

    #[test]
    fn test_third_join_fans_out_to_everyone() {
        let mut session = session();
        join(&mut session, A, "Player 1");
        join(&mut session, B, "Player 2");
        session.drain_outbox();

        join(&mut session, C, "Player 3");
        let outbox = session.drain_outbox();

        assert_eq!(messages_for(&outbox, A).len(), 1);
        assert_eq!(messages_for(&outbox, B).len(), 1);

        let to_c = messages_for(&outbox, C);
        assert_eq!(to_c.len(), 3);
        assert!(matches!(to_c[0], Message::JoinAccept { .. }));
        let roster: Vec<ParticipantId> = to_c[1..]
            .iter()
            .map(|message| match message {
                Message::ParticipantJoined { identity } => identity.id(),
                other => panic!("Unexpected message {:?}", other),
            })
            .collect();
        assert_eq!(roster, vec![A, B]);
    }
}
