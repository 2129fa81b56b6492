//! Wire codec for the replication protocol
//!
//! Every message crossing the network is one variant of [`Message`]. The
//! layout is bincode with fixed-width little-endian integers:
//!
//! ```text
//! [kind tag: u32] [fields in declaration order]
//! strings / sequences: [length: u64] [items]
//! Vec2:                [x: f32] [y: f32]
//! ```
//!
//! The schema is frozen: field order and presence per kind never change
//! without a new kind tag. Decoding always produces an owned value, so a
//! transport that recycles its receive buffer can do so as soon as
//! [`Message::decode`] returns.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

use crate::error::ProtocolError;
use crate::transport::{Delivery, MAX_PAYLOAD_SIZE};

/// Identifier of a participant, derived from its transport connection handle
pub type ParticipantId = u32;

/// Longest username the server stores, in bytes
///
/// Small enough that a join notice carrying the name always fits in one
/// datagram payload.
pub const MAX_USERNAME_LEN: usize = 64;

/// Shortens `username` to at most [`MAX_USERNAME_LEN`] bytes without splitting a character
pub fn clamp_username(mut username: String) -> String {
    if username.len() > MAX_USERNAME_LEN {
        let mut end = MAX_USERNAME_LEN;
        while !username.is_char_boundary(end) {
            end -= 1;
        }
        username.truncate(end);
    }
    username
}

/// 2D position in world units
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<(f32, f32)> for Vec2 {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    fn add(self, other: Vec2) -> Vec2 {
        Vec2::new(self.x + other.x, self.y + other.y)
    }
}

impl AddAssign for Vec2 {
    fn add_assign(&mut self, other: Vec2) {
        self.x += other.x;
        self.y += other.y;
    }
}

/// Authoritative state of one participant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: ParticipantId,
    pub position: Vec2,
}

impl PlayerState {
    pub fn new(id: ParticipantId, position: Vec2) -> Self {
        Self { id, position }
    }
}

/// One participant as known to remote peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub state: PlayerState,
    pub username: String,
}

impl ClientIdentity {
    pub fn new(state: PlayerState, username: impl Into<String>) -> Self {
        Self {
            state,
            username: username.into(),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.state.id
    }
}

/// Every message kind exchanged between client and server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Client -> server, first message on a fresh connection
    JoinRequest { username: String },
    /// Server -> requesting client, carries the assigned id and spawn position
    JoinAccept { state: PlayerState },
    /// Client -> server, once per client tick
    PositionUpdate { position: Vec2 },
    /// Server -> all clients, once per server tick, one entry per registered participant
    SnapshotUpdate { states: Vec<PlayerState> },
    /// Server -> other clients, once per admitted join
    ParticipantJoined { identity: ClientIdentity },
    /// Server -> remaining clients, once per removal
    ParticipantLeft { id: ParticipantId },
}

/// Codec settings shared by messages and transport frames
pub(crate) fn wire_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(limit as u64)
        .reject_trailing_bytes()
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        wire_options(MAX_PAYLOAD_SIZE)
            .serialize(self)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        wire_options(MAX_PAYLOAD_SIZE)
            .deserialize(bytes)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }

    /// Delivery mode this kind must be sent with
    ///
    /// Join/leave/accept build the client's roster incrementally and must
    /// never be lost or reordered; positions and snapshots are superseded by
    /// the next one and tolerate loss.
    pub fn delivery(&self) -> Delivery {
        match self {
            Message::JoinRequest { .. }
            | Message::JoinAccept { .. }
            | Message::ParticipantJoined { .. }
            | Message::ParticipantLeft { .. } => Delivery::ReliableOrdered,
            Message::PositionUpdate { .. } | Message::SnapshotUpdate { .. } => {
                Delivery::Unreliable
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::JoinRequest { .. } => "JoinRequest",
            Message::JoinAccept { .. } => "JoinAccept",
            Message::PositionUpdate { .. } => "PositionUpdate",
            Message::SnapshotUpdate { .. } => "SnapshotUpdate",
            Message::ParticipantJoined { .. } => "ParticipantJoined",
            Message::ParticipantLeft { .. } => "ParticipantLeft",
        }
    }
}
