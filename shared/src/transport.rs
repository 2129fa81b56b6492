//! Datagram framing and delivery modes for the UDP transport
//!
//! The protocol core only needs two things from a transport: a way to send
//! an encoded message with a chosen [`Delivery`] mode, and connect /
//! disconnect / receive notifications. This module defines the frames the
//! bundled UDP transport puts on the wire to provide that contract.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ProtocolError;
use crate::protocol::wire_options;

/// Largest datagram either side will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Frame tag, sequence number and payload length prefix
pub const FRAME_HEADER_SIZE: usize = 16;

/// Largest encoded message that still fits in one frame
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - FRAME_HEADER_SIZE;

/// Default UDP port of the server
pub const DEFAULT_PORT: u16 = 12345;

/// Transport-level connection handle
pub type ConnectionId = u32;

/// How a message is delivered to its recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Guaranteed delivery, FIFO per recipient
    ReliableOrdered,
    /// Best effort, may be dropped or reordered
    Unreliable,
}

/// Everything the UDP transport puts in a datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    // Connection lifecycle
    /// `session` is fresh for every connect attempt sequence of a client, so
    /// the server can tell a retry from a restarted client on the same address
    Connect { session: u64 },
    Accepted { connection: ConnectionId },
    Rejected { reason: String },
    Disconnect,

    // Payload delivery
    Reliable { sequence: u32, payload: Vec<u8> },
    Ack { sequence: u32 },
    Unreliable { payload: Vec<u8> },

    // Keep-alive and latency measurement
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        wire_options(MAX_DATAGRAM_SIZE)
            .serialize(self)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        wire_options(MAX_DATAGRAM_SIZE)
            .deserialize(bytes)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}

/// Timing knobs for a peer link
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSettings {
    /// How long a reliable frame may stay unacknowledged before it is sent again
    pub resend_interval: Duration,
    /// How often an idle link sends a ping
    pub ping_interval: Duration,
    /// Silence after which the peer is considered gone
    pub timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(100),
            ping_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Current wall-clock time in milliseconds, used for ping timestamps
pub fn timestamp_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}
