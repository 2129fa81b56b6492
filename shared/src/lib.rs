//! Types and codecs shared by the replication server and client
//!
//! - [`protocol`]: the six wire message kinds and their binary codec
//! - [`error`]: the protocol error taxonomy
//! - [`transport`]: datagram frames and delivery modes of the UDP transport
//! - [`channel`]: reliable-ordered sequencing and per-peer link state

pub mod channel;
pub mod error;
pub mod protocol;
pub mod transport;

pub use error::ProtocolError;
pub use protocol::{
    clamp_username, ClientIdentity, Message, ParticipantId, PlayerState, Vec2, MAX_USERNAME_LEN,
};
pub use transport::{ConnectionId, Delivery, Frame, LinkSettings};
