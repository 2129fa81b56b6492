//! Error taxonomy shared by the server and client protocol layers
//!
//! Every variant is local-recoverable: a bad message or an out-of-state
//! request from one connection never tears down another connection or the
//! broadcast loop. The only failure that propagates is connection loss,
//! which the transport reports as a disconnect event rather than an error.

use thiserror::Error;

use crate::protocol::ParticipantId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Truncated bytes, an unrecognized kind tag, or trailing garbage
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A value exceeded the datagram size limit while encoding
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    /// The id allocator handed out an id that is still registered
    #[error("participant {0} is already registered")]
    DuplicateParticipant(ParticipantId),

    /// Admission policy refused the connection before any protocol exchange
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),
}

impl ProtocolError {
    /// Errors that are expected during normal operation and only logged at debug level
    pub fn is_benign(&self) -> bool {
        matches!(self, ProtocolError::UnknownParticipant(_))
    }
}
