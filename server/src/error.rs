//! Error taxonomy for the server core.
//!
//! Each variant maps to one handling policy:
//! - protocol violations disconnect the offending connection, no retry
//! - authentication failures send one typed rejection and close the stream
//! - checksum failures kick with a checksum reason
//! - slot errors turn into a rejection with no slot side effects
//! - transport errors force a kick with a generic reason
//! - configuration errors stop the server at startup

use crate::config::ConfigError;
use shared::framing::FrameError;
use shared::handshake::HandshakeRejection;
use shared::CodecError;
use thiserror::Error;

/// Why a slot could not be secured.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("no free slot for the requested model")]
    Unavailable,

    #[error("slot admission refused: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] CodecError),

    #[error("unexpected packet 0x{tag:02X} while {state}")]
    UnexpectedPacket { tag: u8, state: &'static str },

    #[error("invalid telemetry from slot {0}")]
    InvalidTelemetry(u8),

    #[error("handshake rejected: {0:?}")]
    AuthenticationFailure(HandshakeRejection),

    #[error("checksum verification failed")]
    ChecksumFailure,

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl ServerError {
    /// Whether the error means the peer broke the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ServerError::Malformed(_)
                | ServerError::UnexpectedPacket { .. }
                | ServerError::InvalidTelemetry(_)
                | ServerError::Frame(FrameError::PayloadTooLarge { .. })
                | ServerError::Frame(FrameError::Empty)
        )
    }

    /// Whether the error is a plain end of stream rather than a failure.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ServerError::Frame(FrameError::ConnectionClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let malformed = ServerError::from(CodecError::InvalidString);
        assert!(malformed.is_protocol_violation());
        assert!(!malformed.is_disconnect());

        let closed = ServerError::from(FrameError::ConnectionClosed);
        assert!(closed.is_disconnect());
        assert!(!closed.is_protocol_violation());

        let slot = ServerError::from(SlotError::Rejected("not on the list".into()));
        assert_eq!(slot.to_string(), "slot admission refused: not on the list");
    }
}
