use std::time::Duration;

use chat_wire::WireError;

use crate::handler::ConnectionState;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] WireError),

    #[error("username {0:?} is already taken")]
    NameCollision(String),

    #[error("username must not be empty")]
    EmptyUsername,

    #[error("{username} is unreachable: {reason}")]
    PeerUnreachable {
        username: String,
        reason: &'static str,
    },

    #[error("protocol violation while {state}: {detail}")]
    ProtocolViolation {
        state: ConnectionState,
        detail: String,
    },

    #[error("session for {0} is already closed")]
    SessionClosed(String),

    #[error("failed to encode frame: {0}")]
    Encode(#[source] WireError),

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Classify a wire-level failure seen while the connection was in `state`.
    pub fn from_wire(err: WireError, state: ConnectionState) -> Self {
        match err {
            WireError::Io(io) => Self::Io(io),
            WireError::UnexpectedKind { kind, origin } => Self::ProtocolViolation {
                state,
                detail: format!("{kind} is never sent by the {origin}"),
            },
            other => Self::MalformedEnvelope(other),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::NameCollision(_) | Self::EmptyUsername => "name_collision",
            Self::PeerUnreachable { .. } => "peer_unreachable",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::SessionClosed(_) => "session_closed",
            Self::Encode(_) => "encode",
            Self::WriteTimeout(_) => "write_timeout",
            Self::Io(_) => "io",
        }
    }

    /// Admission refusals: answered with a negative admission byte.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::NameCollision(_) | Self::EmptyUsername)
    }

    /// Errors caused by the remote side breaking the protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedEnvelope(_) | Self::ProtocolViolation { .. }
        )
    }
}
