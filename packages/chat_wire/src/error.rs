use crate::frame::MessageKind;

/// Why a byte sequence could not be decoded as an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Malformed {
    #[error("declared length {declared} exceeds remaining {remaining} bytes")]
    Truncated { declared: usize, remaining: usize },

    #[error("stream ended in the middle of a frame")]
    UnexpectedEof,

    #[error("negative length or count: {0}")]
    NegativeLength(i32),

    #[error("string of {len} bytes exceeds limit of {max}")]
    TooLong { len: usize, max: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown message kind {0}")]
    UnknownKind(i32),

    #[error("expected {expected} fields, found {found}")]
    BadArity { expected: usize, found: usize },

    #[error("{count} entries exceed limit of {max}")]
    TooManyEntries { count: usize, max: usize },

    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    #[error("unexpected payload shape: {0}")]
    UnexpectedPayload(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] Malformed),

    /// A known kind arrived from the side that never sends it.
    #[error("{kind} is never sent by the {origin}")]
    UnexpectedKind {
        kind: MessageKind,
        origin: &'static str,
    },

    /// A value too large for its 32-bit length prefix.
    #[error("{0} does not fit in a 32-bit length prefix")]
    Oversized(usize),

    #[error("invalid peer record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::Json(_) => "malformed_envelope",
            Self::UnexpectedKind { .. } => "unexpected_kind",
            Self::Oversized(_) => "oversized",
            Self::Io(_) => "io",
        }
    }

    /// True when the peer sent bytes that do not form a valid envelope.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Json(_))
    }
}
