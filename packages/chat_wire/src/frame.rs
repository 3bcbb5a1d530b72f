//! Tagged frames exchanged between the relay and its TCP clients.
//!
//! | Direction | Tag | Payload |
//! |-----------|-----|---------|
//! | C→S | 471 | String username |
//! | S→C | (none) | Bool admission |
//! | S→C | 371 | Int32 count, count × StringList[time, username, text] |
//! | C→S | 472 | StringList[time, username, text] |
//! | S→C | 372 | StringList[time, username, text] |

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, DEFAULT_MAX_STRING_BYTES, SliceReader};
use crate::error::{Malformed, WireError};

/// Most history entries a reader accepts in one replay.
///
/// The relay refuses a configured history capacity above this.
pub const MAX_HISTORY_ENTRIES: usize = 1024;

/// Numeric message kinds shared by the TCP and UDP variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Peer name collision (UDP only).
    Reject,
    /// History replay (TCP) or welcome with history (UDP).
    History,
    /// Relayed chat line (TCP).
    Broadcast,
    /// Admission request (TCP) or announce (UDP).
    Join,
    /// New chat line from a participant.
    Post,
}

impl MessageKind {
    pub const fn code(self) -> i32 {
        match self {
            Self::Reject => 370,
            Self::History => 371,
            Self::Broadcast => 372,
            Self::Join => 471,
            Self::Post => 472,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::History => "history",
            Self::Broadcast => "broadcast",
            Self::Join => "join",
            Self::Post => "post",
        }
    }
}

impl TryFrom<i32> for MessageKind {
    type Error = Malformed;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            370 => Ok(Self::Reject),
            371 => Ok(Self::History),
            372 => Ok(Self::Broadcast),
            471 => Ok(Self::Join),
            472 => Ok(Self::Post),
            other => Err(Malformed::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// One chat line. Travels as a three-entry string list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    pub time: String,
    pub username: String,
    pub text: String,
}

impl ChatMessage {
    const FIELDS: usize = 3;

    pub fn new(
        time: impl Into<String>,
        username: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            time: time.into(),
            username: username.into(),
            text: text.into(),
        }
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        codec::put_str_list(buf, &[&self.time, &self.username, &self.text])
    }

    fn from_fields(fields: Vec<String>) -> Result<Self, Malformed> {
        let found = fields.len();
        let Ok([time, username, text]) = <[String; Self::FIELDS]>::try_from(fields) else {
            return Err(Malformed::BadArity {
                expected: Self::FIELDS,
                found,
            });
        };
        Ok(Self {
            time,
            username,
            text,
        })
    }

    fn take(reader: &mut SliceReader<'_>) -> Result<Self, Malformed> {
        Self::from_fields(reader.read_string_list_exact(Self::FIELDS)?)
    }

    async fn read<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_string: usize,
    ) -> Result<Self, WireError> {
        let fields = codec::read_string_list_exact(reader, Self::FIELDS, max_string).await?;
        Ok(Self::from_fields(fields)?)
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.time, self.username, self.text)
    }
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Join { username: String },
    Post(ChatMessage),
}

impl ClientFrame {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Join { .. } => MessageKind::Join,
            Self::Post(_) => MessageKind::Post,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        codec::put_i32(&mut buf, self.kind().code());
        match self {
            Self::Join { username } => codec::put_str(&mut buf, username)?,
            Self::Post(message) => message.put(&mut buf)?,
        }
        Ok(buf)
    }

    /// Decode exactly one frame from a complete buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Self::decode_with_limit(bytes, DEFAULT_MAX_STRING_BYTES)
    }

    pub fn decode_with_limit(bytes: &[u8], max_string: usize) -> Result<Self, WireError> {
        let mut reader = SliceReader::new(bytes, max_string);
        let frame = match client_kind(reader.read_i32()?)? {
            MessageKind::Join => Self::Join {
                username: reader.read_string()?,
            },
            _ => Self::Post(ChatMessage::take(&mut reader)?),
        };
        reader.finish()?;
        Ok(frame)
    }

    /// Read the next frame from a stream.
    ///
    /// Returns `None` if the peer closed the stream between frames.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_string: usize,
    ) -> Result<Option<Self>, WireError> {
        let Some(tag) = codec::read_tag(reader).await? else {
            return Ok(None);
        };
        let frame = match client_kind(tag)? {
            MessageKind::Join => Self::Join {
                username: codec::read_string(reader, max_string).await?,
            },
            _ => Self::Post(ChatMessage::read(reader, max_string).await?),
        };
        Ok(Some(frame))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), WireError> {
        writer.write_all(&self.encode()?).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn client_kind(tag: i32) -> Result<MessageKind, WireError> {
    match MessageKind::try_from(tag)? {
        kind @ (MessageKind::Join | MessageKind::Post) => Ok(kind),
        kind => Err(WireError::UnexpectedKind {
            kind,
            origin: "client",
        }),
    }
}

fn server_kind(tag: i32) -> Result<MessageKind, WireError> {
    match MessageKind::try_from(tag)? {
        kind @ (MessageKind::History | MessageKind::Broadcast) => Ok(kind),
        kind => Err(WireError::UnexpectedKind {
            kind,
            origin: "server",
        }),
    }
}

fn history_count(raw: i32) -> Result<usize, Malformed> {
    let count = usize::try_from(raw).map_err(|_| Malformed::NegativeLength(raw))?;
    if count > MAX_HISTORY_ENTRIES {
        return Err(Malformed::TooManyEntries {
            count,
            max: MAX_HISTORY_ENTRIES,
        });
    }
    Ok(count)
}

/// Frames the relay sends to a client.
///
/// `Admission` is the only untagged frame: it is always the first thing the
/// relay writes after a join request, so clients read it with
/// [`ServerFrame::read_admission`] before switching to [`ServerFrame::read_from`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Admission(bool),
    History(Vec<ChatMessage>),
    Broadcast(ChatMessage),
}

impl ServerFrame {
    /// The tag, or `None` for the untagged admission byte.
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Self::Admission(_) => None,
            Self::History(_) => Some(MessageKind::History),
            Self::Broadcast(_) => Some(MessageKind::Broadcast),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        if let Some(kind) = self.kind() {
            codec::put_i32(buf, kind.code());
        }
        match self {
            Self::Admission(accepted) => codec::put_bool(buf, *accepted),
            Self::History(entries) => {
                codec::put_len(buf, entries.len())?;
                for entry in entries {
                    entry.put(buf)?;
                }
            }
            Self::Broadcast(message) => message.put(buf)?,
        }
        Ok(())
    }

    /// Decode exactly one tagged frame from a complete buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = SliceReader::new(bytes, DEFAULT_MAX_STRING_BYTES);
        let frame = match server_kind(reader.read_i32()?)? {
            MessageKind::History => {
                let count = history_count(reader.read_i32()?)?;
                let mut entries = Vec::with_capacity(count.min(reader.remaining() / 4));
                for _ in 0..count {
                    entries.push(ChatMessage::take(&mut reader)?);
                }
                Self::History(entries)
            }
            _ => Self::Broadcast(ChatMessage::take(&mut reader)?),
        };
        reader.finish()?;
        Ok(frame)
    }

    /// Decode a complete buffer holding only the admission byte.
    pub fn decode_admission(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = SliceReader::new(bytes, DEFAULT_MAX_STRING_BYTES);
        let accepted = reader.read_bool()?;
        reader.finish()?;
        Ok(Self::Admission(accepted))
    }

    pub async fn read_admission<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool, WireError> {
        codec::read_bool(reader).await
    }

    /// Read the next tagged frame from a stream.
    ///
    /// Returns `None` if the relay closed the stream between frames.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_string: usize,
    ) -> Result<Option<Self>, WireError> {
        let Some(tag) = codec::read_tag(reader).await? else {
            return Ok(None);
        };
        let frame = match server_kind(tag)? {
            MessageKind::History => {
                let count = history_count(codec::read_i32(reader).await?)?;
                let mut entries = Vec::with_capacity(count.min(16));
                for _ in 0..count {
                    entries.push(ChatMessage::read(reader, max_string).await?);
                }
                Self::History(entries)
            }
            _ => Self::Broadcast(ChatMessage::read(reader, max_string).await?),
        };
        Ok(Some(frame))
    }
}
