//! Datagram records for the UDP flood-broadcast variant.
//!
//! On the wire every datagram is a JSON record
//! `{ "protocol_num": N, "username": "...", "message": ... }` where `message`
//! is either a string or a list of strings depending on `protocol_num`.
//! The record is turned into a [`PeerMessage`] as soon as it is received.

use serde::{Deserialize, Serialize};

use crate::error::{Malformed, WireError};
use crate::frame::MessageKind;

/// Every datagram a peer can send or receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// A peer joined and asks who else is around.
    Announce { username: String },
    /// The announced name is already used by the receiver.
    Reject,
    /// Reply to an announce, carrying the sender's formatted history.
    Welcome {
        username: String,
        history: Vec<String>,
    },
    /// A chat line flooded to everyone.
    Broadcast { username: String, message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerRecord {
    protocol_num: i32,
    #[serde(default)]
    username: String,
    #[serde(default)]
    message: RecordPayload,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RecordPayload {
    Text(String),
    Lines(Vec<String>),
}

impl Default for RecordPayload {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl PeerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Announce { .. } => MessageKind::Join,
            Self::Reject => MessageKind::Reject,
            Self::Welcome { .. } => MessageKind::History,
            Self::Broadcast { .. } => MessageKind::Post,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let (username, message) = match self {
            Self::Announce { username } => (username.clone(), RecordPayload::default()),
            Self::Reject => (String::new(), RecordPayload::default()),
            Self::Welcome { username, history } => {
                (username.clone(), RecordPayload::Lines(history.clone()))
            }
            Self::Broadcast { username, message } => {
                (username.clone(), RecordPayload::Text(message.clone()))
            }
        };
        let record = PeerRecord {
            protocol_num: self.kind().code(),
            username,
            message,
        };
        Ok(serde_json::to_vec(&record)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let record: PeerRecord = serde_json::from_slice(bytes)?;
        let message = match (MessageKind::try_from(record.protocol_num)?, record.message) {
            (MessageKind::Join, _) => Self::Announce {
                username: record.username,
            },
            (MessageKind::Reject, _) => Self::Reject,
            (MessageKind::History, RecordPayload::Lines(history)) => Self::Welcome {
                username: record.username,
                history,
            },
            (MessageKind::History, RecordPayload::Text(text)) if text.is_empty() => {
                Self::Welcome {
                    username: record.username,
                    history: Vec::new(),
                }
            }
            (MessageKind::Post, RecordPayload::Text(message)) => Self::Broadcast {
                username: record.username,
                message,
            },
            (MessageKind::History, RecordPayload::Text(_)) => {
                return Err(Malformed::UnexpectedPayload("welcome history must be a list").into());
            }
            (MessageKind::Post, RecordPayload::Lines(_)) => {
                return Err(Malformed::UnexpectedPayload("chat message must be a string").into());
            }
            (kind @ MessageKind::Broadcast, _) => {
                return Err(WireError::UnexpectedKind {
                    kind,
                    origin: "peer",
                });
            }
        };
        Ok(message)
    }
}
