//! Chat Wire - envelopes shared by the relay, its clients, and UDP peers
//!
//! Two encodings live here:
//!
//! - the TCP relay framing: little-endian `i32` tags and counts, length-prefixed
//!   UTF-8 strings, and string lists (see [`codec`] and [`frame`])
//! - the UDP peer records: a closed [`PeerMessage`] enum carried as JSON
//!
//! # Example
//!
//! ```
//! use chat_wire::{ChatMessage, ClientFrame};
//!
//! let frame = ClientFrame::Post(ChatMessage::new("12:00:00", "alice", "hello"));
//! let bytes = frame.encode().unwrap();
//! assert_eq!(ClientFrame::decode(&bytes).unwrap(), frame);
//! ```

pub mod codec;
mod error;
pub mod frame;
pub mod peer;

pub use codec::DEFAULT_MAX_STRING_BYTES;
pub use error::{Malformed, WireError};
pub use frame::{ChatMessage, ClientFrame, MAX_HISTORY_ENTRIES, MessageKind, ServerFrame};
pub use peer::PeerMessage;
