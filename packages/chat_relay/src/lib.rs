//! Chat Relay - a multi-party chat room over TCP, plus a serverless UDP peer
//!
//! The relay admits clients by unique username, replays recent history to
//! each newcomer, and re-broadcasts every posted line to all participants.
//! The binary in `main.rs` wires these pieces to the CLI.

pub mod broadcast;
pub mod client;
pub mod config;
mod error;
pub mod handler;
pub mod history;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod server;
pub mod session;

pub use broadcast::Broadcaster;
pub use client::ChatClient;
pub use config::{FileConfig, PeerConfig, RelayConfig};
pub use error::RelayError;
pub use handler::ConnectionState;
pub use history::History;
pub use metrics::RelayMetrics;
pub use registry::{Admitted, RoomRegistry};
pub use server::RelayServer;
pub use session::{Session, SessionId};

pub use chat_wire::ChatMessage;
