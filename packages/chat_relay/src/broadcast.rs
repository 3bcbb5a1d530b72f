//! Fan-out of one chat line to every live session.

use std::sync::Arc;

use chat_wire::{ChatMessage, ServerFrame};
use tracing::warn;

use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::session::{Outbound, Session};

#[derive(Debug, Clone)]
pub struct Broadcaster {
    metrics: Arc<RelayMetrics>,
}

impl Broadcaster {
    pub fn new(metrics: Arc<RelayMetrics>) -> Self {
        Self { metrics }
    }

    /// Queue `message` for every session in `sessions`.
    ///
    /// The frame is encoded once and shared; nothing is queued if encoding
    /// fails. Returns the sessions that could not take it; the caller removes
    /// them. One failure never stops delivery to the rest.
    pub fn deliver(
        &self,
        message: &ChatMessage,
        sessions: &[Session],
    ) -> Result<Vec<Session>, RelayError> {
        let frame: Outbound = ServerFrame::Broadcast(message.clone())
            .encode()
            .map_err(RelayError::Encode)?
            .into();

        let mut failed = Vec::new();
        for session in sessions {
            match session.try_send(Arc::clone(&frame)) {
                Ok(()) => self.metrics.message_relayed(),
                Err(e) => {
                    warn!(
                        username = %session.username(),
                        session = %session.id(),
                        error_code = e.error_code(),
                        "dropping recipient: {}",
                        e
                    );
                    failed.push(session.clone());
                }
            }
        }
        Ok(failed)
    }
}
