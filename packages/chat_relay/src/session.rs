//! One admitted client: its username and outbound write path.
//!
//! The registry and broadcaster only ever push pre-encoded frames into the
//! session's bounded queue. A dedicated writer task ([`pump_outbound`]) owns
//! the socket's write half and performs the actual network writes, so a slow
//! client never holds up anyone holding the registry lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RelayError;

/// A fully encoded frame, shared between every recipient of a broadcast.
pub type Outbound = Arc<[u8]>;

/// Process-unique id distinguishing sessions that reuse a username.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Handle to an admitted client. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Session {
    id: SessionId,
    username: Arc<str>,
    outbound: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        username: &str,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let session = Self {
            id,
            username: Arc::from(username),
            outbound,
            closed: CancellationToken::new(),
        };
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue means the client is not draining its socket; a closed
    /// queue means its writer is gone. Both make the session unreachable.
    pub fn try_send(&self, frame: Outbound) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(self.unreachable("session closed"));
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => self.unreachable("outbound queue full"),
            TrySendError::Closed(_) => self.unreachable("writer stopped"),
        })
    }

    fn unreachable(&self, reason: &'static str) -> RelayError {
        RelayError::PeerUnreachable {
            username: self.username.to_string(),
            reason,
        }
    }

    /// Mark the session closed. Wakes the connection handler and writer.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been closed from any side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Drain a session's queue into the socket until the session closes.
///
/// Closing the session stops new frames from being queued; whatever is
/// already queued is still written before the write half is shut down.
/// `abort` stops the pump at once, even in the middle of a write. A failed or
/// timed-out write closes the session, which in turn stops the connection
/// handler's read loop.
pub async fn pump_outbound<W>(
    mut rx: mpsc::Receiver<Outbound>,
    mut writer: W,
    write_timeout: Option<Duration>,
    closed: CancellationToken,
    abort: CancellationToken,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        biased;
        _ = abort.cancelled() => Ok(()),
        result = write_queued(&mut rx, &mut writer, write_timeout, &closed) => result,
    };
    closed.cancel();

    tokio::select! {
        biased;
        _ = abort.cancelled() => debug!("outbound aborted"),
        shutdown = shutdown_writer(&mut writer, write_timeout) => {
            if let Err(e) = shutdown {
                debug!("outbound shutdown failed: {}", e);
            }
        }
    }
    result
}

async fn write_queued<W>(
    rx: &mut mpsc::Receiver<Outbound>,
    writer: &mut W,
    write_timeout: Option<Duration>,
    closed: &CancellationToken,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };
        write_frame(writer, &frame, write_timeout).await?;
    }

    rx.close();
    while let Some(frame) = rx.recv().await {
        write_frame(writer, &frame, write_timeout).await?;
    }
    Ok(())
}

async fn shutdown_writer<W>(
    writer: &mut W,
    write_timeout: Option<Duration>,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    match write_timeout {
        Some(limit) => tokio::time::timeout(limit, writer.shutdown())
            .await
            .map_err(|_| RelayError::WriteTimeout(limit))??,
        None => writer.shutdown().await?,
    }
    Ok(())
}

async fn write_frame<W>(
    writer: &mut W,
    frame: &[u8],
    write_timeout: Option<Duration>,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    match write_timeout {
        Some(limit) => tokio::time::timeout(limit, write)
            .await
            .map_err(|_| RelayError::WriteTimeout(limit))??,
        None => write.await?,
    }
    Ok(())
}
