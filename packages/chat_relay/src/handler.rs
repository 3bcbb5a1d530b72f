//! Per-connection control flow.
//!
//! A connection moves `Connecting → Admitting → Active → Closed`. The first
//! frame must be a join; a taken name is answered with a negative admission
//! byte and the connection is closed. Once active, every post is handed to
//! the registry, which re-attributes and fans it out.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chat_wire::{ClientFrame, ServerFrame};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::registry::RoomRegistry;
use crate::session::pump_outbound;

/// How long a closing connection may keep flushing once the relay shuts down.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Admitting,
    Active,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Admitting => "admitting",
            Self::Active => "active",
            Self::Closed => "closed",
        })
    }
}

/// Per-connection limits, taken from [`RelayConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_string_bytes: usize,
    pub write_timeout: Option<Duration>,
}

impl From<&RelayConfig> for ConnectionLimits {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_string_bytes: config.max_string_bytes,
            write_timeout: config.write_timeout,
        }
    }
}

/// Drive one connection until it closes.
///
/// Errors are logged and counted here; the returned error is informational.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    room: Arc<RoomRegistry>,
    limits: ConnectionLimits,
    shutdown: CancellationToken,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn_id = uuid::Uuid::new_v4();
    let metrics = room.metrics().clone();
    metrics.connection_opened();
    debug!(peer = %peer, conn_id = %conn_id, "connection opened");

    let result = run_connection(stream, &room, limits, &shutdown).await;
    metrics.connection_closed();

    match &result {
        Ok(()) => debug!(peer = %peer, conn_id = %conn_id, "connection closed"),
        Err(e) if e.is_protocol_error() => {
            metrics.protocol_error();
            warn!(
                peer = %peer,
                conn_id = %conn_id,
                error_code = e.error_code(),
                "closing connection: {}",
                e
            );
        }
        Err(RelayError::Io(e)) if is_disconnect(e) => {
            info!(peer = %peer, conn_id = %conn_id, "connection dropped: {}", e)
        }
        Err(e) => error!(
            peer = %peer,
            conn_id = %conn_id,
            error_code = e.error_code(),
            "connection failed: {}",
            e
        ),
    }
    result
}

fn is_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof
    )
}

async fn run_connection<S>(
    stream: S,
    room: &RoomRegistry,
    limits: ConnectionLimits,
    shutdown: &CancellationToken,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut state = ConnectionState::Connecting;

    let first = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        frame = ClientFrame::read_from(&mut reader, limits.max_string_bytes) => frame,
    };
    let username = match first.map_err(|e| RelayError::from_wire(e, state))? {
        None => return Ok(()),
        Some(ClientFrame::Join { username }) => username,
        Some(other) => {
            return Err(RelayError::ProtocolViolation {
                state,
                detail: format!("expected join, got {}", other.kind()),
            });
        }
    };

    state = ConnectionState::Admitting;
    debug!(username = %username, state = %state, "join received");
    let admitted = match room.try_admit(&username).await {
        Ok(admitted) => admitted,
        Err(e) if e.is_rejection() => {
            info!(username = %username, "rejected: {}", e);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                written = write_rejection(&mut write_half, limits.write_timeout) => written?,
            }
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    state = ConnectionState::Active;
    let session = admitted.session;
    let abort = CancellationToken::new();
    let mut writer = tokio::spawn(pump_outbound(
        admitted.outbound,
        write_half,
        limits.write_timeout,
        session.close_token(),
        abort.clone(),
    ));

    let outcome = loop {
        let frame = tokio::select! {
            biased;
            _ = session.closed() => break Ok(()),
            _ = shutdown.cancelled() => break Ok(()),
            frame = ClientFrame::read_from(&mut reader, limits.max_string_bytes) => frame,
        };

        match frame {
            Ok(None) => break Ok(()),
            Ok(Some(ClientFrame::Post(message))) => {
                room.metrics().message_received();
                if message.username != session.username() {
                    debug!(
                        username = %session.username(),
                        claimed = %message.username,
                        "re-attributing message"
                    );
                }
                match room.post(&session, message.text).await {
                    Ok(_) => {}
                    Err(RelayError::SessionClosed(_)) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            Ok(Some(ClientFrame::Join { .. })) => {
                break Err(RelayError::ProtocolViolation {
                    state,
                    detail: "join after admission".to_string(),
                });
            }
            Err(e) => break Err(RelayError::from_wire(e, state)),
        }
    };

    room.remove_session(&session).await;
    state = ConnectionState::Closed;

    match finish_writer(&mut writer, shutdown, &abort).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(
            username = %session.username(),
            state = %state,
            error_code = e.error_code(),
            "outbound stopped: {}",
            e
        ),
        Err(e) => error!(username = %session.username(), "writer task failed: {}", e),
    }
    outcome
}

/// Wait for the writer to flush what is queued.
///
/// Once the relay is shutting down the writer gets [`SHUTDOWN_DRAIN`] more,
/// then it is aborted even if the client never reads.
async fn finish_writer(
    writer: &mut JoinHandle<Result<(), RelayError>>,
    shutdown: &CancellationToken,
    abort: &CancellationToken,
) -> Result<Result<(), RelayError>, JoinError> {
    tokio::select! {
        joined = &mut *writer => return joined,
        _ = shutdown.cancelled() => {}
    }
    match tokio::time::timeout(SHUTDOWN_DRAIN, &mut *writer).await {
        Ok(joined) => joined,
        Err(_) => {
            debug!("outbound still busy at shutdown, aborting");
            abort.cancel();
            writer.await
        }
    }
}

async fn write_rejection<W>(writer: &mut W, write_timeout: Option<Duration>) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let reply = ServerFrame::Admission(false)
        .encode()
        .map_err(RelayError::Encode)?;
    let write = async {
        writer.write_all(&reply).await?;
        writer.flush().await?;
        writer.shutdown().await
    };
    match write_timeout {
        Some(limit) => tokio::time::timeout(limit, write)
            .await
            .map_err(|_| RelayError::WriteTimeout(limit))??,
        None => write.await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RelayMetrics;
    use chat_wire::{ChatMessage, DEFAULT_MAX_STRING_BYTES, MessageKind};
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn room() -> Arc<RoomRegistry> {
        Arc::new(RoomRegistry::new(
            &RelayConfig::default(),
            Arc::new(RelayMetrics::new()),
        ))
    }

    fn connect(
        room: &Arc<RoomRegistry>,
        shutdown: &CancellationToken,
    ) -> (DuplexStream, JoinHandle<Result<(), RelayError>>) {
        connect_with(
            room,
            shutdown,
            4096,
            ConnectionLimits::from(&RelayConfig::default()),
        )
    }

    fn connect_with(
        room: &Arc<RoomRegistry>,
        shutdown: &CancellationToken,
        pipe: usize,
        limits: ConnectionLimits,
    ) -> (DuplexStream, JoinHandle<Result<(), RelayError>>) {
        let (client, server) = tokio::io::duplex(pipe);
        let handle = tokio::spawn(handle_connection(
            server,
            "127.0.0.1:9".parse().unwrap(),
            room.clone(),
            limits,
            shutdown.clone(),
        ));
        (client, handle)
    }

    async fn join(client: &mut DuplexStream, name: &str) -> bool {
        ClientFrame::Join {
            username: name.to_string(),
        }
        .write_to(client)
        .await
        .unwrap();
        ServerFrame::read_admission(client).await.unwrap()
    }

    async fn next(client: &mut DuplexStream) -> Option<ServerFrame> {
        ServerFrame::read_from(client, DEFAULT_MAX_STRING_BYTES)
            .await
            .unwrap()
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Admitting.to_string(), "admitting");
    }

    #[tokio::test]
    async fn admitted_client_gets_history_then_own_broadcast() {
        let room = room();
        let shutdown = CancellationToken::new();
        let (mut alice, _task) = connect(&room, &shutdown);

        assert!(join(&mut alice, "alice").await);
        assert_eq!(next(&mut alice).await, Some(ServerFrame::History(vec![])));

        ClientFrame::Post(ChatMessage::new("00:00:00", "alice", "hi"))
            .write_to(&mut alice)
            .await
            .unwrap();
        match next(&mut alice).await {
            Some(ServerFrame::Broadcast(message)) => {
                assert_eq!(message.username, "alice");
                assert_eq!(message.text, "hi");
            }
            other => panic!("expected broadcast, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn taken_name_gets_false_and_eof() {
        let room = room();
        let _held = room.try_admit("alice").await.unwrap();
        let shutdown = CancellationToken::new();
        let (mut client, task) = connect(&room, &shutdown);

        assert!(!join(&mut client, "alice").await);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        task.await.unwrap().unwrap();
        assert_eq!(room.metrics().rejections.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn spoofed_identity_is_reattributed() {
        let room = room();
        let shutdown = CancellationToken::new();
        let (mut bob, _task) = connect(&room, &shutdown);
        assert!(join(&mut bob, "bob").await);
        next(&mut bob).await;

        ClientFrame::Post(ChatMessage::new("99:99:99", "alice", "not really"))
            .write_to(&mut bob)
            .await
            .unwrap();
        let Some(ServerFrame::Broadcast(message)) = next(&mut bob).await else {
            panic!("expected broadcast");
        };
        assert_eq!(message.username, "bob");
        assert_ne!(message.time, "99:99:99");
    }

    #[tokio::test]
    async fn server_tag_before_join_is_violation() {
        let room = room();
        let shutdown = CancellationToken::new();
        let (mut client, task) = connect(&room, &shutdown);

        client
            .write_all(&MessageKind::Broadcast.code().to_le_bytes())
            .await
            .unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "protocol_violation");
        assert!(err.to_string().contains("while connecting"));
        assert_eq!(room.metrics().protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn second_join_closes_and_frees_name() {
        let room = room();
        let shutdown = CancellationToken::new();
        let (mut client, task) = connect(&room, &shutdown);
        assert!(join(&mut client, "eve").await);
        next(&mut client).await;

        ClientFrame::Join {
            username: "eve2".into(),
        }
        .write_to(&mut client)
        .await
        .unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            RelayError::ProtocolViolation {
                state: ConnectionState::Active,
                ..
            }
        ));
        assert!(room.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_tag_while_active_is_malformed() {
        let room = room();
        let shutdown = CancellationToken::new();
        let (mut client, task) = connect(&room, &shutdown);
        assert!(join(&mut client, "frank").await);
        next(&mut client).await;

        client.write_all(&12345i32.to_le_bytes()).await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "malformed_envelope");
        assert!(room.is_empty().await);
    }

    #[tokio::test]
    async fn disconnect_releases_name() {
        let room = room();
        let shutdown = CancellationToken::new();
        let (mut client, task) = connect(&room, &shutdown);
        assert!(join(&mut client, "gina").await);
        drop(client);

        task.await.unwrap().unwrap();
        assert!(room.is_empty().await);
        assert!(room.try_admit("gina").await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_stops_active_connection() {
        let room = room();
        let shutdown = CancellationToken::new();
        let (mut client, task) = connect(&room, &shutdown);
        assert!(join(&mut client, "hal").await);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(room.is_empty().await);
    }

    #[tokio::test]
    async fn post_with_huge_field_count_is_malformed() {
        let room = room();
        let shutdown = CancellationToken::new();
        let (mut client, task) = connect(&room, &shutdown);
        assert!(join(&mut client, "ivy").await);
        next(&mut client).await;

        let mut bogus = MessageKind::Post.code().to_le_bytes().to_vec();
        bogus.extend_from_slice(&i32::MAX.to_le_bytes());
        client.write_all(&bogus).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("handler kept reading")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.error_code(), "malformed_envelope");
        assert!(room.is_empty().await);
    }

    #[tokio::test]
    async fn half_closed_client_still_receives_queued_frames() {
        let room = room();
        let shutdown = CancellationToken::new();
        let (mut client, task) = connect(&room, &shutdown);

        ClientFrame::Join {
            username: "jo".into(),
        }
        .write_to(&mut client)
        .await
        .unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        let mut expected = vec![1u8];
        expected.extend(ServerFrame::History(vec![]).encode().unwrap());
        assert_eq!(received, expected);

        task.await.unwrap().unwrap();
        assert!(room.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_finishes_even_if_client_never_reads() {
        let room = room();
        let shutdown = CancellationToken::new();
        let limits = ConnectionLimits {
            max_string_bytes: DEFAULT_MAX_STRING_BYTES,
            write_timeout: None,
        };
        let (mut client, task) = connect_with(&room, &shutdown, 64, limits);

        ClientFrame::Join {
            username: "kim".into(),
        }
        .write_to(&mut client)
        .await
        .unwrap();
        // The echo of this line cannot fit in the pipe, and nobody reads it.
        ClientFrame::Post(ChatMessage::new("t", "kim", "x".repeat(1024)))
            .write_to(&mut client)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("handler hung after shutdown")
            .unwrap()
            .unwrap();
        assert!(room.is_empty().await);
    }
}
