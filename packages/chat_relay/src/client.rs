//! TCP chat client: the admission handshake plus an interactive console loop.

use std::io::Write as _;

use anyhow::{Context, Result};
use chat_wire::{ChatMessage, ClientFrame, DEFAULT_MAX_STRING_BYTES, ServerFrame};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::error::RelayError;
use crate::handler::ConnectionState;

/// Format used to stamp outgoing lines. The relay re-stamps them anyway.
const LOCAL_TIME_FORMAT: &str = "%H:%M:%S";

/// Receiving half of an admitted connection.
pub struct ChatReceiver {
    reader: BufReader<OwnedReadHalf>,
    max_string: usize,
}

impl ChatReceiver {
    /// Next relayed chat line, or `None` once the relay closes the connection.
    ///
    /// Not cancel safe: a partially read frame is lost if the future is dropped.
    pub async fn next_message(&mut self) -> Result<Option<ChatMessage>, RelayError> {
        let frame = ServerFrame::read_from(&mut self.reader, self.max_string)
            .await
            .map_err(|e| RelayError::from_wire(e, ConnectionState::Active))?;
        match frame {
            None => Ok(None),
            Some(ServerFrame::Broadcast(message)) => Ok(Some(message)),
            Some(other) => Err(RelayError::ProtocolViolation {
                state: ConnectionState::Active,
                detail: format!("unexpected {other:?} after admission"),
            }),
        }
    }
}

/// Sending half of an admitted connection.
pub struct ChatSender {
    writer: OwnedWriteHalf,
    username: String,
}

impl ChatSender {
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Send one chat line, stamped with local time.
    pub async fn send(&mut self, text: &str) -> Result<(), RelayError> {
        let time = chrono::Local::now().format(LOCAL_TIME_FORMAT).to_string();
        let frame = ClientFrame::Post(ChatMessage::new(time, self.username.as_str(), text));
        frame
            .write_to(&mut self.writer)
            .await
            .map_err(|e| RelayError::from_wire(e, ConnectionState::Active))
    }
}

/// An admitted client connection.
pub struct ChatClient {
    receiver: ChatReceiver,
    sender: ChatSender,
}

impl ChatClient {
    /// Connect and join as `username`, accepting strings up to
    /// [`DEFAULT_MAX_STRING_BYTES`].
    ///
    /// Returns the client and the history replayed by the relay, oldest
    /// first. A taken name yields [`RelayError::NameCollision`].
    pub async fn connect(
        addr: impl ToSocketAddrs,
        username: &str,
    ) -> Result<(Self, Vec<ChatMessage>), RelayError> {
        Self::connect_with_limit(addr, username, DEFAULT_MAX_STRING_BYTES).await
    }

    /// Like [`ChatClient::connect`], for a relay configured with a different
    /// `max_string_bytes`.
    pub async fn connect_with_limit(
        addr: impl ToSocketAddrs,
        username: &str,
        max_string: usize,
    ) -> Result<(Self, Vec<ChatMessage>), RelayError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        ClientFrame::Join {
            username: username.to_string(),
        }
        .write_to(&mut writer)
        .await
        .map_err(|e| RelayError::from_wire(e, ConnectionState::Connecting))?;

        let admitted = ServerFrame::read_admission(&mut reader)
            .await
            .map_err(|e| RelayError::from_wire(e, ConnectionState::Admitting))?;
        if !admitted {
            return Err(if username.is_empty() {
                RelayError::EmptyUsername
            } else {
                RelayError::NameCollision(username.to_string())
            });
        }

        let history = match ServerFrame::read_from(&mut reader, max_string)
            .await
            .map_err(|e| RelayError::from_wire(e, ConnectionState::Admitting))?
        {
            Some(ServerFrame::History(entries)) => entries,
            Some(other) => {
                return Err(RelayError::ProtocolViolation {
                    state: ConnectionState::Admitting,
                    detail: format!("expected history, got {other:?}"),
                });
            }
            None => return Err(RelayError::SessionClosed(username.to_string())),
        };

        let client = Self {
            receiver: ChatReceiver { reader, max_string },
            sender: ChatSender {
                writer,
                username: username.to_string(),
            },
        };
        Ok((client, history))
    }

    pub fn username(&self) -> &str {
        self.sender.username()
    }

    pub async fn send(&mut self, text: &str) -> Result<(), RelayError> {
        self.sender.send(text).await
    }

    pub async fn next_message(&mut self) -> Result<Option<ChatMessage>, RelayError> {
        self.receiver.next_message().await
    }

    pub fn into_split(self) -> (ChatReceiver, ChatSender) {
        (self.receiver, self.sender)
    }
}

/// Console client: prompt for a name if needed, print history, then relay
/// stdin lines until an empty line or the relay goes away.
pub async fn run_interactive(
    addr: &str,
    username: Option<String>,
    max_string: usize,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let username = match username {
        Some(name) => name,
        None => {
            print!("Enter your username for the chatroom: ");
            std::io::stdout().flush().context("failed to flush stdout")?;
            lines
                .next_line()
                .await
                .context("failed to read username")?
                .unwrap_or_default()
        }
    };

    let connected = ChatClient::connect_with_limit(addr, &username, max_string).await;
    let (client, history) = match connected {
        Ok(connected) => connected,
        Err(e) if e.is_rejection() => {
            println!("Username {username:?} is not available.");
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to join chat at {addr}")),
    };
    info!(addr = %addr, username = %username, "joined chat");

    for message in &history {
        println!("{message}");
    }

    let (mut receiver, mut sender) = client.into_split();
    let mut incoming = tokio::spawn(async move {
        loop {
            match receiver.next_message().await {
                Ok(Some(message)) => println!("{message}"),
                Ok(None) => break,
                Err(e) => {
                    debug!(error_code = e.error_code(), "receive failed: {}", e);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut incoming => {
                println!("Disconnected from the chatroom.");
                return Ok(());
            }
            line = lines.next_line() => {
                let line = line.context("failed to read stdin")?.unwrap_or_default();
                if line.is_empty() {
                    println!("You left the chatroom. Goodbye.");
                    break;
                }
                sender.send(&line).await.context("failed to send message")?;
            }
        }
    }

    incoming.abort();
    Ok(())
}
