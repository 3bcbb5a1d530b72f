//! Serverless chat over UDP broadcast.
//!
//! Every peer floods its lines to the broadcast address. A newcomer announces
//! its name; any peer with a different name answers with a welcome carrying
//! its recent history, and a peer with the same name answers with a reject.
//! [`PeerNode`] holds the state and decides how to react; [`run_peer`] wires
//! it to a socket and the console.

use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};

use anyhow::{Context, Result};
use chat_wire::PeerMessage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::history::History;

const TIME_FORMAT: &str = "%H:%M:%S";
const MAX_DATAGRAM: usize = 65_507;

/// What the runner should do after a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    Ignore,
    /// Send this back to the sender's address on the peer port.
    Reply(PeerMessage),
    /// Print these lines.
    Display(Vec<String>),
    /// Our name is taken; leave.
    Quit,
}

#[derive(Debug)]
pub struct PeerNode {
    username: String,
    history: History<String>,
    welcomed: bool,
}

impl PeerNode {
    pub fn new(username: impl Into<String>, history_capacity: usize) -> Self {
        Self {
            username: username.into(),
            history: History::new(history_capacity),
            welcomed: false,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn history(&self) -> Vec<String> {
        self.history.to_vec()
    }

    pub fn announce(&self) -> PeerMessage {
        PeerMessage::Announce {
            username: self.username.clone(),
        }
    }

    pub fn compose(&self, text: &str) -> PeerMessage {
        PeerMessage::Broadcast {
            username: self.username.clone(),
            message: text.to_string(),
        }
    }

    /// React to one received message.
    ///
    /// `from_self` is true when the datagram came from our own address, which
    /// happens for every broadcast we send. `now` stamps displayed lines.
    pub fn handle(&mut self, message: PeerMessage, from_self: bool, now: &str) -> PeerAction {
        match message {
            PeerMessage::Announce { .. } if from_self => PeerAction::Ignore,
            PeerMessage::Announce { username } if username == self.username => {
                PeerAction::Reply(PeerMessage::Reject)
            }
            PeerMessage::Announce { .. } => PeerAction::Reply(PeerMessage::Welcome {
                username: self.username.clone(),
                history: self.history.to_vec(),
            }),
            PeerMessage::Reject => PeerAction::Quit,
            PeerMessage::Welcome { .. } if self.welcomed => PeerAction::Ignore,
            PeerMessage::Welcome { history, .. } => {
                self.welcomed = true;
                self.history.replace(history);
                PeerAction::Display(self.history.to_vec())
            }
            PeerMessage::Broadcast { username, message } => {
                let line = format!("> {now} {username}: {message}");
                self.history.push(line.clone());
                PeerAction::Display(vec![line])
            }
        }
    }
}

/// Outgoing address of this machine, used to spot our own broadcasts.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn send(socket: &UdpSocket, message: &PeerMessage, to: SocketAddr) -> Result<()> {
    let bytes = message.encode().context("failed to encode peer message")?;
    socket
        .send_to(&bytes, to)
        .await
        .with_context(|| format!("failed to send to {to}"))?;
    Ok(())
}

/// Console peer: announce, then flood stdin lines until an empty line or a
/// reject.
pub async fn run_peer(config: PeerConfig, username: Option<String>) -> Result<()> {
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

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
        .await
        .with_context(|| format!("failed to bind UDP port {}", config.port))?;
    socket
        .set_broadcast(true)
        .context("failed to enable SO_BROADCAST")?;
    let broadcast = SocketAddr::new(config.broadcast_addr, config.port);
    let me = local_ip();
    info!(port = config.port, local_ip = %me, username = %username, "peer started");

    let mut node = PeerNode::new(username, config.history_capacity);
    send(&socket, &node.announce(), broadcast).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("receive failed: {}", e);
                        continue;
                    }
                };
                let message = match PeerMessage::decode(&buf[..len]) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(peer = %from, error_code = e.error_code(), "ignoring datagram: {}", e);
                        continue;
                    }
                };
                let now = chrono::Local::now().format(TIME_FORMAT).to_string();
                match node.handle(message, from.ip() == me, &now) {
                    PeerAction::Ignore => {}
                    PeerAction::Reply(reply) => {
                        let to = SocketAddr::new(from.ip(), config.port);
                        if let Err(e) = send(&socket, &reply, to).await {
                            warn!(peer = %to, "{:#}", e);
                        }
                    }
                    PeerAction::Display(lines) => {
                        for line in lines {
                            println!("{line}");
                        }
                    }
                    PeerAction::Quit => {
                        println!("Username {:?} is already taken.", node.username());
                        break;
                    }
                }
            }
            line = lines.next_line() => {
                let line = line.context("failed to read stdin")?.unwrap_or_default();
                if line.is_empty() {
                    break;
                }
                send(&socket, &node.compose(&line), broadcast).await?;
            }
        }
    }
    info!(username = %node.username(), "peer stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(name: &str) -> PeerMessage {
        PeerMessage::Announce {
            username: name.to_string(),
        }
    }

    fn chat(name: &str, text: &str) -> PeerMessage {
        PeerMessage::Broadcast {
            username: name.to_string(),
            message: text.to_string(),
        }
    }

    #[test]
    fn own_announce_is_ignored() {
        let mut node = PeerNode::new("alice", 10);
        assert_eq!(node.handle(announce("alice"), true, "t"), PeerAction::Ignore);
    }

    #[test]
    fn same_name_from_elsewhere_is_rejected() {
        let mut node = PeerNode::new("alice", 10);
        assert_eq!(
            node.handle(announce("alice"), false, "t"),
            PeerAction::Reply(PeerMessage::Reject)
        );
    }

    #[test]
    fn newcomer_gets_welcome_with_history() {
        let mut node = PeerNode::new("alice", 10);
        node.handle(chat("alice", "hi"), true, "10:00:00");

        let action = node.handle(announce("bob"), false, "10:00:01");
        assert_eq!(
            action,
            PeerAction::Reply(PeerMessage::Welcome {
                username: "alice".into(),
                history: vec!["> 10:00:00 alice: hi".into()],
            })
        );
    }

    #[test]
    fn only_first_welcome_is_adopted() {
        let mut node = PeerNode::new("bob", 10);
        let first = PeerMessage::Welcome {
            username: "alice".into(),
            history: vec!["> 1 alice: a".into()],
        };
        let second = PeerMessage::Welcome {
            username: "carol".into(),
            history: vec!["> 2 carol: c".into()],
        };

        assert_eq!(
            node.handle(first, false, "t"),
            PeerAction::Display(vec!["> 1 alice: a".into()])
        );
        assert_eq!(node.handle(second, false, "t"), PeerAction::Ignore);
        assert_eq!(node.history(), vec!["> 1 alice: a".to_string()]);
    }

    #[test]
    fn reject_quits() {
        let mut node = PeerNode::new("bob", 10);
        assert_eq!(node.handle(PeerMessage::Reject, false, "t"), PeerAction::Quit);
    }

    #[test]
    fn broadcasts_are_bounded_in_history() {
        let mut node = PeerNode::new("bob", 10);
        for i in 0..12 {
            node.handle(chat("amy", &i.to_string()), false, "t");
        }
        let history = node.history();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0], "> t amy: 2");
        assert_eq!(history[9], "> t amy: 11");
    }

    #[test]
    fn oversized_welcome_is_trimmed() {
        let mut node = PeerNode::new("bob", 2);
        let welcome = PeerMessage::Welcome {
            username: "alice".into(),
            history: vec!["a".into(), "b".into(), "c".into()],
        };
        node.handle(welcome, false, "t");
        assert_eq!(node.history(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn compose_uses_own_name() {
        let node = PeerNode::new("zoe", 10);
        assert_eq!(node.compose("yo"), chat("zoe", "yo"));
        assert_eq!(node.announce(), announce("zoe"));
    }
}
