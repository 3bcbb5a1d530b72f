//! Shared room state: who is here, what was said recently.
//!
//! Everything lives in one aggregate behind one lock. Admission and
//! append-then-broadcast each run as a single critical section, which is what
//! gives every recipient the same order as history and guarantees a newcomer
//! sees its history frame before any live broadcast. No network I/O happens
//! under the lock: frames are only pushed into per-session queues.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chat_wire::{ChatMessage, ServerFrame};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::broadcast::Broadcaster;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::history::History;
use crate::metrics::RelayMetrics;
use crate::session::{Outbound, Session, SessionId};

const FALLBACK_TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug)]
struct RoomState {
    usernames: HashSet<String>,
    history: History<ChatMessage>,
    sessions: HashMap<String, Session>,
}

impl RoomState {
    fn take(&mut self, username: &str) -> Option<Session> {
        self.usernames.remove(username);
        self.sessions.remove(username)
    }

    fn ordered_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(Session::id);
        sessions
    }
}

/// A newly admitted session plus the receiving end of its outbound queue.
///
/// The queue already holds the positive admission reply and the history
/// replay, in that order.
#[derive(Debug)]
pub struct Admitted {
    pub session: Session,
    pub outbound: mpsc::Receiver<Outbound>,
}

#[derive(Debug)]
pub struct RoomRegistry {
    state: Mutex<RoomState>,
    broadcaster: Broadcaster,
    time_format: String,
    outbound_capacity: usize,
    next_session_id: AtomicU64,
    metrics: Arc<RelayMetrics>,
}

impl RoomRegistry {
    pub fn new(config: &RelayConfig, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            state: Mutex::new(RoomState {
                usernames: HashSet::new(),
                history: History::new(config.history_capacity),
                sessions: HashMap::new(),
            }),
            broadcaster: Broadcaster::new(metrics.clone()),
            time_format: config.time_format.clone(),
            outbound_capacity: config.outbound_queue.max(2),
            next_session_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Atomically reserve `username` and create its session.
    pub async fn try_admit(&self, username: &str) -> Result<Admitted, RelayError> {
        if username.is_empty() {
            self.metrics.rejected();
            return Err(RelayError::EmptyUsername);
        }

        let mut state = self.state.lock().await;
        if state.usernames.contains(username) {
            self.metrics.rejected();
            return Err(RelayError::NameCollision(username.to_string()));
        }

        // Ids are assigned under the lock so that id order is admission order.
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let (session, outbound) = Session::new(id, username, self.outbound_capacity);

        let admission = ServerFrame::Admission(true)
            .encode()
            .map_err(RelayError::Encode)?;
        let history = ServerFrame::History(state.history.to_vec())
            .encode()
            .map_err(RelayError::Encode)?;
        // Capacity is at least 2, so a fresh queue always takes both frames.
        session.try_send(admission.into())?;
        session.try_send(history.into())?;

        state.usernames.insert(username.to_string());
        state.sessions.insert(username.to_string(), session.clone());
        drop(state);

        self.metrics.admitted();
        info!(username = %username, session = %id, "admitted");
        Ok(Admitted { session, outbound })
    }

    /// Remove whatever session holds `username`. Idempotent.
    pub async fn remove(&self, username: &str) -> Option<Session> {
        let removed = self.state.lock().await.take(username);
        if let Some(session) = &removed {
            session.close();
            info!(username = %username, session = %session.id(), "removed");
        }
        removed
    }

    /// Remove `session` only if it is still the live holder of its username.
    ///
    /// A stale handle never evicts a newer session that reuses the name.
    pub async fn remove_session(&self, session: &Session) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            let current = state.sessions.get(session.username()).map(Session::id);
            if current == Some(session.id()) {
                state.take(session.username())
            } else {
                None
            }
        };
        session.close();
        match removed {
            Some(_) => {
                info!(username = %session.username(), session = %session.id(), "removed");
                true
            }
            None => false,
        }
    }

    /// Append to history. Returns true if the oldest entry was evicted.
    pub async fn append_history(&self, message: ChatMessage) -> bool {
        let evicted = self.state.lock().await.history.push(message);
        if evicted {
            self.metrics.history_evicted();
        }
        evicted
    }

    /// Live sessions in admission order.
    pub async fn snapshot_sessions(&self) -> Vec<Session> {
        self.state.lock().await.ordered_sessions()
    }

    /// Stamp, attribute, record and fan out one chat line from `session`.
    ///
    /// Recipients whose queue refused the frame are removed once the lock is
    /// released.
    pub async fn post(&self, session: &Session, text: String) -> Result<ChatMessage, RelayError> {
        let mut state = self.state.lock().await;
        let live = state.sessions.get(session.username()).map(Session::id);
        if live != Some(session.id()) {
            return Err(RelayError::SessionClosed(session.username().to_string()));
        }

        let message = ChatMessage::new(self.stamp(), session.username(), text);
        let recipients = state.ordered_sessions();
        let failed = self.broadcaster.deliver(&message, &recipients)?;
        if state.history.push(message.clone()) {
            self.metrics.history_evicted();
        }
        drop(state);

        for dead in &failed {
            if self.remove_session(dead).await {
                self.metrics.session_dropped();
            }
        }
        debug!(
            username = %session.username(),
            recipients = recipients.len() - failed.len(),
            "relayed"
        );
        Ok(message)
    }

    /// Current history, oldest first.
    pub async fn history(&self) -> Vec<ChatMessage> {
        self.state.lock().await.history.to_vec()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    fn stamp(&self) -> String {
        let now = chrono::Local::now();
        let mut out = String::new();
        if write!(out, "{}", now.format(&self.time_format)).is_err() {
            out.clear();
            out.push_str(&now.format(FALLBACK_TIME_FORMAT).to_string());
        }
        out
    }
}
