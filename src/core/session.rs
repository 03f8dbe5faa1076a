//! Session table
//!
//! Tracks proxied connections from request to close and provides
//! disconnect capability for the management API.

use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

/// Unique session identifier
pub type SessionId = u64;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Requesting = 0,
    Relaying = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Requesting,
            1 => SessionState::Relaying,
            _ => SessionState::Closed,
        }
    }
}

/// Point-in-time view of a session, as served by the API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    #[serde(rename = "clientIP")]
    pub client_ip: IpAddr,
    pub target: String,
    /// RFC 3339 timestamp
    pub start_time: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub state: SessionState,
}

/// Live counters shared between the table and the connection task
#[derive(Debug, Default)]
pub struct SessionCounters {
    /// Client -> target
    pub bytes_in: Arc<AtomicU64>,
    /// Target -> client
    pub bytes_out: Arc<AtomicU64>,
    state: AtomicU8,
}

impl SessionCounters {
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug)]
struct SessionEntry {
    client_ip: IpAddr,
    target: String,
    started_at: SystemTime,
    counters: Arc<SessionCounters>,
    cancel_token: CancellationToken,
}

impl SessionEntry {
    fn snapshot(&self, id: SessionId) -> Session {
        Session {
            id,
            client_ip: self.client_ip,
            target: self.target.clone(),
            start_time: humantime::format_rfc3339_millis(self.started_at).to_string(),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            state: self.counters.state(),
        }
    }
}

/// Handle held by the connection task that owns a session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub counters: Arc<SessionCounters>,
    pub cancel_token: CancellationToken,
}

/// Registry of active sessions
#[derive(Debug, Clone)]
pub struct SessionTable {
    next_id: Arc<AtomicU64>,
    total_created: Arc<AtomicU64>,
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            total_created: Arc::new(AtomicU64::new(0)),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Register a session in the `requesting` state
    pub fn create(&self, client_ip: IpAddr, target: String) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let counters = Arc::new(SessionCounters::default());
        let cancel_token = CancellationToken::new();

        // Entry is fully built before it becomes visible to list()
        let entry = SessionEntry {
            client_ip,
            target,
            started_at: SystemTime::now(),
            counters: Arc::clone(&counters),
            cancel_token: cancel_token.clone(),
        };
        self.sessions.insert(id, entry);
        self.total_created.fetch_add(1, Ordering::Relaxed);

        SessionHandle {
            id,
            counters,
            cancel_token,
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|entry| entry.snapshot(id))
    }

    /// Remove a session; returns false if it was already gone
    pub fn remove(&self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some((_, entry)) => {
                entry.counters.set_state(SessionState::Closed);
                true
            }
            None => false,
        }
    }

    /// Snapshot of all sessions ordered by id
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot(*entry.key()))
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Fire the session's cancellation token. The owning task removes it.
    pub fn disconnect(&self, id: SessionId) -> bool {
        match self.sessions.get(&id) {
            Some(entry) => {
                entry.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every session, returning how many were signalled
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in self.sessions.iter() {
            entry.cancel_token.cancel();
            closed += 1;
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions ever created; never decreases
    pub fn total_created(&self) -> u64 {
        self.total_created.load(Ordering::Relaxed)
    }
}
