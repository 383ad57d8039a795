//! Registry of live sessions.
//!
//! Every connection reserves a [`SessionSlot`] before its shell is launched
//! and holds it until the session has been torn down. Dropping the slot
//! frees the capacity and removes the session's entry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;

use super::pty::SessionId;

/// Information about a live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Remote address of the client.
    pub peer: Option<SocketAddr>,
    /// Terminal columns at launch.
    pub cols: u16,
    /// Terminal rows at launch.
    pub rows: u16,
    /// When the shell was launched.
    pub started_at: SystemTime,
}

/// Concurrent map of live sessions with an optional capacity limit.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionInfo>,
    reserved: AtomicUsize,
    /// Maximum concurrent sessions; 0 means unlimited.
    limit: usize,
}

impl SessionRegistry {
    /// Creates a registry allowing `limit` concurrent sessions (0 = unlimited).
    pub fn new(limit: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            limit,
        }
    }

    /// Reserves capacity for one session.
    ///
    /// Returns `None` when the registry is full.
    pub fn try_reserve(self: &Arc<Self>) -> Option<SessionSlot> {
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            if self.limit != 0 && current >= self.limit {
                return None;
            }
            match self.reserved.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Some(SessionSlot {
            registry: Arc::clone(self),
            id: None,
        })
    }

    /// Returns the capacity limit (0 = unlimited).
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the number of reserved slots, launched or not.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Returns the number of running sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Lists all running sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|info| info.started_at);
        sessions
    }
}

/// A reserved place in the [`SessionRegistry`].
#[derive(Debug)]
pub struct SessionSlot {
    registry: Arc<SessionRegistry>,
    id: Option<SessionId>,
}

impl SessionSlot {
    /// Records the launched session in this slot.
    pub fn register(&mut self, info: SessionInfo) {
        if let Some(previous) = self.id.replace(info.id.clone()) {
            self.registry.sessions.remove(&previous);
        }
        self.registry.sessions.insert(info.id.clone(), info);
    }

    /// Returns the ID of the session held by this slot.
    pub fn id(&self) -> Option<&SessionId> {
        self.id.as_ref()
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.registry.sessions.remove(&id);
        }
        self.registry.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}
