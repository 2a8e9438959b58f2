//! Live connection registry.
//!
//! Each accepted connection registers a session. The I/O layer publishes
//! transfer progress into it, and the stats listener reads snapshots. The
//! registry map is only mutated on accept and teardown.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::protocol::MessageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Operation {
    kind: Option<MessageType>,
    path: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// Progress of one connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    operation: Mutex<Operation>,
    offset: AtomicU64,
    bytes: AtomicU64,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            operation: Mutex::new(Operation {
                kind: None,
                path: String::new(),
                started_at: Utc::now(),
                started: Instant::now(),
            }),
            offset: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn operation(&self) -> MutexGuard<'_, Operation> {
        self.operation.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the operation this connection is serving.
    pub fn begin(&self, kind: MessageType, path: &str) {
        let mut op = self.operation();
        op.kind = Some(kind);
        op.path = path.to_string();
        op.started_at = Utc::now();
        op.started = Instant::now();
    }

    pub fn kind(&self) -> Option<MessageType> {
        self.operation().kind
    }

    /// Publish a stream offset. The published value never moves backward,
    /// even when several streams of one operation report concurrently.
    pub fn publish_offset(&self, offset: u64) {
        self.offset.fetch_max(offset, Ordering::AcqRel);
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let op = self.operation().clone();
        SessionSnapshot {
            id: self.id,
            kind: op.kind,
            path: op.path,
            started_at: op.started_at,
            elapsed_ms: op.started.elapsed().as_millis() as u64,
            offset: self.offset(),
            bytes: self.bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub kind: Option<MessageType>,
    pub path: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub offset: u64,
    pub bytes: u64,
}

impl fmt::Display for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.map(MessageType::name).unwrap_or("IDLE");
        write!(
            f,
            "{} | {} | {} | {} | {}",
            self.id,
            kind,
            self.path,
            self.bytes,
            self.started_at.to_rfc3339()
        )
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new session; it is removed when the guard drops.
    pub fn register(self: &Arc<Self>) -> SessionGuard {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let session = Arc::new(Session::new(id));
        self.sessions().insert(id, Arc::clone(&session));
        SessionGuard {
            registry: Arc::clone(self),
            session,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live sessions ordered by id.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<_> = self.sessions().values().cloned().collect();
        let mut snaps: Vec<_> = sessions.iter().map(|s| s.snapshot()).collect();
        snaps.sort_by_key(|s| s.id);
        snaps
    }

    /// Paths currently being written by live Put sessions. Their multipart
    /// uploads are in flight, not orphaned.
    pub fn active_write_paths(&self) -> HashSet<String> {
        self.snapshot()
            .into_iter()
            .filter(|s| {
                matches!(
                    s.kind,
                    Some(MessageType::Put | MessageType::PutV2 | MessageType::PutV3)
                )
            })
            .map(|s| s.path)
            .collect()
    }
}

/// Owning handle of a registered session.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
}

impl SessionGuard {
    /// Shared handle for the I/O layer.
    pub fn handle(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.sessions().remove(&self.session.id);
        let snap = self.session.snapshot();
        if let Some(kind) = snap.kind {
            tracing::info!(
                session = %snap.id,
                op = %kind,
                path = %snap.path,
                bytes = snap.bytes,
                elapsed_ms = snap.elapsed_ms,
                "session closed"
            );
        }
    }
}
