use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct SessionIdAllocator {
    counter: AtomicU64,
}

impl SessionIdAllocator {
    pub fn next_id(&self) -> SessionId {
        SessionId(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    QueueFull,
    Closed,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::QueueFull => f.write_str("queue_full"),
            DeliveryError::Closed => f.write_str("closed"),
        }
    }
}

/// What the registry keeps for a joined session: identity, the sending side
/// of its outbound queue and a way to tell it to go away. Cloning a handle
/// never extends the session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    outbox: mpsc::Sender<Arc<[u8]>>,
    evict: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(id: SessionId, outbox: mpsc::Sender<Arc<[u8]>>, evict: Arc<Notify>) -> Self {
        Self { id, outbox, evict }
    }

    /// Asks the owning session to close. The permit is kept if the session is
    /// not waiting right now.
    pub fn evict(&self) {
        self.evict.notify_one();
    }

    /// Queues an encoded frame for this session's writer without waiting.
    pub fn try_deliver(&self, payload: Arc<[u8]>) -> Result<(), DeliveryError> {
        match self.outbox.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DeliveryError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub resolved_name: String,
    /// Every registered name, the new one included, sorted.
    pub roster: Vec<String>,
}

/// Display name -> session. Every operation takes the one lock, so a join's
/// collision check, insert and roster snapshot are a single step.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, requested_name: &str, handle: SessionHandle) -> Admission {
        let mut sessions = self.sessions.lock().await;
        let resolved_name = resolve_name(&sessions, requested_name);
        sessions.insert(resolved_name.clone(), handle);
        let mut roster = sessions.keys().cloned().collect::<Vec<_>>();
        roster.sort();
        Admission {
            resolved_name,
            roster,
        }
    }

    /// Removes `name` only while it still belongs to `id`. Returns whether
    /// anything was removed.
    pub async fn unregister(&self, name: &str, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(name) {
            Some(handle) if handle.id == id => {
                sessions.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<(String, SessionHandle)> {
        let sessions = self.sessions.lock().await;
        let mut entries = sessions
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Drops every entry. Only used once sessions can no longer clean up
    /// after themselves.
    pub async fn clear(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        sessions.clear();
        count
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names = self.sessions.lock().await.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

/// Smallest `name{k}` (k >= 1) not already taken, or `name` itself if free.
fn resolve_name(sessions: &HashMap<String, SessionHandle>, requested: &str) -> String {
    if !sessions.contains_key(requested) {
        return requested.to_string();
    }
    let mut suffix: u64 = 1;
    loop {
        let candidate = format!("{requested}{suffix}");
        if !sessions.contains_key(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}
