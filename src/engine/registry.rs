use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::session::DispatchSession;

/// A session behind its per-ride lock. Every mutation of one ride's
/// session goes through this mutex; different rides never share one.
pub type SessionHandle = Arc<Mutex<DispatchSession>>;

/// Live dispatch sessions keyed by ride id.
///
/// Entries are lost on restart; the stale-ride sweeper cleans up the rides
/// they leave behind.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn put(&self, ride_id: Uuid, session: SessionHandle);

    async fn get(&self, ride_id: Uuid) -> Option<SessionHandle>;

    async fn remove(&self, ride_id: Uuid) -> Option<SessionHandle>;

    async fn snapshot(&self) -> Vec<(Uuid, SessionHandle)>;

    async fn len(&self) -> usize;
}

#[derive(Default)]
pub struct InMemorySessionRegistry {
    sessions: DashMap<Uuid, SessionHandle>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn put(&self, ride_id: Uuid, session: SessionHandle) {
        self.sessions.insert(ride_id, session);
    }

    async fn get(&self, ride_id: Uuid) -> Option<SessionHandle> {
        self.sessions.get(&ride_id).map(|entry| entry.value().clone())
    }

    async fn remove(&self, ride_id: Uuid) -> Option<SessionHandle> {
        self.sessions.remove(&ride_id).map(|(_, session)| session)
    }

    async fn snapshot(&self) -> Vec<(Uuid, SessionHandle)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    async fn len(&self) -> usize {
        self.sessions.len()
    }
}
