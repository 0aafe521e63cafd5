//! Session registry.
//!
//! The registry is the single owner of session state. All tasks that read
//! or mutate sessions go through one reader/writer lock; list queries are
//! served from a separate short-TTL snapshot cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   write   ┌──────────────────────────────┐
//! │ ConnectionHandler│──────────▶│ RwLock<HashMap<SessionId,    │
//! │ DiscoveryService │           │                 Session>>    │
//! └──────────────────┘           └──────────────┬───────────────┘
//!          │ list                               │ invalidate
//!          ▼                                    ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ SnapshotCache (own lock, generation + TTL)                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - Lookups of unknown sessions return `RegistryError::SessionNotFound`

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, info};

use fork_core::{Session, SessionId};

mod cache;
mod error;

pub use cache::SnapshotCache;
pub use error::{RegisterOutcome, RegistryError, RemovalReason};

/// How long a list snapshot stays valid without mutations.
pub const CACHE_TTL: Duration = Duration::from_secs(2);

struct RegistryInner {
    sessions: RwLock<HashMap<SessionId, Session>>,
    cache: SnapshotCache,
}

/// Shared, cheap-to-clone handle to the session registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry with the default cache TTL.
    pub fn new() -> Self {
        Self::with_cache_ttl(CACHE_TTL)
    }

    /// Creates an empty registry with a custom cache TTL.
    pub fn with_cache_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                cache: SnapshotCache::new(ttl),
            }),
        }
    }

    /// Upserts a session keyed by its id.
    ///
    /// An existing entry is replaced in place; its original registration
    /// time is kept.
    pub async fn register(&self, mut session: Session) -> RegisterOutcome {
        let mut sessions = self.inner.sessions.write().await;

        let outcome = match sessions.get(&session.id) {
            Some(existing) => {
                session.registered_at = existing.registered_at;
                RegisterOutcome::Replaced
            }
            None => RegisterOutcome::Created,
        };

        info!(
            session_id = %session.id,
            project = %session.project,
            services = session.services.len(),
            outcome = ?outcome,
            "Session registered"
        );

        sessions.insert(session.id.clone(), session);
        self.inner.cache.invalidate().await;
        outcome
    }

    /// Inserts a session only if no session with its id exists.
    ///
    /// This is the commit step of reconciliation: the existence check and
    /// the insert happen under one write lock, so racing callers produce
    /// exactly one entry. Returns true if the session was inserted.
    pub async fn insert_if_absent(&self, session: Session) -> bool {
        let mut sessions = self.inner.sessions.write().await;

        if sessions.contains_key(&session.id) {
            debug!(session_id = %session.id, "Session already known, skipping insert");
            return false;
        }

        info!(
            session_id = %session.id,
            project = %session.project,
            services = session.services.len(),
            "Session discovered"
        );

        sessions.insert(session.id.clone(), session);
        self.inner.cache.invalidate().await;
        true
    }

    /// Removes a session.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::SessionNotFound` if the session doesn't exist.
    pub async fn remove(
        &self,
        session_id: &SessionId,
        reason: RemovalReason,
    ) -> Result<Session, RegistryError> {
        let mut sessions = self.inner.sessions.write().await;

        let removed = sessions
            .remove(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;

        info!(
            session_id = %session_id,
            reason = %reason,
            remaining = sessions.len(),
            "Session removed"
        );

        self.inner.cache.invalidate().await;
        Ok(removed)
    }

    /// Marks a session as seen now, optionally with a new container id.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::SessionNotFound` if the session doesn't exist.
    pub async fn touch(
        &self,
        session_id: &SessionId,
        container_id: Option<&str>,
    ) -> Result<Session, RegistryError> {
        let mut sessions = self.inner.sessions.write().await;

        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;
        session.touch(container_id);
        let updated = session.clone();

        self.inner.cache.invalidate().await;
        Ok(updated)
    }

    /// Returns a copy of one session.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::SessionNotFound` if the session doesn't exist.
    pub async fn get(&self, session_id: &SessionId) -> Result<Session, RegistryError> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))
    }

    /// Returns true if a session with this id exists.
    pub async fn contains(&self, session_id: &SessionId) -> bool {
        self.inner.sessions.read().await.contains_key(session_id)
    }

    /// Lists all sessions, ordered by registration time.
    ///
    /// Served from the snapshot cache; rebuilt from memory when the cache
    /// is invalid or expired. Never touches the container runtime.
    pub async fn list(&self) -> Arc<Vec<Session>> {
        if let Some(cached) = self.inner.cache.get().await {
            return cached;
        }

        let (generation, snapshot) = {
            let sessions = self.inner.sessions.read().await;
            let generation = self.inner.cache.generation();
            (generation, sorted(sessions.values().cloned().collect()))
        };

        let snapshot = Arc::new(snapshot);
        self.inner
            .cache
            .store(generation, Arc::clone(&snapshot))
            .await;
        snapshot
    }

    /// Returns an uncached copy of all sessions, ordered by registration time.
    pub async fn snapshot(&self) -> Vec<Session> {
        let sessions = self.inner.sessions.read().await;
        sorted(sessions.values().cloned().collect())
    }

    /// Returns the ids of all sessions.
    pub async fn ids(&self) -> Vec<SessionId> {
        self.inner.sessions.read().await.keys().cloned().collect()
    }

    /// Returns the number of sessions.
    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Returns true if no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(mut sessions: Vec<Session>) -> Vec<Session> {
    sessions.sort_by(|a, b| {
        a.registered_at
            .cmp(&b.registered_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    sessions
}
