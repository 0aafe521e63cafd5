//! Short-TTL snapshot cache for `list` queries.
//!
//! The cache has its own lock, separate from the registry map, so list
//! calls never contend with the mutation path. Every mutation bumps the
//! generation; a snapshot is served only while its generation is current
//! and its TTL has not elapsed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use fork_core::Session;

struct CachedSnapshot {
    generation: u64,
    built_at: Instant,
    sessions: Arc<Vec<Session>>,
}

/// Point-in-time copy of all sessions with a short time-to-live.
pub struct SnapshotCache {
    ttl: Duration,
    generation: AtomicU64,
    slot: Mutex<Option<CachedSnapshot>>,
}

impl SnapshotCache {
    /// Creates an empty cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            generation: AtomicU64::new(0),
            slot: Mutex::new(None),
        }
    }

    /// Returns the current generation.
    ///
    /// Read this while holding the registry read lock so it matches the
    /// data being copied.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns the cached snapshot if it is still valid.
    pub async fn get(&self) -> Option<Arc<Vec<Session>>> {
        let slot = self.slot.lock().await;
        let cached = slot.as_ref()?;
        if cached.generation != self.generation() || cached.built_at.elapsed() >= self.ttl {
            return None;
        }
        Some(Arc::clone(&cached.sessions))
    }

    /// Stores a snapshot built at `generation`.
    ///
    /// Dropped if a mutation happened after the snapshot was taken.
    pub async fn store(&self, generation: u64, sessions: Arc<Vec<Session>>) {
        let mut slot = self.slot.lock().await;
        if generation != self.generation() {
            return;
        }
        *slot = Some(CachedSnapshot {
            generation,
            built_at: Instant::now(),
            sessions,
        });
    }

    /// Marks any cached snapshot invalid immediately.
    pub async fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.slot.lock().await.take();
    }
}
