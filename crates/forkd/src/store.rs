//! Durable counter state.
//!
//! The only state that survives a daemon restart is one monotonically
//! increasing counter used to hand out sequential identifiers. Sessions
//! are never persisted; discovery rebuilds them on every start.
//!
//! # Durability
//!
//! Every increment schedules an asynchronous, best-effort write. The
//! caller never waits for it and a failed write is only logged, so a
//! crash between an increment and its write can hand out the same id
//! again after restart. Writes are serialized and always persist the
//! latest in-memory value, so overlapping writes never move the file
//! backwards. `flush` is awaited on shutdown.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;

/// Counter value used when no state file exists.
pub const INITIAL_ID: u64 = 1;

/// On-disk record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CounterState {
    next_id: u64,
}

/// Errors from persisting counter state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("state writer task failed: {0}")]
    Join(String),
}

struct StoreInner {
    path: PathBuf,
    next_id: AtomicU64,
    write_lock: Mutex<()>,
}

/// Persistent sequential-id counter.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// Loads the counter from `path`, defaulting to `INITIAL_ID` when the
    /// file is missing or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let next_id = read_state(&path).unwrap_or(INITIAL_ID);

        info!(path = %path.display(), next_id, "Counter state loaded");

        Self {
            inner: Arc::new(StoreInner {
                path,
                next_id: AtomicU64::new(next_id),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Returns the value the next call to `next_id` will hand out.
    pub fn peek(&self) -> u64 {
        self.inner.next_id.load(Ordering::Acquire)
    }

    /// Hands out the next identifier and schedules a background write.
    pub fn next_id(&self) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        self.persist_in_background();
        id
    }

    /// Writes the current value and waits for the write to finish.
    pub async fn flush(&self) -> Result<(), StoreError> {
        persist(&self.inner).await
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn persist_in_background(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = persist(&inner).await {
                warn!(error = %e, "Failed to persist counter state");
            }
        });
    }
}

async fn persist(inner: &Arc<StoreInner>) -> Result<(), StoreError> {
    let _guard = inner.write_lock.lock().await;

    // Read under the write lock so the latest value always lands last.
    let state = CounterState {
        next_id: inner.next_id.load(Ordering::Acquire),
    };
    let bytes = serde_json::to_vec_pretty(&state)?;
    let path = inner.path.clone();

    tokio::task::spawn_blocking(move || {
        write_atomic(&path, &bytes).map_err(|source| StoreError::Io { path, source })
    })
    .await
    .map_err(|e| StoreError::Join(e.to_string()))??;

    debug!(next_id = state.next_id, "Counter state persisted");
    Ok(())
}

fn read_state(path: &Path) -> Option<u64> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read counter state");
            return None;
        }
    };

    match serde_json::from_str::<CounterState>(&contents) {
        Ok(state) => Some(state.next_id.max(INITIAL_ID)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt counter state, starting over");
            None
        }
    }
}
