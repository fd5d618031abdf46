//! Distributed named locks for the per-service pipelines.
//!
//! One lock per service type, held across processes through either a Redis
//! keyspace or the `recargas_process_locks` MySQL table. The backend is
//! chosen once at startup and never mixed: falling back silently from one
//! backend to the other would let two processes hold "the same" lock in
//! different stores, which is a double-charge risk.
//!
//! # Acquire protocol
//!
//! 1. `delete_expired` sweeps stale rows/keys so a crashed holder cannot
//!    block forever.
//! 2. Atomic insert-if-absent of `{holder_id, pid, acquired_at, expires_at}`.
//! 3. On conflict the existing owner is reported (age + remaining TTL), never
//!    stolen.
//!
//! Release only deletes when `holder_id` matches, so a process whose lock
//! expired and was taken over cannot release the new owner's lock.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

mod manager;
pub mod memory;
pub mod mysql;
pub mod redis_store;

pub use manager::{AcquireOutcome, HeldInfo, LockManager};
pub use memory::MemoryLockStore;
pub use mysql::MySqlLockStore;
pub use redis_store::RedisLockStore;

/// Errors a lock backend can surface. `Unavailable` means the store itself is
/// unreachable (connection refused, pool exhausted); pipelines treat both
/// variants as "skip this tick" but alert on them differently.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One live lock as persisted by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub holder_id: String,
    pub pid: u32,
    pub acquired_at_unix: i64,
    pub expires_at_unix: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key is already held by an unexpired lock.
    Exists,
}

/// Storage backend for named locks.
///
/// `try_insert` must be atomic insert-if-absent; everything else can be
/// best-effort. `ttl_secs` is passed separately because the Redis backend
/// enforces expiry server-side (PX) while MySQL stores `expires_at_unix` and
/// relies on `delete_expired` sweeps.
#[async_trait::async_trait]
pub trait LockStore: Send + Sync {
    async fn try_insert(&self, rec: &LockRecord, ttl_secs: u64) -> Result<InsertOutcome, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError>;
    /// Delete only if `holder_id` matches. Returns whether a lock was removed.
    async fn delete_if_holder(&self, key: &str, holder_id: &str) -> Result<bool, StoreError>;
    /// Remove locks whose `expires_at_unix` has passed. Returns count removed.
    async fn delete_expired(&self, now_unix: i64) -> Result<u64, StoreError>;
    /// Remove every lock regardless of holder or expiry (operator tool).
    async fn delete_all(&self) -> Result<u64, StoreError>;
    async fn list(&self) -> Result<Vec<LockRecord>, StoreError>;
    fn backend_name(&self) -> &'static str;
}

pub type SharedLockStore = Arc<dyn LockStore>;

pub(crate) fn log_acquired(rec: &LockRecord, backend: &str) {
    info!(
        key = %rec.key,
        holder = %rec.holder_id,
        pid = rec.pid,
        expires_at = rec.expires_at_unix,
        backend,
        "lock acquired"
    );
}

pub(crate) fn log_conflict(key: &str, existing: Option<&LockRecord>, now_unix: i64) {
    match existing {
        Some(rec) => warn!(
            key,
            owner = %rec.holder_id,
            owner_pid = rec.pid,
            age_seconds = now_unix - rec.acquired_at_unix,
            expires_in_seconds = rec.expires_at_unix - now_unix,
            "lock already held"
        ),
        None => warn!(key, "lock already held (owner raced away before read)"),
    }
}
