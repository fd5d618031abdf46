use chrono::Utc;

use crate::{log_acquired, log_conflict, InsertOutcome, LockRecord, SharedLockStore, StoreError};

/// Result of one acquire attempt. Backend failures are folded in rather than
/// returned as `Err` — every variant except `Acquired` means "skip this
/// tick", and the caller decides how loudly to log it.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Acquired {
        key: String,
        backend: &'static str,
    },
    /// Held by another process; no stealing.
    Exists {
        owner: Option<String>,
        age_seconds: i64,
        expires_in_seconds: i64,
    },
    BackendUnavailable {
        reason: String,
    },
    BackendError {
        reason: String,
    },
}

impl AcquireOutcome {
    pub fn acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HeldInfo {
    pub holder_id: String,
    pub age_seconds: i64,
    pub expires_in_seconds: i64,
}

/// Facade the pipelines talk to. One instance per process; the holder id
/// identifies this process in lock records and release checks.
#[derive(Clone)]
pub struct LockManager {
    store: SharedLockStore,
    holder_id: String,
}

impl LockManager {
    pub fn new(store: SharedLockStore, holder_id: impl Into<String>) -> Self {
        Self {
            store,
            holder_id: holder_id.into(),
        }
    }

    /// Process-scoped holder id: `<hostname-ish>-<pid>-<uuid>`.
    pub fn default_holder_id() -> String {
        format!(
            "recargas-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        )
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub async fn acquire(&self, key: &str, ttl_secs: u64) -> AcquireOutcome {
        let now = Utc::now().timestamp();

        // Sweep first so a crashed holder's stale lock cannot block forever.
        if let Err(e) = self.store.delete_expired(now).await {
            return Self::outcome_from_store_error(e);
        }

        let rec = LockRecord {
            key: key.to_string(),
            holder_id: self.holder_id.clone(),
            pid: std::process::id(),
            acquired_at_unix: now,
            expires_at_unix: now + ttl_secs as i64,
        };

        match self.store.try_insert(&rec, ttl_secs).await {
            Ok(InsertOutcome::Inserted) => {
                log_acquired(&rec, self.store.backend_name());
                AcquireOutcome::Acquired {
                    key: key.to_string(),
                    backend: self.store.backend_name(),
                }
            }
            Ok(InsertOutcome::Exists) => {
                let existing = self.store.get(key).await.ok().flatten();
                log_conflict(key, existing.as_ref(), now);
                AcquireOutcome::Exists {
                    owner: existing.as_ref().map(|r| r.holder_id.clone()),
                    age_seconds: existing
                        .as_ref()
                        .map(|r| now - r.acquired_at_unix)
                        .unwrap_or(0),
                    expires_in_seconds: existing
                        .as_ref()
                        .map(|r| r.expires_at_unix - now)
                        .unwrap_or(0),
                }
            }
            Err(e) => Self::outcome_from_store_error(e),
        }
    }

    /// Idempotent; only removes the lock if this manager's holder id still
    /// owns it.
    pub async fn release(&self, key: &str) -> Result<bool, StoreError> {
        self.store.delete_if_holder(key, &self.holder_id).await
    }

    pub async fn is_held(&self, key: &str) -> Result<Option<HeldInfo>, StoreError> {
        let now = Utc::now().timestamp();
        let rec = self.store.get(key).await?;
        Ok(rec.filter(|r| r.expires_at_unix > now).map(|r| HeldInfo {
            holder_id: r.holder_id.clone(),
            age_seconds: now - r.acquired_at_unix,
            expires_in_seconds: r.expires_at_unix - now,
        }))
    }

    pub async fn sweep_expired(&self) -> Result<u64, StoreError> {
        self.store.delete_expired(Utc::now().timestamp()).await
    }

    /// Operator escape hatch: remove every lock in the store.
    pub async fn force_clear(&self) -> Result<u64, StoreError> {
        self.store.delete_all().await
    }

    /// Release every lock this holder still owns (graceful shutdown).
    pub async fn release_all(&self) -> Result<u64, StoreError> {
        let mut released = 0u64;
        for rec in self.store.list().await? {
            if rec.holder_id == self.holder_id
                && self.store.delete_if_holder(&rec.key, &self.holder_id).await?
            {
                released += 1;
            }
        }
        Ok(released)
    }

    pub async fn list(&self) -> Result<Vec<LockRecord>, StoreError> {
        self.store.list().await
    }

    fn outcome_from_store_error(e: StoreError) -> AcquireOutcome {
        match e {
            StoreError::Unavailable(reason) => AcquireOutcome::BackendUnavailable { reason },
            StoreError::Other(err) => AcquireOutcome::BackendError {
                reason: err.to_string(),
            },
        }
    }
}
