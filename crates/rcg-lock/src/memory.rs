//! In-process lock store.
//!
//! Not a production backend — the configuration surface only offers redis and
//! mysql. This exists for unit tests and for the run-once harness, where a
//! real store would add nothing but setup cost.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{InsertOutcome, LockRecord, LockStore, StoreError};

#[derive(Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, LockRecord>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LockStore for MemoryLockStore {
    async fn try_insert(
        &self,
        rec: &LockRecord,
        _ttl_secs: u64,
    ) -> Result<InsertOutcome, StoreError> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        if locks.contains_key(&rec.key) {
            return Ok(InsertOutcome::Exists);
        }
        locks.insert(rec.key.clone(), rec.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        Ok(self.locks.lock().expect("lock map poisoned").get(key).cloned())
    }

    async fn delete_if_holder(&self, key: &str, holder_id: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        match locks.get(key) {
            Some(rec) if rec.holder_id == holder_id => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, now_unix: i64) -> Result<u64, StoreError> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        let before = locks.len();
        locks.retain(|_, rec| rec.expires_at_unix > now_unix);
        Ok((before - locks.len()) as u64)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        let n = locks.len() as u64;
        locks.clear();
        Ok(n)
    }

    async fn list(&self) -> Result<Vec<LockRecord>, StoreError> {
        Ok(self
            .locks
            .lock()
            .expect("lock map poisoned")
            .values()
            .cloned()
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
