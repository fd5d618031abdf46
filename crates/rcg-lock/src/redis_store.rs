//! Redis lock backend.
//!
//! The record is stored as JSON under `recargas:lock:<key>` with `SET NX PX`,
//! so mutual exclusion and expiry are both enforced server-side — a crashed
//! holder's key simply evaporates when its TTL passes, which is why
//! `delete_expired` is a no-op here. Holder-checked release runs as a Lua
//! script so the get/compare/delete cannot interleave with a takeover.

use anyhow::{anyhow, Context};
use redis::aio::ConnectionManager;
use redis::Script;

use crate::{InsertOutcome, LockRecord, LockStore, StoreError};

const KEY_PREFIX: &str = "recargas:lock:";

const RELEASE_IF_HOLDER: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local ok, rec = pcall(cjson.decode, raw)
if ok and rec.holder_id == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisLockStore {
    conn: ConnectionManager,
}

impl RedisLockStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("redis url rejected: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(format!("redis connect failed: {e}")))?;
        Ok(Self { conn })
    }

    fn redis_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        {
            let mut iter: redis::AsyncIter<String> = conn
                .scan_match(format!("{KEY_PREFIX}*"))
                .await
                .map_err(|e| classify(e, "redis scan failed"))?;
            while let Some(k) = iter.next_item().await {
                keys.push(k);
            }
        }
        Ok(keys)
    }
}

fn classify(err: redis::RedisError, what: &str) -> StoreError {
    if err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
        StoreError::Unavailable(format!("{what}: {err}"))
    } else {
        StoreError::Other(anyhow!(err).context(what.to_string()))
    }
}

#[async_trait::async_trait]
impl LockStore for RedisLockStore {
    async fn try_insert(
        &self,
        rec: &LockRecord,
        ttl_secs: u64,
    ) -> Result<InsertOutcome, StoreError> {
        let payload = serde_json::to_string(rec)
            .context("serialize lock record")
            .map_err(StoreError::Other)?;

        let mut conn = self.conn.clone();
        let res: Option<String> = redis::cmd("SET")
            .arg(Self::redis_key(&rec.key))
            .arg(payload)
            .arg("NX")
            .arg("PX")
            .arg(ttl_secs * 1_000)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, "redis SET NX failed"))?;

        Ok(match res {
            Some(_) => InsertOutcome::Inserted,
            None => InsertOutcome::Exists,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, "redis GET failed"))?;

        raw.map(|s| {
            serde_json::from_str(&s)
                .context("parse lock record")
                .map_err(StoreError::Other)
        })
        .transpose()
    }

    async fn delete_if_holder(&self, key: &str, holder_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = Script::new(RELEASE_IF_HOLDER)
            .key(Self::redis_key(key))
            .arg(holder_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| classify(e, "redis holder-checked release failed"))?;
        Ok(removed > 0)
    }

    async fn delete_expired(&self, _now_unix: i64) -> Result<u64, StoreError> {
        // PX expiry is server-side; redis already removed anything stale.
        Ok(0)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let keys = self.keys().await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, "redis DEL failed"))?;
        Ok(removed as u64)
    }

    async fn list(&self) -> Result<Vec<LockRecord>, StoreError> {
        let mut out = Vec::new();
        for key in self.keys().await? {
            let mut conn = self.conn.clone();
            let raw: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| classify(e, "redis GET failed"))?;
            if let Some(s) = raw {
                let rec: LockRecord = serde_json::from_str(&s)
                    .context("parse lock record")
                    .map_err(StoreError::Other)?;
                out.push(rec);
            }
        }
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
