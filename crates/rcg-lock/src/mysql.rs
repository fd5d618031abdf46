//! MySQL lock backend over `recargas_process_locks`.
//!
//! Mutual exclusion comes from the unique index on `lock_key`: the insert
//! either lands or fails with a duplicate-key error, and the duplicate is the
//! `Exists` signal. Expiry is enforced by `delete_expired` sweeps (the
//! manager runs one before every acquire).

use anyhow::{anyhow, Context};
use sqlx::{MySqlPool, Row};

use crate::{InsertOutcome, LockRecord, LockStore, StoreError};

pub struct MySqlLockStore {
    pool: MySqlPool,
}

impl MySqlLockStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

/// MySQL duplicate-entry (SQLSTATE 23000 / error 1062).
fn is_duplicate_key(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("23000") || db.message().contains("Duplicate entry")
        }
        _ => false,
    }
}

/// Connection-level failures mean the backend is unavailable, not that the
/// lock is contested.
fn classify(err: sqlx::Error, what: &str) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => StoreError::Unavailable(format!("{what}: {err}")),
        _ => StoreError::Other(anyhow!(err).context(what.to_string())),
    }
}

fn row_to_record(row: &sqlx::mysql::MySqlRow) -> Result<LockRecord, StoreError> {
    fn col<'r, T: sqlx::Decode<'r, sqlx::MySql> + sqlx::Type<sqlx::MySql>>(
        row: &'r sqlx::mysql::MySqlRow,
        name: &str,
    ) -> Result<T, StoreError> {
        row.try_get(name)
            .with_context(|| format!("lock row column {name}"))
            .map_err(StoreError::Other)
    }

    Ok(LockRecord {
        key: col(row, "lock_key")?,
        holder_id: col(row, "lock_id")?,
        pid: col::<i64>(row, "pid")? as u32,
        acquired_at_unix: col(row, "acquired_at")?,
        expires_at_unix: col(row, "expires_at")?,
    })
}

#[async_trait::async_trait]
impl LockStore for MySqlLockStore {
    async fn try_insert(
        &self,
        rec: &LockRecord,
        _ttl_secs: u64,
    ) -> Result<InsertOutcome, StoreError> {
        let res = sqlx::query(
            r#"
            insert into recargas_process_locks (lock_key, lock_id, pid, acquired_at, expires_at)
            values (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rec.key)
        .bind(&rec.holder_id)
        .bind(rec.pid as i64)
        .bind(rec.acquired_at_unix)
        .bind(rec.expires_at_unix)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_duplicate_key(&e) => Ok(InsertOutcome::Exists),
            Err(e) => Err(classify(e, "lock insert failed")),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            select lock_key, lock_id, pid, acquired_at, expires_at
            from recargas_process_locks
            where lock_key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(e, "lock fetch failed"))?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn delete_if_holder(&self, key: &str, holder_id: &str) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            delete from recargas_process_locks
            where lock_key = ? and lock_id = ?
            "#,
        )
        .bind(key)
        .bind(holder_id)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "lock release failed"))?;

        Ok(res.rows_affected() > 0)
    }

    async fn delete_expired(&self, now_unix: i64) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            delete from recargas_process_locks
            where expires_at <= ?
            "#,
        )
        .bind(now_unix)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "expired lock sweep failed"))?;

        Ok(res.rows_affected())
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let res = sqlx::query("delete from recargas_process_locks")
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "lock clear failed"))?;
        Ok(res.rows_affected())
    }

    async fn list(&self) -> Result<Vec<LockRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            select lock_key, lock_id, pid, acquired_at, expires_at
            from recargas_process_locks
            order by acquired_at asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "lock list failed"))?;

        rows.iter().map(row_to_record).collect()
    }

    fn backend_name(&self) -> &'static str {
        "mysql"
    }
}
