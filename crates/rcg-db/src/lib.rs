//! MySQL access for the recharge engine.
//!
//! All SQL lives in this crate: the ledger batch writer, the per-service
//! eligibility queries, and the connectivity/status helpers the CLI uses.
//! Lock-table SQL is the one exception — the MySQL lock backend owns its own
//! statements (see `rcg-lock`), because the locking protocol is the backend,
//! not shared data access.

use anyhow::{Context, Result};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

pub mod eligibility;
pub mod ledger;

pub use eligibility::SqlEligibility;
pub use ledger::SqlLedger;

pub const ENV_DB_URL: &str = "RCG_DATABASE_URL";

/// Connect to MySQL using RCG_DATABASE_URL.
pub async fn connect_from_env() -> Result<MySqlPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to MySQL")?;

    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using RCG_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<MySqlPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &MySqlPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &MySqlPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select count(*)
        from information_schema.tables
        where table_schema = database() and table_name = 'recargas'
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_recargas_table: exists > 0,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_recargas_table: bool,
}

/// Successful detail rows written today (operator `status` output).
pub async fn count_recharges_today(pool: &MySqlPool, today: &str) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)
        from detalle_recargas dr
        join recargas r on r.id = dr.id_recarga
        where dr.status = 1
          and date(from_unixtime(r.fecha)) = ?
        "#,
    )
    .bind(today)
    .fetch_one(pool)
    .await
    .context("count_recharges_today failed")?;
    Ok(n)
}

/// MySQL duplicate-entry (SQLSTATE 23000 / error 1062).
pub(crate) fn is_duplicate_key(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("23000") || db.message().contains("Duplicate entry")
        }
        _ => false,
    }
}
