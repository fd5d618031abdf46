//! Ledger batch writer.
//!
//! One transaction per batch: the `recargas` master row, every
//! `detalle_recargas` row, and every expiry update commit or roll back as a
//! unit. The single tolerated in-transaction failure is a duplicate folio —
//! InnoDB rolls back only the failed statement, so the item folds to
//! `duplicates` (already paid and recorded by an earlier attempt) and the
//! batch keeps going. Aborting on duplicates would wedge recovery forever.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::MySqlPool;
use tracing::warn;

use rcg_pipeline::{BatchItem, BatchWriteReport, Ledger, NewMaster};
use rcg_schemas::ServiceType;

use crate::is_duplicate_key;

pub struct SqlLedger {
    pool: MySqlPool,
}

impl SqlLedger {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl Ledger for SqlLedger {
    async fn write_batch(
        &self,
        master: &NewMaster,
        items: &[BatchItem],
    ) -> Result<BatchWriteReport> {
        if items.is_empty() {
            return Err(anyhow!("write_batch called with empty batch"));
        }

        let mut tx = self.pool.begin().await.context("begin batch tx")?;

        let res = sqlx::query(
            r#"
            insert into recargas (total, fecha, notas, quien, proveedor, tipo, resumen)
            values (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(master.total)
        .bind(master.fecha_unix)
        .bind(&master.notas)
        .bind(&master.quien)
        .bind(&master.proveedor)
        .bind(&master.tipo)
        .bind(serde_json::to_value(master.resumen).context("serialize resumen")?)
        .execute(&mut *tx)
        .await
        .context("master insert failed")?;

        let master_id = res.last_insert_id();
        let mut report = BatchWriteReport {
            master_id,
            ..Default::default()
        };

        for item in items {
            let insert = sqlx::query(
                r#"
                insert into detalle_recargas
                    (id_recarga, sim, importe, dispositivo, vehiculo, detalle, folio, status)
                values (?, ?, ?, ?, ?, ?, ?, 1)
                "#,
            )
            .bind(master_id)
            .bind(&item.sim)
            .bind(item.amount)
            .bind(&item.dispositivo)
            .bind(&item.vehiculo)
            .bind(&item.detalle)
            .bind(&item.folio)
            .execute(&mut *tx)
            .await;

            match insert {
                Ok(_) => {
                    update_expiry(&mut tx, item).await?;
                    report.inserted.push(item.item_id.clone());
                }
                Err(e) if is_duplicate_key(&e) => {
                    // Already paid and recorded by a previous attempt. No
                    // expiry update: that attempt advanced it.
                    warn!(
                        sim = %item.sim,
                        folio = item.folio.as_deref().unwrap_or("-"),
                        "duplicate folio folded"
                    );
                    report.duplicates.push(item.item_id.clone());
                }
                Err(e) => {
                    // Anything else poisons the batch: roll the whole
                    // transaction back so no partial master/detail state is
                    // visible.
                    tx.rollback().await.ok();
                    return Err(anyhow!(e).context(format!("detail insert failed for {}", item.sim)));
                }
            }
        }

        tx.commit().await.context("batch commit failed")?;
        Ok(report)
    }

    async fn folio_exists(&self, folio: &str, sim: &str) -> Result<bool> {
        let (n,): (i64,) = sqlx::query_as(
            r#"
            select count(*)
            from detalle_recargas
            where folio = ? and sim = ?
            "#,
        )
        .bind(folio)
        .bind(sim)
        .fetch_one(&self.pool)
        .await
        .context("folio_exists failed")?;
        Ok(n > 0)
    }
}

/// Expiry update inside the batch transaction. `greatest(...)` keeps the
/// stored expiry monotonic even if a stale recovery item lands late.
async fn update_expiry(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    item: &BatchItem,
) -> Result<()> {
    let query = match item.service {
        ServiceType::Voz => {
            r#"
            update prepagos_automaticos
            set fecha_expira_saldo = greatest(coalesce(fecha_expira_saldo, 0), ?)
            where sim = ?
            "#
        }
        ServiceType::Gps | ServiceType::Eliot => {
            r#"
            update dispositivos
            set unix_saldo = greatest(coalesce(unix_saldo, 0), ?)
            where sim = ?
            "#
        }
    };

    sqlx::query(query)
        .bind(item.new_expiry_unix)
        .bind(&item.sim)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("expiry update failed for {}", item.sim))?;
    Ok(())
}
