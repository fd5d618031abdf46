//! Per-service eligibility queries.
//!
//! Each service reads a different shape:
//!
//! - GPS / ELIOT: prepaid tracker rows from `dispositivos`, filtered by the
//!   `servicio` tag, with the last-telemetry timestamp for the idle math.
//! - VOZ: subscriber rows from `prepagos_automaticos` with their package
//!   code. No telemetry concept.
//!
//! Rows already recharged today are excluded here, at SQL level, so a tick
//! that runs twice in one day cannot double-charge even before the folio
//! guard. Idle minutes are derived in Rust from the raw timestamp — the
//! float division stays out of the SQL so the window parameters bind as
//! plain integers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{MySqlPool, Row};

use rcg_clock::OperatorClock;
use rcg_pipeline::{EligibilityParams, EligibilitySource};
use rcg_schemas::{Candidate, ServiceType};

pub struct SqlEligibility {
    pool: MySqlPool,
    clock: OperatorClock,
}

impl SqlEligibility {
    pub fn new(pool: MySqlPool, clock: OperatorClock) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl EligibilitySource for SqlEligibility {
    async fn candidates(
        &self,
        service: ServiceType,
        params: &EligibilityParams,
    ) -> Result<Vec<Candidate>> {
        match service {
            ServiceType::Gps | ServiceType::Eliot => {
                self.tracker_candidates(service, params).await
            }
            ServiceType::Voz => self.voz_candidates(params).await,
        }
    }
}

impl SqlEligibility {
    async fn tracker_candidates(
        &self,
        service: ServiceType,
        params: &EligibilityParams,
    ) -> Result<Vec<Candidate>> {
        let now_unix = self.clock.now_unix();
        let min_report_unix = now_unix - params.days_limit * 86_400;

        let rows = sqlx::query(
            r#"
            select d.sim, d.descripcion, d.empresa, d.dispositivo,
                   d.unix_saldo, d.unix_ultimo_reporte
            from dispositivos d
            where d.servicio = ?
              and d.prepago = 1
              and d.status = 1
              and d.unix_saldo is not null
              and d.unix_saldo <= ?
              and d.unix_ultimo_reporte is not null
              and d.unix_ultimo_reporte >= ?
              and not exists (
                  select 1
                  from detalle_recargas dr
                  join recargas r on r.id = dr.id_recarga
                  where dr.sim = d.sim
                    and dr.status = 1
                    and date(from_unixtime(r.fecha)) = ?
              )
            order by d.unix_saldo asc
            "#,
        )
        .bind(service.as_str())
        .bind(params.end_of_tomorrow_unix)
        .bind(min_report_unix)
        .bind(&params.today)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("{service} eligibility query failed"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let last_report: i64 = row.try_get("unix_ultimo_reporte")?;
            out.push(Candidate {
                sim: row.try_get("sim")?,
                descripcion: row.try_get("descripcion")?,
                empresa: row.try_get("empresa")?,
                dispositivo: row.try_get("dispositivo")?,
                unix_saldo: row.try_get("unix_saldo")?,
                idle_minutes: self.clock.minutes_since(last_report),
                codigo_paquete: None,
            });
        }
        Ok(out)
    }

    async fn voz_candidates(&self, params: &EligibilityParams) -> Result<Vec<Candidate>> {
        let rows = sqlx::query(
            r#"
            select pa.sim, pa.descripcion, pa.empresa, pa.codigo_paquete,
                   pa.fecha_expira_saldo
            from prepagos_automaticos pa
            where pa.status = 1
              and pa.fecha_expira_saldo is not null
              and pa.fecha_expira_saldo <= ?
              and not exists (
                  select 1
                  from detalle_recargas dr
                  join recargas r on r.id = dr.id_recarga
                  where dr.sim = pa.sim
                    and dr.status = 1
                    and date(from_unixtime(r.fecha)) = ?
              )
            order by pa.fecha_expira_saldo asc
            "#,
        )
        .bind(params.end_of_tomorrow_unix)
        .bind(&params.today)
        .fetch_all(&self.pool)
        .await
        .context("VOZ eligibility query failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let sim: String = row.try_get("sim")?;
            out.push(Candidate {
                descripcion: row.try_get("descripcion")?,
                empresa: row.try_get("empresa")?,
                dispositivo: sim.clone(),
                sim,
                unix_saldo: row.try_get("fecha_expira_saldo")?,
                idle_minutes: 0.0,
                codigo_paquete: row.try_get("codigo_paquete")?,
            });
        }
        Ok(out)
    }
}
