//! Per-service recharge pipeline.
//!
//! The runner orchestrates one tick: lock → recovery drain → eligibility →
//! filter → provider selection → serial dispatch → one batch write →
//! verified queue cleanup → release. The storage collaborators sit behind
//! the [`Ledger`] and [`EligibilitySource`] traits defined here, so the
//! whole state machine runs identically against MySQL and against the
//! in-memory fakes the scenario tests use.

use anyhow::Result;
use async_trait::async_trait;

use rcg_schemas::{Candidate, RechargeSummary, ServiceType};

pub mod filter;
pub mod notes;
pub mod runner;
pub mod strategy;

pub use filter::{classify, FilterOutcome, FilterParams};
pub use notes::{format_detail_text, format_master_note, MasterNoteArgs, VozDetailNote};
pub use runner::{BatchOutcome, Pipeline, RecoveryStats, TickOutcome, TickReport};
pub use strategy::{ChargePlan, ServiceStrategy};

/// Ledger operator recorded on every master row.
pub const OPERATOR: &str = "mextic.app";

// ---------------------------------------------------------------------------
// Eligibility seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EligibilityParams {
    /// Upper idle window in days; rows idle longer are abandoned.
    pub days_limit: i64,
    /// Candidates must expire at or before this unix second.
    pub end_of_tomorrow_unix: i64,
    /// `YYYY-MM-DD` in the operator timezone, for the recharged-today
    /// exclusion.
    pub today: String,
}

#[async_trait]
pub trait EligibilitySource: Send + Sync {
    async fn candidates(
        &self,
        service: ServiceType,
        params: &EligibilityParams,
    ) -> Result<Vec<Candidate>>;
}

// ---------------------------------------------------------------------------
// Ledger seam
// ---------------------------------------------------------------------------

/// Master row to insert, fully formatted. The writer never edits these
/// fields.
#[derive(Debug, Clone)]
pub struct NewMaster {
    pub total: i64,
    pub fecha_unix: i64,
    pub notas: String,
    pub quien: String,
    pub proveedor: String,
    /// `rastreo` or `paquete`.
    pub tipo: String,
    pub resumen: RechargeSummary,
}

/// One detail row plus the expiry update that must commit with it.
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Queue item id, echoed back in the report.
    pub item_id: String,
    pub service: ServiceType,
    pub sim: String,
    pub amount: i64,
    pub dispositivo: String,
    pub vehiculo: String,
    pub detalle: String,
    pub folio: Option<String>,
    /// Applied inside the same transaction, never decreasing the stored
    /// expiry. Duplicate-folio items skip this update.
    pub new_expiry_unix: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BatchWriteReport {
    pub master_id: u64,
    /// Queue item ids whose detail row landed.
    pub inserted: Vec<String>,
    /// Queue item ids folded on a duplicate folio (already paid and
    /// recorded by an earlier attempt — counted as success, no expiry
    /// change).
    pub duplicates: Vec<String>,
}

/// Single-transaction master+detail writer plus the post-commit existence
/// check the queue cleanup relies on.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert exactly one master row and one detail row per item inside one
    /// transaction. A duplicate folio folds that item to `duplicates` and
    /// the transaction continues; any other error rolls everything back.
    async fn write_batch(&self, master: &NewMaster, items: &[BatchItem])
        -> Result<BatchWriteReport>;

    /// Post-commit verification by `(folio, sim)`. Queue items may only be
    /// removed once this returns true.
    async fn folio_exists(&self, folio: &str, sim: &str) -> Result<bool>;
}
