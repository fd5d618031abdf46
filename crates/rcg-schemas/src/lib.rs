//! Shared domain types for the recharge engine.
//!
//! Everything that crosses a crate boundary lives here: the service tag, the
//! candidate rows produced by the eligibility queries, the normalized
//! webservice call result, and the durable auxiliary-queue item. The queue
//! item is the crash-recovery envelope: its serde shape is the on-disk
//! journal format, so renames here are format changes.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Service type
// ---------------------------------------------------------------------------

/// One pipeline per service type. The tag selects the eligibility SQL, the
/// scheduling rule, the amount/duration defaults, and the queue namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    #[serde(rename = "GPS")]
    Gps,
    #[serde(rename = "VOZ")]
    Voz,
    #[serde(rename = "ELIOT")]
    Eliot,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Gps => "GPS",
            ServiceType::Voz => "VOZ",
            ServiceType::Eliot => "ELIOT",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GPS" => Ok(ServiceType::Gps),
            "VOZ" => Ok(ServiceType::Voz),
            "ELIOT" => Ok(ServiceType::Eliot),
            other => Err(anyhow!("invalid service type: {}", other)),
        }
    }

    /// Ledger `tipo` column value for this service.
    pub fn ledger_kind(&self) -> &'static str {
        match self {
            ServiceType::Gps => "rastreo",
            ServiceType::Voz | ServiceType::Eliot => "paquete",
        }
    }

    /// Queue item `kind` tag, e.g. `GPS_recharge`.
    pub fn queue_kind(&self) -> String {
        format!("{}_recharge", self.as_str())
    }

    pub fn all() -> [ServiceType; 3] {
        [ServiceType::Gps, ServiceType::Voz, ServiceType::Eliot]
    }

    /// GPS and ELIOT devices report telemetry; VOZ subscribers do not.
    pub fn has_telemetry(&self) -> bool {
        matches!(self, ServiceType::Gps | ServiceType::Eliot)
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderName {
    #[serde(rename = "TAECEL")]
    Taecel,
    #[serde(rename = "MST")]
    Mst,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Taecel => "TAECEL",
            ProviderName::Mst => "MST",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient balance probe result. `available = false` marks a provider whose
/// probe failed (credentials, transport) — it never receives dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderBalance {
    pub name: ProviderName,
    pub balance: f64,
    pub available: bool,
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// Denormalized eligibility row. `idle_minutes` is zero for VOZ (no
/// telemetry concept); `codigo_paquete` is `Some` only for VOZ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub sim: String,
    pub descripcion: String,
    pub empresa: String,
    pub dispositivo: String,
    /// Current expiry, unix seconds.
    pub unix_saldo: i64,
    pub idle_minutes: f64,
    pub codigo_paquete: Option<String>,
}

// ---------------------------------------------------------------------------
// Webservice call result
// ---------------------------------------------------------------------------

/// Common shape both provider clients normalize into. `folio` is the
/// duplicate-detection anchor across the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebserviceCallResult {
    pub success: bool,
    pub provider: ProviderName,
    pub trans_id: String,
    pub folio: String,
    /// Whole pesos.
    pub amount: i64,
    pub carrier: String,
    pub date_str: String,
    pub final_balance: String,
    pub timeout: String,
    pub ip: String,
    pub note: String,
    pub raw_response: Value,
}

// ---------------------------------------------------------------------------
// VOZ package catalog
// ---------------------------------------------------------------------------

/// One entry of the fixed VOZ package catalog (code → PSL/days/amount/label).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDef {
    pub psl: String,
    pub days: i64,
    pub amount: i64,
    pub label: String,
}

// ---------------------------------------------------------------------------
// Auxiliary queue item
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Webservice charged, DB row not yet written. Money is at risk until
    /// the batch writer confirms.
    WebserviceSuccessPendingDb,
    /// Batch write attempt failed; recovery must resolve before any new
    /// dispatch (strict-recovery policy).
    DbInsertionFailedPendingRecovery,
    /// Re-enqueued from a crash marker; awaiting the recovery batch write.
    RecoveryPendingDb,
    Inserted,
    Duplicate,
    Failed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::WebserviceSuccessPendingDb => "webservice_success_pending_db",
            QueueItemStatus::DbInsertionFailedPendingRecovery => {
                "db_insertion_failed_pending_recovery"
            }
            QueueItemStatus::RecoveryPendingDb => "recovery_pending_db",
            QueueItemStatus::Inserted => "inserted",
            QueueItemStatus::Duplicate => "duplicate",
            QueueItemStatus::Failed => "failed",
        }
    }

    /// Statuses that still owe a DB confirmation.
    pub fn is_pending_db(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::WebserviceSuccessPendingDb
                | QueueItemStatus::DbInsertionFailedPendingRecovery
                | QueueItemStatus::RecoveryPendingDb
        )
    }

    /// Terminal statuses that selective cleanup may drop after folio
    /// verification.
    pub fn is_processed(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::Inserted | QueueItemStatus::Duplicate
        )
    }
}

/// Snapshot of the candidate at dispatch time, embedded in the queue item so
/// recovery can rebuild ledger rows without re-querying eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSnapshot {
    pub sim: String,
    pub descripcion: String,
    pub empresa: String,
    pub dispositivo: String,
    pub unix_saldo: i64,
    /// VOZ only; recovery needs it to rebuild the package detail text.
    #[serde(default)]
    pub codigo_paquete: Option<String>,
}

impl CandidateSnapshot {
    pub fn of(c: &Candidate) -> Self {
        Self {
            sim: c.sim.clone(),
            descripcion: c.descripcion.clone(),
            empresa: c.empresa.clone(),
            dispositivo: c.dispositivo.clone(),
            unix_saldo: c.unix_saldo,
            codigo_paquete: c.codigo_paquete.clone(),
        }
    }
}

/// Batch position counters captured at dispatch time; they feed the master
/// note text verbatim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NoteCounters {
    pub current_index: usize,
    pub total_to_recharge: usize,
    pub reporting_on_time: usize,
    pub total_records: usize,
    pub is_recovery: bool,
}

/// Durable auxiliary-queue item. Exists on stable storage from the moment a
/// webservice call succeeds until the batch writer verifies its folio in the
/// detail table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuxQueueItem {
    pub id: String,
    pub service: ServiceType,
    pub sim: String,
    /// `{SERVICE}_recharge`.
    pub kind: String,
    pub status: QueueItemStatus,
    pub amount: i64,
    pub days_validity: i64,
    pub record: CandidateSnapshot,
    pub webservice_response: Option<WebserviceCallResult>,
    pub note_data: NoteCounters,
    pub provider: Option<ProviderName>,
    pub trans_id: Option<String>,
    pub attempts: u32,
    pub last_attempt_unix: Option<i64>,
    pub added_at_unix: i64,
    pub last_error: Option<String>,
    /// Pre-recharge expiry as `DD/MM/YYYY`, for operators reading the queue.
    pub expiration_date_human: String,
}

impl AuxQueueItem {
    /// Build the item for a just-confirmed webservice success.
    #[allow(clippy::too_many_arguments)]
    pub fn for_success(
        service: ServiceType,
        candidate: &Candidate,
        ws: WebserviceCallResult,
        days_validity: i64,
        note_data: NoteCounters,
        added_at_unix: i64,
        expiration_date_human: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            service,
            sim: candidate.sim.clone(),
            kind: service.queue_kind(),
            status: QueueItemStatus::WebserviceSuccessPendingDb,
            amount: ws.amount,
            days_validity,
            record: CandidateSnapshot::of(candidate),
            provider: Some(ws.provider),
            trans_id: Some(ws.trans_id.clone()),
            webservice_response: Some(ws),
            note_data,
            attempts: 0,
            last_attempt_unix: None,
            added_at_unix,
            last_error: None,
            expiration_date_human,
        }
    }

    pub fn folio(&self) -> Option<&str> {
        self.webservice_response.as_ref().map(|w| w.folio.as_str())
    }
}

// ---------------------------------------------------------------------------
// Ledger summary
// ---------------------------------------------------------------------------

/// `resumen` JSON column of the master row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechargeSummary {
    pub error: u32,
    pub success: u32,
    pub refund: u32,
}

impl RechargeSummary {
    pub fn success_only(n: u32) -> Self {
        Self {
            error: 0,
            success: n,
            refund: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_round_trips() {
        for s in ServiceType::all() {
            assert_eq!(ServiceType::parse(s.as_str()).unwrap(), s);
        }
        assert!(ServiceType::parse("SMS").is_err());
    }

    #[test]
    fn ledger_kind_per_service() {
        assert_eq!(ServiceType::Gps.ledger_kind(), "rastreo");
        assert_eq!(ServiceType::Voz.ledger_kind(), "paquete");
        assert_eq!(ServiceType::Eliot.ledger_kind(), "paquete");
    }

    #[test]
    fn queue_status_serde_uses_snake_case_tags() {
        let s = serde_json::to_string(&QueueItemStatus::WebserviceSuccessPendingDb).unwrap();
        assert_eq!(s, "\"webservice_success_pending_db\"");
        let back: QueueItemStatus =
            serde_json::from_str("\"db_insertion_failed_pending_recovery\"").unwrap();
        assert_eq!(back, QueueItemStatus::DbInsertionFailedPendingRecovery);
    }

    #[test]
    fn pending_db_covers_recovery_statuses() {
        assert!(QueueItemStatus::WebserviceSuccessPendingDb.is_pending_db());
        assert!(QueueItemStatus::DbInsertionFailedPendingRecovery.is_pending_db());
        assert!(QueueItemStatus::RecoveryPendingDb.is_pending_db());
        assert!(!QueueItemStatus::Inserted.is_pending_db());
        assert!(!QueueItemStatus::Duplicate.is_pending_db());
        assert!(!QueueItemStatus::Failed.is_pending_db());
    }
}
