//! Ledger note formatting.
//!
//! These strings are consumed by operators and downstream reporting; the
//! formats are load-bearing and byte-exact. Do not "improve" spacing or
//! accents here without migrating the consumers.

use rcg_schemas::{ProviderName, ServiceType, WebserviceCallResult};

pub const RECOVERY_PREFIX: &str = "< RECUPERACIÓN > ";

#[derive(Debug, Clone)]
pub struct MasterNoteArgs {
    pub service: ServiceType,
    /// Successful calls in this batch (SSS).
    pub success: usize,
    /// Size of the to-recharge set this tick (TTT).
    pub total_to_recharge: usize,
    /// Still unpaid when the day ends (PPP).
    pub pending_end_of_day: usize,
    pub reporting_on_time: usize,
    /// Items actually processed (P).
    pub processed: usize,
    /// Candidate rows examined (N).
    pub total_records: usize,
    pub is_recovery: bool,
    /// For single-item batches: `(descripcion, empresa)` embedded in the
    /// note.
    pub single: Option<(String, String)>,
}

/// Master `notas` column text.
pub fn format_master_note(args: &MasterNoteArgs) -> String {
    let body = if args.service == ServiceType::Voz {
        format!(
            "Recarga Automática VOZ - {} paquetes procesados",
            args.processed
        )
    } else {
        let device = match &args.single {
            Some((descripcion, empresa)) if args.processed == 1 => {
                format!("{descripcion} [{empresa}] - ")
            }
            _ => String::new(),
        };
        format!(
            "[ {:03} / {:03} ] {}Recarga Automática **** {:03} Pendientes al Finalizar el Día **** [ {} Reportando en Tiempo y Forma ] ({} procesados de {} total)",
            args.success,
            args.total_to_recharge,
            device,
            args.pending_end_of_day,
            args.reporting_on_time,
            args.processed,
            args.total_records,
        )
    };

    if args.is_recovery {
        format!("{RECOVERY_PREFIX}{body}")
    } else {
        body
    }
}

/// VOZ-only extras appended to the detail text.
#[derive(Debug, Clone)]
pub struct VozDetailNote {
    pub code: String,
    pub psl: String,
    pub days: i64,
    pub provider: ProviderName,
}

/// Detail `detalle` column text for a successful call.
pub fn format_detail_text(sim: &str, ws: &WebserviceCallResult, voz: Option<&VozDetailNote>) -> String {
    let mut s = format!(
        "[ Saldo Final: {} ] Folio: {}, Cantidad: ${}.00, Teléfono: {}, Carrier: {}, Fecha: {}, TransID: {}, Timeout: {}, IP: {}",
        ws.final_balance,
        ws.folio,
        ws.amount,
        sim,
        ws.carrier,
        ws.date_str,
        ws.trans_id,
        ws.timeout,
        ws.ip,
    );
    if let Some(v) = voz {
        s.push_str(&format!(
            ", Paquete: {} ({}), Días: {}, Provider: {}",
            v.code, v.psl, v.days, v.provider
        ));
    }
    if !ws.note.is_empty() {
        s.push_str(&format!(", {}", ws.note));
    }
    s
}
