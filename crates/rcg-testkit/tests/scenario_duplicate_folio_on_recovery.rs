//! Scenario: duplicate folio on recovery. The queued item's folio already
//! exists in the detail table — the recovery batch still writes its master
//! row, the item folds to `duplicate` (counted as success, no second
//! charge), the device expiry is NOT advanced, and the queue is cleaned.

use rcg_pipeline::TickOutcome;
use rcg_schemas::{AuxQueueItem, NoteCounters, ProviderName, ServiceType, WebserviceCallResult};
use rcg_testkit::{candidate, gps_strategy, rig_with, FakeProvider, EOD_JAN_15, NOON_JAN_15};
use std::sync::Arc;

fn pending_item(sim: &str, folio: &str) -> AuxQueueItem {
    let cand = candidate(sim, 15.0, EOD_JAN_15 - 600);
    let ws = WebserviceCallResult {
        success: true,
        provider: ProviderName::Taecel,
        trans_id: format!("TX-{folio}"),
        folio: folio.to_string(),
        amount: 10,
        carrier: "TELCEL".into(),
        date_str: "2026-01-14 23:50:00".into(),
        final_balance: "900.00".into(),
        timeout: "30".into(),
        ip: "127.0.0.1".into(),
        note: String::new(),
        raw_response: serde_json::json!({}),
    };
    AuxQueueItem::for_success(
        ServiceType::Gps,
        &cand,
        ws,
        8,
        NoteCounters {
            current_index: 1,
            total_to_recharge: 1,
            reporting_on_time: 0,
            total_records: 1,
            is_recovery: false,
        },
        NOON_JAN_15 - 3_600,
        "15/01/2026".into(),
    )
}

#[tokio::test]
async fn duplicate_recovery_counts_as_success_without_second_charge() {
    let provider = Arc::new(FakeProvider::new(ProviderName::Taecel, 1_000.0));
    let mut rig = rig_with(gps_strategy(), NOON_JAN_15, Vec::new(), provider.clone());

    const OLD_EXPIRY: i64 = EOD_JAN_15 + 3 * 86_400; // advanced by the earlier attempt

    // The earlier attempt already recorded folio F1 and advanced the device.
    rig.ledger.seed_detail("F1", "111");
    rig.ledger.seed_device("111", OLD_EXPIRY);
    rig.queue.enqueue(pending_item("111", "F1")).unwrap();

    let report = rig.run_tick().await;

    // Recovery resolved cleanly; no candidates afterwards.
    assert_eq!(report.outcome, TickOutcome::NoCandidates);
    let recovery = report.recovery.expect("recovery ran");
    assert_eq!(recovery.drained, 1);
    assert_eq!(recovery.duplicates, 1);
    assert_eq!(recovery.inserted, 0);
    assert_eq!(recovery.failed, 0);

    // One master row with resumen.success = 1, prefixed as a recovery note.
    let masters = rig.ledger.masters();
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].1.resumen.success, 1);
    assert!(masters[0].1.notas.starts_with("< RECUPERACIÓN > "));

    // No second charge, no new detail row, expiry untouched.
    assert_eq!(provider.recharge_count(), 0);
    assert_eq!(rig.ledger.details().len(), 1, "only the seeded row");
    assert_eq!(rig.ledger.device_expiry("111"), Some(OLD_EXPIRY));

    // Folio verification passed (the seeded row), so the queue is clean.
    assert!(rig.queue.is_empty());
}
