//! Scenario: strict recovery. A pending-recovery item that cannot be
//! resolved this tick suppresses every new webservice call — paying again
//! while a prior payment is unreconciled is the failure mode this engine
//! exists to prevent.

use rcg_pipeline::TickOutcome;
use rcg_schemas::{AuxQueueItem, NoteCounters, ProviderName, QueueItemStatus, ServiceType};
use rcg_testkit::{candidate, gps_strategy, rig_with, FakeProvider, EOD_JAN_15, NOON_JAN_15};
use std::sync::Arc;

fn pending_recovery_item(sim: &str, folio: &str) -> AuxQueueItem {
    let cand = candidate(sim, 15.0, EOD_JAN_15 - 600);
    let ws = rcg_schemas::WebserviceCallResult {
        success: true,
        provider: ProviderName::Taecel,
        trans_id: format!("TX-{folio}"),
        folio: folio.to_string(),
        amount: 10,
        carrier: "TELCEL".into(),
        date_str: "2026-01-14 22:00:00".into(),
        final_balance: "900.00".into(),
        timeout: "30".into(),
        ip: "127.0.0.1".into(),
        note: String::new(),
        raw_response: serde_json::json!({}),
    };
    let mut item = AuxQueueItem::for_success(
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
    );
    item.status = QueueItemStatus::DbInsertionFailedPendingRecovery;
    item
}

#[tokio::test]
async fn unresolved_recovery_item_suppresses_all_dispatch() {
    let provider = Arc::new(FakeProvider::new(ProviderName::Taecel, 1_000.0));
    // Fresh candidates exist — they must NOT be charged.
    let mut rig = rig_with(
        gps_strategy(),
        NOON_JAN_15,
        vec![candidate("222", 15.0, EOD_JAN_15 - 500)],
        provider.clone(),
    );

    rig.queue.enqueue(pending_recovery_item("111", "FX")).unwrap();
    // The recovery batch write fails this tick.
    rig.ledger.set_fail_writes(true);

    let report = rig.run_tick().await;

    assert_eq!(report.outcome, TickOutcome::BlockedByRecovery);
    assert_eq!(provider.recharge_count(), 0, "zero webservice calls");
    assert!(rig.ledger.masters().is_empty(), "zero master rows");
    assert!(rig.ledger.details().is_empty(), "zero detail rows");

    // Queue unchanged in content: the item is still pending recovery.
    assert_eq!(rig.queue.len(), 1);
    assert_eq!(
        rig.queue.items()[0].status,
        QueueItemStatus::DbInsertionFailedPendingRecovery
    );
    assert!(report.queue_stats.failed > 0, "stats surface the block");
}

#[tokio::test]
async fn next_tick_resolves_and_unblocks() {
    let provider = Arc::new(FakeProvider::new(ProviderName::Taecel, 1_000.0));
    let mut rig = rig_with(
        gps_strategy(),
        NOON_JAN_15,
        vec![candidate("222", 15.0, EOD_JAN_15 - 500)],
        provider.clone(),
    );
    rig.queue.enqueue(pending_recovery_item("111", "FX")).unwrap();
    rig.ledger.set_fail_writes(true);

    let blocked = rig.run_tick().await;
    assert_eq!(blocked.outcome, TickOutcome::BlockedByRecovery);

    // DB is back: recovery drains, then fresh candidates are processed.
    rig.ledger.set_fail_writes(false);
    let report = rig.run_tick().await;
    assert_eq!(report.outcome, TickOutcome::Completed);
    let recovery = report.recovery.expect("recovery ran");
    assert_eq!(recovery.inserted, 1);
    assert_eq!(recovery.failed, 0);
    assert_eq!(provider.recharge_count(), 1, "only the fresh candidate was charged");
    assert_eq!(rig.ledger.masters().len(), 2, "recovery batch + fresh batch");
    assert!(rig.queue.is_empty());
}
