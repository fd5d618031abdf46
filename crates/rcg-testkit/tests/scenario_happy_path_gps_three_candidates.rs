//! Scenario: GPS happy path, three idle devices, healthy provider.
//!
//! Expect exactly one master row (`total = 30`, `tipo = 'rastreo'`), three
//! detail rows carrying the provider folios, three expiries advanced by
//! `DIAS` days past end-of-today, and an empty queue afterwards.

use rcg_pipeline::TickOutcome;
use rcg_schemas::ProviderName;
use rcg_testkit::{candidate, gps_strategy, rig_with, FakeProvider, EOD_JAN_15, NOON_JAN_15};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const EXPECTED_EXPIRY: i64 = EOD_JAN_15 + 8 * 86_400;

#[tokio::test]
async fn three_candidates_one_master_three_details() {
    let provider =
        Arc::new(FakeProvider::new(ProviderName::Taecel, 1_000.0).with_folios(&["F1", "F2", "F3"]));
    let candidates = vec![
        candidate("111", 15.0, EOD_JAN_15 - 600),
        candidate("222", 15.0, EOD_JAN_15 - 500),
        candidate("333", 15.0, EOD_JAN_15 - 400),
    ];
    let mut rig = rig_with(gps_strategy(), NOON_JAN_15, candidates, provider.clone());

    // Post-batch hook: the analytics seam fires once per committed batch.
    let observed = Arc::new(AtomicUsize::new(0));
    let observed_hook = Arc::clone(&observed);
    rig.pipeline.set_observer(Arc::new(move |outcome| {
        assert_eq!(outcome.inserted, 3);
        observed_hook.fetch_add(1, Ordering::SeqCst);
    }));

    let report = rig.run_tick().await;
    assert_eq!(observed.load(Ordering::SeqCst), 1, "observer fired once");

    assert_eq!(report.outcome, TickOutcome::Completed);
    assert_eq!(report.to_recharge, 3);
    assert_eq!(report.dispatched, 3);
    assert_eq!(report.ws_failures, 0);
    assert_eq!(provider.recharge_count(), 3);

    // Exactly one master; totals and kind are the ledger contract.
    let masters = rig.ledger.masters();
    assert_eq!(masters.len(), 1);
    let (_, master) = &masters[0];
    assert_eq!(master.total, 30);
    assert_eq!(master.tipo, "rastreo");
    assert_eq!(master.quien, "mextic.app");
    assert_eq!(master.resumen.success, 3);
    assert_eq!(master.resumen.error, 0);
    assert_eq!(
        master.notas,
        "[ 003 / 003 ] Recarga Automática **** 000 Pendientes al Finalizar el Día **** [ 0 Reportando en Tiempo y Forma ] (3 procesados de 3 total)"
    );

    // Three detail rows, folios F1..F3, Σ importe == total.
    let details = rig.ledger.details();
    assert_eq!(details.len(), 3);
    let mut folios: Vec<_> = details.iter().filter_map(|d| d.folio.clone()).collect();
    folios.sort();
    assert_eq!(folios, vec!["F1", "F2", "F3"]);
    assert_eq!(details.iter().map(|d| d.amount).sum::<i64>(), master.total);

    // Expiry advanced by DIAS days for every device.
    for sim in ["111", "222", "333"] {
        assert_eq!(rig.ledger.device_expiry(sim), Some(EXPECTED_EXPIRY));
    }

    // Verified cleanup emptied the queue.
    assert!(rig.queue.is_empty());
    assert_eq!(report.batches.len(), 1);
    assert_eq!(report.batches[0].inserted, 3);
    assert_eq!(report.batches[0].duplicates, 0);
}

#[tokio::test]
async fn single_item_batch_embeds_device_in_note() {
    let provider = Arc::new(FakeProvider::new(ProviderName::Taecel, 1_000.0).with_folios(&["F9"]));
    let mut rig = rig_with(
        gps_strategy(),
        NOON_JAN_15,
        vec![candidate("777", 30.0, EOD_JAN_15 - 600)],
        provider,
    );

    let report = rig.run_tick().await;
    assert_eq!(report.outcome, TickOutcome::Completed);

    let masters = rig.ledger.masters();
    assert_eq!(masters.len(), 1);
    assert!(
        masters[0].1.notas.contains("UNIDAD 777 [ACME] - Recarga Automática"),
        "single-item note must embed description and company: {}",
        masters[0].1.notas
    );
}
