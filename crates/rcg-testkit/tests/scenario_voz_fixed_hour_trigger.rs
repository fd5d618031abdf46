//! Scenario: VOZ at the 04:00 fixed-hour trigger. Two subscribers on package
//! 150005 (PSL150, 25 days, $150) → one `paquete` master, two PSL150 detail
//! rows, `fecha_expira_saldo` moved to end-of-day + 25 days.

use chrono::Timelike;
use rcg_pipeline::TickOutcome;
use rcg_schemas::ProviderName;
use rcg_sched::Trigger;
use rcg_testkit::{
    rig_with, test_clock, voz_candidate, voz_strategy, FakeProvider, EOD_JAN_15, FOUR_AM_JAN_15,
};
use std::sync::Arc;

/// end_of_day(2026-01-15 + 25 days) in America/Mazatlan.
const EXPECTED_EXPIRY: i64 = EOD_JAN_15 + 25 * 86_400;

#[test]
fn fixed_hour_trigger_fires_at_four() {
    let trigger = Trigger::fixed_times(vec![(1, 0), (4, 0)]).unwrap();
    // 03:59 local → next fire is 04:00 the same day.
    let now = test_clock(FOUR_AM_JAN_15 - 60).now();
    let next = trigger.next_fire(now).unwrap();
    assert_eq!(next.hour(), 4);
    assert_eq!(next.minute(), 0);
    assert_eq!(next.timestamp(), FOUR_AM_JAN_15);
}

#[tokio::test]
async fn two_subscribers_one_package_master() {
    let provider =
        Arc::new(FakeProvider::new(ProviderName::Mst, 2_000.0).with_folios(&["V1", "V2"]));
    let candidates = vec![
        voz_candidate("6681110001", "150005", FOUR_AM_JAN_15 + 3_600),
        voz_candidate("6681110002", "150005", FOUR_AM_JAN_15 + 7_200),
    ];
    let mut rig = rig_with(voz_strategy(), FOUR_AM_JAN_15, candidates, provider.clone());

    let report = rig.run_tick().await;

    assert_eq!(report.outcome, TickOutcome::Completed);
    assert_eq!(report.dispatched, 2);
    assert_eq!(provider.recharge_count(), 2);

    let masters = rig.ledger.masters();
    assert_eq!(masters.len(), 1);
    let (_, master) = &masters[0];
    assert_eq!(master.tipo, "paquete");
    assert_eq!(master.total, 300);
    assert_eq!(master.notas, "Recarga Automática VOZ - 2 paquetes procesados");

    // Detail rows reference the PSL code and the package block.
    let details = rig.ledger.details();
    assert_eq!(details.len(), 2);
    for d in &details {
        assert_eq!(d.amount, 150);
        assert!(
            d.detalle.contains("Paquete: 150005 (PSL150), Días: 25, Provider: MST"),
            "detail text missing package block: {}",
            d.detalle
        );
    }

    // fecha_expira_saldo = end_of_day(today + 25 days).
    for sim in ["6681110001", "6681110002"] {
        assert_eq!(rig.ledger.device_expiry(sim), Some(EXPECTED_EXPIRY));
    }
    assert!(rig.queue.is_empty());
}

#[tokio::test]
async fn unknown_package_code_is_skipped_and_counted_failed() {
    let provider = Arc::new(FakeProvider::new(ProviderName::Mst, 2_000.0));
    let candidates = vec![
        voz_candidate("6681110001", "150005", FOUR_AM_JAN_15 + 3_600),
        // Legacy code absent from the catalog: skip, never default.
        voz_candidate("6681110002", "10007", FOUR_AM_JAN_15 + 7_200),
    ];
    let mut rig = rig_with(voz_strategy(), FOUR_AM_JAN_15, candidates, provider.clone());

    let report = rig.run_tick().await;

    assert_eq!(report.outcome, TickOutcome::Completed);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.ws_failures, 1);
    assert_eq!(provider.recharge_count(), 1);
    assert_eq!(provider.recharged_sims(), vec!["6681110001"]);
}
