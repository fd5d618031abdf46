//! Scenario: provider failover exhaustion. TAECEL rejects credentials at the
//! balance probe, MST probes below the threshold — the tick ends cleanly
//! with no webservice calls beyond the probes.

use rcg_pipeline::TickOutcome;
use rcg_schemas::ProviderName;
use rcg_testkit::{
    candidate, gps_strategy, pipeline_for, FakeFailure, FakeProvider, EOD_JAN_15, NOON_JAN_15,
};
use std::sync::Arc;

#[tokio::test]
async fn no_provider_above_threshold_ends_cleanly() {
    let taecel = Arc::new(FakeProvider::new(ProviderName::Taecel, 0.0));
    taecel.set_balance_failure(FakeFailure::Credentials);
    let mst = Arc::new(FakeProvider::new(ProviderName::Mst, 50.0)); // below 100 threshold

    let mut rig = pipeline_for(
        gps_strategy(),
        NOON_JAN_15,
        vec![candidate("111", 15.0, EOD_JAN_15 - 600)],
        vec![taecel.clone(), mst.clone()],
        taecel.clone(),
    );

    let report = rig.run_tick().await;

    assert_eq!(report.outcome, TickOutcome::NoProviderAboveThreshold);
    assert_eq!(taecel.recharge_count(), 0);
    assert_eq!(mst.recharge_count(), 0);
    assert!(rig.ledger.masters().is_empty());
    assert!(rig.queue.is_empty());
}

#[tokio::test]
async fn healthy_second_provider_wins_selection() {
    let taecel = Arc::new(FakeProvider::new(ProviderName::Taecel, 0.0));
    taecel.set_balance_failure(FakeFailure::Transport);
    let mst = Arc::new(FakeProvider::new(ProviderName::Mst, 800.0));

    let mut rig = pipeline_for(
        gps_strategy(),
        NOON_JAN_15,
        vec![candidate("111", 15.0, EOD_JAN_15 - 600)],
        vec![taecel.clone(), mst.clone()],
        mst.clone(),
    );

    let report = rig.run_tick().await;

    assert_eq!(report.outcome, TickOutcome::Completed);
    assert_eq!(taecel.recharge_count(), 0);
    assert_eq!(mst.recharge_count(), 1);
    assert_eq!(rig.ledger.masters()[0].1.proveedor, "MST");
}

#[tokio::test]
async fn mid_tick_provider_outage_fails_over() {
    // TAECEL ranks first (richer) but every recharge times out; MST picks up
    // the rest of the tick.
    let taecel = Arc::new(FakeProvider::new(ProviderName::Taecel, 900.0));
    taecel.fail_all_recharges(FakeFailure::Transport);
    let mst = Arc::new(FakeProvider::new(ProviderName::Mst, 500.0));

    let mut rig = pipeline_for(
        gps_strategy(),
        NOON_JAN_15,
        vec![
            candidate("111", 15.0, EOD_JAN_15 - 600),
            candidate("222", 15.0, EOD_JAN_15 - 500),
        ],
        vec![taecel.clone(), mst.clone()],
        mst.clone(),
    );

    let report = rig.run_tick().await;

    assert_eq!(report.outcome, TickOutcome::Completed);
    assert_eq!(report.dispatched, 2);
    assert_eq!(mst.recharge_count(), 2, "all charges moved to the fallback");
    assert_eq!(rig.ledger.masters().len(), 1);
}
