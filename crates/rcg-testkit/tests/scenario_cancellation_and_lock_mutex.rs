//! Scenario: cancellation takes effect between webservice calls, and the
//! service lock is released on every exit path.

use rcg_pipeline::TickOutcome;
use rcg_schemas::ProviderName;
use rcg_testkit::{candidate, gps_strategy, rig_with, FakeProvider, EOD_JAN_15, NOON_JAN_15};
use std::sync::Arc;

#[tokio::test]
async fn pre_cancelled_tick_dispatches_nothing() {
    let provider = Arc::new(FakeProvider::new(ProviderName::Taecel, 1_000.0));
    let mut rig = rig_with(
        gps_strategy(),
        NOON_JAN_15,
        vec![
            candidate("111", 15.0, EOD_JAN_15 - 600),
            candidate("222", 15.0, EOD_JAN_15 - 500),
        ],
        provider.clone(),
    );

    rig.shutdown_tx.send(true).unwrap();
    let report = rig.run_tick().await;

    assert_eq!(report.outcome, TickOutcome::Cancelled);
    assert_eq!(report.dispatched, 0);
    assert_eq!(provider.recharge_count(), 0);
    assert!(rig.ledger.masters().is_empty());
}

#[tokio::test]
async fn lock_is_released_after_cancelled_tick() {
    let provider = Arc::new(FakeProvider::new(ProviderName::Taecel, 1_000.0));
    let mut rig = rig_with(
        gps_strategy(),
        NOON_JAN_15,
        vec![candidate("111", 15.0, EOD_JAN_15 - 600)],
        provider.clone(),
    );

    rig.shutdown_tx.send(true).unwrap();
    assert_eq!(rig.run_tick().await.outcome, TickOutcome::Cancelled);

    // Un-cancel: the next tick must be able to take the lock and complete.
    rig.shutdown_tx.send(false).unwrap();
    let report = rig.run_tick().await;
    assert_eq!(report.outcome, TickOutcome::Completed);
    assert_eq!(report.dispatched, 1);
    assert_eq!(provider.recharge_count(), 1);
}

#[tokio::test]
async fn completed_tick_releases_lock_for_next_tick() {
    let provider = Arc::new(FakeProvider::new(ProviderName::Taecel, 1_000.0));
    let mut rig = rig_with(
        gps_strategy(),
        NOON_JAN_15,
        vec![candidate("111", 15.0, EOD_JAN_15 - 600)],
        provider.clone(),
    );

    assert_eq!(rig.run_tick().await.outcome, TickOutcome::Completed);

    // Second tick re-acquires cleanly: the first tick released on exit.
    let second = rig.run_tick().await;
    assert_ne!(second.outcome, TickOutcome::SkippedLockHeld);
}
