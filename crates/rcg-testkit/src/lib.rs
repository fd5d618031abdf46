//! Deterministic fakes for pipeline scenarios.
//!
//! Everything here is offline: a scripted provider, an in-memory ledger with
//! a real folio unique index, and a fixed eligibility source. The scenario
//! tests under `tests/` drive the actual [`rcg_pipeline::Pipeline`] against
//! these, so the state machine under test is the production one.

pub mod fake_provider;
pub mod fixtures;
pub mod memory_ledger;

pub use fake_provider::{FakeFailure, FakeProvider};
pub use fixtures::{
    candidate, default_rig, gps_strategy, pipeline_for, rig_with, test_clock, voz_candidate,
    voz_strategy, FixedEligibility, TestRig, EOD_JAN_15, FOUR_AM_JAN_15, NOON_JAN_15,
};
pub use memory_ledger::{MemoryLedger, StoredDetail};
