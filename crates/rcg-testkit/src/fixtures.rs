//! Scenario rig: a production [`Pipeline`] wired to fakes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use rcg_clock::OperatorClock;
use rcg_lock::{LockManager, MemoryLockStore};
use rcg_pipeline::{
    EligibilityParams, EligibilitySource, Pipeline, ServiceStrategy, TickReport,
};
use rcg_providers::retry::{RetryPolicy, Strategy};
use rcg_providers::RechargeProvider;
use rcg_queue::AuxQueue;
use rcg_schemas::{Candidate, PackageDef, ProviderName, ServiceType};

use crate::fake_provider::FakeProvider;
use crate::memory_ledger::MemoryLedger;

/// 2026-01-15 12:00:00 America/Mazatlan.
pub const NOON_JAN_15: i64 = 1_768_503_600;
/// 2026-01-15 04:00:00 America/Mazatlan (the VOZ fixed-hour scenario).
pub const FOUR_AM_JAN_15: i64 = 1_768_474_800;
/// 2026-01-15 23:59:59 America/Mazatlan.
pub const EOD_JAN_15: i64 = 1_768_546_799;

pub fn test_clock(unix: i64) -> OperatorClock {
    OperatorClock::from_name("America/Mazatlan")
        .expect("test timezone")
        .with_fixed_now(unix)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        strategy: Strategy::Linear,
        base_delay_ms: 1,
        max_retries: 3,
    }
}

pub fn gps_strategy() -> ServiceStrategy {
    ServiceStrategy {
        service: ServiceType::Gps,
        importe: 10,
        dias: 8,
        codigo: Some("TAE010".into()),
        packages: Default::default(),
        delay_between_calls: Duration::from_millis(1),
        retry: fast_retry(),
        min_balance_threshold: 100.0,
        lock_timeout_secs: 600,
        days_limit: 14,
        minutes_threshold: 10.0,
    }
}

pub fn voz_strategy() -> ServiceStrategy {
    let mut packages = std::collections::BTreeMap::new();
    packages.insert(
        "150005".to_string(),
        PackageDef {
            psl: "PSL150".into(),
            days: 25,
            amount: 150,
            label: "Paquete 150".into(),
        },
    );
    ServiceStrategy {
        service: ServiceType::Voz,
        importe: 150,
        dias: 25,
        codigo: None,
        packages,
        delay_between_calls: Duration::from_millis(1),
        retry: fast_retry(),
        min_balance_threshold: 100.0,
        lock_timeout_secs: 600,
        days_limit: 14,
        minutes_threshold: 0.0,
    }
}

pub fn candidate(sim: &str, idle_minutes: f64, unix_saldo: i64) -> Candidate {
    Candidate {
        sim: sim.to_string(),
        descripcion: format!("UNIDAD {sim}"),
        empresa: "ACME".into(),
        dispositivo: format!("dev-{sim}"),
        unix_saldo,
        idle_minutes,
        codigo_paquete: None,
    }
}

pub fn voz_candidate(sim: &str, codigo: &str, unix_saldo: i64) -> Candidate {
    Candidate {
        sim: sim.to_string(),
        descripcion: format!("LINEA {sim}"),
        empresa: "ACME".into(),
        dispositivo: sim.to_string(),
        unix_saldo,
        idle_minutes: 0.0,
        codigo_paquete: Some(codigo.to_string()),
    }
}

/// Eligibility source returning a scripted candidate list.
pub struct FixedEligibility {
    candidates: Mutex<Vec<Candidate>>,
}

impl FixedEligibility {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
        }
    }

    pub fn set(&self, candidates: Vec<Candidate>) {
        *self.candidates.lock().unwrap() = candidates;
    }
}

#[async_trait]
impl EligibilitySource for FixedEligibility {
    async fn candidates(
        &self,
        _service: ServiceType,
        _params: &EligibilityParams,
    ) -> Result<Vec<Candidate>> {
        Ok(self.candidates.lock().unwrap().clone())
    }
}

/// Everything a scenario needs, with handles into each fake.
pub struct TestRig {
    pub pipeline: Pipeline,
    pub queue: AuxQueue,
    pub ledger: Arc<MemoryLedger>,
    pub provider: Arc<FakeProvider>,
    pub eligibility: Arc<FixedEligibility>,
    pub clock: OperatorClock,
    pub shutdown_tx: watch::Sender<bool>,
    pub state_dir: tempfile::TempDir,
}

impl TestRig {
    pub async fn run_tick(&mut self) -> TickReport {
        self.pipeline.run_tick(&mut self.queue).await
    }

    /// Reopen the queue from disk, as a restarted process would.
    pub fn reopen_queue(&mut self) {
        self.queue = AuxQueue::open(self.state_dir.path(), self.queue.service())
            .expect("reopen queue");
    }
}

/// A rig with one fake provider. Additional providers can be passed through
/// [`pipeline_for`].
pub fn rig_with(
    strategy: ServiceStrategy,
    clock_unix: i64,
    candidates: Vec<Candidate>,
    provider: Arc<FakeProvider>,
) -> TestRig {
    pipeline_for(strategy, clock_unix, candidates, vec![provider.clone()], provider)
}

pub fn pipeline_for(
    strategy: ServiceStrategy,
    clock_unix: i64,
    candidates: Vec<Candidate>,
    providers: Vec<Arc<FakeProvider>>,
    primary: Arc<FakeProvider>,
) -> TestRig {
    let service = strategy.service;
    let clock = test_clock(clock_unix);
    let ledger = Arc::new(MemoryLedger::new());
    let eligibility = Arc::new(FixedEligibility::new(candidates));
    let locks = LockManager::new(Arc::new(MemoryLockStore::new()), "test-holder");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state_dir = tempfile::tempdir().expect("temp state dir");
    let queue = AuxQueue::open(state_dir.path(), service).expect("open queue");

    let provider_objs: Vec<Arc<dyn RechargeProvider>> = providers
        .into_iter()
        .map(|p| p as Arc<dyn RechargeProvider>)
        .collect();

    let pipeline = Pipeline::new(
        strategy,
        clock.clone(),
        locks,
        eligibility.clone(),
        ledger.clone(),
        provider_objs,
        shutdown_rx,
    );

    TestRig {
        pipeline,
        queue,
        ledger,
        provider: primary,
        eligibility,
        clock,
        shutdown_tx,
        state_dir,
    }
}

/// Default single-provider rig: TAECEL with a healthy balance.
pub fn default_rig(strategy: ServiceStrategy, clock_unix: i64, candidates: Vec<Candidate>) -> TestRig {
    let provider = Arc::new(FakeProvider::new(ProviderName::Taecel, 1_000.0));
    rig_with(strategy, clock_unix, candidates, provider)
}
