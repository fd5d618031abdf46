//! Orchestrator.
//!
//! Builds the engine in dependency order — lock store, per-service queues
//! (with the startup recovery sweep), provider clients, pipelines, schedules
//! — and owns graceful shutdown. No module-level state: everything a
//! pipeline needs is constructed here and handed in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use rcg_clock::OperatorClock;
use rcg_config::{AppConfig, LockProvider, ServiceConfig};
use rcg_lock::{LockManager, MySqlLockStore, RedisLockStore, SharedLockStore};
use rcg_pipeline::{Pipeline, TickReport};
use rcg_providers::{MstClient, RechargeProvider, TaecelClient};
use rcg_queue::{AuxQueue, QueueStats};
use rcg_sched::{Scheduler, Trigger};
use rcg_schemas::{ProviderName, ServiceType};

pub const ENV_REDIS_URL: &str = "RCG_REDIS_URL";

mod wiring;

pub use wiring::{retry_policy_from_config, strategy_from_config, trigger_from_config};

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct ServiceRuntime {
    pipeline: Arc<Pipeline>,
    queue: Arc<Mutex<AuxQueue>>,
    trigger: Trigger,
}

pub struct Orchestrator {
    clock: OperatorClock,
    locks: LockManager,
    pool: sqlx::MySqlPool,
    services: HashMap<ServiceType, ServiceRuntime>,
    providers: Vec<Arc<dyn RechargeProvider>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct StatusReport {
    pub queues: Vec<(ServiceType, QueueStats)>,
    pub locks: Vec<rcg_lock::LockRecord>,
    pub schedules: Vec<(ServiceType, String)>,
    pub recharges_today: i64,
}

impl Orchestrator {
    /// Build everything from validated configuration. Fails fast on
    /// unreachable infrastructure except provider probes, which are
    /// deferred to [`Orchestrator::probe_balances`].
    pub async fn build(app: &AppConfig) -> Result<Self> {
        let clock = OperatorClock::from_name(&app.global.default_timezone)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = rcg_db::connect_from_env().await?;
        rcg_db::migrate(&pool).await?;

        // Lock backend: chosen once, never mixed.
        let store: SharedLockStore = match app.global.lock_provider {
            LockProvider::Redis => {
                let url = std::env::var(ENV_REDIS_URL)
                    .with_context(|| format!("missing env var {ENV_REDIS_URL}"))?;
                Arc::new(
                    RedisLockStore::connect(&url)
                        .await
                        .map_err(|e| anyhow!("redis lock backend: {e}"))?,
                )
            }
            LockProvider::Mysql => Arc::new(MySqlLockStore::new(pool.clone())),
        };
        let locks = LockManager::new(store, LockManager::default_holder_id());
        info!(backend = locks.backend_name(), holder = locks.holder_id(), "lock manager ready");

        let ledger = Arc::new(rcg_db::SqlLedger::new(pool.clone()));
        let eligibility = Arc::new(rcg_db::SqlEligibility::new(pool.clone(), clock.clone()));

        let mut services = HashMap::new();
        // Boot-probe clients, one per upstream. Services keep their own
        // instances (per-service timeout and retry policy); the probe only
        // needs a single representative client for each provider name.
        let mut probe_providers: HashMap<ProviderName, Arc<dyn RechargeProvider>> = HashMap::new();

        for service in ServiceType::all() {
            let Some(cfg) = app.service(service) else {
                continue;
            };

            // Startup recovery sweep: journal replay + crash marker.
            let mut queue = AuxQueue::open(&app.global.state_dir, service)?;
            let recovered = queue.recover_from_marker()?;
            if recovered.was_processing {
                warn!(
                    %service,
                    reenqueued = recovered.reenqueued,
                    "previous run crashed mid-tick; recovery items queued"
                );
            }

            let providers = build_providers(app, cfg)?;
            for p in &providers {
                probe_providers.entry(p.name()).or_insert_with(|| Arc::clone(p));
            }

            let strategy = strategy_from_config(service, cfg, app);
            let trigger = trigger_from_config(cfg)?;
            let pipeline = Arc::new(Pipeline::new(
                strategy,
                clock.clone(),
                locks.clone(),
                eligibility.clone(),
                ledger.clone(),
                providers,
                shutdown_rx.clone(),
            ));

            services.insert(
                service,
                ServiceRuntime {
                    pipeline,
                    queue: Arc::new(Mutex::new(queue)),
                    trigger,
                },
            );
        }

        if services.is_empty() {
            return Err(anyhow!("no services configured"));
        }

        Ok(Self {
            clock,
            locks,
            pool,
            services,
            providers: probe_providers.into_values().collect(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Boot-time balance probe. Non-fatal: a dead upstream at startup is an
    /// operational warning, not a reason to refuse to schedule.
    pub async fn probe_balances(&self) {
        for p in &self.providers {
            match p.balance().await {
                Ok(balance) => info!(provider = %p.name(), balance, "opening balance"),
                Err(e) => warn!(provider = %p.name(), error = %e, "opening balance probe failed"),
            }
        }
    }

    /// Run one service immediately, bypassing the scheduler. Used by
    /// `run-once`, the TEST_* toggles, and tests.
    pub async fn run_service_once(&self, service: ServiceType) -> Result<TickReport> {
        let rt = self
            .services
            .get(&service)
            .ok_or_else(|| anyhow!("service {service} not configured"))?;
        let mut queue = rt.queue.lock().await;
        Ok(rt.pipeline.run_tick(&mut queue).await)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let mut queues = Vec::new();
        for (svc, rt) in &self.services {
            queues.push((*svc, rt.queue.lock().await.stats()));
        }
        queues.sort_by_key(|(svc, _)| svc.as_str());

        let locks = self
            .locks
            .list()
            .await
            .map_err(|e| anyhow!("lock list failed: {e}"))?;

        let mut schedules: Vec<(ServiceType, String)> = self
            .services
            .iter()
            .map(|(svc, rt)| (*svc, rt.trigger.describe()))
            .collect();
        schedules.sort_by_key(|(svc, _)| svc.as_str());

        let recharges_today =
            rcg_db::count_recharges_today(&self.pool, &self.clock.today_str()).await?;

        Ok(StatusReport {
            queues,
            locks,
            schedules,
            recharges_today,
        })
    }

    /// Sweep expired locks; with `force`, remove every lock.
    pub async fn clean_locks(&self, force: bool) -> Result<u64> {
        let n = if force {
            self.locks.force_clear().await
        } else {
            self.locks.sweep_expired().await
        }
        .map_err(|e| anyhow!("lock cleanup failed: {e}"))?;
        Ok(n)
    }

    /// Resident mode: register schedules, honor TEST_* immediate toggles,
    /// then wait for SIGINT/SIGTERM and shut down gracefully.
    pub async fn start(self) -> Result<()> {
        let mut scheduler = Scheduler::new(self.clock.clone(), self.shutdown_rx.clone());

        for (service, rt) in &self.services {
            let pipeline = Arc::clone(&rt.pipeline);
            let queue = Arc::clone(&rt.queue);
            scheduler.register(*service, rt.trigger.clone(), move |svc| {
                let pipeline = Arc::clone(&pipeline);
                let queue = Arc::clone(&queue);
                async move {
                    // In-process overlap suppression: a still-running tick
                    // holds the queue mutex, and this tick simply skips.
                    let Ok(mut guard) = queue.try_lock() else {
                        warn!(service = %svc, "tick suppressed: previous tick still running");
                        return;
                    };
                    let _ = pipeline.run_tick(&mut guard).await;
                }
            });
        }

        // Development/operator toggles: run one service immediately.
        for service in ServiceType::all() {
            let var = format!("TEST_{}", service.as_str());
            if std::env::var(&var).is_ok() && self.services.contains_key(&service) {
                info!(%service, toggle = %var, "immediate run requested by environment");
                if let Err(e) = self.run_service_once(service).await {
                    error!(%service, error = %e, "immediate run failed");
                }
            }
        }

        self.probe_balances().await;
        info!("orchestrator resident; waiting for shutdown signal");

        wait_for_shutdown_signal().await;
        info!("shutdown signal received");

        // Flip the cancellation flag: pipelines stop between webservice
        // calls, schedule loops exit after their current tick.
        let _ = self.shutdown_tx.send(true);
        scheduler.join().await;

        match self.locks.release_all().await {
            Ok(released) => info!(released, "locks released"),
            Err(e) => warn!(error = %e, "lock release on shutdown failed"),
        }

        self.pool.close().await;
        info!("orchestrator stopped");
        Ok(())
    }

    /// Hand out a shutdown trigger for tests driving cancellation.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn build_providers(
    app: &AppConfig,
    cfg: &ServiceConfig,
) -> Result<Vec<Arc<dyn RechargeProvider>>> {
    let retry = retry_policy_from_config(cfg);
    let timeout = Duration::from_millis(cfg.webservice_timeout_ms);
    let mut providers: Vec<Arc<dyn RechargeProvider>> = Vec::new();

    if let Some(t) = &app.providers.taecel {
        providers.push(Arc::new(TaecelClient::new(
            t.url.clone(),
            t.key.clone(),
            t.nip.clone(),
            timeout,
            retry,
        )));
    }
    if let Some(m) = &app.providers.mst {
        providers.push(Arc::new(MstClient::new(
            m.url.clone(),
            m.usuario.clone(),
            m.clave.clone(),
            timeout,
            retry,
        )));
    }

    if providers.is_empty() {
        return Err(anyhow!("no providers configured"));
    }
    Ok(providers)
}
