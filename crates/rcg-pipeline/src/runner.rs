//! Pipeline runner.
//!
//! One invocation = one tick of one service. The order of operations is
//! load-bearing and mirrors the money flow:
//!
//! ```text
//! IDLE → LOCKED → RECOVERED → FILTERED → PROVIDERED → DISPATCHING → CLEANUP → RELEASE
//! ```
//!
//! Two rules dominate everything else:
//!
//! - **Queue before DB.** A webservice success is enqueued durably before the
//!   next call is made and long before the batch writer runs. A crash at any
//!   point leaves the paid item recoverable.
//! - **Strict recovery.** If draining prior items leaves any of them failed,
//!   no new webservice call is made this tick. Paying again while an
//!   unresolved item might still reconcile is the one mistake this engine
//!   exists to prevent.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{error, info, warn};

use rcg_clock::OperatorClock;
use rcg_lock::{AcquireOutcome, LockManager};
use rcg_providers::{select_providers, RankedProvider, ProviderError, RechargeRequest, SelectorError};
use rcg_queue::{AuxQueue, QueueStats};
use rcg_schemas::{AuxQueueItem, NoteCounters, RechargeSummary, ServiceType};

use crate::notes::{format_detail_text, format_master_note, MasterNoteArgs, VozDetailNote};
use crate::strategy::ServiceStrategy;
use crate::{
    classify, BatchItem, EligibilityParams, EligibilitySource, FilterParams, Ledger, NewMaster,
    OPERATOR,
};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    /// Another process holds the service lock.
    SkippedLockHeld,
    /// Lock backend unreachable or erroring.
    SkippedBackend(String),
    /// Recovery drain left failed items; dispatch suppressed.
    BlockedByRecovery,
    NoCandidates,
    NothingToRecharge,
    NoProviderAboveThreshold,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryStats {
    pub drained: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Post-batch summary, also handed to the observer hook.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub service: ServiceType,
    pub master_id: u64,
    pub inserted: usize,
    pub duplicates: usize,
    pub total_amount: i64,
    pub provider: String,
    pub is_recovery: bool,
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub service: ServiceType,
    pub outcome: TickOutcome,
    pub candidates: usize,
    pub to_recharge: usize,
    pub savings: usize,
    pub reporting_on_time: usize,
    pub dispatched: usize,
    pub ws_failures: usize,
    pub recovery: Option<RecoveryStats>,
    pub batches: Vec<BatchOutcome>,
    pub queue_stats: QueueStats,
    pub elapsed_ms: u64,
}

impl TickReport {
    fn new(service: ServiceType, outcome: TickOutcome, queue_stats: QueueStats) -> Self {
        Self {
            service,
            outcome,
            candidates: 0,
            to_recharge: 0,
            savings: 0,
            reporting_on_time: 0,
            dispatched: 0,
            ws_failures: 0,
            recovery: None,
            batches: Vec::new(),
            queue_stats,
            elapsed_ms: 0,
        }
    }
}

pub type BatchObserver = Arc<dyn Fn(&BatchOutcome) + Send + Sync>;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    strategy: ServiceStrategy,
    clock: OperatorClock,
    locks: LockManager,
    eligibility: Arc<dyn EligibilitySource>,
    ledger: Arc<dyn Ledger>,
    providers: Vec<Arc<dyn rcg_providers::RechargeProvider>>,
    shutdown: watch::Receiver<bool>,
    observer: Option<BatchObserver>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy: ServiceStrategy,
        clock: OperatorClock,
        locks: LockManager,
        eligibility: Arc<dyn EligibilitySource>,
        ledger: Arc<dyn Ledger>,
        providers: Vec<Arc<dyn rcg_providers::RechargeProvider>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            strategy,
            clock,
            locks,
            eligibility,
            ledger,
            providers,
            shutdown,
            observer: None,
        }
    }

    /// Analytics and alerting subscribe here; one hook, called after every
    /// committed batch.
    pub fn set_observer(&mut self, observer: BatchObserver) {
        self.observer = Some(observer);
    }

    pub fn service(&self) -> ServiceType {
        self.strategy.service
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One tick. Never panics the caller's loop: every failure mode is an
    /// outcome.
    pub async fn run_tick(&self, queue: &mut AuxQueue) -> TickReport {
        let service = self.strategy.service;
        let started = Instant::now();
        let key = self.strategy.lock_key();

        match self.locks.acquire(&key, self.strategy.lock_timeout_secs).await {
            AcquireOutcome::Acquired { .. } => {}
            AcquireOutcome::Exists { owner, age_seconds, .. } => {
                info!(%service, owner = owner.as_deref().unwrap_or("?"), age_seconds, "tick skipped: lock held");
                return TickReport::new(service, TickOutcome::SkippedLockHeld, queue.stats());
            }
            AcquireOutcome::BackendUnavailable { reason }
            | AcquireOutcome::BackendError { reason } => {
                error!(%service, reason, "tick skipped: lock backend");
                return TickReport::new(service, TickOutcome::SkippedBackend(reason), queue.stats());
            }
        }

        let mut report = self.run_locked(queue).await;

        if let Err(e) = self.locks.release(&key).await {
            warn!(%service, error = %e, "lock release failed (TTL will reap it)");
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report.queue_stats = queue.stats();
        info!(
            %service,
            outcome = ?report.outcome,
            candidates = report.candidates,
            to_recharge = report.to_recharge,
            savings = report.savings,
            reporting_on_time = report.reporting_on_time,
            dispatched = report.dispatched,
            ws_failures = report.ws_failures,
            pending_db = report.queue_stats.pending_db(),
            elapsed_ms = report.elapsed_ms,
            "tick finished"
        );
        report
    }

    async fn run_locked(&self, queue: &mut AuxQueue) -> TickReport {
        let service = self.strategy.service;

        // Pipeline entry: marker up before anything that can spend or move
        // money. Sample = whatever is already pending.
        let pending = queue.pending_db_items();
        if let Err(e) = queue.mark_processing_start(&pending) {
            return TickReport::new(service, TickOutcome::Failed(format!("marker: {e}")), queue.stats());
        }

        let mut report = TickReport::new(service, TickOutcome::Completed, queue.stats());

        // ---- RECOVERED: drain before any new spend --------------------------
        let recovery = self.drain_recovery(queue).await;
        if recovery.drained > 0 {
            report.recovery = Some(recovery);
        }
        if recovery.failed > 0 {
            warn!(
                %service,
                failed = recovery.failed,
                "strict recovery: unresolved items, dispatch suppressed this tick"
            );
            report.outcome = TickOutcome::BlockedByRecovery;
            self.finish(queue);
            return report;
        }

        // ---- FILTERED -------------------------------------------------------
        let params = EligibilityParams {
            days_limit: self.strategy.days_limit,
            end_of_tomorrow_unix: self.clock.end_of_tomorrow_unix(),
            today: self.clock.today_str(),
        };
        let candidates = match self.eligibility.candidates(service, &params).await {
            Ok(c) => c,
            Err(e) => {
                error!(%service, error = %e, "eligibility query failed");
                report.outcome = TickOutcome::Failed(format!("eligibility: {e}"));
                self.finish(queue);
                return report;
            }
        };
        report.candidates = candidates.len();
        if candidates.is_empty() {
            report.outcome = TickOutcome::NoCandidates;
            self.finish(queue);
            return report;
        }

        let filtered = classify(
            service,
            candidates,
            &FilterParams {
                days_limit: self.strategy.days_limit,
                minutes_threshold: self.strategy.minutes_threshold,
                end_of_today_unix: self.clock.end_of_today_unix(),
            },
        );
        report.to_recharge = filtered.to_recharge.len();
        report.savings = filtered.savings.len();
        report.reporting_on_time = filtered.reporting_on_time;
        info!(
            %service,
            to_recharge = report.to_recharge,
            savings = report.savings,
            reporting_on_time = report.reporting_on_time,
            abandoned = filtered.abandoned,
            "candidates classified"
        );
        if filtered.to_recharge.is_empty() {
            report.outcome = TickOutcome::NothingToRecharge;
            self.finish(queue);
            return report;
        }

        // ---- PROVIDERED -----------------------------------------------------
        let selection = match select_providers(&self.providers, self.strategy.min_balance_threshold).await {
            Ok(s) => s,
            Err(SelectorError::NoProviderAboveThreshold { min_balance, probed }) => {
                warn!(
                    %service,
                    min_balance,
                    ?probed,
                    "no provider above threshold; tick ends cleanly"
                );
                report.outcome = TickOutcome::NoProviderAboveThreshold;
                self.finish(queue);
                return report;
            }
        };

        // ---- DISPATCHING ----------------------------------------------------
        let total_records = report.candidates;
        let total_to_recharge = filtered.to_recharge.len();
        let mut session_sims: Vec<String> = Vec::new();
        let mut provider_idx = 0usize;
        let mut cancelled = false;

        'candidates: for (i, cand) in filtered.to_recharge.iter().enumerate() {
            if self.cancelled() {
                cancelled = true;
                break;
            }

            let Some(plan) = self.strategy.resolve_charge(cand) else {
                warn!(
                    %service,
                    sim = %cand.sim,
                    codigo = cand.codigo_paquete.as_deref().unwrap_or("-"),
                    "package code not in catalog; skipped and counted failed"
                );
                report.ws_failures += 1;
                continue;
            };

            let req = RechargeRequest {
                sim: cand.sim.clone(),
                amount: plan.amount,
                codigo: plan.codigo.clone(),
                package: plan.package,
            };

            // Provider failover is sticky: once an upstream proves unusable
            // (credentials or exhausted transport retries) the rest of the
            // tick moves to the next-ranked one.
            loop {
                let Some(ranked) = selection.ranked.get(provider_idx) else {
                    warn!(%service, "all selected providers exhausted mid-tick");
                    report.ws_failures += 1;
                    break 'candidates;
                };
                match self.dispatch_one(ranked, cand, &plan, &req, i, total_to_recharge, total_records, filtered.reporting_on_time, queue).await {
                    DispatchResult::Enqueued => {
                        session_sims.push(cand.sim.clone());
                        report.dispatched += 1;
                        break;
                    }
                    DispatchResult::ProviderUnusable => {
                        provider_idx += 1;
                    }
                    DispatchResult::CandidateFailed => {
                        report.ws_failures += 1;
                        break;
                    }
                }
            }

            if i + 1 < filtered.to_recharge.len() {
                tokio::time::sleep(self.strategy.delay_between_calls).await;
            }
        }

        // ---- batch write + CLEANUP -----------------------------------------
        if !session_sims.is_empty() {
            if cancelled {
                // Paid items stay pending in the queue; the next tick's
                // recovery drain records them. Writing the ledger during
                // shutdown risks a half-observed commit.
                info!(%service, pending = session_sims.len(), "cancelled before batch write; items left for recovery");
            } else {
                let items: Vec<AuxQueueItem> = queue
                    .items()
                    .iter()
                    .filter(|it| session_sims.contains(&it.sim))
                    .cloned()
                    .collect();
                let counters = BatchCounters {
                    total_to_recharge,
                    reporting_on_time: filtered.reporting_on_time,
                    total_records,
                    is_recovery: false,
                };
                match self.write_batch_and_cleanup(queue, &items, counters).await {
                    Ok(outcome) => report.batches.push(outcome),
                    Err(e) => {
                        error!(%service, error = %e, "batch write failed; items queued for recovery");
                        report.outcome = TickOutcome::Failed(format!("batch write: {e}"));
                        self.finish(queue);
                        return report;
                    }
                }
            }
        }

        if cancelled {
            report.outcome = TickOutcome::Cancelled;
        }
        self.finish(queue);
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_one(
        &self,
        ranked: &RankedProvider,
        cand: &rcg_schemas::Candidate,
        plan: &crate::ChargePlan,
        req: &RechargeRequest,
        index: usize,
        total_to_recharge: usize,
        total_records: usize,
        reporting_on_time: usize,
        queue: &mut AuxQueue,
    ) -> DispatchResult {
        let service = self.strategy.service;
        match ranked.provider.recharge(req).await {
            Ok(ws) => {
                let note_data = NoteCounters {
                    current_index: index + 1,
                    total_to_recharge,
                    reporting_on_time,
                    total_records,
                    is_recovery: false,
                };
                let item = AuxQueueItem::for_success(
                    service,
                    cand,
                    ws,
                    plan.days,
                    note_data,
                    self.clock.now_unix(),
                    self.clock.format_dd_mm_yyyy(cand.unix_saldo),
                );
                // Queue-before-DB: the enqueue must be durable before this
                // function returns success.
                if let Err(e) = queue.enqueue(item) {
                    // Paid but not journaled — loudest possible failure. The
                    // marker still samples it via the in-flight rewrite below.
                    error!(%service, sim = %cand.sim, error = %e, "CRITICAL: paid recharge failed to journal");
                    return DispatchResult::CandidateFailed;
                }
                let in_flight = queue.pending_db_items();
                if let Err(e) = queue.mark_processing_start(&in_flight) {
                    warn!(%service, error = %e, "marker refresh failed");
                }
                DispatchResult::Enqueued
            }
            Err(e @ ProviderError::Credentials { .. }) | Err(e @ ProviderError::Transport { .. }) => {
                warn!(%service, provider = %ranked.provider.name(), error = %e, "provider unusable, failing over");
                DispatchResult::ProviderUnusable
            }
            Err(e) => {
                warn!(%service, sim = %cand.sim, error = %e, "webservice rejected candidate");
                DispatchResult::CandidateFailed
            }
        }
    }

    /// Drain every pending-DB item through the batch writer before any new
    /// dispatch. Items with no stored webservice response can never be
    /// verified against the ledger and are terminally failed.
    async fn drain_recovery(&self, queue: &mut AuxQueue) -> RecoveryStats {
        let service = self.strategy.service;
        let pending = queue.pending_db_items();
        if pending.is_empty() {
            return RecoveryStats::default();
        }

        let mut stats = RecoveryStats {
            drained: pending.len(),
            ..Default::default()
        };

        let (usable, unusable): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|it| it.webservice_response.is_some());

        for it in &unusable {
            warn!(%service, sim = %it.sim, "recovery item has no webservice response; terminal");
            let _ = queue.mark_failed_terminal(&it.id, "no webservice response to recover");
            stats.failed += 1;
        }

        if usable.is_empty() {
            return stats;
        }

        info!(%service, items = usable.len(), "recovery drain start");
        let counters = BatchCounters {
            total_to_recharge: usable.len(),
            reporting_on_time: usable[0].note_data.reporting_on_time,
            total_records: usable[0].note_data.total_records.max(usable.len()),
            is_recovery: true,
        };
        match self.write_batch_and_cleanup(queue, &usable, counters).await {
            Ok(outcome) => {
                stats.inserted = outcome.inserted;
                stats.duplicates = outcome.duplicates;
            }
            Err(e) => {
                error!(%service, error = %e, "recovery batch write failed");
                stats.failed += usable.len();
            }
        }
        stats
    }

    /// One master + N details in one transaction, then per-item folio
    /// verification before anything leaves the queue.
    async fn write_batch_and_cleanup(
        &self,
        queue: &mut AuxQueue,
        items: &[AuxQueueItem],
        counters: BatchCounters,
    ) -> anyhow::Result<BatchOutcome> {
        let service = self.strategy.service;
        let provider_name = items
            .iter()
            .find_map(|it| it.provider)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "N/A".to_string());

        let master = NewMaster {
            total: items.iter().map(|it| it.amount).sum(),
            fecha_unix: self.clock.now_unix(),
            notas: format_master_note(&MasterNoteArgs {
                service,
                success: items.len(),
                total_to_recharge: counters.total_to_recharge,
                pending_end_of_day: counters.total_to_recharge.saturating_sub(items.len()),
                reporting_on_time: counters.reporting_on_time,
                processed: items.len(),
                total_records: counters.total_records,
                is_recovery: counters.is_recovery,
                single: (items.len() == 1).then(|| {
                    (
                        items[0].record.descripcion.clone(),
                        items[0].record.empresa.clone(),
                    )
                }),
            }),
            quien: OPERATOR.to_string(),
            proveedor: provider_name.clone(),
            tipo: service.ledger_kind().to_string(),
            resumen: RechargeSummary::success_only(items.len() as u32),
        };

        let batch_items: Vec<BatchItem> = items
            .iter()
            .map(|it| self.to_batch_item(it))
            .collect();

        let write = self.ledger.write_batch(&master, &batch_items).await;
        let report = match write {
            Ok(r) => r,
            Err(e) => {
                for it in items {
                    let _ = queue.mark_failed(&it.id, &format!("db insert failed: {e}"));
                }
                return Err(e);
            }
        };

        for id in &report.inserted {
            let _ = queue.mark_inserted(id);
        }
        for id in &report.duplicates {
            info!(%service, item = %id, "duplicate folio folded (already recorded)");
            let _ = queue.mark_duplicate(id);
        }

        // CLEANUP: selective, verification-gated. An unverified item keeps
        // its status and stays queued — a paid recharge is never dropped on
        // trust.
        let processed: Vec<AuxQueueItem> = queue
            .items()
            .iter()
            .filter(|it| it.status.is_processed())
            .cloned()
            .collect();
        for it in processed {
            let verified = match it.folio() {
                Some(folio) => self
                    .ledger
                    .folio_exists(folio, &it.sim)
                    .await
                    .unwrap_or(false),
                None => false,
            };
            if verified {
                let _ = queue.remove(&it.id);
            } else {
                warn!(%service, sim = %it.sim, "processed item failed folio verification; kept in queue");
            }
        }

        let outcome = BatchOutcome {
            service,
            master_id: report.master_id,
            inserted: report.inserted.len(),
            duplicates: report.duplicates.len(),
            total_amount: master.total,
            provider: provider_name,
            is_recovery: counters.is_recovery,
        };
        info!(
            %service,
            master_id = outcome.master_id,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            total = outcome.total_amount,
            provider = %outcome.provider,
            is_recovery = outcome.is_recovery,
            "batch committed"
        );
        if let Some(observer) = &self.observer {
            observer(&outcome);
        }
        Ok(outcome)
    }

    fn to_batch_item(&self, it: &AuxQueueItem) -> BatchItem {
        let ws = it
            .webservice_response
            .as_ref()
            .expect("batch items carry a webservice response");
        let voz = (self.strategy.service == ServiceType::Voz)
            .then(|| {
                it.record.codigo_paquete.as_ref().map(|code| VozDetailNote {
                    code: code.clone(),
                    psl: self
                        .strategy
                        .packages
                        .get(code)
                        .map(|p| p.psl.clone())
                        .unwrap_or_default(),
                    days: it.days_validity,
                    provider: ws.provider,
                })
            })
            .flatten();

        BatchItem {
            item_id: it.id.clone(),
            service: it.service,
            sim: it.sim.clone(),
            amount: it.amount,
            dispositivo: it.record.dispositivo.clone(),
            vehiculo: it.record.descripcion.clone(),
            detalle: format_detail_text(&it.sim, ws, voz.as_ref()),
            folio: Some(ws.folio.clone()),
            new_expiry_unix: self.strategy.new_expiry_unix(&self.clock, it.days_validity),
        }
    }

    /// Clean exit for every path: marker down.
    fn finish(&self, queue: &mut AuxQueue) {
        if let Err(e) = queue.mark_processing_end() {
            warn!(service = %self.strategy.service, error = %e, "marker removal failed");
        }
    }
}

enum DispatchResult {
    Enqueued,
    ProviderUnusable,
    CandidateFailed,
}

struct BatchCounters {
    total_to_recharge: usize,
    reporting_on_time: usize,
    total_records: usize,
    is_recovery: bool,
}
