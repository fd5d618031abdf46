//! In-memory ledger with real duplicate-folio semantics.
//!
//! Mirrors the MySQL writer's contract: one "transaction" per batch (staged,
//! then committed), a unique index on folio that folds duplicates instead of
//! aborting, expiry updates only for inserted items, and a scriptable write
//! failure for strict-recovery scenarios.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use rcg_pipeline::{BatchItem, BatchWriteReport, Ledger, NewMaster};

#[derive(Debug, Clone)]
pub struct StoredDetail {
    pub master_id: u64,
    pub sim: String,
    pub amount: i64,
    pub folio: Option<String>,
    pub detalle: String,
}

#[derive(Default)]
struct LedgerState {
    masters: Vec<(u64, NewMaster)>,
    details: Vec<StoredDetail>,
    folio_index: HashSet<String>,
    devices: HashMap<String, i64>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    fail_writes: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `write_batch` fail until cleared — drives the
    /// strict-recovery block scenarios.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Pre-existing detail row (e.g. from a previous partially-observed
    /// attempt) so a recovery insert hits the folio unique index.
    pub fn seed_detail(&self, folio: &str, sim: &str) {
        let mut st = self.state.lock().unwrap();
        st.folio_index.insert(folio.to_string());
        st.details.push(StoredDetail {
            master_id: 0,
            sim: sim.to_string(),
            amount: 0,
            folio: Some(folio.to_string()),
            detalle: "seeded".into(),
        });
    }

    pub fn seed_device(&self, sim: &str, expiry_unix: i64) {
        self.state
            .lock()
            .unwrap()
            .devices
            .insert(sim.to_string(), expiry_unix);
    }

    pub fn masters(&self) -> Vec<(u64, NewMaster)> {
        self.state.lock().unwrap().masters.clone()
    }

    pub fn details(&self) -> Vec<StoredDetail> {
        self.state.lock().unwrap().details.clone()
    }

    pub fn device_expiry(&self, sim: &str) -> Option<i64> {
        self.state.lock().unwrap().devices.get(sim).copied()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn write_batch(
        &self,
        master: &NewMaster,
        items: &[BatchItem],
    ) -> Result<BatchWriteReport> {
        if items.is_empty() {
            return Err(anyhow!("write_batch called with empty batch"));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("scripted ledger write failure"));
        }

        let mut st = self.state.lock().unwrap();
        let master_id = st.masters.len() as u64 + 1;

        // Stage, then commit — only duplicates can "fail" per item, so the
        // all-or-nothing property holds by construction here.
        let mut staged_details = Vec::new();
        let mut staged_expiries = Vec::new();
        let mut report = BatchWriteReport {
            master_id,
            ..Default::default()
        };

        for item in items {
            let duplicate = item
                .folio
                .as_ref()
                .map(|f| st.folio_index.contains(f))
                .unwrap_or(false);
            if duplicate {
                report.duplicates.push(item.item_id.clone());
                continue;
            }
            staged_details.push(StoredDetail {
                master_id,
                sim: item.sim.clone(),
                amount: item.amount,
                folio: item.folio.clone(),
                detalle: item.detalle.clone(),
            });
            staged_expiries.push((item.sim.clone(), item.new_expiry_unix));
            report.inserted.push(item.item_id.clone());
        }

        st.masters.push((master_id, master.clone()));
        for d in staged_details {
            if let Some(f) = &d.folio {
                st.folio_index.insert(f.clone());
            }
            st.details.push(d);
        }
        for (sim, expiry) in staged_expiries {
            let slot = st.devices.entry(sim).or_insert(0);
            // Monotonic, as in the SQL writer.
            if expiry > *slot {
                *slot = expiry;
            }
        }

        Ok(report)
    }

    async fn folio_exists(&self, folio: &str, sim: &str) -> Result<bool> {
        let st = self.state.lock().unwrap();
        Ok(st
            .details
            .iter()
            .any(|d| d.folio.as_deref() == Some(folio) && d.sim == sim))
    }
}
