//! Durable auxiliary queue.
//!
//! Every successful webservice call becomes money already spent; this queue
//! is the proof of that spend between the provider's confirmation and the
//! ledger commit. It is a per-service append-only JSONL journal: `enqueue`
//! and every status transition append one line and fsync before returning, so
//! a crash at any point replays to the exact pre-crash state. `clean_processed`
//! compacts the journal by rewriting it with only the surviving items (write
//! temp + fsync + rename).
//!
//! A sibling marker file records that a pipeline was mid-flight; finding one
//! at startup means the process died between webservice success and queue
//! cleanup, and the marker's sample is re-enqueued for recovery.
//!
//! Single-writer per service type. Cross-process exclusivity is the lock
//! manager's job; in-process the queue is owned by one pipeline at a time.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use rcg_schemas::{AuxQueueItem, QueueItemStatus, ServiceType};

// ---------------------------------------------------------------------------
// Journal format
// ---------------------------------------------------------------------------

/// One journal line. The journal is replayed top-to-bottom on open; unknown
/// sims in a mutation line mean the item was compacted away and the line is
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Enqueue {
        item: AuxQueueItem,
    },
    SetStatus {
        sim: String,
        status: QueueItemStatus,
        error: Option<String>,
        at_unix: i64,
    },
    Remove {
        sim: String,
    },
}

// ---------------------------------------------------------------------------
// Crash-recovery marker
// ---------------------------------------------------------------------------

/// Written on pipeline entry, deleted on clean exit. Its presence at startup
/// is the crash signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashRecoveryMarker {
    pub was_processing: bool,
    pub started_at_unix: i64,
    pub items_in_process: usize,
    pub sample: Vec<AuxQueueItem>,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub inserted: usize,
    pub duplicate: usize,
    pub failed: usize,
    pub total: usize,
}

impl QueueStats {
    /// Items that still owe a DB confirmation, including failed ones.
    pub fn pending_db(&self) -> usize {
        self.pending + self.failed
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CleanReport {
    pub cleaned: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerRecovery {
    pub was_processing: bool,
    pub reenqueued: usize,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub struct AuxQueue {
    service: ServiceType,
    journal_path: PathBuf,
    marker_path: PathBuf,
    /// FIFO by insertion; replay preserves order.
    items: Vec<AuxQueueItem>,
}

impl AuxQueue {
    /// Open (or create) the queue for one service, replaying any existing
    /// journal. Does NOT consume the crash marker — call
    /// [`AuxQueue::recover_from_marker`] explicitly so startup controls when
    /// recovery items appear.
    pub fn open(state_dir: impl AsRef<Path>, service: ServiceType) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir)
            .with_context(|| format!("create state dir {}", state_dir.display()))?;

        let journal_path = state_dir.join(format!("queue_{}.jsonl", service.as_str()));
        let marker_path = state_dir.join(format!("processing_{}.json", service.as_str()));

        let items = replay_journal(&journal_path)?;

        Ok(Self {
            service,
            journal_path,
            marker_path,
            items,
        })
    }

    pub fn service(&self) -> ServiceType {
        self.service
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[AuxQueueItem] {
        &self.items
    }

    /// Items still owing a DB confirmation, FIFO.
    pub fn pending_db_items(&self) -> Vec<AuxQueueItem> {
        self.items
            .iter()
            .filter(|i| i.status.is_pending_db())
            .cloned()
            .collect()
    }

    /// Durably append a new item. The fsync completes before this returns —
    /// the caller may only proceed to the DB once this has succeeded.
    pub fn enqueue(&mut self, item: AuxQueueItem) -> Result<()> {
        self.append(&JournalEntry::Enqueue { item: item.clone() })?;
        info!(
            service = %self.service,
            sim = %item.sim,
            folio = item.folio().unwrap_or("-"),
            status = item.status.as_str(),
            "queue item persisted"
        );
        self.items.push(item);
        Ok(())
    }

    pub fn mark_inserted(&mut self, key: &str) -> Result<bool> {
        self.set_status(key, QueueItemStatus::Inserted, None)
    }

    pub fn mark_duplicate(&mut self, key: &str) -> Result<bool> {
        self.set_status(key, QueueItemStatus::Duplicate, None)
    }

    pub fn mark_failed(&mut self, key: &str, err: &str) -> Result<bool> {
        self.set_status(
            key,
            QueueItemStatus::DbInsertionFailedPendingRecovery,
            Some(err.to_string()),
        )
    }

    /// Terminal failure that recovery will not retry (e.g. provider domain
    /// error while draining).
    pub fn mark_failed_terminal(&mut self, key: &str, err: &str) -> Result<bool> {
        self.set_status(key, QueueItemStatus::Failed, Some(err.to_string()))
    }

    /// Flip an item into a given status, journaled. `key` matches item id or
    /// sim. Attempts counter and last-attempt stamp move together with every
    /// transition.
    pub fn set_status(
        &mut self,
        key: &str,
        status: QueueItemStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let Some(idx) = self.find(key) else {
            warn!(service = %self.service, key, "status change for unknown queue item");
            return Ok(false);
        };
        let sim = self.items[idx].sim.clone();
        self.append(&JournalEntry::SetStatus {
            sim,
            status,
            error: error.clone(),
            at_unix: now,
        })?;
        apply_status(&mut self.items[idx], status, error, now);
        Ok(true)
    }

    /// Remove one item after the caller verified its folio exists in the
    /// detail table. Never called on unverified items.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let Some(idx) = self.find(key) else {
            return Ok(false);
        };
        let sim = self.items[idx].sim.clone();
        self.append(&JournalEntry::Remove { sim })?;
        self.items.remove(idx);
        Ok(true)
    }

    /// Drop every processed (inserted/duplicate) item and compact the
    /// journal.
    pub fn clean_processed(&mut self) -> Result<CleanReport> {
        let before = self.items.len();
        self.items.retain(|i| !i.status.is_processed());
        let cleaned = before - self.items.len();
        self.rewrite_journal()?;
        Ok(CleanReport {
            cleaned,
            remaining: self.items.len(),
        })
    }

    pub fn stats(&self) -> QueueStats {
        let mut s = QueueStats {
            total: self.items.len(),
            ..Default::default()
        };
        for i in &self.items {
            match i.status {
                QueueItemStatus::WebserviceSuccessPendingDb | QueueItemStatus::RecoveryPendingDb => {
                    s.pending += 1
                }
                QueueItemStatus::DbInsertionFailedPendingRecovery | QueueItemStatus::Failed => {
                    s.failed += 1
                }
                QueueItemStatus::Inserted => s.inserted += 1,
                QueueItemStatus::Duplicate => s.duplicate += 1,
            }
        }
        s
    }

    // -- crash marker -------------------------------------------------------

    /// Write the marker before any webservice dispatch. `sample` is the set
    /// of items in flight this tick.
    pub fn mark_processing_start(&mut self, sample: &[AuxQueueItem]) -> Result<()> {
        let marker = CrashRecoveryMarker {
            was_processing: true,
            started_at_unix: Utc::now().timestamp(),
            items_in_process: sample.len(),
            sample: sample.to_vec(),
        };
        let json = serde_json::to_string_pretty(&marker).context("serialize crash marker")?;
        write_durable(&self.marker_path, json.as_bytes())
            .with_context(|| format!("write marker {}", self.marker_path.display()))
    }

    /// Clean-exit path: the tick finished, no crash to recover.
    pub fn mark_processing_end(&mut self) -> Result<()> {
        if self.marker_path.exists() {
            fs::remove_file(&self.marker_path)
                .with_context(|| format!("remove marker {}", self.marker_path.display()))?;
        }
        Ok(())
    }

    /// Startup recovery: if a marker says a tick died mid-flight, re-enqueue
    /// its sampled items as `db_insertion_failed_pending_recovery` and clear
    /// the marker. Items already present in the queue keep their journaled
    /// state (the journal is truth; the marker only fills holes).
    pub fn recover_from_marker(&mut self) -> Result<MarkerRecovery> {
        if !self.marker_path.exists() {
            return Ok(MarkerRecovery::default());
        }
        let raw = fs::read_to_string(&self.marker_path)
            .with_context(|| format!("read marker {}", self.marker_path.display()))?;
        let marker: CrashRecoveryMarker =
            serde_json::from_str(&raw).context("parse crash marker")?;

        let mut reenqueued = 0usize;
        if marker.was_processing {
            for mut item in marker.sample {
                if self.find(&item.sim).is_some() {
                    continue;
                }
                item.status = QueueItemStatus::DbInsertionFailedPendingRecovery;
                item.last_error = Some("crash marker recovery".to_string());
                self.enqueue(item)?;
                reenqueued += 1;
            }
            warn!(
                service = %self.service,
                reenqueued,
                items_in_process = marker.items_in_process,
                "crash marker found; items re-enqueued for recovery"
            );
        }

        fs::remove_file(&self.marker_path)
            .with_context(|| format!("remove marker {}", self.marker_path.display()))?;

        Ok(MarkerRecovery {
            was_processing: marker.was_processing,
            reenqueued,
        })
    }

    // -- internals ----------------------------------------------------------

    fn find(&self, key: &str) -> Option<usize> {
        self.items.iter().position(|i| i.sim == key || i.id == key)
    }

    fn append(&self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("serialize journal entry")?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .with_context(|| format!("open journal {}", self.journal_path.display()))?;
        f.write_all(line.as_bytes())
            .context("write journal line failed")?;
        f.write_all(b"\n").context("write newline failed")?;
        // Durable before return: the whole crash-recovery contract hangs on
        // this line being on stable storage when the method returns.
        f.sync_all().context("journal fsync failed")?;
        Ok(())
    }

    fn rewrite_journal(&self) -> Result<()> {
        let tmp = self.journal_path.with_extension("jsonl.tmp");
        {
            let mut f = File::create(&tmp)
                .with_context(|| format!("create journal temp {}", tmp.display()))?;
            for item in &self.items {
                let line = serde_json::to_string(&JournalEntry::Enqueue { item: item.clone() })
                    .context("serialize journal entry")?;
                f.write_all(line.as_bytes())?;
                f.write_all(b"\n")?;
            }
            f.sync_all().context("journal compaction fsync failed")?;
        }
        fs::rename(&tmp, &self.journal_path)
            .with_context(|| format!("swap compacted journal {}", self.journal_path.display()))?;
        Ok(())
    }
}

fn apply_status(
    item: &mut AuxQueueItem,
    status: QueueItemStatus,
    error: Option<String>,
    at_unix: i64,
) {
    item.status = status;
    item.attempts += 1;
    item.last_attempt_unix = Some(at_unix);
    if error.is_some() {
        item.last_error = error;
    }
}

fn replay_journal(path: &Path) -> Result<Vec<AuxQueueItem>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("read journal {}", path.display()))?;

    let mut items: Vec<AuxQueueItem> = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry: JournalEntry = serde_json::from_str(trimmed)
            .with_context(|| format!("parse journal line {} of {}", i + 1, path.display()))?;
        match entry {
            JournalEntry::Enqueue { item } => items.push(item),
            JournalEntry::SetStatus {
                sim,
                status,
                error,
                at_unix,
            } => {
                if let Some(item) = items.iter_mut().find(|it| it.sim == sim) {
                    apply_status(item, status, error, at_unix);
                }
            }
            JournalEntry::Remove { sim } => {
                items.retain(|it| it.sim != sim);
            }
        }
    }
    Ok(items)
}

/// Write bytes then fsync, creating parent dirs as needed.
fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    let mut f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcg_schemas::{CandidateSnapshot, NoteCounters};

    fn item(sim: &str, status: QueueItemStatus) -> AuxQueueItem {
        AuxQueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            service: ServiceType::Gps,
            sim: sim.to_string(),
            kind: ServiceType::Gps.queue_kind(),
            status,
            amount: 10,
            days_validity: 8,
            record: CandidateSnapshot {
                sim: sim.to_string(),
                descripcion: "UNIT".into(),
                empresa: "ACME".into(),
                dispositivo: "dev-1".into(),
                unix_saldo: 1_768_500_000,
                codigo_paquete: None,
            },
            webservice_response: None,
            note_data: NoteCounters {
                current_index: 1,
                total_to_recharge: 1,
                reporting_on_time: 0,
                total_records: 1,
                is_recovery: false,
            },
            provider: None,
            trans_id: None,
            attempts: 0,
            last_attempt_unix: None,
            added_at_unix: 1_768_500_000,
            last_error: None,
            expiration_date_human: "15/01/2026".into(),
        }
    }

    #[test]
    fn enqueue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
            q.enqueue(item("111", QueueItemStatus::WebserviceSuccessPendingDb))
                .unwrap();
            q.enqueue(item("222", QueueItemStatus::WebserviceSuccessPendingDb))
                .unwrap();
        }
        let q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        assert_eq!(q.len(), 2);
        // FIFO preserved across replay.
        assert_eq!(q.items()[0].sim, "111");
        assert_eq!(q.items()[1].sim, "222");
    }

    #[test]
    fn status_transitions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
            q.enqueue(item("111", QueueItemStatus::WebserviceSuccessPendingDb))
                .unwrap();
            q.mark_inserted("111").unwrap();
        }
        let q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        assert_eq!(q.items()[0].status, QueueItemStatus::Inserted);
        assert_eq!(q.items()[0].attempts, 1);
    }

    #[test]
    fn key_matches_id_or_sim() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        let it = item("111", QueueItemStatus::WebserviceSuccessPendingDb);
        let id = it.id.clone();
        q.enqueue(it).unwrap();
        assert!(q.mark_duplicate(&id).unwrap());
        assert_eq!(q.items()[0].status, QueueItemStatus::Duplicate);
    }

    #[test]
    fn clean_processed_keeps_pending_and_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        q.enqueue(item("111", QueueItemStatus::WebserviceSuccessPendingDb))
            .unwrap();
        q.enqueue(item("222", QueueItemStatus::WebserviceSuccessPendingDb))
            .unwrap();
        q.enqueue(item("333", QueueItemStatus::WebserviceSuccessPendingDb))
            .unwrap();
        q.mark_inserted("111").unwrap();
        q.mark_duplicate("222").unwrap();
        q.mark_failed("333", "tx aborted").unwrap();

        let report = q.clean_processed().unwrap();
        assert_eq!(report.cleaned, 2);
        assert_eq!(report.remaining, 1);

        // Compacted journal replays to the same state.
        let q2 = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        assert_eq!(q2.len(), 1);
        assert_eq!(q2.items()[0].sim, "333");
        assert_eq!(
            q2.items()[0].status,
            QueueItemStatus::DbInsertionFailedPendingRecovery
        );
    }

    #[test]
    fn clean_processed_is_identity_when_nothing_processed() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        q.enqueue(item("111", QueueItemStatus::WebserviceSuccessPendingDb))
            .unwrap();
        let report = q.clean_processed().unwrap();
        assert_eq!(report.cleaned, 0);
        assert_eq!(report.remaining, 1);
    }

    #[test]
    fn stats_bucket_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        q.enqueue(item("111", QueueItemStatus::WebserviceSuccessPendingDb))
            .unwrap();
        q.enqueue(item("222", QueueItemStatus::WebserviceSuccessPendingDb))
            .unwrap();
        q.mark_failed("222", "boom").unwrap();

        let s = q.stats();
        assert_eq!(s.pending, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.total, 2);
        assert_eq!(s.pending_db(), 2);
    }

    #[test]
    fn marker_recovery_reenqueues_sample() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
            let sample = vec![item("111", QueueItemStatus::WebserviceSuccessPendingDb)];
            q.mark_processing_start(&sample).unwrap();
            // Simulated crash: no mark_processing_end, queue file empty.
        }
        let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        let rec = q.recover_from_marker().unwrap();
        assert!(rec.was_processing);
        assert_eq!(rec.reenqueued, 1);
        assert_eq!(
            q.items()[0].status,
            QueueItemStatus::DbInsertionFailedPendingRecovery
        );
        // Marker consumed; second recovery is a no-op.
        let rec2 = q.recover_from_marker().unwrap();
        assert!(!rec2.was_processing);
    }

    #[test]
    fn marker_does_not_override_journaled_items() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
            q.enqueue(item("111", QueueItemStatus::WebserviceSuccessPendingDb))
                .unwrap();
            let sample = q.items().to_vec();
            q.mark_processing_start(&sample).unwrap();
        }
        let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        let rec = q.recover_from_marker().unwrap();
        // Journal already has the item; marker fills no holes.
        assert_eq!(rec.reenqueued, 0);
        assert_eq!(q.len(), 1);
        assert_eq!(
            q.items()[0].status,
            QueueItemStatus::WebserviceSuccessPendingDb
        );
    }

    #[test]
    fn clean_exit_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        q.mark_processing_start(&[]).unwrap();
        q.mark_processing_end().unwrap();
        let rec = q.recover_from_marker().unwrap();
        assert!(!rec.was_processing);
    }

    #[test]
    fn remove_is_journaled() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
            q.enqueue(item("111", QueueItemStatus::WebserviceSuccessPendingDb))
                .unwrap();
            q.mark_inserted("111").unwrap();
            assert!(q.remove("111").unwrap());
        }
        let q = AuxQueue::open(dir.path(), ServiceType::Gps).unwrap();
        assert!(q.is_empty());
    }
}
