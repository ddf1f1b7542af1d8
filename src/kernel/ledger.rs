//! Kernel that keeps a record of every finished unit

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::execution::{BatchStatus, RuntimeWorkUnitExecution, WorkUnitKind};
use crate::kernel::BatchKernel;

/// Terminal state of one finished unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Unit kind
    pub kind: WorkUnitKind,
    /// Launching unit, if any
    pub parent_id: Option<u64>,
    /// Terminal batch status
    pub batch_status: BatchStatus,
    /// Exit status
    pub exit_status: String,
    /// When the kernel was notified
    pub completed_at: DateTime<Utc>,
}

/// [`BatchKernel`] recording completions keyed by execution id
#[derive(Debug, Default)]
pub struct CompletionLedger {
    records: DashMap<u64, CompletionRecord>,
    notifications: AtomicUsize,
}

impl CompletionLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `execution_id`, if that unit finished
    pub fn record(&self, execution_id: u64) -> Option<CompletionRecord> {
        self.records.get(&execution_id).map(|r| r.clone())
    }

    /// Terminal status for `execution_id`, if that unit finished
    pub fn status_of(&self, execution_id: u64) -> Option<BatchStatus> {
        self.records.get(&execution_id).map(|r| r.batch_status)
    }

    /// Ids of finished children of `parent_id`
    pub fn children_of(&self, parent_id: u64) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .records
            .iter()
            .filter(|entry| entry.value().parent_id == Some(parent_id))
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of notifications received
    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    /// Number of distinct units recorded
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was recorded yet
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl BatchKernel for CompletionLedger {
    fn unit_completed(&self, execution: &RuntimeWorkUnitExecution) -> anyhow::Result<()> {
        self.notifications.fetch_add(1, Ordering::SeqCst);
        debug!(
            unit = %execution.label(),
            batch_status = %execution.batch_status(),
            "Kernel notified of unit completion"
        );
        self.records.insert(
            execution.id(),
            CompletionRecord {
                kind: execution.kind(),
                parent_id: execution.parent_id(),
                batch_status: execution.batch_status(),
                exit_status: execution.exit_status(),
                completed_at: Utc::now(),
            },
        );
        Ok(())
    }
}
