//! Worker pool running one work unit per blocking thread
//!
//! Units run on tokio's blocking thread pool, gated by two semaphores:
//! one for top-level jobs and one for partitions and split-flows. A job
//! waiting on its children never holds a slot its children need.
//!
//! A split-flow branch that runs a partitioned step (or a nested split)
//! shares the sub-unit semaphore with its children. While it blocks on
//! them it hands its slot back and takes one again once they reported.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::config::BatchConfig;
use crate::execution::{BatchStatus, RuntimeWorkUnitExecution, WorkUnitKind};
use crate::partition::{PartitionReplyHub, PartitionedStepOutcome};
use crate::split_flow::{CompletionRendezvous, SplitOutcome};
use crate::unit::{StopHandle, WorkUnit};
use crate::{BatchError, Result};

/// Outcome of one unit run by the pool
#[derive(Debug)]
pub struct UnitReport {
    /// Execution id
    pub execution_id: u64,
    /// Unit kind
    pub kind: WorkUnitKind,
    /// Terminal batch status
    pub batch_status: BatchStatus,
    /// Exit status
    pub exit_status: String,
    /// Setup or processing failure returned by the unit
    pub error: Option<BatchError>,
    /// Final execution context; absent when the pool lost the unit
    pub execution: Option<RuntimeWorkUnitExecution>,
}

impl UnitReport {
    fn finished(execution: RuntimeWorkUnitExecution, result: Result<()>) -> Self {
        Self {
            execution_id: execution.id(),
            kind: execution.kind(),
            batch_status: execution.batch_status(),
            exit_status: execution.exit_status(),
            error: result.err(),
            execution: Some(execution),
        }
    }

    fn lost(execution_id: u64, kind: WorkUnitKind, error: BatchError) -> Self {
        Self {
            execution_id,
            kind,
            batch_status: BatchStatus::Failed,
            exit_status: BatchStatus::Failed.as_str().to_string(),
            error: Some(error),
            execution: None,
        }
    }

    /// Whether the unit ended without a failure
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.batch_status != BatchStatus::Failed
    }
}

/// Bounded pool that runs work units on dedicated threads
#[derive(Clone)]
pub struct WorkUnitExecutor {
    handle: Handle,
    job_slots: Arc<Semaphore>,
    sub_unit_slots: Arc<Semaphore>,
    in_flight: Arc<DashMap<u64, StopHandle>>,
    partition_reply_timeout: Duration,
    split_flow_join_timeout: Duration,
}

impl WorkUnitExecutor {
    /// Create a pool on `handle` sized by `config`
    pub fn new(handle: Handle, config: &BatchConfig) -> Result<Self> {
        config.validate()?;
        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            max_concurrent_sub_units = config.max_concurrent_sub_units,
            "Creating work unit executor"
        );
        Ok(Self {
            handle,
            job_slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            sub_unit_slots: Arc::new(Semaphore::new(config.max_concurrent_sub_units)),
            in_flight: Arc::new(DashMap::new()),
            partition_reply_timeout: config.partition_reply_timeout(),
            split_flow_join_timeout: config.split_flow_join_timeout(),
        })
    }

    /// Create a pool on the runtime the caller is running in
    pub fn current(config: &BatchConfig) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| BatchError::Config(e.to_string()))?;
        Self::new(handle, config)
    }

    /// Submit a unit; it runs once a slot of its kind is free
    pub fn submit(&self, unit: WorkUnit) -> JoinHandle<UnitReport> {
        let execution_id = unit.execution().id();
        let kind = unit.execution().kind();
        let slots = match kind {
            WorkUnitKind::Job => self.job_slots.clone(),
            WorkUnitKind::Partition | WorkUnitKind::SplitFlow => self.sub_unit_slots.clone(),
        };
        let in_flight = self.in_flight.clone();
        in_flight.insert(execution_id, unit.stop_handle());
        debug!(execution_id, kind = %kind, "Work unit submitted");

        self.handle.spawn(async move {
            let held = match slots.clone().acquire_owned().await {
                Ok(permit) => Some(HeldSlot { slots, permit }),
                Err(_) => None,
            };
            debug!(execution_id, "Acquired work unit slot");

            let report = match tokio::task::spawn_blocking(move || run_unit(unit, held)).await {
                Ok(report) => report,
                Err(e) => {
                    error!(execution_id, error = %e, "Work unit thread was lost");
                    UnitReport::lost(execution_id, kind, BatchError::Join(e))
                }
            };
            in_flight.remove(&execution_id);
            report
        })
    }

    /// Submit every unit and wait for all reports
    #[instrument(skip(self, units), fields(unit_count = units.len()))]
    pub async fn run_all(&self, units: Vec<WorkUnit>) -> Vec<UnitReport> {
        let (submitted, handles): (Vec<_>, Vec<_>) = units
            .into_iter()
            .map(|unit| ((unit.execution().id(), unit.execution().kind()), self.submit(unit)))
            .unzip();
        join_all(handles)
            .await
            .into_iter()
            .zip(submitted)
            .map(|(joined, (execution_id, kind))| match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(execution_id, error = %e, "Work unit task was lost");
                    UnitReport::lost(execution_id, kind, BatchError::Join(e))
                }
            })
            .collect()
    }

    /// Launch partition units and block until each reported a final status
    ///
    /// Meant for a job's controller thread. Must not be called from async
    /// code since it blocks the calling thread.
    pub fn run_partitions(&self, hub: &PartitionReplyHub, units: Vec<WorkUnit>) -> Result<PartitionedStepOutcome> {
        let expected = units.len();
        let receiver = hub.receiver();
        for unit in units {
            drop(self.submit(unit));
        }
        self.with_sub_unit_slot_released(|| {
            receiver.await_final_statuses(expected, self.partition_reply_timeout, |_| {})
        })
    }

    /// Launch split-flow units and block until every branch finished
    ///
    /// Each unit must have been built with `rendezvous`. Blocks the calling
    /// thread like [`WorkUnitExecutor::run_partitions`].
    pub fn run_split(&self, rendezvous: &CompletionRendezvous, units: Vec<WorkUnit>) -> Result<SplitOutcome> {
        let expected = units.len();
        for unit in units {
            drop(self.submit(unit));
        }
        self.with_sub_unit_slot_released(|| rendezvous.await_all(expected, self.split_flow_join_timeout))
    }

    /// Run `wait` with the calling unit's sub-unit slot handed back
    ///
    /// Job slots and threads outside this pool are left alone.
    fn with_sub_unit_slot_released<T>(&self, wait: impl FnOnce() -> T) -> T {
        let released = HELD_SLOT.with(|held| {
            let mut held = held.borrow_mut();
            let ours = matches!(held.as_ref(), Some(slot) if Arc::ptr_eq(&slot.slots, &self.sub_unit_slots));
            if ours {
                held.take()
            } else {
                None
            }
        });
        let Some(HeldSlot { slots, permit }) = released else {
            return wait();
        };
        drop(permit);
        debug!("Released sub-unit slot while waiting on children");

        let result = wait();

        match futures::executor::block_on(slots.clone().acquire_owned()) {
            Ok(permit) => HELD_SLOT.with(|held| *held.borrow_mut() = Some(HeldSlot { slots, permit })),
            Err(e) => error!(error = %e, "Could not take back sub-unit slot"),
        }
        result
    }

    /// Request a stop for a running unit; false when it is not in flight
    pub fn stop(&self, execution_id: u64) -> bool {
        match self.in_flight.get(&execution_id) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Units submitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Slot owned by the unit running on the current blocking thread
struct HeldSlot {
    slots: Arc<Semaphore>,
    permit: OwnedSemaphorePermit,
}

thread_local! {
    static HELD_SLOT: RefCell<Option<HeldSlot>> = const { RefCell::new(None) };
}

/// Clears the thread's slot when the unit is done, even on unwind
struct SlotGuard;

impl Drop for SlotGuard {
    fn drop(&mut self) {
        HELD_SLOT.with(|held| drop(held.borrow_mut().take()));
    }
}

fn run_unit(mut unit: WorkUnit, held: Option<HeldSlot>) -> UnitReport {
    HELD_SLOT.with(|slot| *slot.borrow_mut() = held);
    let _guard = SlotGuard;
    let result = unit.run();
    UnitReport::finished(unit.into_execution(), result)
}
