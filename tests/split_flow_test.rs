//! Split-flow rendezvous tests
//!
//! Every branch of a split leaves exactly one completion token, whatever
//! happened on its thread, so the joining thread never waits forever.

use anyhow::{anyhow, bail};
use batch_kernel::execution::{BatchStatus, RuntimeWorkUnitExecution};
use batch_kernel::kernel::CompletionLedger;
use batch_kernel::split_flow::CompletionRendezvous;
use batch_kernel::unit::{ThreadRootController, WorkUnit, WorkUnitCallback};
use batch_kernel::BatchError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const JOB_ID: u64 = 50;

struct CompletingFlow;

impl ThreadRootController for CompletingFlow {
    fn run_on_thread(
        &self,
        execution: &mut RuntimeWorkUnitExecution,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        execution.set_batch_status(BatchStatus::Started)?;
        execution.set_batch_status(BatchStatus::Completed)?;
        execution.set_exit_status("FLOW_DONE");
        Ok(())
    }
}

struct ThrowingFlow;

impl ThreadRootController for ThrowingFlow {
    fn run_on_thread(
        &self,
        execution: &mut RuntimeWorkUnitExecution,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        bail!("flow {} hit a bad record", execution.flow_name().unwrap_or_default())
    }
}

struct FailingEnd;

impl WorkUnitCallback for FailingEnd {
    fn unit_ended(&self, _execution: &RuntimeWorkUnitExecution) -> anyhow::Result<()> {
        Err(anyhow!("listener could not flush"))
    }
}

/// Branch controller that records whether it was reached
#[derive(Default)]
struct WatchedFlow {
    invoked: AtomicBool,
}

impl ThreadRootController for WatchedFlow {
    fn run_on_thread(
        &self,
        execution: &mut RuntimeWorkUnitExecution,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.invoked.store(true, Ordering::SeqCst);
        execution.set_batch_status(BatchStatus::Completed)?;
        Ok(())
    }
}

struct RefusingStart;

impl WorkUnitCallback for RefusingStart {
    fn unit_started(&self, _execution: &mut RuntimeWorkUnitExecution) -> anyhow::Result<()> {
        Err(anyhow!("branch listener is not ready"))
    }
}

fn flow_unit(
    rendezvous: &CompletionRendezvous,
    id: u64,
    flow: &str,
    controller: Arc<dyn ThreadRootController>,
    ledger: Arc<CompletionLedger>,
) -> WorkUnit {
    WorkUnit::builder(
        RuntimeWorkUnitExecution::split_flow(id, JOB_ID, "nightly", flow),
        controller,
        ledger,
    )
    .with_rendezvous(rendezvous.clone())
    .build()
}

fn spawn_all(units: Vec<WorkUnit>) -> Vec<thread::JoinHandle<()>> {
    units
        .into_iter()
        .map(|mut unit| {
            thread::spawn(move || {
                let _ = unit.run();
            })
        })
        .collect()
}

#[test]
fn test_every_throwing_branch_leaves_a_token() {
    let rendezvous = CompletionRendezvous::new();
    let ledger = Arc::new(CompletionLedger::new());
    let branches = 6;

    let units = (0..branches)
        .map(|i| {
            flow_unit(
                &rendezvous,
                JOB_ID + 1 + i as u64,
                &format!("flow{i}"),
                Arc::new(ThrowingFlow),
                ledger.clone(),
            )
        })
        .collect();
    let handles = spawn_all(units);

    let outcome = rendezvous
        .await_all(branches, Duration::from_secs(5))
        .expect("every branch should join");
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(outcome.completed.len(), branches);
    assert!(outcome.completed.iter().all(|t| t.batch_status() == BatchStatus::Failed));
    assert_eq!(outcome.batch_status, BatchStatus::Failed);
    assert_eq!(rendezvous.pending(), 0);
    assert_eq!(ledger.children_of(JOB_ID).len(), branches);
}

#[test]
fn test_mixed_branches_roll_up_to_failed() {
    let rendezvous = CompletionRendezvous::new();
    let ledger = Arc::new(CompletionLedger::new());

    let handles = spawn_all(vec![
        flow_unit(&rendezvous, 51, "A", Arc::new(CompletingFlow), ledger.clone()),
        flow_unit(&rendezvous, 52, "B", Arc::new(ThrowingFlow), ledger.clone()),
    ]);

    let outcome = rendezvous.await_all(2, Duration::from_secs(5)).unwrap();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut branches: Vec<_> = outcome
        .completed
        .iter()
        .map(|t| (t.flow_name().unwrap_or_default().to_string(), t.batch_status(), t.exit_status()))
        .collect();
    branches.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(
        branches,
        vec![
            ("A".to_string(), BatchStatus::Completed, "FLOW_DONE".to_string()),
            ("B".to_string(), BatchStatus::Failed, "FAILED".to_string()),
        ]
    );
    assert_eq!(outcome.batch_status, BatchStatus::Failed);
}

#[test]
fn test_failing_end_callback_still_adds_token() {
    let rendezvous = CompletionRendezvous::new();
    let ledger = Arc::new(CompletionLedger::new());

    let mut unit = WorkUnit::builder(
        RuntimeWorkUnitExecution::split_flow(60, JOB_ID, "nightly", "audit"),
        Arc::new(CompletingFlow),
        ledger.clone(),
    )
    .with_after_callback(Arc::new(FailingEnd))
    .with_rendezvous(rendezvous.clone())
    .build();

    unit.run().expect("end callback failures are not unit failures");

    let token = rendezvous.poll(Duration::from_secs(1)).expect("token");
    assert_eq!(token.batch_status(), BatchStatus::Completed);
    assert_eq!(token.execution().id(), 60);
    assert_eq!(ledger.status_of(60), Some(BatchStatus::Completed));
}

#[test]
fn test_join_times_out_when_a_branch_never_runs() {
    let rendezvous = CompletionRendezvous::new();
    let ledger = Arc::new(CompletionLedger::new());

    let handles = spawn_all(vec![flow_unit(&rendezvous, 71, "only", Arc::new(CompletingFlow), ledger)]);

    let err = rendezvous.await_all(2, Duration::from_millis(200)).unwrap_err();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(matches!(err, BatchError::JoinTimeout { expected: 2, received: 1 }));
}

#[test]
fn test_failing_start_callback_leaves_one_failed_token() {
    let rendezvous = CompletionRendezvous::new();
    let ledger = Arc::new(CompletionLedger::new());
    let controller = Arc::new(WatchedFlow::default());

    let mut unit = WorkUnit::builder(
        RuntimeWorkUnitExecution::split_flow(80, JOB_ID, "nightly", "extract"),
        controller.clone(),
        ledger.clone(),
    )
    .with_before_callback(Arc::new(RefusingStart))
    .with_rendezvous(rendezvous.clone())
    .build();

    let err = unit.run().unwrap_err();
    assert!(matches!(err, BatchError::SetupFailure { ref message, .. } if message.contains("not ready")));
    assert!(!controller.invoked.load(Ordering::SeqCst));

    let outcome = rendezvous.await_all(1, Duration::from_secs(1)).unwrap();
    assert_eq!(outcome.completed.len(), 1);
    assert_eq!(outcome.completed[0].batch_status(), BatchStatus::Failed);
    assert_eq!(outcome.completed[0].execution().id(), 80);
    assert_eq!(outcome.batch_status, BatchStatus::Failed);
    assert!(rendezvous.poll(Duration::from_millis(20)).is_none());
    assert_eq!(ledger.status_of(80), Some(BatchStatus::Failed));
}
