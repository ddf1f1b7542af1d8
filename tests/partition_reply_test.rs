//! Partition reply channel tests
//!
//! Every partition must deliver exactly one final status to the step that
//! launched it, even when it fails or panics before reporting one itself.

use anyhow::anyhow;
use batch_kernel::execution::{BatchStatus, PartitionPlanConfig, RuntimeWorkUnitExecution};
use batch_kernel::kernel::CompletionLedger;
use batch_kernel::partition::{
    BridgeConnection, InMemoryBridge, MessageBridge, PartitionReplyHub, PartitionReplyMsgType,
    ReplyChannelError, WireFormat,
};
use batch_kernel::unit::{ThreadRootController, WorkUnit, WorkUnitCallback};
use batch_kernel::BatchError;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STEP: &str = "load";
const TOP_LEVEL: u64 = 100;

/// What a scripted partition does once it is running
#[derive(Clone, Copy)]
enum Script {
    Complete,
    FailAfterPartialExit,
    Panic,
    ReportTwice,
    ChattyComplete,
}

struct ScriptedPartition {
    script: Script,
    invocations: AtomicUsize,
}

impl ScriptedPartition {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            invocations: AtomicUsize::new(0),
        })
    }
}

impl ThreadRootController for ScriptedPartition {
    fn run_on_thread(
        &self,
        execution: &mut RuntimeWorkUnitExecution,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        execution.set_batch_status(BatchStatus::Started)?;
        match self.script {
            Script::Complete => {
                execution.set_batch_status(BatchStatus::Completed)?;
                execution.send_final_status()?;
            }
            Script::FailAfterPartialExit => {
                execution.set_exit_status("PARTIAL");
                return Err(anyhow!("chunk 4 could not be written"));
            }
            Script::Panic => panic!("reader lost its cursor"),
            Script::ReportTwice => {
                execution.set_batch_status(BatchStatus::Completed)?;
                execution.send_final_status()?;
                let second = execution.send_final_status();
                assert_eq!(second, Err(ReplyChannelError::FinalStatusAlreadySent));
            }
            Script::ChattyComplete => {
                execution.send_status_update()?;
                execution.send_collector_data(b"rows=42".to_vec())?;
                execution.set_batch_status(BatchStatus::Completed)?;
                execution.send_final_status()?;
            }
        }
        Ok(())
    }
}

struct FailingStart;

impl WorkUnitCallback for FailingStart {
    fn unit_started(&self, _execution: &mut RuntimeWorkUnitExecution) -> anyhow::Result<()> {
        Err(anyhow!("listener could not open its log"))
    }
}

fn partition_unit(
    hub: &PartitionReplyHub,
    number: u32,
    controller: Arc<ScriptedPartition>,
    ledger: Arc<CompletionLedger>,
) -> WorkUnit {
    let plan = PartitionPlanConfig::new(TOP_LEVEL, STEP, number);
    let execution = RuntimeWorkUnitExecution::partition(
        TOP_LEVEL + 1 + number as u64,
        "import",
        plan.clone(),
        hub.queue_for(&plan),
    );
    WorkUnit::builder(execution, controller, ledger).build()
}

fn run_on_threads(units: Vec<WorkUnit>) -> Vec<(WorkUnit, batch_kernel::Result<()>)> {
    let handles: Vec<_> = units
        .into_iter()
        .map(|mut unit| {
            thread::spawn(move || {
                let result = unit.run();
                (unit, result)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("unit thread should not die"))
        .collect()
}

#[test]
fn test_failed_partition_gets_synthesized_final_status() {
    let hub = PartitionReplyHub::local();
    let receiver = hub.receiver();
    let ledger = Arc::new(CompletionLedger::new());

    let units = vec![
        partition_unit(&hub, 0, ScriptedPartition::new(Script::Complete), ledger.clone()),
        partition_unit(&hub, 1, ScriptedPartition::new(Script::FailAfterPartialExit), ledger.clone()),
        partition_unit(&hub, 2, ScriptedPartition::new(Script::Complete), ledger.clone()),
    ];
    let finished = run_on_threads(units);

    let outcome = receiver
        .await_final_statuses(3, Duration::from_secs(5), |_| {})
        .expect("all partitions should report");

    assert_eq!(outcome.final_statuses.len(), 3);
    assert_eq!(outcome.batch_status, BatchStatus::Failed);

    let mut by_partition = outcome.final_statuses.clone();
    by_partition.sort_by_key(|m| m.partition_number());
    assert_eq!(by_partition[0].batch_status, BatchStatus::Completed);
    assert_eq!(by_partition[0].exit_status, "COMPLETED");
    assert_eq!(by_partition[1].batch_status, BatchStatus::Failed);
    assert_eq!(by_partition[1].exit_status, "FAILED");
    assert_eq!(by_partition[2].batch_status, BatchStatus::Completed);

    // The partition's own context keeps the exit status it set
    let (failed, result) = &finished[1];
    assert!(matches!(result, Err(BatchError::ProcessingFailure { .. })));
    assert_eq!(failed.batch_status(), BatchStatus::Failed);
    assert_eq!(failed.exit_status(), "PARTIAL");
    assert!(!failed.execution().is_final_status_sent());

    assert_eq!(ledger.children_of(TOP_LEVEL).len(), 3);
    assert!(receiver.poll(Duration::from_millis(20)).unwrap().is_none());
}

#[test]
fn test_panicking_partition_still_reports() {
    let hub = PartitionReplyHub::local();
    let ledger = Arc::new(CompletionLedger::new());

    let finished = run_on_threads(vec![partition_unit(
        &hub,
        0,
        ScriptedPartition::new(Script::Panic),
        ledger.clone(),
    )]);

    let msg = hub
        .receiver()
        .poll(Duration::from_secs(1))
        .unwrap()
        .expect("synthesized final status");
    assert_eq!(msg.msg_type, PartitionReplyMsgType::PartitionFinalStatus);
    assert_eq!(msg.batch_status, BatchStatus::Failed);

    match &finished[0].1 {
        Err(BatchError::ProcessingFailure { message, .. }) => {
            assert!(message.contains("reader lost its cursor"), "got: {message}");
        }
        other => panic!("expected processing failure, got {other:?}"),
    }
    assert_eq!(ledger.status_of(TOP_LEVEL + 1), Some(BatchStatus::Failed));
}

#[test]
fn test_setup_failure_skips_processing_but_reports() {
    let hub = PartitionReplyHub::local();
    let ledger = Arc::new(CompletionLedger::new());
    let controller = ScriptedPartition::new(Script::Complete);

    let plan = PartitionPlanConfig::new(TOP_LEVEL, STEP, 0);
    let execution = RuntimeWorkUnitExecution::partition(7, "import", plan.clone(), hub.queue_for(&plan));
    let mut unit = WorkUnit::builder(execution, controller.clone(), ledger.clone())
        .with_before_callback(Arc::new(FailingStart))
        .build();

    let err = unit.run().unwrap_err();

    assert!(matches!(err, BatchError::SetupFailure { .. }));
    assert_eq!(controller.invocations.load(Ordering::SeqCst), 0);
    assert_eq!(unit.batch_status(), BatchStatus::Failed);

    let msg = hub.receiver().poll(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(msg.batch_status, BatchStatus::Failed);
    assert_eq!(ledger.status_of(7), Some(BatchStatus::Failed));
}

#[test]
fn test_only_one_final_status_per_partition() {
    let hub = PartitionReplyHub::local();
    let receiver = hub.receiver();
    let ledger = Arc::new(CompletionLedger::new());

    let finished = run_on_threads(vec![partition_unit(
        &hub,
        0,
        ScriptedPartition::new(Script::ReportTwice),
        ledger,
    )]);
    assert!(finished[0].1.is_ok());

    let first = receiver.poll(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(first.batch_status, BatchStatus::Completed);
    assert!(receiver.poll(Duration::from_millis(50)).unwrap().is_none());
}

#[test]
fn test_status_updates_and_collector_data_reach_analyzer() {
    let hub = PartitionReplyHub::local();
    let ledger = Arc::new(CompletionLedger::new());

    run_on_threads(vec![partition_unit(
        &hub,
        0,
        ScriptedPartition::new(Script::ChattyComplete),
        ledger,
    )]);

    let mut seen = Vec::new();
    let outcome = hub
        .receiver()
        .await_final_statuses(1, Duration::from_secs(1), |m| {
            seen.push((m.msg_type, m.collector_data.clone()));
        })
        .unwrap();

    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].0, PartitionReplyMsgType::PartitionStatusUpdate);
    assert_eq!(seen[1], (PartitionReplyMsgType::PartitionCollectorData, Some(b"rows=42".to_vec())));
    assert_eq!(seen[2].0, PartitionReplyMsgType::PartitionFinalStatus);
    assert_eq!(outcome.batch_status, BatchStatus::Completed);
}

#[test]
fn test_remote_channel_reports_and_releases_connections() {
    let bridge = Arc::new(InMemoryBridge::new());
    let hub = PartitionReplyHub::remote(bridge.clone(), "batch.partition.reply.test", WireFormat::Bincode);
    let receiver = hub.receiver();
    let ledger = Arc::new(CompletionLedger::new());

    run_on_threads(vec![
        partition_unit(&hub, 0, ScriptedPartition::new(Script::Complete), ledger.clone()),
        partition_unit(&hub, 1, ScriptedPartition::new(Script::Panic), ledger.clone()),
    ]);

    let outcome = receiver
        .await_final_statuses(2, Duration::from_secs(5), |_| {})
        .unwrap();

    let mut statuses: Vec<_> = outcome
        .final_statuses
        .iter()
        .map(|m| (m.partition_number(), m.batch_status))
        .collect();
    statuses.sort_by_key(|(number, _)| *number);
    assert_eq!(statuses, vec![(0, BatchStatus::Completed), (1, BatchStatus::Failed)]);
    assert_eq!(bridge.open_connections(), 0);
    assert_eq!(bridge.delivered(), 2);
}

#[test]
fn test_close_twice_is_harmless_on_both_channels() {
    let plan = PartitionPlanConfig::new(TOP_LEVEL, STEP, 0);
    let local = PartitionReplyHub::local();
    let bridge = Arc::new(InMemoryBridge::new());
    let remote = PartitionReplyHub::remote(bridge.clone(), "replies", WireFormat::Json);

    for hub in [&local, &remote] {
        let queue = hub.queue_for(&plan);
        assert!(queue.close().is_ok());
        assert!(queue.close().is_ok());
        assert_eq!(
            queue.add(batch_kernel::PartitionReplyMsg::synthesized_failure(plan.clone())),
            Err(ReplyChannelError::Closed)
        );
    }
    assert_eq!(bridge.open_connections(), 0);
}

/// Bridge whose broker is unreachable
struct UnreachableBridge;

impl MessageBridge for UnreachableBridge {
    fn connect(&self, destination: &str) -> Result<Box<dyn BridgeConnection>, ReplyChannelError> {
        Err(ReplyChannelError::Bridge(format!("no route to {destination}")))
    }

    fn receive(&self, _destination: &str, _timeout: Duration) -> Result<Option<Bytes>, ReplyChannelError> {
        Ok(None)
    }
}

#[test]
fn test_bridge_outage_does_not_hang_partition() {
    let hub = PartitionReplyHub::remote(Arc::new(UnreachableBridge), "replies", WireFormat::Json);
    let ledger = Arc::new(CompletionLedger::new());

    let finished = run_on_threads(vec![partition_unit(
        &hub,
        0,
        ScriptedPartition::new(Script::Complete),
        ledger.clone(),
    )]);

    let (unit, result) = &finished[0];
    assert!(matches!(result, Err(BatchError::ProcessingFailure { .. })));
    assert_eq!(unit.batch_status(), BatchStatus::Failed);
    assert_eq!(ledger.status_of(TOP_LEVEL + 1), Some(BatchStatus::Failed));
    assert!(matches!(
        hub.receiver().await_final_statuses(1, Duration::from_millis(50), |_| {}),
        Err(BatchError::ReplyTimeout { expected: 1, received: 0 })
    ));
}
