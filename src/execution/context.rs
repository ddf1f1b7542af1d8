//! Execution contexts owned by work-unit threads
//!
//! A [`RuntimeWorkUnitExecution`] is created by the orchestrator right before
//! a unit is submitted and is then mutated only by the thread running that
//! unit. Other threads read it after the unit has finished, either through
//! the unit itself, a [`crate::split_flow::CompletedSplitFlow`] token, or the
//! kernel's completion hook.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{field, Span};

use crate::execution::status::BatchStatus;
use crate::partition::{PartitionReplyMsg, PartitionReplyQueue, ReplyChannelError};
use crate::{BatchError, Result};

/// Which kind of unit owns an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkUnitKind {
    /// Top-level job
    Job,
    /// One partition of a partitioned step
    Partition,
    /// One branch of a split
    SplitFlow,
}

impl WorkUnitKind {
    /// Lower-case label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Partition => "partition",
            Self::SplitFlow => "split_flow",
        }
    }
}

impl fmt::Display for WorkUnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable configuration of a single partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionPlanConfig {
    /// Execution id of the job that launched the partitioned step
    pub top_level_execution_id: u64,
    /// Name of the partitioned step
    pub step_name: String,
    /// Zero-based partition number
    pub partition_number: u32,
    /// Partition-scoped properties from the partition plan
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl PartitionPlanConfig {
    /// Create a plan entry with no properties
    pub fn new(top_level_execution_id: u64, step_name: impl Into<String>, partition_number: u32) -> Self {
        Self {
            top_level_execution_id,
            step_name: step_name.into(),
            partition_number,
            properties: HashMap::new(),
        }
    }

    /// Add a partition property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Partition-only part of an execution: its plan and its reply obligation
#[derive(Clone)]
pub(crate) struct PartitionExecution {
    plan: PartitionPlanConfig,
    reply_queue: Arc<dyn PartitionReplyQueue>,
    final_status_sent: bool,
}

/// Mutable state a work-unit thread operates on
#[derive(Clone)]
pub struct RuntimeWorkUnitExecution {
    id: u64,
    parent_id: Option<u64>,
    top_level_execution_id: u64,
    job_name: String,
    kind: WorkUnitKind,
    batch_status: BatchStatus,
    exit_status: Option<String>,
    properties: HashMap<String, String>,
    partition: Option<PartitionExecution>,
    flow_name: Option<String>,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    span: Span,
}

impl RuntimeWorkUnitExecution {
    fn new(
        id: u64,
        parent_id: Option<u64>,
        top_level_execution_id: u64,
        job_name: String,
        kind: WorkUnitKind,
    ) -> Self {
        let span = tracing::info_span!(
            "work_unit",
            unit_id = id,
            kind = %kind,
            top_level_execution_id,
            job_name = %job_name,
            step_name = field::Empty,
            partition_number = field::Empty,
            flow_name = field::Empty,
        );
        let now = Utc::now();
        Self {
            id,
            parent_id,
            top_level_execution_id,
            job_name,
            kind,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            properties: HashMap::new(),
            partition: None,
            flow_name: None,
            created_at: now,
            last_updated: now,
            span,
        }
    }

    /// Context for a top-level job execution
    pub fn job(execution_id: u64, job_name: impl Into<String>) -> Self {
        Self::new(execution_id, None, execution_id, job_name.into(), WorkUnitKind::Job)
    }

    /// Context for one partition; the reply queue carries its final status
    /// back to the thread that launched the partitioned step
    pub fn partition(
        id: u64,
        job_name: impl Into<String>,
        plan: PartitionPlanConfig,
        reply_queue: Arc<dyn PartitionReplyQueue>,
    ) -> Self {
        let top_level = plan.top_level_execution_id;
        let mut execution = Self::new(id, Some(top_level), top_level, job_name.into(), WorkUnitKind::Partition);
        execution.span.record("step_name", plan.step_name.as_str());
        execution.span.record("partition_number", plan.partition_number);
        execution.properties = plan.properties.clone();
        execution.partition = Some(PartitionExecution {
            plan,
            reply_queue,
            final_status_sent: false,
        });
        execution
    }

    /// Context for one split-flow branch
    pub fn split_flow(
        id: u64,
        top_level_execution_id: u64,
        job_name: impl Into<String>,
        flow_name: impl Into<String>,
    ) -> Self {
        let flow_name = flow_name.into();
        let mut execution = Self::new(
            id,
            Some(top_level_execution_id),
            top_level_execution_id,
            job_name.into(),
            WorkUnitKind::SplitFlow,
        );
        execution.span.record("flow_name", flow_name.as_str());
        execution.flow_name = Some(flow_name);
        execution
    }

    /// Add execution properties; partition plan properties take precedence
    pub fn with_properties<I, K, V>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in properties {
            self.properties.entry(key.into()).or_insert_with(|| value.into());
        }
        self
    }

    /// Execution id of this unit
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Execution id of the launching unit, if any
    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    /// Execution id of the top-level job
    pub fn top_level_execution_id(&self) -> u64 {
        self.top_level_execution_id
    }

    /// Job name
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Unit kind
    pub fn kind(&self) -> WorkUnitKind {
        self.kind
    }

    /// Split-flow name, for split-flow executions
    pub fn flow_name(&self) -> Option<&str> {
        self.flow_name.as_deref()
    }

    /// Partition plan, for partition executions
    pub fn partition_plan(&self) -> Option<&PartitionPlanConfig> {
        self.partition.as_ref().map(|p| &p.plan)
    }

    /// Look up an execution property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Current batch status
    pub fn batch_status(&self) -> BatchStatus {
        self.batch_status
    }

    /// Exit status, defaulting to the batch status name when none was set
    pub fn exit_status(&self) -> String {
        self.exit_status
            .clone()
            .unwrap_or_else(|| self.batch_status.as_str().to_string())
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last status change
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Logging span of this execution
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Human-readable label used in logs and errors
    pub fn label(&self) -> String {
        match (&self.partition, &self.flow_name) {
            (Some(p), _) => format!(
                "{}:{}[{}]#{}",
                self.job_name, p.plan.step_name, p.plan.partition_number, self.id
            ),
            (None, Some(flow)) => format!("{}:{}#{}", self.job_name, flow, self.id),
            (None, None) => format!("{}#{}", self.job_name, self.id),
        }
    }

    /// Move to a new batch status, rejecting changes out of a terminal status
    pub fn set_batch_status(&mut self, status: BatchStatus) -> Result<()> {
        if !self.batch_status.can_transition_to(status) {
            return Err(BatchError::InvalidStatusTransition {
                from: self.batch_status,
                to: status,
            });
        }
        self.batch_status = status;
        self.last_updated = Utc::now();
        Ok(())
    }

    /// Set the exit status
    pub fn set_exit_status(&mut self, exit_status: impl Into<String>) {
        self.exit_status = Some(exit_status.into());
        self.last_updated = Utc::now();
    }

    /// Force the execution to FAILED, keeping any exit status already set
    pub(crate) fn mark_failed(&mut self) {
        self.batch_status = BatchStatus::Failed;
        self.last_updated = Utc::now();
    }

    /// Force a terminal status after the controller returned without one
    pub(crate) fn force_status(&mut self, status: BatchStatus) {
        self.batch_status = status;
        self.last_updated = Utc::now();
    }

    /// Whether this partition already delivered its final status
    pub fn is_final_status_sent(&self) -> bool {
        self.partition.as_ref().is_some_and(|p| p.final_status_sent)
    }

    /// Report the current status as this partition's final status
    ///
    /// Only one final status is ever delivered per partition; a second call
    /// fails with [`ReplyChannelError::FinalStatusAlreadySent`]. The current
    /// status must be terminal.
    pub fn send_final_status(&mut self) -> std::result::Result<(), ReplyChannelError> {
        let batch_status = self.batch_status;
        let exit_status = self.exit_status();
        let partition = self.partition.as_mut().ok_or(ReplyChannelError::NotPartition)?;
        if partition.final_status_sent {
            return Err(ReplyChannelError::FinalStatusAlreadySent);
        }
        if !batch_status.is_terminal() {
            return Err(ReplyChannelError::NonTerminalStatus(batch_status));
        }
        let msg = PartitionReplyMsg::final_status(partition.plan.clone(), batch_status, exit_status);
        partition.reply_queue.add(msg)?;
        partition.final_status_sent = true;
        Ok(())
    }

    /// Send an in-flight status update to the launching step
    pub fn send_status_update(&self) -> std::result::Result<(), ReplyChannelError> {
        let partition = self.partition.as_ref().ok_or(ReplyChannelError::NotPartition)?;
        let msg = PartitionReplyMsg::status_update(partition.plan.clone(), self.batch_status, self.exit_status());
        partition.reply_queue.add(msg)
    }

    /// Send opaque collector data to the launching step's analyzer
    pub fn send_collector_data(&self, data: Vec<u8>) -> std::result::Result<(), ReplyChannelError> {
        let partition = self.partition.as_ref().ok_or(ReplyChannelError::NotPartition)?;
        let msg = PartitionReplyMsg::collector_data(partition.plan.clone(), self.batch_status, data);
        partition.reply_queue.add(msg)
    }

    pub(crate) fn reply_queue(&self) -> Option<&Arc<dyn PartitionReplyQueue>> {
        self.partition.as_ref().map(|p| &p.reply_queue)
    }
}

impl fmt::Debug for RuntimeWorkUnitExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeWorkUnitExecution")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("top_level_execution_id", &self.top_level_execution_id)
            .field("job_name", &self.job_name)
            .field("kind", &self.kind)
            .field("batch_status", &self.batch_status)
            .field("exit_status", &self.exit_status)
            .field("partition", &self.partition_plan())
            .field("final_status_sent", &self.is_final_status_sent())
            .field("flow_name", &self.flow_name)
            .finish()
    }
}
