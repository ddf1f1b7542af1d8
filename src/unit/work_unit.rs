//! Work unit: one thread's execution of a job, partition or split-flow
//!
//! Every unit walks the same phases on its own thread:
//!
//! ```text
//! CREATED -> THREAD_BEGIN -> RUNNING -> THREAD_END -> DONE
//! ```
//!
//! - `THREAD_BEGIN` runs the start callbacks and installs thread resources.
//!   Any failure marks the unit FAILED and skips `RUNNING`.
//! - `RUNNING` hands the execution to the [`ThreadRootController`]. An error
//!   or panic marks the unit FAILED and is returned from [`WorkUnit::run`]
//!   once `THREAD_END` has finished.
//! - `THREAD_END` always runs. It notifies the kernel, runs the end
//!   callbacks and resets thread resources, each step best-effort. Partitions
//!   then make sure a final status reached their launcher and close their
//!   reply queue; split-flows add their completion token.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::execution::{BatchStatus, RuntimeWorkUnitExecution, WorkUnitKind};
use crate::kernel::BatchKernel;
use crate::metrics::BatchMetrics;
use crate::partition::PartitionReplyMsg;
use crate::split_flow::{CompletedSplitFlow, CompletionRendezvous};
use crate::unit::callbacks::WorkUnitCallback;
use crate::unit::cleanup::{guarded, run_cleanup_step, FailureKind};
use crate::unit::controller::{StopHandle, ThreadRootController};
use crate::unit::resources::ThreadResources;
use crate::{BatchError, Result};

/// Lifecycle phase of a work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    /// Built, not yet run
    Created,
    /// Running start callbacks and resource setup
    ThreadBegin,
    /// Controller is processing
    Running,
    /// Running completion notification and cleanup
    ThreadEnd,
    /// Finished; terminal status may be read
    Done,
}

enum UnitVariant {
    Job,
    Partition,
    SplitFlow { rendezvous: Option<CompletionRendezvous> },
}

/// One job, partition or split-flow execution bound to a controller
pub struct WorkUnit {
    execution: RuntimeWorkUnitExecution,
    controller: Arc<dyn ThreadRootController>,
    kernel: Arc<dyn BatchKernel>,
    before_callbacks: Vec<Arc<dyn WorkUnitCallback>>,
    after_callbacks: Vec<Arc<dyn WorkUnitCallback>>,
    resources: Option<Arc<dyn ThreadResources>>,
    cancel: CancellationToken,
    variant: UnitVariant,
    phase: UnitPhase,
}

/// Builder for [`WorkUnit`]
pub struct WorkUnitBuilder {
    execution: RuntimeWorkUnitExecution,
    controller: Arc<dyn ThreadRootController>,
    kernel: Arc<dyn BatchKernel>,
    before_callbacks: Vec<Arc<dyn WorkUnitCallback>>,
    after_callbacks: Vec<Arc<dyn WorkUnitCallback>>,
    resources: Option<Arc<dyn ThreadResources>>,
    cancel: Option<CancellationToken>,
    rendezvous: Option<CompletionRendezvous>,
}

impl WorkUnitBuilder {
    /// Add a callback run at thread begin
    pub fn with_before_callback(mut self, callback: Arc<dyn WorkUnitCallback>) -> Self {
        self.before_callbacks.push(callback);
        self
    }

    /// Add a callback run at thread end
    pub fn with_after_callback(mut self, callback: Arc<dyn WorkUnitCallback>) -> Self {
        self.after_callbacks.push(callback);
        self
    }

    /// Add a callback to both lists
    pub fn with_callback(self, callback: Arc<dyn WorkUnitCallback>) -> Self {
        self.with_before_callback(callback.clone())
            .with_after_callback(callback)
    }

    /// Install thread resources for the unit's lifetime
    pub fn with_resources(mut self, resources: Arc<dyn ThreadResources>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Use an existing cancellation token, e.g. a child of the job's token
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Rendezvous a split-flow unit reports its completion to
    pub fn with_rendezvous(mut self, rendezvous: CompletionRendezvous) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    /// Build the unit; its variant follows the execution's kind
    pub fn build(self) -> WorkUnit {
        let variant = match self.execution.kind() {
            WorkUnitKind::Job => UnitVariant::Job,
            WorkUnitKind::Partition => UnitVariant::Partition,
            WorkUnitKind::SplitFlow => UnitVariant::SplitFlow {
                rendezvous: self.rendezvous,
            },
        };
        WorkUnit {
            execution: self.execution,
            controller: self.controller,
            kernel: self.kernel,
            before_callbacks: self.before_callbacks,
            after_callbacks: self.after_callbacks,
            resources: self.resources,
            cancel: self.cancel.unwrap_or_default(),
            variant,
            phase: UnitPhase::Created,
        }
    }
}

impl WorkUnit {
    /// Start building a unit around `execution`
    pub fn builder(
        execution: RuntimeWorkUnitExecution,
        controller: Arc<dyn ThreadRootController>,
        kernel: Arc<dyn BatchKernel>,
    ) -> WorkUnitBuilder {
        WorkUnitBuilder {
            execution,
            controller,
            kernel,
            before_callbacks: Vec::new(),
            after_callbacks: Vec::new(),
            resources: None,
            cancel: None,
            rendezvous: None,
        }
    }

    /// Run the unit to completion on the calling thread
    ///
    /// Returns [`BatchError::SetupFailure`] or [`BatchError::ProcessingFailure`]
    /// after thread-end cleanup when the unit failed. In every case the unit
    /// has a terminal status once this returns.
    pub fn run(&mut self) -> Result<()> {
        if self.phase != UnitPhase::Created {
            return Err(BatchError::AlreadyRun(self.execution.label()));
        }
        let span = self.execution.span().clone();
        let _entered = span.enter();
        let kind = self.execution.kind();
        let started = Instant::now();
        BatchMetrics::record_unit_started(kind.as_str());
        debug!(unit = %self.execution.label(), "Work unit thread starting");

        let outcome = match self.thread_begin() {
            Ok(()) => self.running(),
            Err(err) => {
                self.execution.mark_failed();
                error!(
                    unit = %self.execution.label(),
                    failure_kind = FailureKind::Setup.as_str(),
                    error = %err,
                    "Work unit setup failed; processing skipped"
                );
                BatchMetrics::record_unit_failure(kind.as_str(), FailureKind::Setup.as_str());
                Err(err)
            }
        };

        self.thread_end();
        self.phase = UnitPhase::Done;

        let batch_status = self.execution.batch_status();
        BatchMetrics::record_unit_finished(kind.as_str(), batch_status.as_str(), started.elapsed());
        info!(
            unit = %self.execution.label(),
            batch_status = %batch_status,
            exit_status = %self.execution.exit_status(),
            duration_ms = started.elapsed().as_millis(),
            "Work unit thread finished"
        );
        outcome
    }

    fn thread_begin(&mut self) -> Result<()> {
        self.phase = UnitPhase::ThreadBegin;
        let label = self.execution.label();

        for callback in &self.before_callbacks {
            guarded(|| callback.unit_started(&mut self.execution)).map_err(|err| {
                BatchError::SetupFailure {
                    unit: label.clone(),
                    message: format!("start callback failed: {err:#}"),
                }
            })?;
        }

        if let Some(resources) = &self.resources {
            guarded(|| resources.acquire(&self.execution)).map_err(|err| BatchError::SetupFailure {
                unit: label.clone(),
                message: format!("thread resource setup failed: {err:#}"),
            })?;
        }
        Ok(())
    }

    fn running(&mut self) -> Result<()> {
        self.phase = UnitPhase::Running;
        debug!(unit = %self.execution.label(), "Handing execution to controller");

        let controller = self.controller.clone();
        let cancel = self.cancel.clone();
        match guarded(|| controller.run_on_thread(&mut self.execution, &cancel)) {
            Ok(()) => {
                if !self.execution.batch_status().is_terminal() {
                    let status = if cancel.is_cancelled() {
                        BatchStatus::Stopped
                    } else {
                        BatchStatus::Completed
                    };
                    warn!(
                        unit = %self.execution.label(),
                        left_at = %self.execution.batch_status(),
                        recorded = %status,
                        "Controller returned without a terminal status"
                    );
                    self.execution.force_status(status);
                }
                Ok(())
            }
            Err(err) => {
                self.execution.mark_failed();
                let message = format!("{err:#}");
                error!(
                    unit = %self.execution.label(),
                    failure_kind = FailureKind::Processing.as_str(),
                    error = %message,
                    "Work unit processing failed"
                );
                BatchMetrics::record_unit_failure(
                    self.execution.kind().as_str(),
                    FailureKind::Processing.as_str(),
                );
                Err(BatchError::ProcessingFailure {
                    unit: self.execution.label(),
                    message,
                })
            }
        }
    }

    fn thread_end(&mut self) {
        self.phase = UnitPhase::ThreadEnd;
        debug!(unit = %self.execution.label(), "Running thread end");

        let execution = &self.execution;
        run_cleanup_step(FailureKind::Notification, "kernel notification", execution, || {
            self.kernel.unit_completed(execution)
        });
        for callback in &self.after_callbacks {
            run_cleanup_step(FailureKind::Cleanup, "end callback", execution, || {
                callback.unit_ended(execution)
            });
        }
        if let Some(resources) = &self.resources {
            run_cleanup_step(FailureKind::Cleanup, "thread resource reset", execution, || {
                resources.reset()
            });
        }

        match &self.variant {
            UnitVariant::Job => {}
            UnitVariant::Partition => self.finish_partition(),
            UnitVariant::SplitFlow { rendezvous } => {
                if let Some(rendezvous) = rendezvous {
                    rendezvous.add(CompletedSplitFlow::new(self.execution.clone()));
                    debug!(unit = %self.execution.label(), "Split flow completion token added");
                }
            }
        }
    }

    fn finish_partition(&self) {
        let execution = &self.execution;
        let (Some(queue), Some(plan)) = (execution.reply_queue(), execution.partition_plan()) else {
            return;
        };

        if !execution.is_final_status_sent() {
            warn!(
                unit = %execution.label(),
                step_name = %plan.step_name,
                partition_number = plan.partition_number,
                "Partition ended without reporting a final status; sending FAILED"
            );
            BatchMetrics::record_synthesized_final_status(&plan.step_name);
            run_cleanup_step(FailureKind::Notification, "synthesized final status", execution, || {
                queue.add(PartitionReplyMsg::synthesized_failure(plan.clone()))?;
                Ok(())
            });
        }

        run_cleanup_step(FailureKind::Cleanup, "reply queue close", execution, || {
            queue.close()?;
            Ok(())
        });
    }

    /// Execution context of this unit
    pub fn execution(&self) -> &RuntimeWorkUnitExecution {
        &self.execution
    }

    /// Consume the unit, keeping its execution context
    pub fn into_execution(self) -> RuntimeWorkUnitExecution {
        self.execution
    }

    /// Batch status; terminal once [`WorkUnit::run`] returned
    pub fn batch_status(&self) -> BatchStatus {
        self.execution.batch_status()
    }

    /// Exit status; final once [`WorkUnit::run`] returned
    pub fn exit_status(&self) -> String {
        self.execution.exit_status()
    }

    /// Controller driving this unit
    pub fn controller(&self) -> Arc<dyn ThreadRootController> {
        self.controller.clone()
    }

    /// Handle for stopping this unit from another thread
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.execution.id(), self.cancel.clone(), self.controller.clone())
    }

    /// Cancellation token passed to the controller
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> UnitPhase {
        self.phase
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("execution", &self.execution)
            .field("phase", &self.phase)
            .field("before_callbacks", &self.before_callbacks.len())
            .field("after_callbacks", &self.after_callbacks.len())
            .field("has_resources", &self.resources.is_some())
            .finish()
    }
}
