//! Contract of the component that drives a unit's processing

use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::execution::RuntimeWorkUnitExecution;

/// Drives the job, step or flow processing for one execution
///
/// Implementations set the execution's terminal batch status and exit status.
/// Returning an error or panicking marks the unit FAILED.
pub trait ThreadRootController: Send + Sync {
    /// Run processing to completion on the calling thread
    ///
    /// `cancel` fires when a stop was requested for this unit; long-running
    /// loops should check it and end with STOPPED.
    fn run_on_thread(
        &self,
        execution: &mut RuntimeWorkUnitExecution,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// Stop request arriving from outside the unit's thread
    fn stop(&self) {}
}

/// Handle used by the stop path to reach a running unit
#[derive(Clone)]
pub struct StopHandle {
    execution_id: u64,
    token: CancellationToken,
    controller: Arc<dyn ThreadRootController>,
}

impl StopHandle {
    pub(crate) fn new(
        execution_id: u64,
        token: CancellationToken,
        controller: Arc<dyn ThreadRootController>,
    ) -> Self {
        Self {
            execution_id,
            token,
            controller,
        }
    }

    /// Request a stop: fire the token, then signal the controller
    pub fn stop(&self) {
        info!(execution_id = self.execution_id, "Stop requested for work unit");
        self.token.cancel();
        self.controller.stop();
    }

    /// Whether a stop was requested
    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Execution id of the unit
    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("execution_id", &self.execution_id)
            .field("stop_requested", &self.is_stop_requested())
            .finish()
    }
}
