//! Start and end callbacks run around a unit's processing
//!
//! Callback lists are not ordered by contract. Callbacks must not depend on
//! running before or after any other callback in the same list.

use tracing::info;

use crate::execution::RuntimeWorkUnitExecution;

/// Hook invoked when a unit's thread begins and ends
///
/// A failing `unit_started` aborts the unit before processing. A failing
/// `unit_ended` is logged and the remaining end callbacks still run.
pub trait WorkUnitCallback: Send + Sync {
    /// Called at thread begin, before the controller runs
    fn unit_started(&self, execution: &mut RuntimeWorkUnitExecution) -> anyhow::Result<()> {
        let _ = execution;
        Ok(())
    }

    /// Called at thread end, after the kernel was notified
    fn unit_ended(&self, execution: &RuntimeWorkUnitExecution) -> anyhow::Result<()> {
        let _ = execution;
        Ok(())
    }
}

/// Logs unit start and end with the unit's identifiers
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingCallback;

impl WorkUnitCallback for TracingCallback {
    fn unit_started(&self, execution: &mut RuntimeWorkUnitExecution) -> anyhow::Result<()> {
        info!(
            unit = %execution.label(),
            kind = %execution.kind(),
            parent_id = ?execution.parent_id(),
            "Work unit started"
        );
        Ok(())
    }

    fn unit_ended(&self, execution: &RuntimeWorkUnitExecution) -> anyhow::Result<()> {
        info!(
            unit = %execution.label(),
            kind = %execution.kind(),
            batch_status = %execution.batch_status(),
            exit_status = %execution.exit_status(),
            "Work unit ended"
        );
        Ok(())
    }
}
