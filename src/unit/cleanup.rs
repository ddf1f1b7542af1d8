//! Failure capture shared by every phase of a work unit
//!
//! User code (controllers, callbacks, kernel hooks, bridges) may return an
//! error or panic. [`guarded`] turns both into an `anyhow::Error`.
//! [`run_cleanup_step`] is the single place where the swallow-and-log policy
//! for notification and cleanup failures lives.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use anyhow::anyhow;
use tracing::warn;

use crate::execution::RuntimeWorkUnitExecution;
use crate::metrics::BatchMetrics;

/// Where in a unit's life a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Start-of-thread setup; the unit never processes
    Setup,
    /// Controller processing; status forced to FAILED and error returned
    Processing,
    /// Notifying the kernel or sending a reply; logged only
    Notification,
    /// End callbacks and resource release; logged only
    Cleanup,
}

impl FailureKind {
    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Processing => "processing",
            Self::Notification => "notification",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run `f`, converting a panic into an error
pub fn guarded<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run one best-effort step, log any failure and carry on
///
/// Returns whether the step succeeded. The failure never propagates and
/// never touches the execution's status.
pub fn run_cleanup_step<F>(
    kind: FailureKind,
    step: &str,
    execution: &RuntimeWorkUnitExecution,
    f: F,
) -> bool
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match guarded(f) {
        Ok(()) => true,
        Err(err) => {
            warn!(
                unit = %execution.label(),
                step = step,
                failure_kind = kind.as_str(),
                error = %format!("{err:#}"),
                "Best-effort step failed; continuing"
            );
            BatchMetrics::record_unit_failure(execution.kind().as_str(), kind.as_str());
            false
        }
    }
}
