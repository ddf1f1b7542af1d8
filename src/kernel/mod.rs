//! Kernel contract and worker pool
//!
//! The kernel submits work units to a pool of threads and is told when each
//! one finishes. [`WorkUnitExecutor`] is the pool; [`CompletionLedger`] is a
//! kernel that records every completion.

use crate::execution::RuntimeWorkUnitExecution;

pub mod executor;
pub mod ledger;

pub use executor::{UnitReport, WorkUnitExecutor};
pub use ledger::{CompletionLedger, CompletionRecord};

/// Receives completion notifications from work-unit threads
///
/// Called once per unit at thread end, after the terminal status is fixed.
/// Errors and panics are logged by the caller and otherwise ignored.
pub trait BatchKernel: Send + Sync {
    /// A unit's thread finished processing
    fn unit_completed(&self, execution: &RuntimeWorkUnitExecution) -> anyhow::Result<()>;
}
