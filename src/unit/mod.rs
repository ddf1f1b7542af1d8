//! Work units and their lifecycle
//!
//! A [`WorkUnit`] binds one execution context to a [`ThreadRootController`],
//! the kernel, its callbacks and its thread resources, and runs the whole
//! lifecycle on the calling thread.

pub mod callbacks;
pub mod cleanup;
pub mod controller;
pub mod resources;
pub mod work_unit;

pub use callbacks::{TracingCallback, WorkUnitCallback};
pub use cleanup::{guarded, run_cleanup_step, FailureKind};
pub use controller::{StopHandle, ThreadRootController};
pub use resources::{current_transaction_timeout, ThreadResources, TransactionTimeout, TRANSACTION_TIMEOUT_PROPERTY};
pub use work_unit::{UnitPhase, WorkUnit, WorkUnitBuilder};
