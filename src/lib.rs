//! # Batch Kernel
//!
//! The concurrency core of a batch job runtime: it runs a job's units of work
//! (the top-level job, step partitions and split-flow branches) on their own
//! threads, tracks each unit's terminal status and reports that status to
//! whoever launched the unit, even when the unit fails partway through.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use batch_kernel::execution::{BatchStatus, RuntimeWorkUnitExecution};
//! use batch_kernel::kernel::CompletionLedger;
//! use batch_kernel::unit::{ThreadRootController, WorkUnit};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Noop;
//!
//! impl ThreadRootController for Noop {
//!     fn run_on_thread(
//!         &self,
//!         execution: &mut RuntimeWorkUnitExecution,
//!         _cancel: &CancellationToken,
//!     ) -> anyhow::Result<()> {
//!         execution.set_batch_status(BatchStatus::Completed)?;
//!         Ok(())
//!     }
//! }
//!
//! let kernel = Arc::new(CompletionLedger::new());
//! let execution = RuntimeWorkUnitExecution::job(1, "payroll");
//! let mut unit = WorkUnit::builder(execution, Arc::new(Noop), kernel.clone()).build();
//!
//! unit.run().unwrap();
//! assert_eq!(unit.batch_status(), BatchStatus::Completed);
//! assert_eq!(kernel.status_of(1), Some(BatchStatus::Completed));
//! ```
//!
//! ## Modules
//!
//! - [`execution`]: execution contexts, batch statuses and partition plans
//! - [`unit`]: the work unit state machine, callbacks and controller contract
//! - [`partition`]: reply messages and the local/remote reply channels
//! - [`split_flow`]: the completion rendezvous for parallel flows
//! - [`kernel`]: the kernel contract and the worker pool
//! - [`config`]: runtime configuration

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for batch kernel operations
pub type Result<T> = std::result::Result<T, BatchError>;

/// Main error type for batch kernel operations
#[derive(Error, Debug)]
pub enum BatchError {
    /// Start-of-thread setup failed; the unit never reached processing
    #[error("Setup failure in work unit {unit}: {message}")]
    SetupFailure {
        /// Unit label
        unit: String,
        /// Failure detail
        message: String,
    },

    /// Processing failed inside the controller; status was forced to FAILED
    #[error("Processing failure in work unit {unit}: {message}")]
    ProcessingFailure {
        /// Unit label
        unit: String,
        /// Failure detail
        message: String,
    },

    /// A work unit can only be run once
    #[error("Work unit {0} has already been run")]
    AlreadyRun(String),

    /// Illegal batch status change
    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition {
        /// Current status
        from: execution::BatchStatus,
        /// Requested status
        to: execution::BatchStatus,
    },

    /// Reply channel error
    #[error("Reply channel error: {0}")]
    ReplyChannel(#[from] partition::ReplyChannelError),

    /// Not every partition reported a final status in time
    #[error("Timed out waiting for partition final statuses: received {received} of {expected}")]
    ReplyTimeout {
        /// Partitions launched
        expected: usize,
        /// Final statuses received
        received: usize,
    },

    /// Not every split-flow branch completed in time
    #[error("Timed out joining split flows: received {received} of {expected}")]
    JoinTimeout {
        /// Branches launched
        expected: usize,
        /// Completion tokens received
        received: usize,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Join error from pool tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Execution contexts and statuses
pub mod execution;

/// Work units and their lifecycle
pub mod unit;

/// Partition reply channels
pub mod partition;

/// Split-flow completion rendezvous
pub mod split_flow;

/// Kernel contract and worker pool
pub mod kernel;

/// Runtime configuration
pub mod config;

/// Prometheus metrics
pub mod metrics;

/// Tracing subscriber bootstrap
pub mod logging;

pub use config::BatchConfig;
pub use execution::{BatchStatus, PartitionPlanConfig, RuntimeWorkUnitExecution, WorkUnitKind};
pub use kernel::{BatchKernel, CompletionLedger, UnitReport, WorkUnitExecutor};
pub use partition::{
    PartitionReplyHub, PartitionReplyMsg, PartitionReplyMsgType, PartitionReplyQueue,
    PartitionReplyReceiver, ReplyChannelError,
};
pub use split_flow::{CompletedSplitFlow, CompletionRendezvous};
pub use unit::{StopHandle, ThreadRootController, WorkUnit, WorkUnitCallback};
