//! Execution contexts, statuses and partition plans

pub mod context;
pub mod status;

pub use context::{PartitionPlanConfig, RuntimeWorkUnitExecution, WorkUnitKind};
pub use status::BatchStatus;
