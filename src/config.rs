//! Runtime configuration for the batch kernel

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::{BatchError, Result};

pub use crate::partition::{ReplyChannelKind, WireFormat};

/// Batch kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Top-level jobs running at once
    pub max_concurrent_jobs: usize,

    /// Partitions and split-flows running at once
    pub max_concurrent_sub_units: usize,

    /// Bounded wait for every partition's final status, in seconds
    pub partition_reply_timeout_secs: u64,

    /// Bounded wait for every split-flow branch, in seconds
    pub split_flow_join_timeout_secs: u64,

    /// Transaction timeout installed on unit threads, in seconds
    pub default_transaction_timeout_secs: u64,

    /// Reply channel strategy for partitioned steps
    pub reply_channel: ReplyChannelKind,

    /// Encoding used by the remote reply channel
    pub wire_format: WireFormat,

    /// Prefix of remote reply destinations
    pub reply_destination_prefix: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            max_concurrent_jobs: cpus,
            max_concurrent_sub_units: cpus * 2,
            partition_reply_timeout_secs: 300, // 5 minutes
            split_flow_join_timeout_secs: 300,
            default_transaction_timeout_secs: 180,
            reply_channel: ReplyChannelKind::Local,
            wire_format: WireFormat::Json,
            reply_destination_prefix: "batch.partition.reply".to_string(),
        }
    }
}

impl BatchConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BatchError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Reject values the kernel cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(BatchError::Config("max_concurrent_jobs must be at least 1".to_string()));
        }
        if self.max_concurrent_sub_units == 0 {
            return Err(BatchError::Config("max_concurrent_sub_units must be at least 1".to_string()));
        }
        if self.partition_reply_timeout_secs == 0 || self.split_flow_join_timeout_secs == 0 {
            return Err(BatchError::Config("join timeouts must be greater than zero".to_string()));
        }
        if self.default_transaction_timeout_secs == 0 {
            return Err(BatchError::Config(
                "default_transaction_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.reply_destination_prefix.trim().is_empty() {
            return Err(BatchError::Config("reply_destination_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    /// Set the top-level job slot count
    pub fn with_max_concurrent_jobs(mut self, slots: usize) -> Self {
        self.max_concurrent_jobs = slots;
        self
    }

    /// Set the partition and split-flow slot count
    pub fn with_max_concurrent_sub_units(mut self, slots: usize) -> Self {
        self.max_concurrent_sub_units = slots;
        self
    }

    /// Set the partition reply timeout
    pub fn with_partition_reply_timeout(mut self, timeout: Duration) -> Self {
        self.partition_reply_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the split-flow join timeout
    pub fn with_split_flow_join_timeout(mut self, timeout: Duration) -> Self {
        self.split_flow_join_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the reply channel strategy
    pub fn with_reply_channel(mut self, kind: ReplyChannelKind) -> Self {
        self.reply_channel = kind;
        self
    }

    /// Set the remote wire format
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Partition reply timeout
    pub fn partition_reply_timeout(&self) -> Duration {
        Duration::from_secs(self.partition_reply_timeout_secs)
    }

    /// Split-flow join timeout
    pub fn split_flow_join_timeout(&self) -> Duration {
        Duration::from_secs(self.split_flow_join_timeout_secs)
    }

    /// Default transaction timeout
    pub fn default_transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.default_transaction_timeout_secs)
    }
}
