//! Partition reply messages and their wire encoding

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::execution::{BatchStatus, PartitionPlanConfig};
use crate::partition::ReplyChannelError;

/// Kind of message a partition sends to its launching step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionReplyMsgType {
    /// Opaque data from a partition collector for the step's analyzer
    PartitionCollectorData,
    /// In-flight status change
    PartitionStatusUpdate,
    /// The single terminal report of a partition
    PartitionFinalStatus,
}

impl PartitionReplyMsgType {
    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PartitionCollectorData => "collector_data",
            Self::PartitionStatusUpdate => "status_update",
            Self::PartitionFinalStatus => "final_status",
        }
    }
}

/// Message from a partition thread to the thread that launched its step
///
/// Immutable once handed to a reply queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionReplyMsg {
    /// Message kind
    #[serde(rename = "type")]
    pub msg_type: PartitionReplyMsgType,
    /// Partition batch status when the message was built
    pub batch_status: BatchStatus,
    /// Partition exit status when the message was built
    pub exit_status: String,
    /// Plan entry of the reporting partition
    pub partition_plan_config: PartitionPlanConfig,
    /// Collector payload, only for collector-data messages
    #[serde(default)]
    pub collector_data: Option<Vec<u8>>,
}

impl PartitionReplyMsg {
    /// Final status message
    pub fn final_status(
        plan: PartitionPlanConfig,
        batch_status: BatchStatus,
        exit_status: impl Into<String>,
    ) -> Self {
        Self {
            msg_type: PartitionReplyMsgType::PartitionFinalStatus,
            batch_status,
            exit_status: exit_status.into(),
            partition_plan_config: plan,
            collector_data: None,
        }
    }

    /// Final status for a partition that died before reporting one itself
    pub fn synthesized_failure(plan: PartitionPlanConfig) -> Self {
        Self::final_status(plan, BatchStatus::Failed, BatchStatus::Failed.as_str())
    }

    /// In-flight status update
    pub fn status_update(
        plan: PartitionPlanConfig,
        batch_status: BatchStatus,
        exit_status: impl Into<String>,
    ) -> Self {
        Self {
            msg_type: PartitionReplyMsgType::PartitionStatusUpdate,
            batch_status,
            exit_status: exit_status.into(),
            partition_plan_config: plan,
            collector_data: None,
        }
    }

    /// Collector payload for the step's analyzer
    pub fn collector_data(plan: PartitionPlanConfig, batch_status: BatchStatus, data: Vec<u8>) -> Self {
        Self {
            msg_type: PartitionReplyMsgType::PartitionCollectorData,
            batch_status,
            exit_status: batch_status.as_str().to_string(),
            partition_plan_config: plan,
            collector_data: Some(data),
        }
    }

    /// Whether this is the partition's final status
    pub fn is_final_status(&self) -> bool {
        self.msg_type == PartitionReplyMsgType::PartitionFinalStatus
    }

    /// Partition number of the sender
    pub fn partition_number(&self) -> u32 {
        self.partition_plan_config.partition_number
    }

    /// Encode for delivery through a message bridge
    pub fn encode(&self, format: WireFormat) -> Result<Bytes, ReplyChannelError> {
        let encoded = match format {
            WireFormat::Json => serde_json::to_vec(self).map_err(|e| ReplyChannelError::Encode(e.to_string()))?,
            WireFormat::Bincode => bincode::serialize(self).map_err(|e| ReplyChannelError::Encode(e.to_string()))?,
        };
        Ok(Bytes::from(encoded))
    }

    /// Decode a payload received from a message bridge
    pub fn decode(format: WireFormat, payload: &[u8]) -> Result<Self, ReplyChannelError> {
        match format {
            WireFormat::Json => serde_json::from_slice(payload).map_err(|e| ReplyChannelError::Decode(e.to_string())),
            WireFormat::Bincode => bincode::deserialize(payload).map_err(|e| ReplyChannelError::Decode(e.to_string())),
        }
    }
}

/// Encoding used on the cross-process reply channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Self-describing JSON
    #[default]
    Json,
    /// Compact bincode
    Bincode,
}
