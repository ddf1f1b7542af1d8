//! Partition reply channels
//!
//! A partition thread reports back to the step that launched it through a
//! [`PartitionReplyQueue`]. The in-process variant hands messages over in
//! memory; the remote variant encodes them and delivers through a
//! [`MessageBridge`]. Callers only ever see the trait.

use thiserror::Error;

use crate::execution::BatchStatus;

pub mod message;
pub mod remote;
pub mod reply_queue;

pub use message::{PartitionReplyMsg, PartitionReplyMsgType, WireFormat};
pub use remote::{BridgeConnection, InMemoryBridge, MessageBridge, RemotePartitionReplyQueue};
pub use reply_queue::{
    LocalPartitionReplyQueue, PartitionReplyHub, PartitionReplyQueue, PartitionReplyReceiver,
    PartitionedStepOutcome, ReplyChannelKind,
};

/// Reply channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyChannelError {
    /// The queue was closed
    #[error("reply channel is closed")]
    Closed,

    /// A partition tried to report a second final status
    #[error("final status already sent for this partition")]
    FinalStatusAlreadySent,

    /// A final status was reported before the partition reached a terminal state
    #[error("final status must be terminal, got {0}")]
    NonTerminalStatus(BatchStatus),

    /// Reply operations were used on a non-partition execution
    #[error("execution is not a partition")]
    NotPartition,

    /// Message could not be encoded
    #[error("failed to encode reply message: {0}")]
    Encode(String),

    /// Payload could not be decoded
    #[error("failed to decode reply message: {0}")]
    Decode(String),

    /// Transport failure in the message bridge
    #[error("message bridge error: {0}")]
    Bridge(String),
}
