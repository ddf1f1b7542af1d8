//! Reply channel between partition threads and their launching step
//!
//! The launching thread builds one [`PartitionReplyHub`] per partitioned step,
//! gives each partition a [`PartitionReplyQueue`] from [`PartitionReplyHub::queue_for`]
//! and waits on the hub's [`PartitionReplyReceiver`]. Whether messages travel
//! in memory or through a message bridge is decided when the hub is built.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::execution::{BatchStatus, PartitionPlanConfig};
use crate::metrics::BatchMetrics;
use crate::partition::message::{PartitionReplyMsg, WireFormat};
use crate::partition::remote::{MessageBridge, RemotePartitionReplyQueue};
use crate::partition::ReplyChannelError;
use crate::{BatchError, Result};

/// One-way channel from a partition thread to its launching step
///
/// `add` never blocks. `close` is idempotent; messages added after a close
/// are rejected with [`ReplyChannelError::Closed`].
pub trait PartitionReplyQueue: Send + Sync {
    /// Hand a message to the launching step
    fn add(&self, msg: PartitionReplyMsg) -> std::result::Result<(), ReplyChannelError>;

    /// Release the channel
    fn close(&self) -> std::result::Result<(), ReplyChannelError>;
}

/// Which reply channel strategy a hub uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyChannelKind {
    /// Same-process hand-off
    #[default]
    Local,
    /// Delivery through a message bridge
    Remote,
}

/// In-process reply queue; `close` drops this partition's sender
pub struct LocalPartitionReplyQueue {
    sender: Mutex<Option<Sender<PartitionReplyMsg>>>,
}

impl LocalPartitionReplyQueue {
    /// Send into the launching step's channel
    pub fn new(sender: Sender<PartitionReplyMsg>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }
}

impl PartitionReplyQueue for LocalPartitionReplyQueue {
    fn add(&self, msg: PartitionReplyMsg) -> std::result::Result<(), ReplyChannelError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(ReplyChannelError::Closed)?;
        let msg_type = msg.msg_type;
        sender.send(msg).map_err(|_| ReplyChannelError::Closed)?;
        BatchMetrics::record_reply_message(msg_type.as_str());
        Ok(())
    }

    fn close(&self) -> std::result::Result<(), ReplyChannelError> {
        self.sender.lock().take();
        Ok(())
    }
}

#[derive(Clone)]
enum HubChannel {
    Local {
        sender: Sender<PartitionReplyMsg>,
        receiver: Receiver<PartitionReplyMsg>,
    },
    Remote {
        bridge: Arc<dyn MessageBridge>,
        destination: String,
        wire_format: WireFormat,
    },
}

/// Factory for the reply queues and receiver of one partitioned step
#[derive(Clone)]
pub struct PartitionReplyHub {
    channel: HubChannel,
}

impl PartitionReplyHub {
    /// Hub whose partitions reply through memory
    pub fn local() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            channel: HubChannel::Local { sender, receiver },
        }
    }

    /// Hub whose partitions reply through `bridge` on `destination`
    pub fn remote(bridge: Arc<dyn MessageBridge>, destination: impl Into<String>, wire_format: WireFormat) -> Self {
        Self {
            channel: HubChannel::Remote {
                bridge,
                destination: destination.into(),
                wire_format,
            },
        }
    }

    /// Pick the strategy named by `config`
    ///
    /// The remote strategy needs a bridge and gets a fresh destination under
    /// the configured prefix.
    pub fn from_config(config: &BatchConfig, bridge: Option<Arc<dyn MessageBridge>>) -> Result<Self> {
        match config.reply_channel {
            ReplyChannelKind::Local => Ok(Self::local()),
            ReplyChannelKind::Remote => {
                let bridge = bridge.ok_or_else(|| {
                    BatchError::Config("remote reply channel requires a message bridge".to_string())
                })?;
                let destination = format!("{}.{}", config.reply_destination_prefix, Uuid::new_v4());
                Ok(Self::remote(bridge, destination, config.wire_format))
            }
        }
    }

    /// Strategy in use
    pub fn kind(&self) -> ReplyChannelKind {
        match self.channel {
            HubChannel::Local { .. } => ReplyChannelKind::Local,
            HubChannel::Remote { .. } => ReplyChannelKind::Remote,
        }
    }

    /// Reply queue handed to one partition
    pub fn queue_for(&self, plan: &PartitionPlanConfig) -> Arc<dyn PartitionReplyQueue> {
        debug!(
            step_name = %plan.step_name,
            partition_number = plan.partition_number,
            kind = ?self.kind(),
            "Creating partition reply queue"
        );
        match &self.channel {
            HubChannel::Local { sender, .. } => Arc::new(LocalPartitionReplyQueue::new(sender.clone())),
            HubChannel::Remote { bridge, destination, wire_format } => Arc::new(
                RemotePartitionReplyQueue::new(bridge.clone(), destination.clone(), *wire_format),
            ),
        }
    }

    /// Receiving side for the launching thread
    pub fn receiver(&self) -> PartitionReplyReceiver {
        PartitionReplyReceiver {
            channel: self.channel.clone(),
        }
    }
}

impl fmt::Debug for PartitionReplyHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("PartitionReplyHub");
        s.field("kind", &self.kind());
        if let HubChannel::Remote { destination, wire_format, .. } = &self.channel {
            s.field("destination", destination).field("wire_format", wire_format);
        }
        s.finish()
    }
}

/// Result of waiting for every partition of a step
#[derive(Debug, Clone)]
pub struct PartitionedStepOutcome {
    /// Final status messages in arrival order
    pub final_statuses: Vec<PartitionReplyMsg>,
    /// Roll-up of all partition statuses
    pub batch_status: BatchStatus,
}

/// Receiving end used by the thread that launched the partitions
pub struct PartitionReplyReceiver {
    channel: HubChannel,
}

impl PartitionReplyReceiver {
    /// Next message, waiting at most `timeout`
    pub fn poll(&self, timeout: Duration) -> std::result::Result<Option<PartitionReplyMsg>, ReplyChannelError> {
        match &self.channel {
            HubChannel::Local { receiver, .. } => Ok(receiver.recv_timeout(timeout).ok()),
            HubChannel::Remote { bridge, destination, wire_format } => {
                match bridge.receive(destination, timeout)? {
                    Some(payload) => PartitionReplyMsg::decode(*wire_format, &payload).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    /// Block until `expected` final statuses arrived or `timeout` elapsed
    ///
    /// Every message, final or not, is passed to `on_message` in arrival
    /// order, which is where a step's partition analyzer hooks in.
    pub fn await_final_statuses<F>(
        &self,
        expected: usize,
        timeout: Duration,
        mut on_message: F,
    ) -> Result<PartitionedStepOutcome>
    where
        F: FnMut(&PartitionReplyMsg),
    {
        let deadline = Instant::now() + timeout;
        let mut final_statuses = Vec::with_capacity(expected);

        while final_statuses.len() < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = if remaining.is_zero() { None } else { self.poll(remaining)? };
            let Some(msg) = msg else {
                warn!(
                    expected = expected,
                    received = final_statuses.len(),
                    timeout_ms = timeout.as_millis(),
                    "Timed out waiting for partition final statuses"
                );
                return Err(BatchError::ReplyTimeout {
                    expected,
                    received: final_statuses.len(),
                });
            };

            on_message(&msg);
            if msg.is_final_status() {
                debug!(
                    partition_number = msg.partition_number(),
                    batch_status = %msg.batch_status,
                    exit_status = %msg.exit_status,
                    "Partition final status received"
                );
                final_statuses.push(msg);
            }
        }

        let batch_status = BatchStatus::rollup(final_statuses.iter().map(|m| m.batch_status));
        Ok(PartitionedStepOutcome {
            final_statuses,
            batch_status,
        })
    }
}
