//! Cross-process reply channel
//!
//! Messages are encoded with the configured [`WireFormat`] and handed to a
//! [`MessageBridge`]. The bridge connection is opened on the first send and
//! released on close.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::metrics::BatchMetrics;
use crate::partition::message::{PartitionReplyMsg, WireFormat};
use crate::partition::reply_queue::PartitionReplyQueue;
use crate::partition::ReplyChannelError;

/// Transport that moves encoded reply messages between processes
pub trait MessageBridge: Send + Sync {
    /// Open a sending connection to `destination`
    fn connect(&self, destination: &str) -> Result<Box<dyn BridgeConnection>, ReplyChannelError>;

    /// Next payload addressed to `destination`, waiting at most `timeout`
    fn receive(&self, destination: &str, timeout: Duration) -> Result<Option<Bytes>, ReplyChannelError>;
}

/// Open sending connection on a bridge
pub trait BridgeConnection: Send {
    /// Deliver one encoded message
    fn send(&mut self, payload: Bytes) -> Result<(), ReplyChannelError>;

    /// Release the connection
    fn close(&mut self) -> Result<(), ReplyChannelError>;
}

/// Reply queue that delivers through a [`MessageBridge`]
pub struct RemotePartitionReplyQueue {
    bridge: Arc<dyn MessageBridge>,
    destination: String,
    wire_format: WireFormat,
    connection: Mutex<Option<Box<dyn BridgeConnection>>>,
    closed: AtomicBool,
}

impl RemotePartitionReplyQueue {
    /// Create a queue; no connection is opened until the first send
    pub fn new(bridge: Arc<dyn MessageBridge>, destination: String, wire_format: WireFormat) -> Self {
        Self {
            bridge,
            destination,
            wire_format,
            connection: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

impl PartitionReplyQueue for RemotePartitionReplyQueue {
    fn add(&self, msg: PartitionReplyMsg) -> Result<(), ReplyChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplyChannelError::Closed);
        }
        let payload = msg.encode(self.wire_format)?;

        let mut connection = self.connection.lock();
        if connection.is_none() {
            debug!(destination = %self.destination, "Opening reply bridge connection");
            *connection = Some(self.bridge.connect(&self.destination)?);
        }
        if let Some(conn) = connection.as_mut() {
            conn.send(payload)?;
        }
        BatchMetrics::record_reply_message(msg.msg_type.as_str());
        trace!(
            destination = %self.destination,
            msg_type = msg.msg_type.as_str(),
            partition_number = msg.partition_number(),
            "Reply message sent"
        );
        Ok(())
    }

    fn close(&self) -> Result<(), ReplyChannelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.connection.lock().take() {
            Some(mut conn) => {
                debug!(destination = %self.destination, "Closing reply bridge connection");
                conn.close()
            }
            None => Ok(()),
        }
    }
}

/// Bridge that keeps destinations in process memory
///
/// Payloads are still encoded and decoded, so it exercises the same path
/// as a real transport. Open connections are counted so tests can check
/// that every partition released its connection.
#[derive(Default)]
pub struct InMemoryBridge {
    destinations: DashMap<String, (Sender<Bytes>, Receiver<Bytes>)>,
    open_connections: Arc<AtomicUsize>,
    delivered: Arc<AtomicU64>,
}

impl InMemoryBridge {
    /// Create an empty bridge
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections opened and not yet closed or dropped
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Total payloads delivered across all destinations
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    fn destination(&self, name: &str) -> (Sender<Bytes>, Receiver<Bytes>) {
        self.destinations
            .entry(name.to_string())
            .or_insert_with(unbounded)
            .clone()
    }
}

impl MessageBridge for InMemoryBridge {
    fn connect(&self, destination: &str) -> Result<Box<dyn BridgeConnection>, ReplyChannelError> {
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        let (sender, _) = self.destination(destination);
        Ok(Box::new(InMemoryConnection {
            sender,
            open_connections: self.open_connections.clone(),
            delivered: self.delivered.clone(),
            open: true,
        }))
    }

    fn receive(&self, destination: &str, timeout: Duration) -> Result<Option<Bytes>, ReplyChannelError> {
        let (_, receiver) = self.destination(destination);
        Ok(receiver.recv_timeout(timeout).ok())
    }
}

struct InMemoryConnection {
    sender: Sender<Bytes>,
    open_connections: Arc<AtomicUsize>,
    delivered: Arc<AtomicU64>,
    open: bool,
}

impl BridgeConnection for InMemoryConnection {
    fn send(&mut self, payload: Bytes) -> Result<(), ReplyChannelError> {
        if !self.open {
            return Err(ReplyChannelError::Closed);
        }
        self.sender
            .send(payload)
            .map_err(|e| ReplyChannelError::Bridge(e.to_string()))?;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ReplyChannelError> {
        if std::mem::replace(&mut self.open, false) {
            self.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
