//! Completion rendezvous for split-flow branches
//!
//! Each split-flow unit adds exactly one [`CompletedSplitFlow`] token when its
//! thread ends, whatever its outcome. The thread that launched the split
//! drains one token per branch.

use std::fmt;
use std::time::{Duration, Instant};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::execution::{BatchStatus, RuntimeWorkUnitExecution};
use crate::{BatchError, Result};

/// Token left by a finished split-flow unit
#[derive(Debug, Clone)]
pub struct CompletedSplitFlow {
    execution: RuntimeWorkUnitExecution,
}

impl CompletedSplitFlow {
    pub(crate) fn new(execution: RuntimeWorkUnitExecution) -> Self {
        Self { execution }
    }

    /// Final execution context of the branch
    pub fn execution(&self) -> &RuntimeWorkUnitExecution {
        &self.execution
    }

    /// Terminal batch status of the branch
    pub fn batch_status(&self) -> BatchStatus {
        self.execution.batch_status()
    }

    /// Exit status of the branch
    pub fn exit_status(&self) -> String {
        self.execution.exit_status()
    }

    /// Flow name of the branch
    pub fn flow_name(&self) -> Option<&str> {
        self.execution.flow_name()
    }
}

/// All branches of a split, once joined
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    /// Tokens in completion order
    pub completed: Vec<CompletedSplitFlow>,
    /// Roll-up of all branch statuses
    pub batch_status: BatchStatus,
}

/// Blocking collection of finished split-flow units
///
/// Clones share one channel. Every clone keeps both ends alive, so adding
/// a token never fails while a rendezvous exists.
#[derive(Clone)]
pub struct CompletionRendezvous {
    sender: Sender<CompletedSplitFlow>,
    receiver: Receiver<CompletedSplitFlow>,
}

impl CompletionRendezvous {
    /// Create an empty rendezvous
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Add a completion token
    pub fn add(&self, token: CompletedSplitFlow) {
        if self.sender.send(token).is_err() {
            warn!("Split flow rendezvous has no receiver; completion token dropped");
        }
    }

    /// Next token, waiting at most `timeout`
    pub fn poll(&self, timeout: Duration) -> Option<CompletedSplitFlow> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Tokens currently waiting to be drained
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Block until `expected` tokens arrived or `timeout` elapsed
    pub fn await_all(&self, expected: usize, timeout: Duration) -> Result<SplitOutcome> {
        let deadline = Instant::now() + timeout;
        let mut completed = Vec::with_capacity(expected);

        while completed.len() < expected {
            match self.receiver.recv_deadline(deadline).ok() {
                Some(token) => {
                    debug!(
                        flow_name = token.flow_name().unwrap_or_default(),
                        batch_status = %token.batch_status(),
                        "Split flow joined"
                    );
                    completed.push(token);
                }
                None => {
                    warn!(
                        expected = expected,
                        received = completed.len(),
                        timeout_ms = timeout.as_millis(),
                        "Timed out joining split flows"
                    );
                    return Err(BatchError::JoinTimeout {
                        expected,
                        received: completed.len(),
                    });
                }
            }
        }

        let batch_status = BatchStatus::rollup(completed.iter().map(|t| t.batch_status()));
        Ok(SplitOutcome {
            completed,
            batch_status,
        })
    }
}

impl Default for CompletionRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionRendezvous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRendezvous")
            .field("pending", &self.pending())
            .finish()
    }
}
