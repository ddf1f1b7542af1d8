//! Batch statuses and the rules for moving between them

use std::fmt;
use serde::{Deserialize, Serialize};

/// Status of a job, partition or split-flow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Created, thread not yet running
    Starting,
    /// Processing has begun
    Started,
    /// A stop was requested and is being honored
    Stopping,
    /// Stopped before completion
    Stopped,
    /// Ended with a failure
    Failed,
    /// Ended successfully
    Completed,
}

impl BatchStatus {
    /// Terminal statuses are final for an execution
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    /// Whether an execution in this status may move to `next`
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Starting => true,
            Self::Started => next != Self::Starting,
            Self::Stopping => matches!(next, Self::Stopped | Self::Failed | Self::Completed),
            Self::Stopped | Self::Failed | Self::Completed => false,
        }
    }

    /// Fold sibling statuses into the status of their parent
    ///
    /// Any FAILED wins, then any STOPPED, otherwise COMPLETED. Non-terminal
    /// siblings count as FAILED since they never reported a result.
    pub fn rollup<I>(statuses: I) -> BatchStatus
    where
        I: IntoIterator<Item = BatchStatus>,
    {
        let mut stopped = false;
        for status in statuses {
            match status {
                Self::Completed => {}
                Self::Stopped => stopped = true,
                _ => return Self::Failed,
            }
        }
        if stopped {
            Self::Stopped
        } else {
            Self::Completed
        }
    }

    /// Upper-case name, also used as the default exit status
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_terminal_statuses_are_final() {
        for terminal in [BatchStatus::Completed, BatchStatus::Stopped, BatchStatus::Failed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(BatchStatus::Started));
            assert!(terminal.can_transition_to(terminal));
        }
    }

    #[test]
    fn test_forward_transitions() {
        assert!(BatchStatus::Starting.can_transition_to(BatchStatus::Started));
        assert!(BatchStatus::Started.can_transition_to(BatchStatus::Stopping));
        assert!(BatchStatus::Stopping.can_transition_to(BatchStatus::Stopped));
        assert!(!BatchStatus::Started.can_transition_to(BatchStatus::Starting));
        assert!(!BatchStatus::Stopping.can_transition_to(BatchStatus::Started));
    }

    #[test]
    fn test_rollup() {
        assert_eq!(BatchStatus::rollup(Vec::new()), BatchStatus::Completed);
        assert_eq!(
            BatchStatus::rollup([BatchStatus::Completed, BatchStatus::Stopped]),
            BatchStatus::Stopped
        );
        assert_eq!(
            BatchStatus::rollup([BatchStatus::Stopped, BatchStatus::Failed, BatchStatus::Completed]),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::rollup([BatchStatus::Completed, BatchStatus::Started]),
            BatchStatus::Failed
        );
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&BatchStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
        assert_eq!(BatchStatus::Failed.to_string(), "FAILED");
    }

    fn any_status() -> impl Strategy<Value = BatchStatus> {
        prop_oneof![
            Just(BatchStatus::Starting),
            Just(BatchStatus::Started),
            Just(BatchStatus::Stopping),
            Just(BatchStatus::Stopped),
            Just(BatchStatus::Failed),
            Just(BatchStatus::Completed),
        ]
    }

    proptest! {
        #[test]
        fn rollup_is_failed_whenever_a_sibling_failed(
            mut statuses in proptest::collection::vec(any_status(), 0..12),
            position in any::<prop::sample::Index>(),
        ) {
            let at = position.index(statuses.len() + 1);
            statuses.insert(at, BatchStatus::Failed);
            prop_assert_eq!(BatchStatus::rollup(statuses), BatchStatus::Failed);
        }

        #[test]
        fn rollup_is_always_terminal(statuses in proptest::collection::vec(any_status(), 0..12)) {
            prop_assert!(BatchStatus::rollup(statuses).is_terminal());
        }
    }
}
