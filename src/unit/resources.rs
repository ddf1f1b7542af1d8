//! Per-thread resources installed at thread begin and reset at thread end

use std::cell::Cell;
use std::time::Duration;
use anyhow::{bail, Context};
use tracing::debug;

use crate::config::BatchConfig;
use crate::execution::RuntimeWorkUnitExecution;

/// Execution property overriding the transaction timeout, in seconds
pub const TRANSACTION_TIMEOUT_PROPERTY: &str = "transaction.global.timeout";

thread_local! {
    static TRANSACTION_TIMEOUT: Cell<Option<Duration>> = const { Cell::new(None) };
}

/// Transaction timeout installed for the calling thread, if any
pub fn current_transaction_timeout() -> Option<Duration> {
    TRANSACTION_TIMEOUT.with(Cell::get)
}

/// Thread-scoped state a unit needs while it runs
///
/// `acquire` failing is a setup failure. `reset` runs at thread end whatever
/// happened, and its failure is only logged.
pub trait ThreadResources: Send + Sync {
    /// Install state for the current thread
    fn acquire(&self, execution: &RuntimeWorkUnitExecution) -> anyhow::Result<()>;

    /// Return the current thread to its default state
    fn reset(&self) -> anyhow::Result<()>;
}

/// Installs the transaction timeout for the unit's thread
#[derive(Debug, Clone, Copy)]
pub struct TransactionTimeout {
    default: Duration,
}

impl TransactionTimeout {
    /// Use `default` when the execution carries no override
    pub fn new(default: Duration) -> Self {
        Self { default }
    }

    /// Default taken from configuration
    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.default_transaction_timeout())
    }
}

impl ThreadResources for TransactionTimeout {
    fn acquire(&self, execution: &RuntimeWorkUnitExecution) -> anyhow::Result<()> {
        let timeout = match execution.property(TRANSACTION_TIMEOUT_PROPERTY) {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid {TRANSACTION_TIMEOUT_PROPERTY} value '{raw}'"))?;
                if secs == 0 {
                    bail!("{TRANSACTION_TIMEOUT_PROPERTY} must be greater than zero");
                }
                Duration::from_secs(secs)
            }
            None => self.default,
        };
        debug!(timeout_secs = timeout.as_secs(), "Installing transaction timeout");
        TRANSACTION_TIMEOUT.with(|t| t.set(Some(timeout)));
        Ok(())
    }

    fn reset(&self) -> anyhow::Result<()> {
        TRANSACTION_TIMEOUT.with(|t| t.set(None));
        Ok(())
    }
}
