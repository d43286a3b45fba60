use crate::core::{MigrationError, Result};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry-with-backoff wrapper around fallible collaborator operations.
///
/// Fatal errors (see `MigrationError::kind`) are re-thrown on the first
/// attempt without sleeping or consuming a retry. Everything else is
/// retried with exponential backoff up to the configured ceiling, then
/// escalated as `RetryExhausted`.
///
/// State is per-process: the current attempt counter for an operation id
/// resets on success, while historical totals survive for end-of-run
/// reporting. Nothing here persists across orchestrator instances.
pub struct RetryManager {
    max_retries: u32,
    base_delay: Duration,
    current: HashMap<String, u32>,
    total_retries: u64,
    retried_operations: BTreeSet<String>,
}

/// Aggregate retry activity for one orchestrator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySummary {
    pub total_retries: u64,
    pub retried_operations: BTreeSet<String>,
}

impl RetryManager {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            current: HashMap::new(),
            total_retries: 0,
            retried_operations: BTreeSet::new(),
        }
    }

    /// Run `op`, retrying retryable failures.
    ///
    /// The operation gets one initial attempt plus up to `max_retries`
    /// retries; the N-th retry sleeps `base_delay * 2^(N-1)` first.
    pub fn retry_operation<T, F>(&mut self, operation_id: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut last_err: Option<MigrationError> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                debug!(
                    operation = operation_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                std::thread::sleep(delay);
                self.record_retry(operation_id);
            }
            match op() {
                Ok(value) => {
                    self.current.remove(operation_id);
                    return Ok(value);
                }
                Err(e) if e.is_fatal() => {
                    warn!(operation = operation_id, error = %e, "fatal error, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        operation = operation_id,
                        attempt = attempt + 1,
                        error = %e,
                        "retryable failure"
                    );
                    last_err = Some(e);
                }
            }
        }
        self.current.remove(operation_id);
        Err(MigrationError::RetryExhausted {
            operation: operation_id.to_string(),
            attempts: self.max_retries + 1,
            source: Box::new(last_err.unwrap_or_else(|| {
                MigrationError::External("retry loop exhausted without error".into())
            })),
        })
    }

    fn record_retry(&mut self, operation_id: &str) {
        *self.current.entry(operation_id.to_string()).or_insert(0) += 1;
        self.total_retries += 1;
        self.retried_operations.insert(operation_id.to_string());
    }

    /// Retries currently accumulated for an in-flight operation id.
    pub fn current_attempts(&self, operation_id: &str) -> u32 {
        self.current.get(operation_id).copied().unwrap_or(0)
    }

    /// Retries ever performed by this instance.
    pub fn total_retries(&self) -> u64 {
        self.total_retries
    }

    pub fn summary(&self) -> RetrySummary {
        RetrySummary {
            total_retries: self.total_retries,
            retried_operations: self.retried_operations.clone(),
        }
    }
}
