/// Retry policy: at most a fixed number of extra attempts, decided per failure
use super::operation::{OperationKind, Retryability};
use crate::error::DriverError;
use tokio::time::Instant;

/// How a failed attempt is classified for retry purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Connect, handshake, timeout or stream failure
    Network,
    /// No connection became available in time
    PoolExhausted,
    /// Server error code on the transient allow-list
    TransientServer(i32),
    /// Validation, duplicate key, selection failure and everything else
    Permanent,
}

impl FailureClass {
    pub fn classify(error: &DriverError) -> Self {
        if !error.is_retryable() {
            return FailureClass::Permanent;
        }
        match error {
            DriverError::PoolTimeout { .. } => FailureClass::PoolExhausted,
            DriverError::Server(e) => FailureClass::TransientServer(e.code),
            _ => FailureClass::Network,
        }
    }

    fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::Permanent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Surface(&'static str),
}

/// Per-operation attempt bookkeeping; lives only for one `execute` call
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub kind: OperationKind,
    pub retryability: Retryability,
    attempts: u32,
    request_sent: bool,
    last_failure: Option<FailureClass>,
}

impl RetryContext {
    pub fn new(kind: OperationKind, retryability: Retryability) -> Self {
        Self {
            kind,
            retryability,
            attempts: 0,
            request_sent: false,
            last_failure: None,
        }
    }

    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    /// The request was handed to a connection and may have reached the server
    pub fn mark_sent(&mut self) {
        self.request_sent = true;
    }

    pub fn record_failure(&mut self, error: &DriverError) -> FailureClass {
        let class = FailureClass::classify(error);
        self.last_failure = Some(class);
        class
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn request_sent(&self) -> bool {
        self.request_sent
    }
}

/// Explicit retry policy consulted once per failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 1,
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
        }
    }

    pub fn decide(&self, context: &RetryContext, deadline: Instant) -> RetryDecision {
        if !self.enabled {
            return RetryDecision::Surface("retries disabled");
        }
        match context.last_failure {
            Some(class) if class.is_retryable() => {}
            _ => return RetryDecision::Surface("failure is not retryable"),
        }
        if context.attempts > self.max_retries {
            return RetryDecision::Surface("retry budget exhausted");
        }
        match context.retryability {
            Retryability::Never => return RetryDecision::Surface("operation is not retryable"),
            Retryability::UnattemptedOnly if context.request_sent => {
                return RetryDecision::Surface("batch may have been partially applied")
            }
            _ => {}
        }
        if Instant::now() >= deadline {
            return RetryDecision::Surface("deadline expired");
        }
        RetryDecision::Retry
    }
}
