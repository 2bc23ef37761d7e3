/// Operation execution: select, acquire, send, classify, retry
pub mod collection;
pub mod operation;
pub mod retry;
pub mod serializer;

pub use collection::Collection;
pub use operation::{
    DeleteResult, FindOptions, InsertResult, Namespace, Operation, OperationKind, OperationResult,
    PreparedOperation, Retryability, UpdateResult,
};
pub use retry::{FailureClass, RetryContext, RetryDecision, RetryPolicy};
pub use serializer::{DocumentSerializer, JsonSerializer};

use crate::core::Endpoint;
use crate::error::{DriverError, DriverResult};
use crate::protocol::OpCode;
use crate::topology::{ReadPreference, SelectionCriteria, ServerOutcome, Topology};
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Per-request wait for a reply
    pub socket_timeout: Duration,
    /// Per-attempt wait for a pooled connection
    pub wait_queue_timeout: Duration,
    /// Deadline applied when the caller gives none
    pub operation_timeout: Duration,
    pub read_preference: ReadPreference,
    pub retry: RetryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(30),
            wait_queue_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(60),
            read_preference: ReadPreference::Primary,
            retry: RetryPolicy::default(),
        }
    }
}

/// Entry point that turns operations into wire requests
pub struct Executor {
    topology: Topology,
    serializer: Arc<dyn DocumentSerializer>,
    options: ExecutorOptions,
    next_operation_id: AtomicU64,
}

impl Executor {
    pub fn new(topology: Topology, options: ExecutorOptions) -> Self {
        Self::with_serializer(topology, options, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(
        topology: Topology,
        options: ExecutorOptions,
        serializer: Arc<dyn DocumentSerializer>,
    ) -> Self {
        Self {
            topology,
            serializer,
            options,
            next_operation_id: AtomicU64::new(1),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Run one operation to completion under `deadline`
    ///
    /// Qualifying failures are retried against a freshly selected server
    /// as the retry policy allows; the last failure is returned otherwise.
    pub async fn execute(
        &self,
        operation: &Operation,
        deadline: Option<Instant>,
    ) -> DriverResult<OperationResult> {
        if self.topology.is_closed() {
            return Err(DriverError::Shutdown);
        }

        let deadline =
            deadline.unwrap_or_else(|| Instant::now() + self.options.operation_timeout);
        let operation_id = self.next_operation_id.fetch_add(1, Ordering::Relaxed);
        let prepared = operation.prepare(operation_id)?;
        let payload = self.serializer.serialize(&prepared.command)?;
        let criteria = operation.selection_criteria(self.options.read_preference);
        let mut context = RetryContext::new(operation.kind(), operation.retryability());

        loop {
            context.begin_attempt();
            let outcome = self
                .attempt(&criteria, &payload, deadline, &mut context)
                .await
                .and_then(|reply| prepared.to_result(reply));

            let error = match outcome {
                Ok(result) => {
                    if context.attempts() > 1 {
                        info!(
                            "Operation {} ({}) succeeded on attempt {}",
                            operation_id,
                            context.kind,
                            context.attempts()
                        );
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            if let FailureClass::TransientServer(_) = context.record_failure(&error) {
                // The server's role may have changed under us
                self.topology.request_check();
            }

            match self.options.retry.decide(&context, deadline) {
                RetryDecision::Retry => {
                    warn!(
                        "Operation {} ({}) attempt {} failed, retrying: {}",
                        operation_id,
                        context.kind,
                        context.attempts(),
                        error
                    );
                }
                RetryDecision::Surface(reason) => {
                    error!(
                        "Operation {} ({}) failed after {} attempt(s), {}: {}",
                        operation_id,
                        context.kind,
                        context.attempts(),
                        reason,
                        error
                    );
                    return Err(error);
                }
            }
        }
    }

    async fn attempt(
        &self,
        criteria: &SelectionCriteria,
        payload: &Bytes,
        deadline: Instant,
        context: &mut RetryContext,
    ) -> DriverResult<Value> {
        let selected = self.topology.select(criteria, Some(deadline)).await?;
        let endpoint = selected.endpoint;

        let wait = deadline
            .saturating_duration_since(Instant::now())
            .min(self.options.wait_queue_timeout);
        let mut conn = match selected.pool.acquire(wait).await {
            Ok(conn) => conn,
            Err(e) => {
                self.report(&endpoint, &e);
                return Err(e);
            }
        };

        if let Some((round_trip_time, hello)) = conn.take_fresh_handshake() {
            self.topology.update(
                &endpoint,
                ServerOutcome::Handshake {
                    round_trip_time,
                    hello,
                },
            );
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DriverError::RequestTimeout {
                endpoint,
                timeout: Duration::ZERO,
            });
        }

        context.mark_sent();
        let started = Instant::now();
        let timeout = remaining.min(self.options.socket_timeout);
        let result = conn
            .send_receive(OpCode::Command, payload.clone(), timeout)
            .await;
        // Back to the pool, or discarded if the exchange poisoned it
        drop(conn);

        match result {
            Ok(reply) => {
                self.topology.update(
                    &endpoint,
                    ServerOutcome::Success {
                        round_trip_time: started.elapsed(),
                    },
                );
                self.serializer.deserialize(&reply.payload)
            }
            Err(e) => {
                self.report(&endpoint, &e);
                Err(e)
            }
        }
    }

    fn report(&self, endpoint: &Endpoint, error: &DriverError) {
        if let Some(outcome) = ServerOutcome::from_error(error) {
            self.topology.update(endpoint, outcome);
        }
    }
}
