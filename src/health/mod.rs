/// Health probing for server endpoints
pub mod handshake;

pub use handshake::HandshakeHealthChecker;

use crate::core::Endpoint;
use crate::protocol::HelloReply;
use futures::future::join_all;
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;

/// Result of probing one endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy {
        round_trip_time: Duration,
        hello: HelloReply,
    },
    Unhealthy {
        reason: String,
    },
    Timeout,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy {
                round_trip_time, ..
            } => write!(f, "Healthy ({:?})", round_trip_time),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy endpoint
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy { .. })
    }
}

/// Health checker trait
#[async_trait::async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe one endpoint
    async fn check_health(&self, endpoint: &Endpoint) -> HealthStatus;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// Runs checks under the checker's timeout
pub struct HealthCheckManager {
    checker: Box<dyn HealthChecker>,
}

impl HealthCheckManager {
    pub fn new(checker: Box<dyn HealthChecker>) -> Self {
        Self { checker }
    }

    /// Perform health check with timeout
    pub async fn check_endpoint(&self, endpoint: &Endpoint) -> HealthStatus {
        let check = self.checker.check_health(endpoint);
        let status = match timeout(self.checker.check_timeout(), check).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };

        match &status {
            HealthStatus::Healthy { round_trip_time, .. } => {
                tracing::debug!("Endpoint {} is healthy ({:?})", endpoint, round_trip_time);
            }
            HealthStatus::Unhealthy { reason } => {
                tracing::warn!("Endpoint {} is unhealthy: {}", endpoint, reason);
            }
            HealthStatus::Timeout => {
                tracing::warn!("Health check timeout for endpoint {}", endpoint);
            }
            HealthStatus::Unknown => {
                tracing::warn!("Unknown health status for endpoint {}", endpoint);
            }
        }

        status
    }

    /// Probe all endpoints concurrently
    pub async fn check_endpoints(
        &self,
        endpoints: &[Endpoint],
    ) -> Vec<(Endpoint, HealthStatus)> {
        let checks = endpoints.iter().map(|endpoint| self.check_endpoint(endpoint));
        let statuses = join_all(checks).await;
        endpoints.iter().cloned().zip(statuses).collect()
    }
}
