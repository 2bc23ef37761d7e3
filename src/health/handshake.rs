/// Probe that opens a dedicated connection, handshakes and pings
use super::{HealthChecker, HealthStatus};
use crate::core::{Connection, ConnectionOptions, Connector, Endpoint};
use crate::protocol::OpCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Health checker speaking the wire protocol
///
/// Probe connections are never pooled; each check opens and closes its own.
pub struct HandshakeHealthChecker {
    connector: Arc<dyn Connector>,
    connection_options: ConnectionOptions,
    check_timeout: Duration,
}

impl HandshakeHealthChecker {
    pub fn new(connector: Arc<dyn Connector>, connection_options: ConnectionOptions) -> Self {
        // Room for connect plus handshake plus one round trip
        let check_timeout = connection_options.connect_timeout * 2;
        Self {
            connector,
            connection_options,
            check_timeout,
        }
    }
}

#[async_trait::async_trait]
impl HealthChecker for HandshakeHealthChecker {
    async fn check_health(&self, endpoint: &Endpoint) -> HealthStatus {
        tracing::trace!("Probing {}", endpoint);

        let opened =
            Connection::open(endpoint, self.connector.as_ref(), &self.connection_options).await;
        let mut conn = match opened {
            Ok(conn) => conn,
            Err(e) => {
                return HealthStatus::Unhealthy {
                    reason: e.to_string(),
                }
            }
        };

        let ping = json!({ "ping": 1, "$db": "admin" }).to_string();
        let started = Instant::now();
        let result = conn
            .send_receive(OpCode::Command, ping.into(), self.connection_options.connect_timeout)
            .await;
        let round_trip_time = started.elapsed();
        let hello = conn.hello().cloned();
        conn.close();

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                return HealthStatus::Unhealthy {
                    reason: e.to_string(),
                }
            }
        };

        let acknowledged = serde_json::from_slice::<Value>(&reply.payload)
            .ok()
            .and_then(|doc| doc.get("ok").and_then(Value::as_f64))
            == Some(1.0);
        if !acknowledged {
            return HealthStatus::Unhealthy {
                reason: "ping was not acknowledged".to_string(),
            };
        }

        match hello {
            Some(hello) => HealthStatus::Healthy {
                round_trip_time,
                hello,
            },
            None => HealthStatus::Unknown,
        }
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}
