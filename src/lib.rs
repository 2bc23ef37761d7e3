/// docwire - client core for a document database wire protocol
///
/// A `Client` owns one topology: a set of server endpoints, each with its
/// own bounded connection pool, kept current by background handshake
/// probes. Operations go through an executor that selects a server,
/// borrows a connection, and retries qualifying failures once.
///
/// Clients are independent; several may run in one process.
pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod health;
pub mod protocol;
pub mod topology;
pub mod utils;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

pub use crate::config::Config;
pub use crate::core::{
    Connector, Endpoint, ServerDescription, ServerRole, ServerState, TcpConnector,
};
pub use crate::error::{ConfigError, DriverError, DriverResult, ServerError};
pub use crate::executor::{
    Collection, DeleteResult, Executor, FindOptions, InsertResult, Namespace, Operation,
    OperationResult, RetryPolicy, UpdateResult,
};
pub use crate::topology::{ReadPreference, SelectionCriteria, Topology};

/// Entry point: one topology plus the executor in front of it
pub struct Client {
    config: Config,
    executor: Arc<Executor>,
}

impl Client {
    /// Build a client over TCP. No I/O happens until `startup` or the
    /// first operation.
    pub fn new(config: Config) -> DriverResult<Self> {
        Self::with_connector(config, Arc::new(TcpConnector::default()))
    }

    /// Build a client from a `mongodb://` connection string
    pub fn from_uri(uri: &str) -> DriverResult<Self> {
        Self::new(Config::from_uri(uri)?)
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> DriverResult<Self> {
        config.validate()?;

        let topology = Topology::new(config.endpoints()?, config.topology_options(), connector);
        let executor = Executor::new(topology, config.executor_options()?);

        Ok(Self {
            config,
            executor: Arc::new(executor),
        })
    }

    /// Probe every endpoint once, then keep probing in the background
    pub async fn startup(&self) -> DriverResult<()> {
        let topology = self.topology();
        if topology.is_closed() {
            return Err(DriverError::Shutdown);
        }

        topology.check_all().await;
        topology.start_monitor();

        let connected = topology
            .descriptions()
            .iter()
            .filter(|server| server.state == ServerState::Connected)
            .count();
        info!(
            "Client started: {}/{} endpoints reachable",
            connected,
            self.config.client.endpoints.len()
        );
        Ok(())
    }

    /// Stop background probes and close every pool; later operations fail
    /// with `Shutdown`
    pub fn shutdown(&self) {
        self.topology().shutdown();
    }

    pub async fn execute(
        &self,
        operation: &Operation,
        deadline: Option<Instant>,
    ) -> DriverResult<OperationResult> {
        self.executor.execute(operation, deadline).await
    }

    /// Handle for `database.collection`
    pub fn collection(&self, namespace: &str) -> DriverResult<Collection> {
        let namespace: Namespace = namespace.parse()?;
        Ok(Collection::new(self.executor.clone(), namespace))
    }

    pub fn topology(&self) -> &Topology {
        self.executor.topology()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
