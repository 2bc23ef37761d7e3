/// Live view of known servers, their pools, and server selection
///
/// One `Topology` belongs to one client. It owns a `ServerDescription` and a
/// lazily created `ConnectionPool` per endpoint, feeds probe and operation
/// outcomes into the descriptions, and answers selection requests from
/// snapshots so no lock is held while the selector runs.
pub mod selector;

pub use selector::{LowestLatency, ReadPreference, SelectionCriteria, ServerSelector};

use crate::core::{
    ConnectionOptions, ConnectionPool, Connector, Endpoint, PoolOptions, ServerDescription,
    ServerRole, ServerState,
};
use crate::error::{DriverError, DriverResult};
use crate::health::{HandshakeHealthChecker, HealthCheckManager, HealthStatus};
use crate::protocol::HelloReply;
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Weight of the newest sample in the round-trip estimate
const RTT_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct TopologyOptions {
    /// How long `select` waits for a suitable server
    pub selection_timeout: Duration,
    /// Period of background probes
    pub heartbeat_interval: Duration,
    /// Minimum gap between probe rounds, including requested ones
    pub min_heartbeat_interval: Duration,
    /// Consecutive failures before a server is marked unreachable
    pub failure_threshold: u32,
    pub pool: PoolOptions,
    pub connection: ConnectionOptions,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            selection_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            min_heartbeat_interval: Duration::from_millis(500),
            failure_threshold: 1,
            pool: PoolOptions::default(),
            connection: ConnectionOptions::default(),
        }
    }
}

/// Observation fed back into a server description
#[derive(Debug, Clone)]
pub enum ServerOutcome {
    /// A fresh handshake completed, from a probe or a new pooled connection
    Handshake {
        round_trip_time: Duration,
        hello: HelloReply,
    },
    /// A request got a reply
    Success { round_trip_time: Duration },
    /// Connect, handshake or stream failure
    Failure { error: String },
    /// A request timed out; says nothing about the server itself
    Timeout,
}

impl ServerOutcome {
    /// Outcome implied by an attempt error, if it says anything about the server
    pub fn from_error(error: &DriverError) -> Option<Self> {
        match error {
            DriverError::RequestTimeout { .. } => Some(ServerOutcome::Timeout),
            DriverError::ConnectTimeout { .. }
            | DriverError::Connect { .. }
            | DriverError::Handshake { .. }
            | DriverError::Stream { .. } => Some(ServerOutcome::Failure {
                error: error.to_string(),
            }),
            _ => None,
        }
    }
}

/// Result of a successful selection
#[derive(Clone)]
pub struct SelectedServer {
    pub endpoint: Endpoint,
    pub pool: ConnectionPool,
}

struct TopologyInner {
    options: TopologyOptions,
    connector: Arc<dyn Connector>,
    selector: Box<dyn ServerSelector>,
    health: HealthCheckManager,
    servers: RwLock<FnvHashMap<Endpoint, ServerDescription>>,
    pools: Mutex<FnvHashMap<Endpoint, ConnectionPool>>,
    changes: watch::Sender<u64>,
    check_requested: Arc<Notify>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for TopologyInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Cheaply cloneable handle to a client's topology
#[derive(Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

impl Topology {
    pub fn new(
        endpoints: Vec<Endpoint>,
        options: TopologyOptions,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::with_selector(endpoints, options, connector, Box::new(LowestLatency))
    }

    pub fn with_selector(
        endpoints: Vec<Endpoint>,
        options: TopologyOptions,
        connector: Arc<dyn Connector>,
        selector: Box<dyn ServerSelector>,
    ) -> Self {
        let checker = HandshakeHealthChecker::new(connector.clone(), options.connection.clone());
        let servers = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.clone(), ServerDescription::new(endpoint)))
            .collect();
        let (changes, _) = watch::channel(0);

        Self {
            inner: Arc::new(TopologyInner {
                options,
                connector,
                selector,
                health: HealthCheckManager::new(Box::new(checker)),
                servers: RwLock::new(servers),
                pools: Mutex::new(FnvHashMap::default()),
                changes,
                check_requested: Arc::new(Notify::new()),
                monitor: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn read_servers(&self) -> RwLockReadGuard<'_, FnvHashMap<Endpoint, ServerDescription>> {
        self.inner.servers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_servers(&self) -> RwLockWriteGuard<'_, FnvHashMap<Endpoint, ServerDescription>> {
        self.inner.servers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pools(&self) -> MutexGuard<'_, FnvHashMap<Endpoint, ConnectionPool>> {
        self.inner.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &TopologyOptions {
        &self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of all descriptions, ordered by endpoint
    pub fn descriptions(&self) -> Vec<ServerDescription> {
        let mut snapshot: Vec<ServerDescription> =
            self.read_servers().values().cloned().collect();
        snapshot.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        snapshot
    }

    pub fn description(&self, endpoint: &Endpoint) -> Option<ServerDescription> {
        self.read_servers().get(endpoint).cloned()
    }

    /// Existing pool for an endpoint, without creating one
    pub fn pool(&self, endpoint: &Endpoint) -> Option<ConnectionPool> {
        self.lock_pools().get(endpoint).cloned()
    }

    /// Pool for a tracked endpoint, created on first use
    ///
    /// `None` once the topology is shut down or the endpoint was removed.
    fn pool_for(&self, endpoint: &Endpoint) -> Option<ConnectionPool> {
        let mut pools = self.lock_pools();
        if self.is_closed() || !self.read_servers().contains_key(endpoint) {
            return None;
        }
        let pool = pools.entry(endpoint.clone()).or_insert_with(|| {
            debug!("Creating pool for {}", endpoint);
            let pool = ConnectionPool::new(
                endpoint.clone(),
                self.inner.options.pool.clone(),
                self.inner.options.connection.clone(),
                self.inner.connector.clone(),
            );
            pool.start_maintenance();
            pool
        });
        Some(pool.clone())
    }

    /// Pick a server for `criteria`
    ///
    /// When nothing qualifies, an immediate probe is requested and selection
    /// waits for the topology to change, up to the selection timeout or the
    /// caller's deadline, whichever comes first.
    pub async fn select(
        &self,
        criteria: &SelectionCriteria,
        deadline: Option<Instant>,
    ) -> DriverResult<SelectedServer> {
        let limit = Instant::now() + self.inner.options.selection_timeout;
        let deadline = deadline.map_or(limit, |d| d.min(limit));
        let mut changes = self.inner.changes.subscribe();

        loop {
            if self.is_closed() {
                return Err(DriverError::Shutdown);
            }

            changes.borrow_and_update();
            let snapshot = self.descriptions();
            if let Some(endpoint) = self.inner.selector.select(&snapshot, criteria) {
                debug!("Selected {} for {}", endpoint, criteria);
                match self.pool_for(&endpoint) {
                    Some(pool) => return Ok(SelectedServer { endpoint, pool }),
                    // Shut down or removed since the snapshot
                    None => continue,
                }
            }

            self.ensure_monitor();
            self.request_check();

            match timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(DriverError::Shutdown),
                Err(_) => {
                    return Err(DriverError::NoSuitableServer {
                        criteria: criteria.to_string(),
                        details: summarize(&self.descriptions()),
                    })
                }
            }
        }
    }

    /// Feed one observation into an endpoint's description
    pub fn update(&self, endpoint: &Endpoint, outcome: ServerOutcome) {
        let mut cleared = false;
        {
            let mut servers = self.write_servers();
            let Some(server) = servers.get_mut(endpoint) else {
                return;
            };
            let previous = server.state;

            match outcome {
                ServerOutcome::Handshake {
                    round_trip_time,
                    hello,
                } => {
                    server.state = ServerState::Connected;
                    server.role = hello.role();
                    server.max_wire_version = Some(hello.max_wire_version);
                    server.round_trip_time =
                        Some(smooth_rtt(server.round_trip_time, round_trip_time));
                    server.consecutive_failures = 0;
                    server.last_error = None;
                }
                ServerOutcome::Success { round_trip_time } => {
                    server.consecutive_failures = 0;
                    if server.state == ServerState::Connected {
                        server.round_trip_time =
                            Some(smooth_rtt(server.round_trip_time, round_trip_time));
                    }
                }
                ServerOutcome::Failure { error } => {
                    server.consecutive_failures = server.consecutive_failures.saturating_add(1);
                    if server.consecutive_failures >= self.inner.options.failure_threshold
                        && server.state != ServerState::Unreachable
                    {
                        warn!(
                            "Marking {} unreachable after {} consecutive failures: {}",
                            endpoint, server.consecutive_failures, error
                        );
                        server.state = ServerState::Unreachable;
                        server.role = ServerRole::Unknown;
                        server.round_trip_time = None;
                        cleared = true;
                    }
                    server.last_error = Some(error);
                }
                ServerOutcome::Timeout => return,
            }

            server.last_update = Some(SystemTime::now());
            if previous != server.state {
                info!("Server {} is now {} ({})", endpoint, server.state, server.role);
            }
        }

        if cleared {
            if let Some(pool) = self.pool(endpoint) {
                pool.clear();
            }
        }
        self.inner.changes.send_modify(|version| *version += 1);
    }

    /// Start tracking an endpoint
    pub fn add_endpoint(&self, endpoint: Endpoint) {
        let added = {
            let mut servers = self.write_servers();
            if servers.contains_key(&endpoint) {
                false
            } else {
                servers.insert(endpoint.clone(), ServerDescription::new(endpoint.clone()));
                true
            }
        };
        if added {
            info!("Added endpoint {}", endpoint);
            self.request_check();
            self.inner.changes.send_modify(|version| *version += 1);
        }
    }

    /// Stop tracking an endpoint and close its pool
    pub fn remove_endpoint(&self, endpoint: &Endpoint) {
        let removed = self.write_servers().remove(endpoint).is_some();
        let pool = self.lock_pools().remove(endpoint);
        if let Some(pool) = pool {
            pool.close();
        }
        if removed {
            info!("Removed endpoint {}", endpoint);
            self.inner.changes.send_modify(|version| *version += 1);
        }
    }

    /// Probe every endpoint once, concurrently
    pub async fn check_all(&self) {
        let endpoints: Vec<Endpoint> = self
            .descriptions()
            .into_iter()
            .map(|server| server.endpoint)
            .collect();

        for (endpoint, status) in self.inner.health.check_endpoints(&endpoints).await {
            match status {
                HealthStatus::Healthy {
                    round_trip_time,
                    hello,
                } => self.update(
                    &endpoint,
                    ServerOutcome::Handshake {
                        round_trip_time,
                        hello,
                    },
                ),
                HealthStatus::Unhealthy { reason } => {
                    self.update(&endpoint, ServerOutcome::Failure { error: reason })
                }
                HealthStatus::Timeout => self.update(
                    &endpoint,
                    ServerOutcome::Failure {
                        error: "health check timed out".to_string(),
                    },
                ),
                HealthStatus::Unknown => {}
            }
        }
    }

    /// Ask the monitor for a probe round as soon as the rate limit allows
    pub fn request_check(&self) {
        self.inner.check_requested.notify_one();
    }

    fn ensure_monitor(&self) {
        let running = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if !running {
            self.start_monitor();
        }
    }

    /// Spawn the background probe loop
    ///
    /// The loop probes every heartbeat interval, or sooner when a check is
    /// requested, but never more often than the minimum heartbeat interval.
    pub fn start_monitor(&self) {
        if self.is_closed() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let signal = self.inner.check_requested.clone();
        let heartbeat = self.inner.options.heartbeat_interval;
        let min_interval = self.inner.options.min_heartbeat_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(heartbeat) => {}
                    _ = signal.notified() => {}
                }

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let topology = Topology { inner };
                if topology.is_closed() {
                    break;
                }

                let started = Instant::now();
                topology.check_all().await;
                drop(topology);
                tokio::time::sleep_until(started + min_interval).await;
            }
        });

        let previous = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop probing, close every pool, and fail pending selections
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = monitor {
            handle.abort();
        }

        let pools: Vec<ConnectionPool> =
            self.lock_pools().drain().map(|(_, pool)| pool).collect();
        for pool in &pools {
            pool.close();
        }

        self.inner.changes.send_modify(|version| *version += 1);
        info!("Topology shut down ({} pools closed)", pools.len());
    }
}

fn smooth_rtt(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        Some(previous) => previous.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA),
        None => sample,
    }
}

fn summarize(servers: &[ServerDescription]) -> String {
    if servers.is_empty() {
        return "no known servers".to_string();
    }
    servers
        .iter()
        .map(|server| match &server.last_error {
            Some(error) => format!("{} {} ({})", server.endpoint, server.state, error),
            None => format!("{} {} {}", server.endpoint, server.state, server.role),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
