/// Bounded connection pool for one endpoint
///
/// Idle connections are reused most-recently-returned first. When the pool is
/// at capacity, callers queue in FIFO order and each waits under its own
/// timeout; a returned connection or a freed slot goes to the oldest waiter
/// still listening. A generation counter lets `clear` invalidate every
/// connection opened before it, including ones currently checked out.
use super::connection::{Connection, ConnectionOptions, Connector};
use super::Endpoint;
use crate::error::{DriverError, DriverResult};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Pool sizing and timing
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Upper bound on open plus opening connections
    pub max_size: usize,
    /// Connections the maintenance task keeps open
    pub min_size: usize,
    /// Idle connections older than this are closed (zero disables eviction)
    pub max_idle: Duration,
    /// Default wait for a connection when the pool is at capacity
    pub wait_queue_timeout: Duration,
    /// Period of the maintenance task
    pub maintenance_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 100,
            min_size: 0,
            max_idle: Duration::from_secs(60),
            wait_queue_timeout: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(1),
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened over the pool's lifetime
    pub opened: u64,
    /// Connections closed over the pool's lifetime
    pub closed: u64,
    /// Connections dropped on return because they were unusable or stale
    pub discarded: u64,
    pub idle: usize,
    /// Checked out or still opening
    pub outstanding: usize,
    pub waiters: usize,
    pub generation: u64,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.idle + self.outstanding
    }
}

enum Grant {
    Connection(Connection),
    Slot,
}

struct Waiter {
    id: u64,
    grant: oneshot::Sender<Grant>,
}

struct PoolState {
    idle: VecDeque<Connection>,
    /// Idle, checked out and opening connections
    total: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    generation: u64,
    closed: bool,
    opened: u64,
    closed_count: u64,
    discarded: u64,
}

impl PoolState {
    /// Hand freed capacity to queued waiters, oldest first
    fn grant_slots(&mut self, max_size: usize) {
        while self.total < max_size {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.total += 1;
            if waiter.grant.send(Grant::Slot).is_err() {
                // Waiter gave up; keep the slot for the next one
                self.total -= 1;
            }
        }
    }

    fn retire(&mut self, count: usize) {
        self.total -= count;
        self.closed_count += count as u64;
    }
}

struct PoolInner {
    endpoint: Endpoint,
    options: PoolOptions,
    connection_options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take back a checked-out connection
    fn check_in(&self, mut conn: Connection) {
        let mut state = self.lock();

        let reusable =
            !state.closed && conn.is_reusable() && conn.generation() == state.generation;
        if !reusable {
            debug!(
                "Discarding connection {} to {} ({:?}, generation {} of {})",
                conn.id(),
                self.endpoint,
                conn.state(),
                conn.generation(),
                state.generation
            );
            conn.close();
            state.retire(1);
            state.discarded += 1;
            state.grant_slots(self.options.max_size);
            return;
        }

        conn.touch();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.grant.send(Grant::Connection(conn)) {
                Ok(()) => return,
                Err(Grant::Connection(returned)) => conn = returned,
                Err(Grant::Slot) => return,
            }
        }
        state.idle.push_back(conn);
    }

    fn release_slot(&self) {
        let mut state = self.lock();
        state.total -= 1;
        state.grant_slots(self.options.max_size);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .maintenance
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Capacity claimed for a connection that is still opening; given back on drop
struct Reservation<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl Reservation<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release_slot();
        }
    }
}

/// A place in the wait queue; leaving it returns anything granted meanwhile
struct WaitTicket<'a> {
    inner: &'a PoolInner,
    id: u64,
    rx: oneshot::Receiver<Grant>,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.waiters.retain(|waiter| waiter.id != self.id);
        }
        // Only a grant that was never taken is still in the channel
        match self.rx.try_recv() {
            Ok(Grant::Connection(conn)) => self.inner.check_in(conn),
            Ok(Grant::Slot) => self.inner.release_slot(),
            Err(_) => {}
        }
    }
}

enum Step {
    Ready(Connection),
    Open,
    Wait(u64, oneshot::Receiver<Grant>),
}

/// Cheaply cloneable handle to a per-endpoint pool
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        endpoint: Endpoint,
        options: PoolOptions,
        connection_options: ConnectionOptions,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                options,
                connection_options,
                connector,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                    generation: 0,
                    closed: false,
                    opened: 0,
                    closed_count: 0,
                    discarded: 0,
                }),
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Check out a connection, opening one or waiting in line as needed
    pub async fn acquire(&self, wait_timeout: Duration) -> DriverResult<PooledConnection> {
        let deadline = Instant::now() + wait_timeout;

        let step = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(DriverError::PoolClosed {
                    endpoint: self.inner.endpoint.clone(),
                });
            }

            let mut reused = None;
            while let Some(mut conn) = state.idle.pop_back() {
                let stale = conn.generation() != state.generation
                    || (!self.inner.options.max_idle.is_zero()
                        && conn.idle_time() > self.inner.options.max_idle);
                if stale {
                    conn.close();
                    state.retire(1);
                    continue;
                }
                reused = Some(conn);
                break;
            }

            match reused {
                Some(conn) => Step::Ready(conn),
                None if state.total < self.inner.options.max_size && state.waiters.is_empty() => {
                    state.total += 1;
                    Step::Open
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    let id = state.next_waiter_id;
                    state.next_waiter_id += 1;
                    state.waiters.push_back(Waiter { id, grant: tx });
                    // Evictions above may have freed capacity
                    state.grant_slots(self.inner.options.max_size);
                    Step::Wait(id, rx)
                }
            }
        };

        match step {
            Step::Ready(conn) => Ok(self.checkout(conn)),
            Step::Open => self.open_before(deadline, wait_timeout).await,
            Step::Wait(id, rx) => {
                let mut ticket = WaitTicket {
                    inner: &self.inner,
                    id,
                    rx,
                };
                match timeout_at(deadline, &mut ticket.rx).await {
                    Ok(Ok(Grant::Connection(conn))) => Ok(self.checkout(conn)),
                    Ok(Ok(Grant::Slot)) => {
                        drop(ticket);
                        self.open_before(deadline, wait_timeout).await
                    }
                    Ok(Err(_)) => Err(DriverError::PoolClosed {
                        endpoint: self.inner.endpoint.clone(),
                    }),
                    Err(_) => {
                        drop(ticket);
                        debug!(
                            "Timed out after {:?} waiting for a connection to {}",
                            wait_timeout, self.inner.endpoint
                        );
                        Err(self.pool_timeout(wait_timeout))
                    }
                }
            }
        }
    }

    fn pool_timeout(&self, wait_timeout: Duration) -> DriverError {
        DriverError::PoolTimeout {
            endpoint: self.inner.endpoint.clone(),
            timeout: wait_timeout,
        }
    }

    /// Open into claimed capacity, giving the capacity back if `deadline`
    /// passes first
    async fn open_before(
        &self,
        deadline: Instant,
        wait_timeout: Duration,
    ) -> DriverResult<PooledConnection> {
        match timeout_at(deadline, self.open_reserved()).await {
            Ok(opened) => opened.map(|conn| self.checkout(conn)),
            Err(_) => {
                debug!(
                    "Connection to {} still opening after {:?}",
                    self.inner.endpoint, wait_timeout
                );
                Err(self.pool_timeout(wait_timeout))
            }
        }
    }

    /// Open a connection into capacity that was already claimed
    async fn open_reserved(&self) -> DriverResult<Connection> {
        let reservation = Reservation {
            inner: &self.inner,
            armed: true,
        };

        let mut conn = Connection::open(
            &self.inner.endpoint,
            self.inner.connector.as_ref(),
            &self.inner.connection_options,
        )
        .await?;

        let closed = {
            let mut state = self.inner.lock();
            state.opened += 1;
            conn.set_generation(state.generation);
            state.closed
        };
        if closed {
            conn.close();
            return Err(DriverError::PoolClosed {
                endpoint: self.inner.endpoint.clone(),
            });
        }

        reservation.disarm();
        Ok(conn)
    }

    fn checkout(&self, conn: Connection) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
        }
    }

    /// Return a connection; equivalent to dropping it
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Invalidate every existing connection
    ///
    /// Idle connections close now; checked-out ones close when returned.
    pub fn clear(&self) {
        let stale: Vec<Connection> = {
            let mut state = self.inner.lock();
            state.generation += 1;
            let stale: Vec<Connection> = state.idle.drain(..).collect();
            state.retire(stale.len());
            state.grant_slots(self.inner.options.max_size);
            stale
        };

        info!(
            "Cleared pool for {} ({} idle connections closed)",
            self.inner.endpoint,
            stale.len()
        );
        for mut conn in stale {
            conn.close();
        }
    }

    /// Close the pool: idle connections close, waiters and later acquires fail
    pub fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<Connection> = state.idle.drain(..).collect();
            state.retire(idle.len());
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            (idle, waiters)
        };

        // Dropped senders wake waiters with an error
        drop(waiters);
        for mut conn in idle {
            conn.close();
        }

        if let Some(handle) = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        debug!("Closed pool for {}", self.inner.endpoint);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            opened: state.opened,
            closed: state.closed_count,
            discarded: state.discarded,
            idle: state.idle.len(),
            outstanding: state.total - state.idle.len(),
            waiters: state.waiters.len(),
            generation: state.generation,
        }
    }

    /// Spawn the periodic maintenance task
    ///
    /// The task holds only a weak reference and stops once the pool is
    /// closed or dropped.
    pub fn start_maintenance(&self) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.options.maintenance_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pool = ConnectionPool { inner };
                if pool.is_closed() {
                    break;
                }
                pool.run_maintenance().await;
            }
        });

        let previous = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Evict expired idle connections, then open up to `min_size`
    pub async fn run_maintenance(&self) {
        let options = &self.inner.options;

        let evicted: Vec<Connection> = {
            let mut state = self.inner.lock();
            let mut evicted = Vec::new();
            if !options.max_idle.is_zero() {
                // Oldest idle connections sit at the front
                while state.total > options.min_size {
                    let expired = state
                        .idle
                        .front()
                        .map(|conn| conn.idle_time() > options.max_idle)
                        .unwrap_or(false);
                    if !expired {
                        break;
                    }
                    if let Some(conn) = state.idle.pop_front() {
                        evicted.push(conn);
                    }
                }
                state.retire(evicted.len());
                state.grant_slots(options.max_size);
            }
            evicted
        };

        if !evicted.is_empty() {
            debug!(
                "Evicted {} idle connections to {}",
                evicted.len(),
                self.inner.endpoint
            );
        }
        for mut conn in evicted {
            conn.close();
        }

        loop {
            {
                let mut state = self.inner.lock();
                if state.closed || state.total >= options.min_size.min(options.max_size) {
                    break;
                }
                state.total += 1;
            }

            match self.open_reserved().await {
                Ok(conn) => self.inner.check_in(conn),
                Err(e) => {
                    warn!(
                        "Failed to open connection to {} during maintenance: {}",
                        self.inner.endpoint, e
                    );
                    break;
                }
            }
        }
    }
}

/// A checked-out connection; returns itself to the pool when dropped
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    pub fn endpoint(&self) -> &Endpoint {
        &self.pool.endpoint
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .expect("connection is present until the guard drops")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
            .as_mut()
            .expect("connection is present until the guard drops")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn);
        }
    }
}
