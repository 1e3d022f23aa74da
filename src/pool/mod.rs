//! Per-tenant connection pool.
//!
//! The pool holds at most one connection per tenant. Connections are created lazily on
//! the first [`TenantPool::acquire`] for a tenant, shared by every concurrent caller for
//! that tenant, and reference counted through [`Lease`]s. A background task removes
//! connections which report failures and evicts connections idle for longer than the
//! configured timeout.
//!
//! Connections come from a [`ConnectionFactory`], which is any [`tower::Service`] that
//! accepts a [`Target`] and returns a [`TenantConnection`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{Instrument as _, debug, info, warn};

use self::checkout::{Checkout, Connect};
use self::index::{Index, Lookup};
use self::janitor::{Janitor, PoolEvent, close_connection, close_detached};
use self::key::Generation;
use crate::config::{ConfigError, PoolConfig};

mod checkout;
mod error;
mod factory;
mod index;
mod janitor;
mod key;
mod lease;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod stats;

pub use self::error::{Error, SharedError};
pub use self::factory::{
    ConnectionEvent, ConnectionFactory, ConnectionOptions, ServerAddress, Target, TenantConnection,
};
pub use self::key::TenantKey;
pub use self::lease::Lease;
pub use self::stats::{ConnectionState, TenantStats};

/// A pool of connections, one per tenant.
///
/// The pool is cheap to clone; clones share the same connections. Outstanding leases
/// keep the pool's index alive, and the background maintenance task stops once the
/// last clone and the last lease are gone. Dropping the pool never closes connections;
/// call [`TenantPool::close_all`] to shut down cleanly.
pub struct TenantPool<F>
where
    F: ConnectionFactory,
{
    index: Arc<Mutex<Index<F::Connection>>>,
    factory: F,
    config: Arc<PoolConfig>,
    uri: Arc<str>,
    options: Arc<ConnectionOptions>,
    default_tenant: TenantKey,
    events: mpsc::UnboundedSender<PoolEvent>,
    maintenance: Arc<Mutex<Option<Janitor<F::Connection>>>>,
}

impl<F> fmt::Debug for TenantPool<F>
where
    F: ConnectionFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantPool")
            .field("index", &*self.index.lock())
            .field("default_tenant", &self.default_tenant)
            .finish()
    }
}

impl<F> Clone for TenantPool<F>
where
    F: ConnectionFactory,
{
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            factory: self.factory.clone(),
            config: self.config.clone(),
            uri: self.uri.clone(),
            options: self.options.clone(),
            default_tenant: self.default_tenant.clone(),
            events: self.events.clone(),
            maintenance: self.maintenance.clone(),
        }
    }
}

impl<F> TenantPool<F>
where
    F: ConnectionFactory,
{
    /// Create a new pool.
    ///
    /// When called inside a tokio runtime, this also starts the pool's maintenance task.
    /// Otherwise the task starts along with the pool's first connection.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let (shutdown, notice) = crate::notify::shutdown();
        let index = Arc::new(Mutex::new(Index::new(shutdown)));
        let (events, receiver) = mpsc::unbounded_channel();

        let janitor = Janitor {
            index: Arc::downgrade(&index),
            events: receiver,
            shutdown: notice,
            sweep_interval: config.sweep_interval,
            idle_timeout: config.idle_timeout,
        };

        let maintenance = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(janitor.run());
                None
            }
            Err(_) => {
                debug!("no tokio runtime yet, deferring pool maintenance");
                Some(janitor)
            }
        };

        Ok(Self {
            index,
            factory,
            uri: Arc::from(config.uri.as_str()),
            options: Arc::new(config.options.clone()),
            default_tenant: TenantKey::from(config.default_tenant.as_str()),
            config: Arc::new(config),
            events,
            maintenance: Arc::new(Mutex::new(maintenance)),
        })
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The tenant a request for `tenant` is served from.
    ///
    /// Absent or blank tenants map to the configured default tenant.
    pub fn resolve(&self, tenant: Option<&str>) -> TenantKey {
        match tenant.map(str::trim) {
            Some(name) if !name.is_empty() => TenantKey::from(name),
            _ => self.default_tenant.clone(),
        }
    }

    /// Lease the connection for a tenant, creating it if necessary.
    ///
    /// Concurrent calls for a tenant whose connection is being created wait for that
    /// connection; only one creation is ever in flight per tenant. Creation errors are
    /// returned to every waiting caller and are not retried.
    #[cfg_attr(
        not(tarpaulin),
        tracing::instrument(skip_all, fields(tenant = tracing::field::Empty))
    )]
    pub async fn acquire(&self, tenant: Option<&str>) -> Result<Lease<F::Connection>, Error> {
        let tenant = self.resolve(tenant);
        tracing::Span::current().record("tenant", tracing::field::display(&tenant));

        let waiter = {
            let mut index = self.index.lock();
            let now = Instant::now();
            match index.lookup(&tenant, now, &self.index) {
                Lookup::Closed => return Err(Error::Closed),
                Lookup::Leased(lease) => return Ok(lease),
                Lookup::Waiting(waiter) => {
                    debug!("waiting for connection in progress");
                    waiter
                }
                Lookup::Vacant { retired } => {
                    if let Some(connection) = retired {
                        close_detached(tenant.clone(), connection);
                    }

                    debug!("creating connection");
                    index.begin(tenant.clone(), now, |generation| {
                        self.connect(tenant.clone(), generation)
                    })
                }
            }
        };

        Checkout::new(tenant, waiter).await
    }

    fn connect(&self, tenant: TenantKey, generation: Generation) -> AbortHandle {
        // Connections report failures to the maintenance task, so it must be running.
        if let Some(janitor) = self.maintenance.lock().take() {
            debug!("starting pool maintenance");
            tokio::spawn(janitor.run());
        }

        let span = tracing::debug_span!("connect", %tenant, ?generation);
        let attempt = Connect {
            factory: self.factory.clone(),
            target: Target::new(tenant, self.uri.clone(), self.options.clone()),
            timeout: self.config.connect_timeout,
            generation,
            index: Arc::downgrade(&self.index),
            events: self.events.clone(),
        };

        tokio::spawn(attempt.run().instrument(span)).abort_handle()
    }

    /// Evict connections which nobody holds and which have been idle for longer than
    /// `threshold`, returning how many were evicted.
    ///
    /// Unreferenced connections which fail their health check are evicted too.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip(self)))]
    pub async fn evict_idle(&self, threshold: Duration) -> usize {
        janitor::evict(&self.index, threshold).await
    }

    /// Close every connection and shut the pool down.
    ///
    /// Connections being created are abandoned and their callers receive
    /// [`Error::Closed`], as does every later call to [`TenantPool::acquire`]. Leases
    /// still held keep their (now closed) connection. Waits up to the configured
    /// shutdown timeout for connections to close.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip(self)))]
    pub async fn close_all(&self) {
        let connections = self.index.lock().close();
        if connections.is_empty() {
            return;
        }

        info!(count = connections.len(), "closing tenant connections");
        let closing = join_all(
            connections
                .iter()
                .map(|(tenant, connection)| close_connection(tenant, &**connection)),
        );

        if tokio::time::timeout(self.config.shutdown_timeout, closing)
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.config.shutdown_timeout,
                "gave up waiting for connections to close"
            );
        }
    }

    /// Wait for `signal`, then close the pool.
    pub async fn close_on<S>(&self, signal: S)
    where
        S: Future<Output = ()>,
    {
        signal.await;
        debug!("shutdown signal received");
        self.close_all().await;
    }

    /// A snapshot of every tenant in the pool, sorted by tenant.
    pub fn stats(&self) -> Vec<TenantStats> {
        self.index.lock().stats(Instant::now())
    }

    /// Number of tenants with a connection or a connection attempt.
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    /// Returns `true` if the pool holds no tenants.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once [`TenantPool::close_all`] has been called.
    pub fn is_closed(&self) -> bool {
        self.index.lock().is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use static_assertions::assert_impl_all;

    use super::mock::{MockConnection, MockFactory, MockMode};
    use super::*;

    assert_impl_all!(TenantPool<MockFactory>: Send, Sync, Clone);
    assert_impl_all!(Lease<MockConnection>: Send, Sync);

    fn config() -> PoolConfig {
        PoolConfig::new("mongodb://mock.local:27017")
            .with_sweep_interval(Duration::from_secs(24 * 60 * 60))
            .with_idle_timeout(Duration::from_secs(300))
    }

    fn pool(factory: MockFactory) -> TenantPool<MockFactory> {
        crate::fixtures::subscribe();
        TenantPool::new(factory, config()).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    fn stats_for(pool: &TenantPool<MockFactory>, tenant: &str) -> Option<TenantStats> {
        pool.stats()
            .into_iter()
            .find(|stats| stats.tenant.as_str() == tenant)
    }

    #[test]
    fn rejects_missing_uri() {
        let error = TenantPool::new(MockFactory::new(), PoolConfig::default()).unwrap_err();
        assert!(matches!(error, ConfigError::MissingUri));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_one_creation() {
        let factory = MockFactory::delayed(Duration::from_millis(50));
        let pool = pool(factory.clone());

        let leases = join_all((0..10).map(|_| pool.acquire(Some("acme")))).await;
        let leases = leases.into_iter().collect::<Result<Vec<_>, _>>().unwrap();

        assert_eq!(factory.calls(), 1);
        assert!(leases.iter().all(|lease| lease.id() == leases[0].id()));

        let stats = stats_for(&pool, "acme").unwrap();
        assert_eq!(stats.state, ConnectionState::Ready);
        assert_eq!(stats.ref_count, 10);

        drop(leases);
        assert_eq!(stats_for(&pool, "acme").unwrap().ref_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_live_connection() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        let first = pool.acquire(Some("acme")).await.unwrap();
        let id = first.id();
        first.release();

        let second = pool.acquire(Some("acme")).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.tenant().as_str(), "acme");
        assert_eq!(second.state(), ConnectionState::Ready);
        assert_eq!(factory.calls(), 1);

        let other = pool.acquire(Some("globex")).await.unwrap();
        assert_ne!(other.id(), id);
        assert_eq!(factory.calls(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_tenant_uses_default() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        let lease = pool.acquire(None).await.unwrap();
        assert_eq!(lease.tenant().as_str(), "control-plane");

        let blank = pool.acquire(Some("  ")).await.unwrap();
        assert_eq!(blank.id(), lease.id());
        assert_eq!(factory.last().unwrap().tenant().as_str(), "control-plane");
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_idle_connections() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        drop(pool.acquire(Some("acme")).await.unwrap());
        let held = pool.acquire(Some("globex")).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(pool.evict_idle(Duration::from_secs(300)).await, 1);

        assert!(stats_for(&pool, "acme").is_none());
        assert!(stats_for(&pool, "globex").is_some());
        assert_eq!(factory.connections()[0].close_count(), 1);
        assert_eq!(held.close_count(), 0);

        drop(held);
        assert_eq!(pool.evict_idle(Duration::from_secs(300)).await, 1);
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recent_connections_are_not_evicted() {
        let pool = pool(MockFactory::new());

        drop(pool.acquire(Some("acme")).await.unwrap());
        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(pool.evict_idle(Duration::from_secs(300)).await, 0);

        // Acquiring refreshes last use.
        drop(pool.acquire(Some("acme")).await.unwrap());
        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(pool.evict_idle(Duration::from_secs(300)).await, 0);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replaces_connection_failing_health_check() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        let first = pool.acquire(Some("acme")).await.unwrap();
        let stale = factory.last().unwrap();
        drop(first);

        stale.kill();
        assert_eq!(stats_for(&pool, "acme").unwrap().state, ConnectionState::Degraded);

        let second = pool.acquire(Some("acme")).await.unwrap();
        assert_ne!(second.id(), stale.id());
        assert_eq!(factory.calls(), 2);

        wait_until(|| stale.close_count() == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn dead_connection_in_use_is_not_closed() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        let first = pool.acquire(Some("acme")).await.unwrap();
        first.kill();

        let second = pool.acquire(Some("acme")).await.unwrap();
        assert_ne!(second.id(), first.id());
        assert_eq!(first.state(), ConnectionState::Closed);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(first.close_count(), 0);

        drop(first);
        assert_eq!(stats_for(&pool, "acme").unwrap().ref_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_removes_entry() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        drop(pool.acquire(Some("acme")).await.unwrap());
        let connection = factory.last().unwrap();
        connection.disconnect();

        wait_until(|| pool.is_empty()).await;
        wait_until(|| connection.close_count() == 1).await;

        let lease = pool.acquire(Some("acme")).await.unwrap();
        assert_ne!(lease.id(), connection.id());
        assert_eq!(factory.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_outlives_failed_entry() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        let held = pool.acquire(Some("acme")).await.unwrap();
        held.fail("connection reset");

        wait_until(|| pool.is_empty()).await;
        assert_eq!(held.state(), ConnectionState::Closed);
        assert_eq!(held.tenant().as_str(), "acme");
        assert_eq!(held.close_count(), 0);

        let fresh = pool.acquire(Some("acme")).await.unwrap();
        assert_ne!(fresh.id(), held.id());

        // Releasing the old lease must not touch the new entry.
        drop(held);
        assert_eq!(stats_for(&pool, "acme").unwrap().ref_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_errors_are_reported_to_every_waiter() {
        let factory = MockFactory::failing();
        let pool = pool(factory.clone());

        let results = join_all((0..3).map(|_| pool.acquire(Some("acme")))).await;
        assert_eq!(factory.calls(), 1);
        for result in results {
            let error = result.unwrap_err();
            assert!(error.is_creation());
            assert!(!error.is_timeout());
            assert_eq!(error.tenant().unwrap().as_str(), "acme");
        }
        assert!(pool.is_empty());

        factory.switch(MockMode::Immediate);
        let lease = pool.acquire(Some("acme")).await.unwrap();
        assert_eq!(lease.state(), ConnectionState::Ready);
        assert_eq!(factory.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_times_out() {
        let factory = MockFactory::hanging();
        let pool = pool(factory.clone());

        let started = Instant::now();
        let error = pool.acquire(Some("acme")).await.unwrap_err();

        assert!(error.is_timeout());
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(pool.is_empty());
        assert!(factory.connections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_acquire_still_installs() {
        let factory = MockFactory::delayed(Duration::from_millis(50));
        let pool = pool(factory.clone());

        let attempt =
            tokio::time::timeout(Duration::from_millis(10), pool.acquire(Some("acme"))).await;
        assert!(attempt.is_err());

        wait_until(|| {
            stats_for(&pool, "acme").is_some_and(|stats| stats.state == ConnectionState::Ready)
        })
        .await;
        assert_eq!(stats_for(&pool, "acme").unwrap().ref_count, 0);

        let lease = pool.acquire(Some("acme")).await.unwrap();
        assert_eq!(factory.calls(), 1);
        assert_eq!(stats_for(&pool, "acme").unwrap().ref_count, 1);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_closes_everything() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        drop(pool.acquire(Some("idle")).await.unwrap());
        let held = pool.acquire(Some("busy")).await.unwrap();

        factory.switch(MockMode::Hang);
        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Some("pending")).await.map(|lease| lease.id()) })
        };
        wait_until(|| {
            stats_for(&pool, "pending")
                .is_some_and(|stats| stats.state == ConnectionState::Connecting)
        })
        .await;

        pool.close_all().await;

        assert!(pool.is_empty());
        assert!(pool.is_closed());
        assert!(matches!(waiting.await.unwrap(), Err(Error::Closed)));
        for connection in factory.connections() {
            assert_eq!(connection.close_count(), 1);
        }
        assert_eq!(held.state(), ConnectionState::Closed);

        assert!(matches!(pool.acquire(Some("idle")).await, Err(Error::Closed)));

        pool.close_all().await;
        assert_eq!(held.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_on_signal() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());
        drop(pool.acquire(Some("acme")).await.unwrap());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let closing = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.close_on(async move {
                    let _ = rx.await;
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!pool.is_closed());

        tx.send(()).unwrap();
        closing.await.unwrap();
        assert!(pool.is_closed());
        assert_eq!(factory.last().unwrap().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ref_count_never_goes_negative() {
        let pool = pool(MockFactory::new());

        let lease = pool.acquire(Some("acme")).await.unwrap();
        let tenant = lease.tenant().clone();
        let generation = lease.generation;

        assert_eq!(pool.index.lock().release(&tenant, generation), Some(0));
        assert_eq!(pool.index.lock().release(&tenant, generation), Some(0));

        drop(lease);
        assert_eq!(stats_for(&pool, "acme").unwrap().ref_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_report_each_state() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        let ready = pool.acquire(Some("b-ready")).await.unwrap();
        drop(pool.acquire(Some("c-degraded")).await.unwrap());
        factory.last().unwrap().kill();

        factory.switch(MockMode::Hang);
        let _waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Some("a-connecting")).await.map(|_| ()) })
        };
        wait_until(|| pool.len() == 3).await;

        let stats = pool.stats();
        let summary: Vec<_> = stats
            .iter()
            .map(|stats| (stats.tenant.as_str(), stats.state, stats.ref_count))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a-connecting", ConnectionState::Connecting, 1),
                ("b-ready", ConnectionState::Ready, 1),
                ("c-degraded", ConnectionState::Degraded, 0),
            ]
        );

        assert_eq!(stats[0].host, None);
        assert_eq!(stats[1].host.as_deref(), Some("mock.local"));
        assert_eq!(stats[1].port, Some(27017));
        drop(ready);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_task_evicts_idle_connections() {
        crate::fixtures::subscribe();
        let factory = MockFactory::new();
        let config = PoolConfig::new("mongodb://mock.local:27017")
            .with_sweep_interval(Duration::from_secs(120))
            .with_idle_timeout(Duration::from_secs(300));
        let pool = TenantPool::new(factory.clone(), config).unwrap();

        drop(pool.acquire(Some("acme")).await.unwrap());

        tokio::time::sleep(Duration::from_secs(250)).await;
        assert_eq!(pool.len(), 1);

        tokio::time::sleep(Duration::from_secs(250)).await;
        assert!(pool.is_empty());
        assert_eq!(factory.last().unwrap().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_holders_then_idle() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        let first = pool.acquire(Some("tenantA")).await.unwrap();
        let stats = stats_for(&pool, "tenantA").unwrap();
        assert_eq!((stats.state, stats.ref_count), (ConnectionState::Ready, 1));

        let second = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Some("tenantA")).await })
                .await
                .unwrap()
                .unwrap()
        };
        assert_eq!(stats_for(&pool, "tenantA").unwrap().ref_count, 2);
        assert_eq!(first.id(), second.id());
        assert_eq!(factory.calls(), 1);

        assert_eq!(pool.evict_idle(Duration::from_secs(300)).await, 0);
        assert_eq!(pool.len(), 1);

        first.release();
        second.release();
        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;

        assert_eq!(pool.evict_idle(Duration::from_secs(300)).await, 1);
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_keeps_index_alive() {
        let factory = MockFactory::new();
        let pool = pool(factory.clone());

        let lease = pool.acquire(Some("acme")).await.unwrap();
        let index = Arc::downgrade(&pool.index);
        drop(pool);

        assert!(index.upgrade().is_some());
        assert_eq!(lease.state(), ConnectionState::Ready);
        let stats = index.upgrade().unwrap().lock().stats(Instant::now());
        assert_eq!(stats[0].ref_count, 1);

        drop(lease);
        assert!(index.upgrade().is_none());
        assert_eq!(factory.last().unwrap().close_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_all_closes_connection_finished_during_shutdown() {
        let factory = MockFactory::new().with_close_delay(Duration::from_millis(10));
        factory.switch(MockMode::Block(Duration::from_millis(200)));
        let pool = pool(factory.clone());

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Some("acme")).await.map(|lease| lease.id()) })
        };

        // The factory is now blocked inside the creation task.
        wait_until(|| factory.calls() == 1).await;
        pool.close_all().await;
        assert!(matches!(waiting.await.unwrap(), Err(Error::Closed)));

        wait_until(|| factory.connections().len() == 1).await;
        let connection = factory.last().unwrap();
        wait_until(|| connection.close_count() == 1).await;
        assert!(pool.is_empty());
        assert!(matches!(pool.acquire(Some("acme")).await, Err(Error::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_acquires_share_one_creation() {
        let factory = MockFactory::delayed(Duration::from_millis(20));
        let pool = pool(factory.clone());
        let start = Arc::new(tokio::sync::Barrier::new(16));

        let tasks = (0..16).map(|_| {
            let pool = pool.clone();
            let start = start.clone();
            tokio::spawn(async move {
                start.wait().await;
                pool.acquire(Some("acme")).await.map(|lease| lease.id())
            })
        });
        let ids: Vec<usize> = join_all(tasks)
            .await
            .into_iter()
            .map(|result| result.unwrap().unwrap())
            .collect();

        assert_eq!(factory.calls(), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(stats_for(&pool, "acme").unwrap().ref_count, 0);
    }

    #[test]
    fn maintenance_starts_with_first_connection() {
        crate::fixtures::subscribe();
        let factory = MockFactory::new();
        let pool = TenantPool::new(factory.clone(), config()).unwrap();
        assert!(pool.maintenance.lock().is_some());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async {
            drop(pool.acquire(Some("acme")).await.unwrap());
            assert!(pool.maintenance.lock().is_none());

            // Only the maintenance task removes entries on a reported failure.
            let connection = factory.last().unwrap();
            connection.disconnect();
            wait_until(|| pool.is_empty()).await;
            wait_until(|| connection.close_count() == 1).await;
        });
    }
}
