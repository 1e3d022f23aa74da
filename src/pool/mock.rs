//! In-memory connections for testing code which uses a [`TenantPool`](super::TenantPool).
//!
//! [`MockFactory`] creates [`MockConnection`]s and records every connection it hands
//! out, so tests can inspect them, make them fail, and check that they were closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tower::Service;

use super::{ConnectionEvent, ServerAddress, Target, TenantConnection, TenantKey};
use crate::{BoxError, BoxFuture};

static CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug)]
struct State {
    id: usize,
    tenant: TenantKey,
    alive: AtomicBool,
    closes: AtomicUsize,
    close_delay: Duration,
    events: watch::Sender<Option<ConnectionEvent>>,
}

/// A fake tenant connection.
///
/// Clones share state, so a test can hold on to a clone and change the connection's
/// health while the pool uses it.
#[derive(Debug, Clone)]
pub struct MockConnection {
    state: Arc<State>,
}

impl MockConnection {
    /// Create a new live connection for a tenant.
    pub fn new(tenant: TenantKey) -> Self {
        Self::with_close_delay(tenant, Duration::ZERO)
    }

    /// Create a new live connection which takes `delay` to close.
    pub fn with_close_delay(tenant: TenantKey, delay: Duration) -> Self {
        let (events, _) = watch::channel(None);
        Self {
            state: Arc::new(State {
                id: CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
                tenant,
                alive: AtomicBool::new(true),
                closes: AtomicUsize::new(0),
                close_delay: delay,
                events,
            }),
        }
    }

    /// Unique identifier for this connection.
    pub fn id(&self) -> usize {
        self.state.id
    }

    /// The tenant this connection was created for.
    pub fn tenant(&self) -> &TenantKey {
        &self.state.tenant
    }

    /// How many times closing the connection has finished.
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Simulate the server dropping the connection.
    pub fn disconnect(&self) {
        self.report(ConnectionEvent::Disconnected);
    }

    /// Simulate the driver reporting an error.
    pub fn fail(&self, message: impl Into<String>) {
        self.report(ConnectionEvent::Error(message.into()));
    }

    /// Make the connection fail its health check without reporting anything.
    pub fn kill(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
    }

    fn report(&self, event: ConnectionEvent) {
        self.state.alive.store(false, Ordering::SeqCst);
        self.state.events.send_replace(Some(event));
    }
}

impl TenantConnection for MockConnection {
    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    fn address(&self) -> Option<ServerAddress> {
        Some(ServerAddress::new("mock.local", 27017))
    }

    fn closed(&self) -> BoxFuture<'static, ConnectionEvent> {
        let mut events = self.state.events.subscribe();
        Box::pin(async move {
            loop {
                if let Some(event) = events.borrow_and_update().clone() {
                    return event;
                }

                if events.changed().await.is_err() {
                    return ConnectionEvent::Disconnected;
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            if !self.state.close_delay.is_zero() {
                tokio::time::sleep(self.state.close_delay).await;
            }
            self.state.closes.fetch_add(1, Ordering::SeqCst);
            self.report(ConnectionEvent::Disconnected);
            Ok(())
        })
    }
}

/// Error returned by a failing [`MockFactory`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mock connection refused")]
pub struct MockConnectionError;

/// How a [`MockFactory`] responds to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMode {
    /// Connect right away.
    Immediate,

    /// Connect after a delay.
    Delay(Duration),

    /// Block the calling thread before connecting, like a driver doing synchronous
    /// work (such as DNS resolution) when asked for a connection.
    Block(Duration),

    /// Refuse to connect.
    Fail,

    /// Never finish connecting.
    Hang,
}

/// A connection factory which creates [`MockConnection`]s.
#[derive(Debug, Clone)]
pub struct MockFactory {
    mode: Arc<Mutex<MockMode>>,
    calls: Arc<AtomicUsize>,
    connections: Arc<Mutex<Vec<MockConnection>>>,
    close_delay: Duration,
}

impl MockFactory {
    fn with_mode(mode: MockMode) -> Self {
        Self {
            mode: Arc::new(Mutex::new(mode)),
            calls: Arc::new(AtomicUsize::new(0)),
            connections: Arc::new(Mutex::new(Vec::new())),
            close_delay: Duration::ZERO,
        }
    }

    /// A factory which connects right away.
    pub fn new() -> Self {
        Self::with_mode(MockMode::Immediate)
    }

    /// A factory which takes `delay` to connect.
    pub fn delayed(delay: Duration) -> Self {
        Self::with_mode(MockMode::Delay(delay))
    }

    /// A factory which always fails.
    pub fn failing() -> Self {
        Self::with_mode(MockMode::Fail)
    }

    /// A factory which never finishes connecting.
    pub fn hanging() -> Self {
        Self::with_mode(MockMode::Hang)
    }

    /// Make every connection created from now on take `delay` to close.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Change how future requests are handled. Shared by every clone.
    pub fn switch(&self, mode: MockMode) {
        *self.mode.lock() = mode;
    }

    /// Number of connection attempts made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every connection created so far, oldest first.
    pub fn connections(&self) -> Vec<MockConnection> {
        self.connections.lock().clone()
    }

    /// The most recently created connection.
    pub fn last(&self) -> Option<MockConnection> {
        self.connections.lock().last().cloned()
    }
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Target> for MockFactory {
    type Response = MockConnection;
    type Error = MockConnectionError;
    type Future = BoxFuture<'static, Result<MockConnection, MockConnectionError>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, target: Target) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        let connections = self.connections.clone();
        let close_delay = self.close_delay;

        if let MockMode::Block(duration) = mode {
            std::thread::sleep(duration);
        }

        Box::pin(async move {
            match mode {
                MockMode::Immediate | MockMode::Block(_) => {}
                MockMode::Delay(delay) => tokio::time::sleep(delay).await,
                MockMode::Fail => return Err(MockConnectionError),
                MockMode::Hang => std::future::pending::<()>().await,
            }

            let connection = MockConnection::with_close_delay(target.tenant().clone(), close_delay);
            connections.lock().push(connection.clone());
            Ok(connection)
        })
    }
}
