//! Creating and observing tenant connections.
//!
//! The pool does not know how to talk to the store. It asks a [`ConnectionFactory`] for a
//! new connection whenever a tenant has none, and relies on the [`TenantConnection`]
//! trait to check health, report failures, and close.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::Service;

use super::TenantKey;
use crate::{BoxError, BoxFuture};

/// Settings passed through to the underlying store driver for every tenant connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionOptions {
    /// Maximum number of sockets the driver keeps for one tenant.
    pub max_pool_size: u32,

    /// Minimum number of sockets the driver keeps for one tenant.
    pub min_pool_size: u32,

    /// How long the driver keeps an unused socket open.
    pub max_idle_time: Duration,

    /// How long the driver tries to select a server before failing.
    pub server_selection_timeout: Duration,

    /// How long the driver waits for a response on a socket.
    pub socket_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            min_pool_size: 2,
            max_idle_time: Duration::from_secs(30),
            server_selection_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(45),
        }
    }
}

/// A request to the [`ConnectionFactory`] for one tenant's connection.
#[derive(Debug, Clone)]
pub struct Target {
    tenant: TenantKey,
    uri: Arc<str>,
    options: Arc<ConnectionOptions>,
}

impl Target {
    pub(crate) fn new(tenant: TenantKey, uri: Arc<str>, options: Arc<ConnectionOptions>) -> Self {
        Self {
            tenant,
            uri,
            options,
        }
    }

    /// The tenant, which names the database to connect to.
    pub fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    /// The store's connection string.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Driver options for the new connection.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

/// The server a connection is talking to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    /// Host name or IP address.
    pub host: String,

    /// Port number.
    pub port: u16,
}

impl ServerAddress {
    /// Create a new server address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why a live connection stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionEvent {
    /// The driver reported an error on the connection.
    Error(String),

    /// The connection was lost.
    Disconnected,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Error(message) => write!(f, "connection error: {message}"),
            ConnectionEvent::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// A live connection to one tenant's database.
///
/// Connections are shared between every lease for the tenant, so all methods take
/// `&self`. `is_alive` and `address` are called while the pool's index is locked and
/// must not block.
pub trait TenantConnection: Send + Sync + 'static {
    /// Returns `true` if the connection can still serve requests.
    fn is_alive(&self) -> bool;

    /// The server this connection is talking to, if known.
    fn address(&self) -> Option<ServerAddress>;

    /// Resolves once the connection reports an error or disconnects.
    ///
    /// The pool calls this once, right after the connection is created, and removes the
    /// connection from its index when the future resolves. The future must also resolve
    /// once the connection has been closed.
    fn closed(&self) -> BoxFuture<'static, ConnectionEvent>;

    /// Close the connection.
    fn close(&self) -> BoxFuture<'_, Result<(), BoxError>>;
}

/// Creates new connections for tenants.
///
/// To implement a factory, implement a [`tower::Service`] which accepts a [`Target`]
/// and returns a [`TenantConnection`]. The pool clones the factory for each creation.
pub trait ConnectionFactory: Clone + Send + Sync + 'static {
    /// The connection type produced by this factory.
    type Connection: TenantConnection;

    /// Error returned when a connection can't be created.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The future type returned by this factory.
    type Future: Future<Output = Result<Self::Connection, Self::Error>> + Send + 'static;

    /// Connect to the target's database.
    fn create(&mut self, target: Target) -> Self::Future;

    /// Poll the factory to see if it is ready to create a new connection.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;
}

impl<T, C, E, F> ConnectionFactory for T
where
    T: Service<Target, Response = C, Error = E, Future = F>,
    T: Clone + Send + Sync + 'static,
    C: TenantConnection,
    E: std::error::Error + Send + Sync + 'static,
    F: Future<Output = Result<C, E>> + Send + 'static,
{
    type Connection = C;
    type Error = E;
    type Future = F;

    fn create(&mut self, target: Target) -> Self::Future {
        self.call(target)
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Service::poll_ready(self, cx)
    }
}
