//! # Tenement: per-tenant connection pooling behind a signed-session gate
//!
//! Tenement multiplexes access to a multi-tenant document store. Every tenant (usually
//! derived from a request's subdomain) gets its own lazily-created connection, which is
//! shared by all concurrent requests for that tenant, reference counted while in use,
//! evicted once idle, and replaced when it stops answering health checks.
//!
//! ## Architecture Overview
//!
//! The crate is built around two seams, both expressed as traits so that the store
//! driver and the token format stay outside of this crate:
//!
//! - **ConnectionFactory**: a [`tower::Service`] which accepts a [`pool::Target`]
//!   and returns a [`pool::TenantConnection`]. The pool calls it at most once per
//!   tenant at a time.
//! - **SessionVerifier**: validates an opaque session token against a secret and salt,
//!   returning the decoded claims. See [`auth`].
//!
//! ### The pool
//!
//! [`TenantPool`] owns an index of tenant keys to connection entries behind a single
//! mutex. [`TenantPool::acquire`] returns a [`Lease`], which keeps the entry's reference
//! count raised until it is dropped. Concurrent acquisitions for a tenant whose
//! connection is still being created wait for that creation instead of starting their
//! own.
//!
//! Connections report asynchronous failures through [`pool::TenantConnection::closed`].
//! Those reports travel over a channel to the pool's maintenance task, which removes
//! the failed entry so that the next acquisition creates a fresh connection. The same
//! task periodically evicts entries that have been idle for too long.
//!
//! ### The gate
//!
//! [`auth::service::SessionGateLayer`] wraps an inner service. Each request must carry a
//! session token which the verifier accepts before a connection is leased for the
//! request's tenant. The inner service receives an [`auth::Session`] holding both the
//! claims and the lease.
//!
//! ## Shutdown
//!
//! Call [`TenantPool::close_all`] (or [`TenantPool::close_on`] with a shutdown signal)
//! before the process exits, so that every open connection is closed.
//!
//! ## Feature Flags
//!
//! - `mock`: exposes [`pool::mock`], an in-memory factory and connection for tests.

use std::{fmt, pin::Pin};

pub mod auth;
pub mod config;
mod notify;
pub mod pool;

pub use self::config::{AuthConfig, Config, ConfigError, PoolConfig};
pub use self::pool::{Lease, TenantKey, TenantPool};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Utility struct for formatting a `Display` type in a `Debug` context.
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
