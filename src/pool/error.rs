use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::TenantKey;

/// An error shared between every caller waiting on the same connection attempt.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Error returned when a tenant connection can't be acquired.
///
/// Creation failures are never retried by the pool; callers may retry with their own
/// backoff.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The factory failed to create the connection.
    #[error("creating connection for tenant {tenant}")]
    Connecting {
        /// Tenant whose connection failed.
        tenant: TenantKey,

        /// The factory's error.
        #[source]
        source: SharedError,
    },

    /// The factory did not create the connection in time.
    #[error("creating connection for tenant {tenant} timed out after {timeout:?}")]
    Timeout {
        /// Tenant whose connection timed out.
        tenant: TenantKey,

        /// The configured creation bound.
        timeout: Duration,
    },

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    Closed,

    /// The connection attempt this caller waited on ended without a result.
    #[error("connection attempt for tenant {tenant} was abandoned")]
    Unavailable {
        /// Tenant whose connection attempt was abandoned.
        tenant: TenantKey,
    },
}

impl Error {
    /// Returns `true` if creating the connection failed or timed out.
    pub fn is_creation(&self) -> bool {
        matches!(self, Error::Connecting { .. } | Error::Timeout { .. })
    }

    /// Returns `true` if the connection attempt timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// The tenant this error concerns, if any.
    pub fn tenant(&self) -> Option<&TenantKey> {
        match self {
            Error::Connecting { tenant, .. }
            | Error::Timeout { tenant, .. }
            | Error::Unavailable { tenant } => Some(tenant),
            Error::Closed => None,
        }
    }
}
