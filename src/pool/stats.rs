//! Read-only snapshots of the pool's index.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use super::TenantKey;

/// Lifecycle state of a tenant's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// The connection is being created.
    Connecting,

    /// The connection is serving leases.
    Ready,

    /// The connection failed its health check and will be replaced on the next acquire.
    Degraded,

    /// The connection has left the index. Only leases outliving their entry observe this.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        })
    }
}

/// Snapshot of one tenant's entry in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct TenantStats {
    /// The tenant.
    pub tenant: TenantKey,

    /// State of the tenant's connection.
    pub state: ConnectionState,

    /// When the connection was last handed out, or when its creation started.
    pub last_used: Instant,

    /// Time since `last_used`.
    pub idle: Duration,

    /// Number of leases currently held, or callers waiting on creation.
    pub ref_count: usize,

    /// Host of the connected server, if known.
    pub host: Option<String>,

    /// Port of the connected server, if known.
    pub port: Option<u16>,
}

impl fmt::Display for TenantStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} refs={} idle={:?}",
            self.tenant, self.state, self.ref_count, self.idle
        )?;

        match (&self.host, self.port) {
            (Some(host), Some(port)) => write!(f, " {host}:{port}"),
            (Some(host), None) => write!(f, " {host}"),
            _ => Ok(()),
        }
    }
}
