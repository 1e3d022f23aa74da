use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::ConnectionState;
use super::TenantKey;
use super::index::Index;
use super::key::Generation;
use crate::DebugLiteral;

/// A tenant connection handed out by the pool.
///
/// The lease keeps the tenant's entry referenced, which protects it from idle eviction.
/// Dropping the lease (or calling [`Lease::release`]) releases it. The underlying
/// connection is available via `Deref`.
///
/// If the connection fails while the lease is held, the pool removes it from its index
/// but the lease stays usable until it is released; [`Lease::state`] reports
/// [`ConnectionState::Closed`] from then on.
///
/// A lease keeps the pool's index alive, so it can outlive every [`TenantPool`] handle
/// and still release its entry.
///
/// [`TenantPool`]: super::TenantPool
pub struct Lease<C> {
    pub(super) connection: Arc<C>,
    pub(super) tenant: TenantKey,
    pub(super) generation: Generation,
    pub(super) index: Option<Arc<Mutex<Index<C>>>>,
}

impl<C> Lease<C> {
    pub(super) fn new(
        tenant: TenantKey,
        connection: Arc<C>,
        generation: Generation,
        index: Arc<Mutex<Index<C>>>,
    ) -> Self {
        Self {
            connection,
            tenant,
            generation,
            index: Some(index),
        }
    }

    /// The tenant this connection belongs to.
    pub fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    /// The shared connection handle.
    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    /// Release the lease, lowering the entry's reference count.
    pub fn release(self) {
        drop(self)
    }

    /// Drop the lease without touching the index.
    ///
    /// Used when the index is already locked and the count has been corrected by hand.
    pub(super) fn detach(mut self) {
        self.index = None;
    }
}

impl<C> Lease<C>
where
    C: super::TenantConnection,
{
    /// The current state of the entry this lease was taken from.
    pub fn state(&self) -> ConnectionState {
        match &self.index {
            Some(index) => index.lock().state_of(&self.tenant, self.generation),
            None => ConnectionState::Closed,
        }
    }
}

impl<C> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<C> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("tenant", &self.tenant)
            .field("generation", &self.generation)
            .field("connection", &DebugLiteral("..."))
            .finish()
    }
}

impl<C> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(index) = self.index.take() {
            let remaining = index.lock().release(&self.tenant, self.generation);
            trace!(tenant = %self.tenant, ?remaining, "lease released");
        }
    }
}
