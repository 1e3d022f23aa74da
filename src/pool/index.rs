//! The pool's index of tenant connections.
//!
//! Every mutation of pool state goes through [`Index`], which always sits behind the
//! pool's mutex. Methods here never block and never await; anything slow (creating or
//! closing connections) happens outside of the lock, with the index handing back the
//! pieces that need work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::error::Error;
use super::key::{Generation, Generations};
use super::lease::Lease;
use super::{ConnectionState, TenantConnection, TenantKey, TenantStats};
use crate::notify::Shutdown;

pub(super) type Waiter<C> = oneshot::Sender<Result<Lease<C>, Error>>;
pub(super) type WaiterReceiver<C> = oneshot::Receiver<Result<Lease<C>, Error>>;

/// A connection which is still being created.
pub(super) struct Pending<C> {
    generation: Generation,
    started: Instant,
    waiters: Vec<Waiter<C>>,
    task: AbortHandle,
}

/// A live connection in the index.
pub(super) struct Entry<C> {
    pub(super) connection: Arc<C>,
    pub(super) generation: Generation,
    pub(super) created: Instant,
    pub(super) last_used: Instant,
    pub(super) ref_count: usize,
}

pub(super) enum Slot<C> {
    Connecting(Pending<C>),
    Ready(Entry<C>),
}

/// Outcome of looking a tenant up for acquisition.
pub(super) enum Lookup<C> {
    /// A live connection was found and leased.
    Leased(Lease<C>),

    /// A connection is being created; wait on the receiver for it.
    Waiting(WaiterReceiver<C>),

    /// No usable connection. `retired` holds a dead connection which was just removed
    /// and which nothing references any more, so the caller should close it.
    Vacant { retired: Option<Arc<C>> },

    /// The pool has been shut down.
    Closed,
}

pub(super) struct Index<C> {
    slots: HashMap<TenantKey, Slot<C>>,
    generations: Generations,
    shutdown: Shutdown,
}

impl<C> std::fmt::Debug for Index<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("tenants", &self.slots.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C> Index<C> {
    pub(super) fn new(shutdown: Shutdown) -> Self {
        Self {
            slots: HashMap::new(),
            generations: Generations::default(),
            shutdown,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(super) fn is_closed(&self) -> bool {
        self.shutdown.is_announced()
    }

    /// Reserve a slot for a new connection and start creating it.
    ///
    /// `connect` is called with the generation of the new slot and must start the
    /// creation without waiting for it. The returned receiver resolves once the
    /// creation finishes.
    pub(super) fn begin<F>(&mut self, tenant: TenantKey, now: Instant, connect: F) -> WaiterReceiver<C>
    where
        F: FnOnce(Generation) -> AbortHandle,
    {
        let generation = self.generations.next();
        let (tx, rx) = oneshot::channel();

        trace!(%tenant, ?generation, "starting connection");
        let task = connect(generation);
        self.slots.insert(
            tenant,
            Slot::Connecting(Pending {
                generation,
                started: now,
                waiters: vec![tx],
                task,
            }),
        );

        rx
    }

    /// Install a freshly created connection, handing out leases to every caller
    /// still waiting on it.
    ///
    /// Returns `false` if the slot is gone (the pool closed, or the attempt was
    /// superseded); the caller owns the connection and should close it.
    pub(super) fn install(
        &mut self,
        tenant: &TenantKey,
        generation: Generation,
        connection: Arc<C>,
        now: Instant,
        this: &Arc<Mutex<Self>>,
    ) -> bool {
        let Some(pending) = self.take_pending(tenant, generation) else {
            return false;
        };

        let mut entry = Entry {
            connection,
            generation,
            created: now,
            last_used: now,
            ref_count: 0,
        };

        for waiter in pending.waiters {
            if waiter.is_closed() {
                continue;
            }

            entry.ref_count += 1;
            let lease = Lease::new(
                tenant.clone(),
                entry.connection.clone(),
                generation,
                this.clone(),
            );

            if let Err(returned) = waiter.send(Ok(lease)) {
                // The lock is held here, so the lease must not release itself.
                entry.ref_count -= 1;
                if let Ok(lease) = returned {
                    lease.detach();
                }
            }
        }

        debug!(
            %tenant,
            ?generation,
            ref_count = entry.ref_count,
            elapsed = ?now.saturating_duration_since(pending.started),
            "connection ready"
        );
        self.slots.insert(tenant.clone(), Slot::Ready(entry));
        true
    }

    /// Remove a failed creation and report the error to everyone waiting on it.
    pub(super) fn fail(&mut self, tenant: &TenantKey, generation: Generation, error: Error) {
        let Some(pending) = self.take_pending(tenant, generation) else {
            return;
        };

        debug!(%tenant, ?generation, waiters = pending.waiters.len(), "connection failed");
        for waiter in pending.waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn take_pending(&mut self, tenant: &TenantKey, generation: Generation) -> Option<Pending<C>> {
        match self.slots.get(tenant) {
            Some(Slot::Connecting(pending)) if pending.generation == generation => {}
            _ => {
                trace!(%tenant, ?generation, "connection attempt was superseded");
                return None;
            }
        }

        match self.slots.remove(tenant) {
            Some(Slot::Connecting(pending)) => Some(pending),
            _ => None,
        }
    }

    /// Release one lease on the entry, if it is still the same installation.
    ///
    /// Returns the remaining reference count, or `None` if the entry is gone.
    pub(super) fn release(&mut self, tenant: &TenantKey, generation: Generation) -> Option<usize> {
        match self.slots.get_mut(tenant) {
            Some(Slot::Ready(entry)) if entry.generation == generation => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                Some(entry.ref_count)
            }
            _ => None,
        }
    }

    /// Remove an entry whose connection reported a failure.
    ///
    /// Removal ignores the reference count; leases already handed out keep their
    /// connection.
    pub(super) fn remove_failed(&mut self, tenant: &TenantKey, generation: Generation) -> Option<Entry<C>> {
        match self.slots.get(tenant) {
            Some(Slot::Ready(entry)) if entry.generation == generation => {}
            _ => return None,
        }

        match self.slots.remove(tenant) {
            Some(Slot::Ready(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Shut the index down, returning every connection that needs closing.
    ///
    /// Pending creations are aborted and their waiters told the pool is closed.
    /// Calling this more than once returns nothing the second time.
    pub(super) fn close(&mut self) -> Vec<(TenantKey, Arc<C>)> {
        if !self.shutdown.announce() {
            return Vec::new();
        }

        let mut connections = Vec::with_capacity(self.slots.len());
        for (tenant, slot) in self.slots.drain() {
            match slot {
                Slot::Connecting(pending) => {
                    trace!(%tenant, "aborting connection attempt");
                    pending.task.abort();
                    for waiter in pending.waiters {
                        let _ = waiter.send(Err(Error::Closed));
                    }
                }
                Slot::Ready(entry) => {
                    if entry.ref_count > 0 {
                        debug!(%tenant, ref_count = entry.ref_count, "closing connection still in use");
                    }
                    connections.push((tenant, entry.connection));
                }
            }
        }

        connections
    }
}

impl<C> Index<C>
where
    C: TenantConnection,
{
    /// Look a tenant up, leasing its connection if it is live.
    pub(super) fn lookup(&mut self, tenant: &TenantKey, now: Instant, this: &Arc<Mutex<Self>>) -> Lookup<C> {
        if self.is_closed() {
            return Lookup::Closed;
        }

        let dead = matches!(
            self.slots.get(tenant),
            Some(Slot::Ready(entry)) if !entry.connection.is_alive()
        );

        if dead {
            let retired = match self.slots.remove(tenant) {
                Some(Slot::Ready(entry)) => {
                    warn!(
                        %tenant,
                        generation = ?entry.generation,
                        ref_count = entry.ref_count,
                        "connection failed health check, replacing"
                    );
                    (entry.ref_count == 0).then_some(entry.connection)
                }
                _ => None,
            };
            return Lookup::Vacant { retired };
        }

        match self.slots.get_mut(tenant) {
            Some(Slot::Ready(entry)) => {
                entry.ref_count += 1;
                entry.last_used = now;
                trace!(%tenant, ref_count = entry.ref_count, "leasing connection");
                Lookup::Leased(Lease::new(
                    tenant.clone(),
                    entry.connection.clone(),
                    entry.generation,
                    this.clone(),
                ))
            }
            Some(Slot::Connecting(pending)) => {
                let (tx, rx) = oneshot::channel();
                pending.waiters.push(tx);
                trace!(%tenant, waiters = pending.waiters.len(), "joining connection attempt");
                Lookup::Waiting(rx)
            }
            None => Lookup::Vacant { retired: None },
        }
    }

    /// Remove every unreferenced entry idle for longer than `threshold`, along with
    /// unreferenced entries which fail their health check.
    pub(super) fn take_idle(&mut self, now: Instant, threshold: Duration) -> Vec<(TenantKey, Arc<C>)> {
        let expired: Vec<TenantKey> = self
            .slots
            .iter()
            .filter_map(|(tenant, slot)| match slot {
                Slot::Ready(entry)
                    if entry.ref_count == 0
                        && (now.saturating_duration_since(entry.last_used) > threshold
                            || !entry.connection.is_alive()) =>
                {
                    Some(tenant.clone())
                }
                _ => None,
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|tenant| match self.slots.remove(&tenant) {
                Some(Slot::Ready(entry)) => {
                    debug!(
                        %tenant,
                        generation = ?entry.generation,
                        idle = ?now.saturating_duration_since(entry.last_used),
                        age = ?now.saturating_duration_since(entry.created),
                        "evicting connection"
                    );
                    Some((tenant, entry.connection))
                }
                _ => None,
            })
            .collect()
    }

    pub(super) fn state_of(&self, tenant: &TenantKey, generation: Generation) -> ConnectionState {
        match self.slots.get(tenant) {
            Some(Slot::Ready(entry)) if entry.generation == generation => {
                if entry.connection.is_alive() {
                    ConnectionState::Ready
                } else {
                    ConnectionState::Degraded
                }
            }
            _ => ConnectionState::Closed,
        }
    }

    pub(super) fn stats(&self, now: Instant) -> Vec<TenantStats> {
        let mut stats: Vec<TenantStats> = self
            .slots
            .iter()
            .map(|(tenant, slot)| match slot {
                Slot::Connecting(pending) => TenantStats {
                    tenant: tenant.clone(),
                    state: ConnectionState::Connecting,
                    last_used: pending.started,
                    idle: now.saturating_duration_since(pending.started),
                    ref_count: pending.waiters.iter().filter(|w| !w.is_closed()).count(),
                    host: None,
                    port: None,
                },
                Slot::Ready(entry) => {
                    let address = entry.connection.address();
                    TenantStats {
                        tenant: tenant.clone(),
                        state: if entry.connection.is_alive() {
                            ConnectionState::Ready
                        } else {
                            ConnectionState::Degraded
                        },
                        last_used: entry.last_used,
                        idle: now.saturating_duration_since(entry.last_used),
                        ref_count: entry.ref_count,
                        host: address.as_ref().map(|a| a.host.clone()),
                        port: address.map(|a| a.port),
                    }
                }
            })
            .collect();

        stats.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        stats
    }
}
