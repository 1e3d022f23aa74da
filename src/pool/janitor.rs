//! The pool's maintenance task.
//!
//! The janitor owns the receiving end of the pool's event channel. Connection
//! failures arrive here and are applied to the index, and on every tick idle
//! entries are evicted. It stops once the pool is closed or dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::index::Index;
use super::key::Generation;
use super::{ConnectionEvent, TenantConnection, TenantKey};
use crate::notify::Notice;

/// A connection reported that it is no longer usable.
#[derive(Debug, Clone)]
pub(super) struct PoolEvent {
    pub(super) tenant: TenantKey,
    pub(super) generation: Generation,
    pub(super) event: ConnectionEvent,
}

pub(super) struct Janitor<C> {
    pub(super) index: Weak<Mutex<Index<C>>>,
    pub(super) events: mpsc::UnboundedReceiver<PoolEvent>,
    pub(super) shutdown: Notice,
    pub(super) sweep_interval: Duration,
    pub(super) idle_timeout: Duration,
}

impl<C> Janitor<C>
where
    C: TenantConnection,
{
    pub(super) async fn run(self) {
        let Janitor {
            index,
            mut events,
            mut shutdown,
            sweep_interval,
            idle_timeout,
        } = self;

        let mut ticks = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stopped = shutdown.recv();
        tokio::pin!(stopped);

        debug!(?sweep_interval, ?idle_timeout, "pool maintenance started");
        loop {
            tokio::select! {
                _ = &mut stopped => {
                    break;
                }
                Some(event) = events.recv() => {
                    handle_event(&index, event).await;
                }
                _ = ticks.tick() => {
                    let Some(index) = index.upgrade() else {
                        break;
                    };
                    let evicted = evict(&index, idle_timeout).await;
                    trace!(evicted, "idle sweep finished");
                }
            }
        }
        debug!("pool maintenance stopped");
    }
}

async fn handle_event<C>(index: &Weak<Mutex<Index<C>>>, event: PoolEvent)
where
    C: TenantConnection,
{
    let Some(index) = index.upgrade() else {
        return;
    };

    let PoolEvent {
        tenant,
        generation,
        event,
    } = event;

    let removed = index.lock().remove_failed(&tenant, generation);
    drop(index);

    match removed {
        Some(entry) => {
            warn!(%tenant, ?generation, ref_count = entry.ref_count, %event, "removing failed connection");
            if entry.ref_count == 0 {
                close_connection(&tenant, &*entry.connection).await;
            }
        }
        None => trace!(%tenant, ?generation, %event, "ignoring event for retired connection"),
    }
}

/// Evict idle entries from the index and close their connections.
pub(super) async fn evict<C>(index: &Mutex<Index<C>>, threshold: Duration) -> usize
where
    C: TenantConnection,
{
    let idle = index.lock().take_idle(Instant::now(), threshold);
    if idle.is_empty() {
        return 0;
    }

    debug!(count = idle.len(), ?threshold, "evicting idle connections");
    join_all(
        idle.iter()
            .map(|(tenant, connection)| close_connection(tenant, &**connection)),
    )
    .await;
    idle.len()
}

pub(super) async fn close_connection<C>(tenant: &TenantKey, connection: &C)
where
    C: TenantConnection,
{
    match connection.close().await {
        Ok(()) => debug!(%tenant, "connection closed"),
        Err(error) => warn!(%tenant, %error, "error closing connection"),
    }
}

/// Close a connection on its own task.
///
/// The close is not tied to the caller's task, so aborting the caller (as
/// `Index::close` does with creations in flight) cannot cut it short.
pub(super) fn close_detached<C>(tenant: TenantKey, connection: Arc<C>)
where
    C: TenantConnection,
{
    tokio::spawn(async move { close_connection(&tenant, &*connection).await });
}
