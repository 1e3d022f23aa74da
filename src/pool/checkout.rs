use std::fmt;
use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use parking_lot::Mutex;
use pin_project::pin_project;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::error::Error;
use super::index::{Index, WaiterReceiver};
use super::janitor::{PoolEvent, close_detached};
use super::key::Generation;
use super::lease::Lease;
use super::{ConnectionEvent, ConnectionFactory, TenantConnection, TenantKey, Target};

/// Waits for a connection being created for a tenant.
#[pin_project]
pub(super) struct Checkout<C> {
    tenant: TenantKey,
    #[pin]
    waiter: WaiterReceiver<C>,
}

impl<C> Checkout<C> {
    pub(super) fn new(tenant: TenantKey, waiter: WaiterReceiver<C>) -> Self {
        Self { tenant, waiter }
    }
}

impl<C> fmt::Debug for Checkout<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkout")
            .field("tenant", &self.tenant)
            .finish()
    }
}

impl<C> Future for Checkout<C> {
    type Output = Result<Lease<C>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match ready!(this.waiter.poll(cx)) {
            Ok(outcome) => Poll::Ready(outcome),
            Err(_) => {
                trace!(tenant = %this.tenant, "connection attempt dropped its waiters");
                Poll::Ready(Err(Error::Unavailable {
                    tenant: this.tenant.clone(),
                }))
            }
        }
    }
}

/// One attempt to create a tenant's connection, run as its own task.
///
/// The attempt is independent of the callers waiting on it: it finishes (and installs
/// the connection) even if every caller has gone away.
pub(super) struct Connect<F>
where
    F: ConnectionFactory,
{
    pub(super) factory: F,
    pub(super) target: Target,
    pub(super) timeout: Duration,
    pub(super) generation: Generation,
    pub(super) index: Weak<Mutex<Index<F::Connection>>>,
    pub(super) events: mpsc::UnboundedSender<PoolEvent>,
}

impl<F> Connect<F>
where
    F: ConnectionFactory,
{
    pub(super) async fn run(self) {
        let Connect {
            mut factory,
            target,
            timeout,
            generation,
            index: weak,
            events,
        } = self;

        let tenant = target.tenant().clone();
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, async move {
            poll_fn(|cx| factory.poll_ready(cx)).await?;
            factory.create(target).await
        })
        .await;

        let result = match outcome {
            Ok(Ok(connection)) => Ok(Arc::new(connection)),
            Ok(Err(error)) => Err(Error::Connecting {
                tenant: tenant.clone(),
                source: Arc::new(error),
            }),
            Err(_) => Err(Error::Timeout {
                tenant: tenant.clone(),
                timeout,
            }),
        };

        let Some(index) = weak.upgrade() else {
            trace!(%tenant, "pool dropped while connecting");
            if let Ok(connection) = result {
                close_detached(tenant, connection);
            }
            return;
        };

        match result {
            Ok(connection) => {
                debug!(%tenant, elapsed = ?started.elapsed(), "connected");
                let closed = connection.closed();
                let installed =
                    index
                        .lock()
                        .install(&tenant, generation, connection.clone(), Instant::now(), &index);
                drop(index);

                if installed {
                    tokio::spawn(watch(tenant, generation, closed, events));
                } else {
                    // This task may already be aborted by a pool shutdown.
                    debug!(%tenant, "connection no longer wanted, closing");
                    close_detached(tenant, connection);
                }
            }
            Err(error) => {
                warn!(%tenant, %error, "unable to create connection");
                index.lock().fail(&tenant, generation, error);
            }
        }
    }
}

/// Forward a connection's failure to the pool's maintenance task.
async fn watch<E>(tenant: TenantKey, generation: Generation, closed: E, events: mpsc::UnboundedSender<PoolEvent>)
where
    E: Future<Output = ConnectionEvent>,
{
    let event = closed.await;
    trace!(%tenant, ?generation, %event, "connection reported closed");
    let _ = events.send(PoolEvent {
        tenant,
        generation,
        event,
    });
}
