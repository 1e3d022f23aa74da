//! Shutdown notice from a pool's index to its maintenance task.
//!
//! The index owns the [`Shutdown`] side. The notice is delivered either when the pool
//! is closed or when the index itself is dropped, whichever comes first.

use tokio::sync::watch;

/// Announces that the pool has shut down.
#[derive(Debug)]
pub(crate) struct Shutdown(watch::Sender<bool>);

impl Shutdown {
    /// Deliver the notice. Returns `false` if it was already delivered.
    pub(crate) fn announce(&self) -> bool {
        let announced = self.0.send_if_modified(|closed| !std::mem::replace(closed, true));
        if announced {
            tracing::trace!(listeners = self.0.receiver_count(), "announcing pool shutdown");
        }
        announced
    }

    pub(crate) fn is_announced(&self) -> bool {
        *self.0.borrow()
    }
}

/// Receives the notice sent by [`Shutdown`].
#[derive(Debug, Clone)]
pub(crate) struct Notice(watch::Receiver<bool>);

impl Notice {
    /// Wait until the pool shuts down or its index goes away.
    pub(crate) async fn recv(&mut self) {
        // An error means the index was dropped, which is a shutdown too.
        let _ = self.0.wait_for(|closed| *closed).await;
    }
}

pub(crate) fn shutdown() -> (Shutdown, Notice) {
    let (tx, rx) = watch::channel(false);
    (Shutdown(tx), Notice(rx))
}
