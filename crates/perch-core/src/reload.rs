//! Fan-out of configuration reloads.
//!
//! A configuration owner calls [`ReloadBroadcast::announce`] with the new
//! value and every listener receives it. Unlike [`Observable`](crate::pubsub::Observable)
//! there is no deduplication: re-announcing an identical config still
//! reaches everyone, so listeners can re-derive state (e.g. re-detect a
//! device) on demand.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

struct Listeners<T> {
    next_id: u64,
    slots: Vec<(u64, mpsc::Sender<T>)>,
}

/// Broadcast of reloaded configuration values to registered listeners.
pub struct ReloadBroadcast<T> {
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T> Clone for ReloadBroadcast<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T> std::fmt::Debug for ReloadBroadcast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadBroadcast")
            .field("listeners", &lock(&self.listeners).slots.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for ReloadBroadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(listeners: &Mutex<Listeners<T>>) -> MutexGuard<'_, Listeners<T>> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone + Send + 'static> ReloadBroadcast<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Register `callback` for every announced value, until the returned
    /// [`ReloadListener`] is stopped or dropped.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen<F, Fut>(&self, mut callback: F) -> ReloadListener
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(1);
        let id = {
            let mut listeners = lock(&self.listeners);
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.slots.push((id, tx));
            id
        };

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let listeners = Arc::clone(&self.listeners);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    value = rx.recv() => match value {
                        Some(value) => callback(value).await,
                        None => break,
                    },
                }
            }
            lock(&listeners).slots.retain(|(slot_id, _)| *slot_id != id);
            trace!(listener = id, "reload listener deregistered");
        });

        debug!(listener = id, "reload listener registered");
        ReloadListener {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Deliver `value` to every registered listener, waiting until each has
    /// accepted it.
    pub async fn announce(&self, value: T) {
        let slots: Vec<mpsc::Sender<T>> = lock(&self.listeners)
            .slots
            .iter()
            .map(|(_, tx)| tx.clone())
            .collect();

        debug!(listeners = slots.len(), "announcing reload");
        for tx in slots {
            // A closed slot belongs to a listener that is shutting down
            let _ = tx.send(value.clone()).await;
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).slots.len()
    }
}

/// Registration handle returned by [`ReloadBroadcast::listen`].
///
/// Dropping it stops the listener asynchronously; [`stop`](Self::stop)
/// waits until the listener is deregistered.
#[must_use = "dropping a ReloadListener stops it"]
#[derive(Debug)]
pub struct ReloadListener {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ReloadListener {
    /// Stop listening and wait for deregistration.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ReloadListener {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn forwarding(
        broadcast: &ReloadBroadcast<String>,
    ) -> (ReloadListener, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = broadcast.listen(move |value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(value);
            }
        });
        (listener, rx)
    }

    #[tokio::test]
    async fn test_announce_reaches_every_listener() {
        let broadcast = ReloadBroadcast::new();
        let (_a, mut rx_a) = forwarding(&broadcast);
        let (_b, mut rx_b) = forwarding(&broadcast);
        assert_eq!(broadcast.listener_count(), 2);

        broadcast.announce("step=5".to_string()).await;
        assert_eq!(timeout(WAIT, rx_a.recv()).await.unwrap().unwrap(), "step=5");
        assert_eq!(timeout(WAIT, rx_b.recv()).await.unwrap().unwrap(), "step=5");
    }

    #[tokio::test]
    async fn test_announce_does_not_deduplicate() {
        let broadcast = ReloadBroadcast::new();
        let (_listener, mut rx) = forwarding(&broadcast);

        broadcast.announce("same".to_string()).await;
        broadcast.announce("same".to_string()).await;
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "same");
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "same");
    }

    #[tokio::test]
    async fn test_stop_deregisters() {
        let broadcast = ReloadBroadcast::new();
        let (listener, mut rx) = forwarding(&broadcast);
        let (_other, _) = forwarding(&broadcast);

        listener.stop().await;
        assert_eq!(broadcast.listener_count(), 1);

        broadcast.announce("after".to_string()).await;
        // Callback dropped with the task, nothing delivered
        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let broadcast = ReloadBroadcast::<String>::new();
        let (listener, _rx) = forwarding(&broadcast);
        drop(listener);

        timeout(WAIT, async {
            while broadcast.listener_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        // Announcing with no listeners returns immediately
        timeout(WAIT, broadcast.announce("x".to_string()))
            .await
            .unwrap();
    }
}
