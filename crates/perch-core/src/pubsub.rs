//! Observable values: change-deduplicated publish/subscribe with optional
//! background polling.
//!
//! An [`Observable`] caches the last published value and fans every change
//! out to its subscribers through bounded per-subscriber delivery slots.
//! Each subscription has its own consumer task that feeds values to the
//! subscriber's callback in publish order.
//!
//! When a [`PollConfig`] is set, a single background poller samples the
//! value while at least one subscriber exists. The poller takes one
//! synchronous sample when it starts, so the first subscriber sees real
//! state rather than the default value.
//!
//! ## Backpressure
//!
//! [`Observable::publish`] waits for room in every subscriber's slot. A
//! subscriber that stops draining therefore stalls publishers of the same
//! observable (never of other observables). Unsubscribing releases any
//! publisher waiting on that subscriber's slot immediately.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Capacity of each subscriber's delivery slot.
pub const DELIVERY_SLOT_CAPACITY: usize = 3;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Identity of a subscriber across all observables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a process-unique identity.
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Values that can be observed. Equality drives deduplication.
pub trait Observed: Clone + PartialEq + Send + Sync + 'static {}

impl<T> Observed for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Samples the current value, or `None` when it is unavailable.
pub type PollFn<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;

/// Background sampling settings.
///
/// The poll function runs on the async runtime, and its first sample is
/// taken while the observable's state lock is held. It must be cheap and
/// must not block: reading a small file such as a sysfs attribute is fine,
/// anything slower belongs in a task that calls [`Observable::publish`].
#[derive(Clone)]
pub struct PollConfig<T> {
    pub interval: Duration,
    pub poll: PollFn<T>,
}

impl<T> PollConfig<T> {
    pub fn new<F>(interval: Duration, poll: F) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        Self {
            interval,
            poll: Arc::new(poll),
        }
    }
}

impl<T> fmt::Debug for PollConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollConfig")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// A subscriber's delivery slot. Dropping it closes the slot: the consumer
/// task stops and publishers waiting for room give up on it.
struct Slot<T> {
    tx: mpsc::Sender<T>,
    closed: watch::Sender<()>,
}

struct State<T> {
    current: T,
    subscribers: HashMap<SubscriberId, Slot<T>>,
    config: Option<PollConfig<T>>,
    /// Dropping the sender stops the poller.
    poller: Option<oneshot::Sender<()>>,
}

struct Inner<T> {
    state: StdMutex<State<T>>,
    /// Serializes publishers so every slot sees values in publish order.
    publish_order: Mutex<()>,
}

impl<T> Inner<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A shared, observable value. Cloning yields another handle to the same value.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Observed + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Observed + Default> Observable<T> {
    /// An observable without polling, holding `T::default()`.
    pub fn new() -> Self {
        Self::with_initial(T::default(), None)
    }

    /// An observable sampled by `config` while it has subscribers.
    pub fn with_poll(config: PollConfig<T>) -> Self {
        Self::with_initial(T::default(), Some(config))
    }
}

impl<T: Observed> Observable<T> {
    pub fn with_initial(initial: T, config: Option<PollConfig<T>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: StdMutex::new(State {
                    current: initial,
                    subscribers: HashMap::new(),
                    config,
                    poller: None,
                }),
                publish_order: Mutex::new(()),
            }),
        }
    }

    /// Subscribe `id`, invoking `callback` for every value delivered to it.
    ///
    /// Does nothing and returns `false` if `id` is already subscribed.
    /// Starts the poller for the first subscriber. With `deliver_initial`
    /// the cached value is delivered first. When `callback` returns
    /// [`ControlFlow::Break`], the subscriber is removed.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F, Fut>(
        &self,
        id: SubscriberId,
        deliver_initial: bool,
        mut callback: F,
    ) -> bool
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let mut state = self.inner.state();
        if state.subscribers.contains_key(&id) {
            return false;
        }

        let (tx, mut rx) = mpsc::channel(DELIVERY_SLOT_CAPACITY);
        let (closed, mut closed_rx) = watch::channel(());

        start_poller(&self.inner, &mut state);

        if deliver_initial {
            // Fresh slot, cannot be full
            let _ = tx.try_send(state.current.clone());
        }
        state.subscribers.insert(id, Slot { tx, closed });
        drop(state);

        debug!(subscriber = %id, "subscribed");

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let value = tokio::select! {
                    biased;
                    _ = closed_rx.changed() => break,
                    value = rx.recv() => match value {
                        Some(value) => value,
                        None => break,
                    },
                };

                if callback(value).await.is_break() {
                    if let Some(inner) = weak.upgrade() {
                        Observable { inner }.unsubscribe(id);
                    }
                    break;
                }
            }
            trace!(subscriber = %id, "delivery consumer stopped");
        });

        true
    }

    /// Remove `id`, closing its slot. Stops the poller when no subscriber remains.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut state = self.inner.state();
        if state.subscribers.remove(&id).is_some() {
            debug!(subscriber = %id, "unsubscribed");
        }
        if state.subscribers.is_empty() && state.poller.take().is_some() {
            debug!("last subscriber left, poller stopped");
        }
    }

    /// Replace the polling settings. A running poller is restarted under the
    /// new settings; subscribers are untouched.
    pub fn reconfigure(&self, config: Option<PollConfig<T>>) {
        let mut state = self.inner.state();
        state.config = config;
        if state.subscribers.is_empty() {
            return;
        }
        state.poller = None;
        start_poller(&self.inner, &mut state);
    }

    /// Publish `value`. Returns `false`, notifying nobody, if it equals the
    /// last published value.
    pub async fn publish(&self, value: T) -> bool {
        publish(&self.inner, value).await
    }

    /// Last published (or sampled) value.
    pub fn current(&self) -> T {
        self.inner.state().current.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state().subscribers.len()
    }

    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.inner.state().subscribers.contains_key(&id)
    }

    /// Whether the background poller is running.
    pub fn is_polling(&self) -> bool {
        self.inner.state().poller.is_some()
    }
}

impl<T> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Observable")
            .field("subscribers", &state.subscribers.len())
            .field("polling", &state.poller.is_some())
            .finish_non_exhaustive()
    }
}

async fn publish<T: Observed>(inner: &Inner<T>, value: T) -> bool {
    let _order = inner.publish_order.lock().await;

    let slots: Vec<(mpsc::Sender<T>, watch::Receiver<()>)> = {
        let mut state = inner.state();
        if state.current == value {
            return false;
        }
        state.current = value.clone();
        state
            .subscribers
            .values()
            .map(|slot| (slot.tx.clone(), slot.closed.subscribe()))
            .collect()
    };

    for (tx, mut closed) in slots {
        tokio::select! {
            // A send error means the consumer is already gone
            _ = tx.send(value.clone()) => {}
            _ = closed.changed() => {}
        }
    }
    true
}

/// Start the poller if a poll function is configured and none is running.
///
/// The initial sample is taken synchronously, under the state lock. Without
/// subscribers it silently becomes the cached value; with subscribers (a
/// reconfiguration) the poller publishes it as its first action.
fn start_poller<T: Observed>(inner: &Arc<Inner<T>>, state: &mut State<T>) {
    if state.poller.is_some() {
        return;
    }
    let Some(config) = state.config.clone() else {
        return;
    };
    let interval = config.interval.max(MIN_POLL_INTERVAL);

    let pending = match (config.poll)() {
        Some(value) if state.subscribers.is_empty() => {
            state.current = value;
            None
        }
        sample => sample,
    };

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        if let Some(value) = pending
            && let Some(inner) = weak.upgrade()
        {
            publish(&inner, value).await;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    match (config.poll)() {
                        Some(value) => {
                            publish(&inner, value).await;
                        }
                        None => debug!("poll sample unavailable, keeping last value"),
                    }
                }
            }
        }
        trace!("poller stopped");
    });

    state.poller = Some(stop_tx);
    debug!(?interval, "poller started");
}
