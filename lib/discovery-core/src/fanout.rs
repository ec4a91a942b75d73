//! Subscriber registration and best-effort delivery of change batches

use crate::endpoint::ServiceSet;
use crate::metrics::DiscoveryMetrics;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type SubscriberId = u64;

/// Receiving side of a subscription.
///
/// Every delivered batch is the complete endpoint set at that moment. Batches
/// arrive in the order the watcher applied them, but batches may be skipped
/// when the channel stays full. When the store reports that no servers are
/// left, subscribers receive an empty set.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<ServiceSet>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next batch. Returns `None` once the watcher has shut down
    /// or the subscription was removed and pending deliveries finished.
    pub async fn recv(&mut self) -> Option<ServiceSet> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<ServiceSet, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn into_receiver(self) -> mpsc::Receiver<ServiceSet> {
        self.receiver
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: mpsc::Sender<ServiceSet>,
    // Delivery task of the previous batch; the next one waits for it
    last_send: Option<JoinHandle<()>>,
}

/// The subscriber set of one watcher
pub(crate) struct Subscribers {
    path: String,
    inner: Mutex<Vec<Subscriber>>,
    // Set once the watch loop has ended; only changed under `inner`
    closed: AtomicBool,
    next_id: AtomicU64,
    capacity: usize,
    send_timeout: Duration,
    metrics: Option<DiscoveryMetrics>,
}

impl Subscribers {
    pub(crate) fn new(
        path: &str,
        capacity: usize,
        send_timeout: Duration,
        metrics: Option<DiscoveryMetrics>,
    ) -> Self {
        Self {
            path: path.to_string(),
            inner: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            send_timeout,
            metrics,
        }
    }

    /// Add a subscriber. After `close` the subscription is returned already
    /// ended, so its `recv` yields `None` right away.
    pub(crate) async fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.inner.lock().await;
        if self.closed.load(Ordering::Acquire) {
            debug!("{} is no longer watched, subscriber {} ended", self.path, id);
            return Subscription { id, receiver };
        }
        subscribers.push(Subscriber {
            id,
            sender,
            last_send: None,
        });
        self.report_count(subscribers.len());
        debug!("Subscriber {} added to {}", id, self.path);

        Subscription { id, receiver }
    }

    /// Remove a subscriber; unknown ids are ignored
    pub(crate) async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.inner.lock().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if removed {
            self.report_count(subscribers.len());
            debug!("Subscriber {} removed from {}", id, self.path);
        }
        removed
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Hand `services` to every subscriber without waiting for delivery.
    ///
    /// Each (subscriber, batch) pair gets its own task that first waits for
    /// the previous delivery to the same subscriber, so a subscriber never
    /// sees batches out of order. A batch not delivered within the send
    /// timeout is dropped for that subscriber only. Cancelling `stop` ends all
    /// pending deliveries.
    pub(crate) async fn broadcast(&self, services: ServiceSet, stop: &CancellationToken) {
        let mut subscribers = self.inner.lock().await;

        // Receivers dropped without unsubscribing
        let before = subscribers.len();
        subscribers.retain(|s| !s.sender.is_closed());
        if subscribers.len() != before {
            self.report_count(subscribers.len());
        }

        for subscriber in subscribers.iter_mut() {
            let delivery = Delivery {
                id: subscriber.id,
                path: self.path.clone(),
                sender: subscriber.sender.clone(),
                services: services.clone(),
                previous: subscriber.last_send.take(),
                deadline: Instant::now() + self.send_timeout,
                stop: stop.clone(),
                metrics: self.metrics.clone(),
            };

            subscriber.last_send = Some(supervise(subscriber.id, delivery.run()));
        }
    }

    /// Drop every subscriber and refuse new ones. Receivers end once pending
    /// deliveries, which observe the stop token, have finished.
    pub(crate) async fn close(&self) {
        let mut subscribers = self.inner.lock().await;
        self.closed.store(true, Ordering::Release);
        subscribers.clear();
        self.report_count(0);
    }

    fn report_count(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_subscribers(&self.path, count);
        }
    }
}

/// Run a delivery in its own task. A panic abandons that batch only.
fn supervise<F>(id: SubscriberId, delivery: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if AssertUnwindSafe(delivery).catch_unwind().await.is_err() {
            warn!("Delivery to subscriber {} panicked, batch abandoned", id);
        }
    })
}

/// One batch on its way to one subscriber
struct Delivery {
    id: SubscriberId,
    path: String,
    sender: mpsc::Sender<ServiceSet>,
    services: ServiceSet,
    previous: Option<JoinHandle<()>>,
    deadline: Instant,
    stop: CancellationToken,
    metrics: Option<DiscoveryMetrics>,
}

impl Delivery {
    async fn run(mut self) {
        if let Some(mut previous) = self.previous.take() {
            let waited = tokio::select! {
                biased;
                _ = self.stop.cancelled() => None,
                waited = timeout_at(self.deadline, &mut previous) => Some(waited),
            };
            let Some(waited) = waited else {
                previous.abort();
                return;
            };

            match waited {
                Ok(Err(e)) if e.is_panic() => {
                    warn!("Previous delivery to subscriber {} panicked", self.id);
                }
                Ok(_) => {}
                Err(_) => {
                    // The previous batch is stale as well; it must not land
                    // after this point.
                    previous.abort();
                    let _ = previous.await;
                    self.dropped();
                    return;
                }
            }
        }

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                debug!("Discovery for {} closed, batch for subscriber {} discarded", self.path, self.id);
            }
            sent = timeout_at(self.deadline, self.sender.send(self.services.clone())) => match sent {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    debug!("Subscriber {} is gone, batch discarded", self.id);
                }
                Err(_) => self.dropped(),
            }
        }
    }

    fn dropped(&self) {
        warn!(
            "Channel of subscriber {} on {} is full and new change has been dropped",
            self.id, self.path
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_dropped(&self.path);
        }
    }
}
