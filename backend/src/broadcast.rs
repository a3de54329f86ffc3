//! Snapshot fan-out to live viewers.
//!
//! Every subscriber owns a bounded outbound buffer. Publishing hands the new
//! snapshot to each buffer with `try_send` while holding the registry lock;
//! nothing under the lock awaits, so a slow viewer never delays the others.
//! A subscriber whose buffer is full is dropped instead of queued for: only
//! the latest tally matters, and a reconnect starts from a fresh snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use shared::{parse_channel, AggregateSnapshot, Channel, OptionId, SnapshotView, ValidationError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::shutdown::ShutdownSignal;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error(transparent)]
    Channel(#[from] ValidationError),
    #[error("Broadcaster is shutting down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Overflow,
    Disconnected,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: Vec<(Uuid, DropReason)>,
}

#[derive(Debug)]
struct SubscriberSlot {
    sender: mpsc::Sender<Arc<AggregateSnapshot>>,
    last_delivered_version: u64,
}

#[derive(Debug)]
struct Registry {
    latest: Arc<AggregateSnapshot>,
    subscribers: HashMap<Uuid, SubscriberSlot>,
    closed: bool,
}

#[derive(Debug)]
pub struct Broadcaster {
    registry: Mutex<Registry>,
    options: Vec<OptionId>,
    buffer: usize,
}

impl Broadcaster {
    pub fn new(initial: Arc<AggregateSnapshot>, options: Vec<OptionId>, buffer: usize) -> Self {
        Self {
            registry: Mutex::new(Registry {
                latest: initial,
                subscribers: HashMap::new(),
                closed: false,
            }),
            options,
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn latest(&self) -> Arc<AggregateSnapshot> {
        self.lock().latest.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Registers a viewer. The current snapshot is already waiting in the
    /// returned subscription's buffer.
    pub fn subscribe(self: &Arc<Self>, channel: Option<&str>) -> Result<Subscription, BroadcastError> {
        let channel = parse_channel(channel, &self.options)?;
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();

        let mut registry = self.lock();
        if registry.closed {
            return Err(BroadcastError::Closed);
        }

        let latest = registry.latest.clone();
        let version = latest.version;
        if sender.try_send(latest).is_err() {
            error!(connection_id = %id, "Fresh subscriber buffer rejected the initial snapshot");
            return Err(BroadcastError::Closed);
        }
        registry.subscribers.insert(
            id,
            SubscriberSlot {
                sender,
                last_delivered_version: version,
            },
        );
        let count = registry.subscribers.len();
        drop(registry);

        info!(connection_id = %id, ?channel, subscribers = count, "Subscriber connected");
        Ok(Subscription {
            id,
            channel,
            receiver,
            broadcaster: Arc::clone(self),
        })
    }

    /// Offers `snapshot` to every subscriber that has not seen it yet.
    /// Snapshots older than the current one are ignored.
    pub fn publish(&self, snapshot: Arc<AggregateSnapshot>) -> PublishReport {
        let mut report = PublishReport::default();
        let mut registry = self.lock();

        if snapshot.version <= registry.latest.version {
            debug!(version = snapshot.version, "Ignoring stale snapshot");
            return report;
        }
        registry.latest = snapshot.clone();

        for (id, slot) in registry.subscribers.iter_mut() {
            if slot.last_delivered_version >= snapshot.version {
                continue;
            }
            match slot.sender.try_send(snapshot.clone()) {
                Ok(()) => {
                    slot.last_delivered_version = snapshot.version;
                    report.delivered += 1;
                }
                Err(TrySendError::Full(_)) => report.dropped.push((*id, DropReason::Overflow)),
                Err(TrySendError::Closed(_)) => report.dropped.push((*id, DropReason::Disconnected)),
            }
        }

        for (id, reason) in &report.dropped {
            registry.subscribers.remove(id);
            match reason {
                DropReason::Overflow => warn!(connection_id = %id, "Subscriber too slow, dropping"),
                DropReason::Disconnected => debug!(connection_id = %id, "Subscriber gone, removing"),
            }
        }

        report
    }

    fn unregister(&self, id: &Uuid) {
        if self.lock().subscribers.remove(id).is_some() {
            debug!(connection_id = %id, "Subscriber disconnected");
        }
    }

    /// Ends every open stream and refuses new subscribers.
    pub fn close(&self) {
        let mut registry = self.lock();
        registry.closed = true;
        let count = registry.subscribers.len();
        registry.subscribers.clear();
        info!(subscribers = count, "Broadcaster closed");
    }

    /// Forwards snapshots from the aggregation engine until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut snapshots: watch::Receiver<Arc<AggregateSnapshot>>,
        mut shutdown: ShutdownSignal,
    ) {
        info!("Broadcast server started");

        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    let report = self.publish(snapshot);
                    debug!(delivered = report.delivered, dropped = report.dropped.len(), "Snapshot broadcast");
                }
                _ = shutdown.wait() => break,
            }
        }

        self.close();
    }
}

/// One viewer's end of the fan-out. Dropping it unregisters the viewer.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    channel: Channel,
    receiver: mpsc::Receiver<Arc<AggregateSnapshot>>,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Next snapshot, or `None` once the broadcaster dropped this viewer.
    pub async fn next(&mut self) -> Option<Arc<AggregateSnapshot>> {
        self.receiver.recv().await
    }

    pub fn view(&self, snapshot: &AggregateSnapshot) -> SnapshotView {
        snapshot.view(&self.channel)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use shared::validate_option_set;
    use tokio::time::timeout;

    fn options() -> Vec<OptionId> {
        validate_option_set(&["a", "b"]).unwrap()
    }

    fn snapshot(version: u64, a: u64, b: u64) -> Arc<AggregateSnapshot> {
        let opts = options();
        let counts = BTreeMap::from([(opts[0].clone(), a), (opts[1].clone(), b)]);
        Arc::new(AggregateSnapshot::from_counts(version, counts))
    }

    fn broadcaster(buffer: usize) -> Arc<Broadcaster> {
        Arc::new(Broadcaster::new(
            Arc::new(AggregateSnapshot::initial(&options())),
            options(),
            buffer,
        ))
    }

    #[tokio::test]
    async fn test_new_subscriber_gets_latest_immediately() {
        let hub = broadcaster(4);
        hub.publish(snapshot(3, 1, 2));

        let mut sub = hub.subscribe(None).unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.version, 3);
        assert_eq!(first.total, 3);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_versions_are_monotonic_per_subscriber() {
        let hub = broadcaster(8);
        let mut sub = hub.subscribe(None).unwrap();

        hub.publish(snapshot(1, 1, 0));
        hub.publish(snapshot(2, 1, 1));
        hub.publish(snapshot(1, 9, 9));
        hub.publish(snapshot(2, 9, 9));
        hub.publish(snapshot(3, 2, 1));

        let mut versions = Vec::new();
        for _ in 0..4 {
            versions.push(sub.next().await.unwrap().version);
        }
        assert_eq!(versions, vec![0, 1, 2, 3]);
        assert!(timeout(Duration::from_millis(20), sub.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_all_subscribers_see_same_counts() {
        let hub = broadcaster(4);
        let mut subs: Vec<_> = (0..5).map(|_| hub.subscribe(None).unwrap()).collect();
        hub.publish(snapshot(1, 4, 6));

        for sub in subs.iter_mut() {
            assert_eq!(sub.next().await.unwrap().version, 0);
            let update = sub.next().await.unwrap();
            assert_eq!(update.version, 1);
            assert_eq!(update.total, 10);
        }
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_block_others() {
        let hub = broadcaster(2);
        let stalled = hub.subscribe(None).unwrap();
        let mut live = hub.subscribe(None).unwrap();
        assert_eq!(live.next().await.unwrap().version, 0);

        let mut overflowed = false;
        for version in 1..=5 {
            let report = hub.publish(snapshot(version, version, 0));
            if report.dropped.contains(&(stalled.id(), DropReason::Overflow)) {
                overflowed = true;
            }

            let received = timeout(Duration::from_millis(50), live.next())
                .await
                .expect("live subscriber delayed by stalled peer")
                .unwrap();
            assert_eq!(received.version, version);
        }

        assert!(overflowed);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_stream_ends_after_buffer() {
        let hub = broadcaster(1);
        let mut slow = hub.subscribe(None).unwrap();
        let report = hub.publish(snapshot(1, 1, 0));
        assert_eq!(report.dropped, vec![(slow.id(), DropReason::Overflow)]);

        assert_eq!(slow.next().await.unwrap().version, 0);
        assert!(slow.next().await.is_none(), "client must reconnect for a fresh snapshot");
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let hub = broadcaster(4);
        let sub = hub.subscribe(Some("a")).unwrap();
        assert_eq!(sub.channel(), &Channel::Option(options()[0].clone()));
        assert_eq!(hub.subscriber_count(), 1);

        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(snapshot(1, 0, 0)).delivered, 0);
    }

    #[tokio::test]
    async fn test_unsupported_channel_is_rejected() {
        let hub = broadcaster(4);
        let err = hub.subscribe(Some("weather")).unwrap_err();
        assert!(matches!(err, BroadcastError::Channel(ValidationError::UnsupportedChannel(_))));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_streams_and_refuses_subscribers() {
        let hub = broadcaster(4);
        let mut sub = hub.subscribe(None).unwrap();
        hub.close();

        assert_eq!(sub.next().await.unwrap().version, 0);
        assert!(sub.next().await.is_none());
        assert!(matches!(hub.subscribe(None), Err(BroadcastError::Closed)));
    }
}
