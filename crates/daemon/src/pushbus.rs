//! Long-poll push bus
//!
//! Each client UUID owns one bounded queue. A queue is created by the
//! client's first poll; publishing to a client that never polled fails.
//! Queues nobody polls are reclaimed by a periodic sweep.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;
use wgctl_common::{Error, PeerView, Result};

/// Topic of peer configuration change notifications
pub const TOPIC_PEER_CONFIG: &str = "peerConfig";

/// Message delivered to a polling client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub topic: String,
    pub data: String,
    pub attributes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<PeerView>,
}

impl PushMessage {
    /// Configuration change for one peer
    pub fn peer_config(data: impl Into<String>, config: PeerView) -> Self {
        Self {
            topic: TOPIC_PEER_CONFIG.to_string(),
            data: data.into(),
            attributes: config.attributes.clone(),
            config: Some(config),
        }
    }
}

/// Result of one long-poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Message(PushMessage),
    /// Nothing arrived in time; the client should poll again
    NoContent,
    /// The poller went away; nothing was consumed
    Cancelled,
}

struct ClientQueue {
    sender: mpsc::Sender<PushMessage>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<PushMessage>>,
    last_activity: Mutex<Instant>,
}

impl ClientQueue {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    async fn next(&self) -> Option<PushMessage> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }
}

/// Per-client message queues
pub struct PushBus {
    queues: DashMap<Uuid, Arc<ClientQueue>>,
    capacity: usize,
    poll_timeout: Duration,
    expiry: Duration,
}

impl PushBus {
    pub fn new(capacity: usize, poll_timeout: Duration, expiry: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
            poll_timeout,
            expiry,
        }
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn is_registered(&self, uuid: Uuid) -> bool {
        self.queues.contains_key(&uuid)
    }

    /// Enqueue `message` for `uuid` without waiting
    pub fn publish(&self, uuid: Uuid, message: PushMessage) -> Result<()> {
        let queue = self
            .queues
            .get(&uuid)
            .map(|q| Arc::clone(q.value()))
            .ok_or(Error::ClientNotRegistered(uuid))?;

        queue.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => Error::PushQueueFull(uuid),
            TrySendError::Closed(_) => Error::ClientNotRegistered(uuid),
        })?;

        debug!("Queued message for {}", uuid);
        Ok(())
    }

    /// Wait for the next message for `uuid`, registering the client first if
    /// needed. At most one message is consumed per call.
    pub async fn poll(&self, uuid: Uuid, cancel: &CancellationToken) -> PollOutcome {
        let queue = self.register(uuid);
        queue.touch();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => PollOutcome::Cancelled,
            message = queue.next() => match message {
                Some(message) => PollOutcome::Message(message),
                None => PollOutcome::NoContent,
            },
            _ = tokio::time::sleep(self.poll_timeout) => PollOutcome::NoContent,
        };

        if matches!(outcome, PollOutcome::Message(_)) {
            queue.touch();
        }
        outcome
    }

    fn register(&self, uuid: Uuid) -> Arc<ClientQueue> {
        let entry = self.queues.entry(uuid).or_insert_with(|| {
            debug!("Registered push client {}", uuid);
            Arc::new(ClientQueue::new(self.capacity))
        });
        Arc::clone(entry.value())
    }

    /// Drop queues idle for longer than the expiry; returns how many
    pub fn collect_garbage(&self) -> usize {
        let before = self.queues.len();
        self.queues.retain(|uuid, queue| {
            let keep = queue.idle_for() <= self.expiry;
            if !keep {
                debug!("Dropping idle push client {}", uuid);
            }
            keep
        });
        before.saturating_sub(self.queues.len())
    }

    /// Run the idle-queue sweep until cancelled
    pub async fn run_gc(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.collect_garbage();
                    if removed > 0 {
                        info!("Reclaimed {} idle push queues", removed);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_peer, test_db};

    fn bus() -> PushBus {
        PushBus::new(50, Duration::from_secs(10), Duration::from_secs(60))
    }

    fn message(data: &str) -> PushMessage {
        let db = test_db();
        let peer = db.insert_peer(&sample_peer("laptop", [172, 19, 0, 4])).unwrap();
        PushMessage::peer_config(data, peer.view(None))
    }

    #[test]
    fn test_publish_to_unknown_client() {
        let bus = bus();
        let uuid = Uuid::new_v4();
        assert!(matches!(
            bus.publish(uuid, message("update")),
            Err(Error::ClientNotRegistered(u)) if u == uuid
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_with_no_content() {
        let bus = bus();
        let uuid = Uuid::new_v4();
        let start = Instant::now();

        let outcome = bus.poll(uuid, &CancellationToken::new()).await;
        assert_eq!(outcome, PollOutcome::NoContent);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(bus.is_registered(uuid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_message_returned_immediately() {
        let bus = bus();
        let uuid = Uuid::new_v4();
        let cancel = CancellationToken::new();
        bus.poll(uuid, &cancel).await;

        let msg = message("update");
        bus.publish(uuid, msg.clone()).unwrap();
        let start = Instant::now();
        assert_eq!(bus.poll(uuid, &cancel).await, PollOutcome::Message(msg));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_message_per_poll() {
        let bus = bus();
        let uuid = Uuid::new_v4();
        let cancel = CancellationToken::new();
        bus.poll(uuid, &cancel).await;

        bus.publish(uuid, message("first")).unwrap();
        bus.publish(uuid, message("second")).unwrap();

        let PollOutcome::Message(first) = bus.poll(uuid, &cancel).await else {
            panic!("expected a message");
        };
        let PollOutcome::Message(second) = bus.poll(uuid, &cancel).await else {
            panic!("expected a message");
        };
        assert_eq!((first.data.as_str(), second.data.as_str()), ("first", "second"));
        assert_eq!(bus.poll(uuid, &cancel).await, PollOutcome::NoContent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_poll_receives_publish() {
        let bus = Arc::new(bus());
        let uuid = Uuid::new_v4();
        let cancel = CancellationToken::new();
        bus.poll(uuid, &cancel).await;

        let poller = {
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bus.poll(uuid, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        bus.publish(uuid, message("update")).unwrap();

        match poller.await.unwrap() {
            PollOutcome::Message(m) => assert_eq!(m.topic, TOPIC_PEER_CONFIG),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_message() {
        let bus = PushBus::new(2, Duration::from_secs(10), Duration::from_secs(60));
        let uuid = Uuid::new_v4();
        bus.poll(uuid, &CancellationToken::new()).await;

        bus.publish(uuid, message("1")).unwrap();
        bus.publish(uuid, message("2")).unwrap();
        assert!(matches!(
            bus.publish(uuid, message("3")),
            Err(Error::PushQueueFull(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_poll_leaves_message_queued() {
        let bus = Arc::new(bus());
        let uuid = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let poller = {
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bus.poll(uuid, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(poller.await.unwrap(), PollOutcome::Cancelled);

        bus.publish(uuid, message("kept")).unwrap();
        match bus.poll(uuid, &CancellationToken::new()).await {
            PollOutcome::Message(m) => assert_eq!(m.data, "kept"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_reclaims_idle_queues() {
        let bus = bus();
        let idle = Uuid::new_v4();
        let active = Uuid::new_v4();
        let cancel = CancellationToken::new();
        bus.poll(idle, &cancel).await;

        // idle last polled at t=0, active at t=50
        tokio::time::advance(Duration::from_secs(40)).await;
        bus.poll(active, &cancel).await;
        assert_eq!(bus.collect_garbage(), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(bus.collect_garbage(), 1);
        assert!(!bus.is_registered(idle));
        assert!(bus.is_registered(active));
        assert!(matches!(
            bus.publish(idle, message("late")),
            Err(Error::ClientNotRegistered(_))
        ));
    }

    #[test]
    fn test_message_shape() {
        let json = serde_json::to_value(message("update")).unwrap();
        assert_eq!(json["topic"], "peerConfig");
        assert_eq!(json["data"], "update");
        assert_eq!(json["config"]["hostname"], "laptop");
        assert!(json["config"].get("private_key").is_none());
        assert!(json["config"].get("preshared_key").is_none());
    }
}
