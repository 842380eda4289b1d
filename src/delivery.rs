use dashmap::DashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::packet::Packet;

/// Producer side of one session queue
#[derive(Debug)]
enum SessionSender {
    Unbounded(mpsc::UnboundedSender<Arc<Packet>>),
    Bounded(mpsc::Sender<Arc<Packet>>),
}

/// Consumer side of one session queue
#[derive(Debug)]
enum SessionReceiver {
    Unbounded(mpsc::UnboundedReceiver<Arc<Packet>>),
    Bounded(mpsc::Receiver<Arc<Packet>>),
}

/// Outcome of pushing one packet into one session queue
enum Delivery {
    Queued,
    Closed,
    Overflow,
}

impl SessionSender {
    fn deliver(&self, packet: Arc<Packet>) -> Delivery {
        match self {
            SessionSender::Unbounded(tx) => match tx.send(packet) {
                Ok(()) => Delivery::Queued,
                Err(_) => Delivery::Closed,
            },
            SessionSender::Bounded(tx) => match tx.try_send(packet) {
                Ok(()) => Delivery::Queued,
                Err(TrySendError::Full(_)) => Delivery::Overflow,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
        }
    }
}

#[derive(Debug, Default)]
struct DeliveryStats {
    published: AtomicU64,
    overflowed_sessions: AtomicU64,
}

/// Fan-out hand-off between the single capture producer and every viewer.
/// Each session owns its own FIFO queue so concurrent viewers all see every
/// packet in publish order.
#[derive(Debug)]
pub struct DeliveryQueue {
    sessions: DashMap<u64, SessionSender>,
    next_session: AtomicU64,
    // None = unbounded session queues
    session_capacity: Option<usize>,
    stats: DeliveryStats,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::with_session_capacity(None)
    }

    pub fn with_session_capacity(session_capacity: Option<usize>) -> Self {
        Self {
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
            session_capacity: session_capacity.map(|capacity| capacity.max(1)),
            stats: DeliveryStats::default(),
        }
    }

    /// Register a new session. It receives every packet published from now on.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = match self.session_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (SessionSender::Bounded(tx), SessionReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (SessionSender::Unbounded(tx), SessionReceiver::Unbounded(rx))
            }
        };

        self.sessions.insert(id, sender);
        debug!("Session {} subscribed ({} active)", id, self.sessions.len());

        Subscription {
            id,
            receiver,
            queue: Arc::clone(self),
        }
    }

    /// Push a packet to every registered session.
    /// Sessions whose receiver is gone are pruned; sessions whose bounded
    /// queue is full are disconnected.
    pub fn publish(&self, packet: Arc<Packet>) {
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let mut dropped = Vec::new();
        for entry in self.sessions.iter() {
            match entry.value().deliver(Arc::clone(&packet)) {
                Delivery::Queued => {}
                Delivery::Closed => dropped.push(*entry.key()),
                Delivery::Overflow => {
                    warn!("Session {} queue full, disconnecting slow viewer", entry.key());
                    self.stats.overflowed_sessions.fetch_add(1, Ordering::Relaxed);
                    dropped.push(*entry.key());
                }
            }
        }

        // Removal must wait until the shard guards held by iter() are released
        for id in dropped {
            self.sessions.remove(&id);
        }
    }

    /// Disconnect every session. Receivers drain what is queued, then end.
    pub fn close_all(&self) {
        let count = self.sessions.len();
        self.sessions.clear();
        debug!("Closed {} sessions", count);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn published(&self) -> u64 {
        self.stats.published.load(Ordering::Relaxed)
    }

    pub fn overflowed_sessions(&self) -> u64 {
        self.stats.overflowed_sessions.load(Ordering::Relaxed)
    }

    fn unsubscribe(&self, id: u64) {
        if self.sessions.remove(&id).is_some() {
            debug!("Session {} unsubscribed ({} active)", id, self.sessions.len());
        }
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One viewer's registration. Yields packets in publish order and suspends
/// while its queue is empty. Dropping it releases the registration.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: SessionReceiver,
    queue: Arc<DeliveryQueue>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next packet; `None` once the session has been closed
    pub async fn recv(&mut self) -> Option<Arc<Packet>> {
        match &mut self.receiver {
            SessionReceiver::Unbounded(rx) => rx.recv().await,
            SessionReceiver::Bounded(rx) => rx.recv().await,
        }
    }
}

impl Stream for Subscription {
    type Item = Arc<Packet>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.receiver {
            SessionReceiver::Unbounded(rx) => rx.poll_recv(cx),
            SessionReceiver::Bounded(rx) => rx.poll_recv(cx),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn packet(seq: u32) -> Arc<Packet> {
        Arc::new(Packet::new(seq as f64, seq.to_le_bytes().to_vec()))
    }

    #[tokio::test]
    async fn test_single_session_in_order() {
        let queue = Arc::new(DeliveryQueue::new());
        let mut session = queue.subscribe();

        for seq in 0..50 {
            queue.publish(packet(seq));
        }

        for seq in 0..50 {
            let received = session.recv().await.unwrap();
            assert_eq!(received.timestamp(), seq as f64);
        }
        assert_eq!(queue.published(), 50);
    }

    #[tokio::test]
    async fn test_every_session_sees_every_packet() {
        let queue = Arc::new(DeliveryQueue::new());
        let first = queue.subscribe();
        let second = queue.subscribe();
        assert_eq!(queue.session_count(), 2);

        for seq in 0..10 {
            queue.publish(packet(seq));
        }
        queue.close_all();

        let first: Vec<f64> = first.map(|p| p.timestamp()).collect().await;
        let second: Vec<f64> = second.map(|p| p.timestamp()).collect().await;
        let expected: Vec<f64> = (0..10).map(|seq| seq as f64).collect();
        assert_eq!(first, expected);
        assert_eq!(second, expected);
    }

    #[tokio::test]
    async fn test_late_session_only_sees_new_packets() {
        let queue = Arc::new(DeliveryQueue::new());
        queue.publish(packet(0));

        let mut session = queue.subscribe();
        queue.publish(packet(1));

        assert_eq!(session.recv().await.unwrap().timestamp(), 1.0);
    }

    #[tokio::test]
    async fn test_recv_suspends_until_publish() {
        let queue = Arc::new(DeliveryQueue::new());
        let mut session = queue.subscribe();

        let pending = tokio::time::timeout(Duration::from_millis(50), session.recv()).await;
        assert!(pending.is_err());

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.publish(packet(7));
            })
        };

        let received = tokio::time::timeout(Duration::from_secs(2), session.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.timestamp(), 7.0);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases_registration() {
        let queue = Arc::new(DeliveryQueue::new());
        let session = queue.subscribe();
        let _other = queue.subscribe();
        assert_eq!(queue.session_count(), 2);

        drop(session);
        assert_eq!(queue.session_count(), 1);

        // Remaining session is unaffected
        queue.publish(packet(1));
        assert_eq!(queue.session_count(), 1);
    }

    #[tokio::test]
    async fn test_bounded_session_disconnects_on_overflow() {
        let queue = Arc::new(DeliveryQueue::with_session_capacity(Some(2)));
        let slow = queue.subscribe();
        let mut fast = queue.subscribe();

        for seq in 0..3 {
            queue.publish(packet(seq));
            assert_eq!(fast.recv().await.unwrap().timestamp(), seq as f64);
        }

        assert_eq!(queue.overflowed_sessions(), 1);
        assert_eq!(queue.session_count(), 1);

        // The slow viewer drains what was queued before it was cut off
        let drained: Vec<f64> = slow.map(|p| p.timestamp()).collect().await;
        assert_eq!(drained, vec![0.0, 1.0]);
    }
}
