use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::delivery::{DeliveryQueue, Subscription};
use crate::packet::Packet;
use crate::store::{PacketStore, DEFAULT_STORE_CAPACITY};

/// Which producer is currently feeding the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Starting,
    LiveUdp,
    ReplayingSample,
    /// Producer finished or failed; no more packets will arrive
    Idle,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub history: usize,
    pub session_queue_capacity: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history: DEFAULT_STORE_CAPACITY,
            session_queue_capacity: None,
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    emitted_packets: AtomicU64,
    emitted_bytes: AtomicU64,
}

/// Point-in-time counters for reporting
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub capture_state: CaptureState,
    pub emitted_packets: u64,
    pub emitted_bytes: u64,
    pub active_sessions: usize,
    pub overflowed_sessions: u64,
    pub stored_packets: usize,
    pub store_capacity: usize,
}

/// Owns the packet history and the delivery fan-out. Built once at startup
/// and shared by handle with the capture thread and every viewer session.
#[derive(Debug)]
pub struct Pipeline {
    store: PacketStore,
    queue: Arc<DeliveryQueue>,
    // Orders emission against snapshot-then-subscribe
    emit_lock: Mutex<()>,
    capture_state: RwLock<CaptureState>,
    stats: Stats,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            store: PacketStore::with_capacity(config.history),
            queue: Arc::new(DeliveryQueue::with_session_capacity(config.session_queue_capacity)),
            emit_lock: Mutex::new(()),
            capture_state: RwLock::new(CaptureState::Starting),
            stats: Stats::default(),
        }
    }

    /// Record a packet in the history and hand it to every session
    pub fn emit(&self, packet: Packet) {
        let bytes = packet.size() as u64;
        let packet = Arc::new(packet);

        let _guard = self.emit_lock.lock();
        self.store.append(Arc::clone(&packet));
        self.queue.publish(packet);

        self.stats.emitted_packets.fetch_add(1, Ordering::Relaxed);
        self.stats.emitted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// New live session with no history
    pub fn subscribe(&self) -> Subscription {
        self.queue.subscribe()
    }

    /// Current history plus a session that continues exactly after it
    pub fn subscribe_with_backlog(&self) -> (Vec<Arc<Packet>>, Subscription) {
        let _guard = self.emit_lock.lock();
        let backlog = self.store.snapshot();
        (backlog, self.queue.subscribe())
    }

    pub fn snapshot(&self) -> Vec<Arc<Packet>> {
        self.store.snapshot()
    }

    pub fn store(&self) -> &PacketStore {
        &self.store
    }

    pub fn set_capture_state(&self, state: CaptureState) {
        *self.capture_state.write() = state;
    }

    pub fn capture_state(&self) -> CaptureState {
        *self.capture_state.read()
    }

    /// End every viewer stream, used on shutdown
    pub fn close_sessions(&self) {
        self.queue.close_all();
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            capture_state: self.capture_state(),
            emitted_packets: self.stats.emitted_packets.load(Ordering::Relaxed),
            emitted_bytes: self.stats.emitted_bytes.load(Ordering::Relaxed),
            active_sessions: self.queue.session_count(),
            overflowed_sessions: self.queue.overflowed_sessions(),
            stored_packets: self.store.len(),
            store_capacity: self.store.capacity(),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}
