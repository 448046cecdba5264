use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Counters maintained by the event loop. They are atomic so that other threads can observe a
///  running relay; the event loop is the only writer.
#[derive(Debug, Default)]
pub struct RelayStats {
    frames_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
    sources_accepted: AtomicU64,
    sources_rejected: AtomicU64,
    destinations_accepted: AtomicU64,
    destinations_rejected: AtomicU64,
    destinations_reaped: AtomicU64,
    backpressure_pauses: AtomicU64,
    source_connected: AtomicBool,
    live_destinations: AtomicUsize,
}

impl RelayStats {
    pub fn frames_relayed(&self) -> u64 {
        self.frames_relayed.load(Ordering::Relaxed)
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    pub fn sources_accepted(&self) -> u64 {
        self.sources_accepted.load(Ordering::Relaxed)
    }

    pub fn sources_rejected(&self) -> u64 {
        self.sources_rejected.load(Ordering::Relaxed)
    }

    pub fn destinations_accepted(&self) -> u64 {
        self.destinations_accepted.load(Ordering::Relaxed)
    }

    pub fn destinations_rejected(&self) -> u64 {
        self.destinations_rejected.load(Ordering::Relaxed)
    }

    pub fn destinations_reaped(&self) -> u64 {
        self.destinations_reaped.load(Ordering::Relaxed)
    }

    /// how often reading from the source was paused because a destination's buffer was full
    pub fn backpressure_pauses(&self) -> u64 {
        self.backpressure_pauses.load(Ordering::Relaxed)
    }

    pub fn source_connected(&self) -> bool {
        self.source_connected.load(Ordering::Acquire)
    }

    pub fn live_destinations(&self) -> usize {
        self.live_destinations.load(Ordering::Acquire)
    }

    pub(crate) fn on_relayed(&self, frames: usize, bytes: usize) {
        self.frames_relayed.fetch_add(frames as u64, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_source_admission(&self, accepted: bool) {
        if accepted {
            self.sources_accepted.fetch_add(1, Ordering::Relaxed);
        }
        else {
            self.sources_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn on_destination_admission(&self, accepted: bool) {
        if accepted {
            self.destinations_accepted.fetch_add(1, Ordering::Relaxed);
        }
        else {
            self.destinations_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn on_reaped(&self, num_reaped: usize) {
        self.destinations_reaped.fetch_add(num_reaped as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_backpressure(&self) {
        self.backpressure_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_connections(&self, source_connected: bool, live_destinations: usize) {
        self.source_connected.store(source_connected, Ordering::Release);
        self.live_destinations.store(live_destinations, Ordering::Release);
    }
}
