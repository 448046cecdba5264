use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::Waker;
use tracing::{info, warn};

/// Requests an orderly shutdown of a running [crate::relay::Relay] from another thread. The
///  relay checks the flag once per loop iteration; the waker interrupts a blocking wait so the
///  request is seen right away.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub(crate) fn new(running: Arc<AtomicBool>, waker: Arc<Waker>) -> ShutdownHandle {
        ShutdownHandle { running, waker }
    }

    pub fn trigger(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("shutdown requested");
        }
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake the relay's event loop: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, Token};
    use std::time::Duration;

    #[test]
    fn test_trigger_wakes_poll() {
        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(3)).unwrap());
        let handle = ShutdownHandle::new(Arc::new(AtomicBool::new(true)), waker);
        assert!(handle.is_running());

        let remote = handle.clone();
        std::thread::spawn(move || remote.trigger());

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(10))).unwrap();
        assert!(events.iter().any(|e| e.token() == Token(3)));
        assert!(!handle.is_running());
    }
}
