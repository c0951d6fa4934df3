//! Per-client delivery timelines
//!
//! Each paced client gets a [`Timeline`]; every frame request mints a
//! [`Fence`] against it. The broker signals the timeline when a delivery is
//! made, and signals everything outstanding when the client detaches, so a
//! consumer blocked on a fence never waits on a client that will not be
//! served.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct TimelineState {
    /// Highest point the timeline has advanced to
    signaled: u64,
    /// Highest fence target handed out
    issued: u64,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<TimelineState>,
    cond: Condvar,
}

/// A monotonically advancing event counter owned by the broker
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    inner: Arc<Inner>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fence that signals at the next timeline point
    pub fn create_fence(&self) -> Fence {
        let mut state = self.inner.state.lock().unwrap();
        state.issued += 1;
        Fence {
            target: state.issued,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Advance the timeline by one point, waking waiters
    pub fn signal(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.signaled += 1;
        self.inner.cond.notify_all();
    }

    /// Advance the timeline past every issued fence.
    ///
    /// Used on cancellation: any pending waiter observes its fence as
    /// signaled and returns.
    pub fn signal_all(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.signaled < state.issued {
            state.signaled = state.issued;
        }
        self.inner.cond.notify_all();
    }
}

/// A one-shot wait handle satisfied by a delivery or a cancellation
#[derive(Debug)]
pub struct Fence {
    target: u64,
    inner: Arc<Inner>,
}

impl Fence {
    /// Whether the fence point has been reached
    pub fn is_signaled(&self) -> bool {
        self.inner.state.lock().unwrap().signaled >= self.target
    }

    /// Block until the fence signals
    pub fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.signaled < self.target {
            state = self.inner.cond.wait(state).unwrap();
        }
    }

    /// Block until the fence signals or the timeout elapses.
    ///
    /// Returns `true` if the fence signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        while state.signaled < self.target {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, result) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            if result.timed_out() && state.signaled < self.target {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fence_signals_in_order() {
        let timeline = Timeline::new();
        let first = timeline.create_fence();
        let second = timeline.create_fence();

        assert!(!first.is_signaled());

        timeline.signal();
        assert!(first.is_signaled());
        assert!(!second.is_signaled());

        timeline.signal();
        assert!(second.is_signaled());
    }

    #[test]
    fn test_signal_all_releases_everything() {
        let timeline = Timeline::new();
        let fences: Vec<Fence> = (0..4).map(|_| timeline.create_fence()).collect();

        timeline.signal_all();
        assert!(fences.iter().all(Fence::is_signaled));
    }

    #[test]
    fn test_wait_across_threads() {
        let timeline = Timeline::new();
        let fence = timeline.create_fence();

        let signaller = {
            let timeline = timeline.clone();
            thread::spawn(move || timeline.signal())
        };

        fence.wait();
        signaller.join().unwrap();
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let timeline = Timeline::new();
        let fence = timeline.create_fence();
        assert!(!fence.wait_timeout(Duration::from_millis(20)));

        timeline.signal();
        assert!(fence.wait_timeout(Duration::from_millis(20)));
    }
}
