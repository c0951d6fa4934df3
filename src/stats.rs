//! Usage statistics for clients and the device buffer pool

use std::time::{Duration, Instant};

/// Per-client frame accounting
#[derive(Debug, Clone, Default)]
pub struct ClientFrameStats {
    /// Frames accepted into the client's slot pair
    pub frames_received: u64,
    /// Frames the consumer returned via `release`
    pub frames_returned: u64,
    /// Ready frames replaced before the consumer took them
    pub frames_dropped: u64,
    /// Events forwarded to the client
    pub events_received: u64,
    /// Longest observed take-to-release round trip
    pub peak_round_trip: Duration,
}

impl ClientFrameStats {
    /// Frames currently sitting in the client's slots
    pub fn frames_outstanding(&self) -> u64 {
        self.frames_received
            .saturating_sub(self.frames_returned + self.frames_dropped)
    }

    pub(crate) fn record_round_trip(&mut self, taken_at: Instant) {
        let elapsed = taken_at.elapsed();
        if elapsed > self.peak_round_trip {
            self.peak_round_trip = elapsed;
        }
    }
}

/// Snapshot of the device adapter's buffer pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers the pool may hand out concurrently
    pub frames_allowed: u32,
    /// Buffers currently out with the broker or clients
    pub frames_in_use: u32,
    /// Frames delivered since the stream started
    pub frames_produced: u64,
    /// Frames returned to the pool via `mark_frame_consumed`
    pub frames_returned: u64,
    /// Raw captures skipped because the pool was exhausted
    pub frames_skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outstanding_accounting() {
        let stats = ClientFrameStats {
            frames_received: 10,
            frames_returned: 6,
            frames_dropped: 3,
            ..Default::default()
        };
        assert_eq!(stats.frames_outstanding(), 1);
    }

    #[test]
    fn test_outstanding_never_underflows() {
        let stats = ClientFrameStats {
            frames_received: 1,
            frames_returned: 2,
            ..Default::default()
        };
        assert_eq!(stats.frames_outstanding(), 0);
    }

    #[test]
    fn test_round_trip_tracks_peak() {
        let mut stats = ClientFrameStats::default();
        let earlier = Instant::now() - Duration::from_millis(50);
        stats.record_round_trip(earlier);
        assert!(stats.peak_round_trip >= Duration::from_millis(50));

        let peak = stats.peak_round_trip;
        stats.record_round_trip(Instant::now());
        assert_eq!(stats.peak_round_trip, peak);
    }
}
