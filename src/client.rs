//! Virtual clients
//!
//! A [`VirtualClient`] is one logical subscriber to a shared camera. It holds
//! at most two frames at a time: one *ready* (newest available, not yet
//! consumed) and one *held* (taken by the consumer, not yet released). The
//! consumer always sees the freshest frame while the producer stays free to
//! drop intermediate ones without ever blocking.
//!
//! Frames are pulled: `wait_for_frame`/`has_new_frame`, `take_frame`, then
//! `release`. Paced clients additionally gate deliveries through
//! `request_frame`, which returns a fence satisfied by the next delivery (or
//! by cancellation).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::broker::{Broker, StreamPhase};
use crate::buffer::{BufferDesc, CameraEvent, CameraParam};
use crate::error::{CameraError, Result};
use crate::stats::ClientFrameStats;
use crate::sync::Fence;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of a virtual client, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        ClientId(raw)
    }

    /// Numeric form, for logging
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// How the broker decides which frames this client receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Every frame is offered, with no pacing
    Continuous,
    /// Frames are delivered only against outstanding requests, rate-limited
    /// by the broker's delivery threshold
    Paced,
}

/// Receiver for events forwarded to a client.
///
/// Invoked without any broker or client lock held; it is safe to call back
/// into the client from here. Return `false` to report a transport failure;
/// the broker logs it and carries on.
pub trait ClientEventListener: Send + Sync {
    fn on_event(&self, event: CameraEvent) -> bool;
}

/// Result of offering a frame to a client
#[derive(Debug)]
pub(crate) enum DeliverOutcome {
    /// The client stored the frame; `evicted` is a previously ready frame
    /// that was replaced before the consumer took it
    Accepted { evicted: Option<BufferDesc> },
    /// The client did not take the frame
    Refused,
}

struct ClientState {
    phase: StreamPhase,
    buffers: [Option<BufferDesc>; 2],
    ready: Option<usize>,
    held: Option<usize>,
    held_since: Option<Instant>,
    listener: Option<Arc<dyn ClientEventListener>>,
    last_delivered_us: i64,
    stats: ClientFrameStats,
}

/// One logical subscriber to a shared camera
pub struct VirtualClient {
    id: ClientId,
    broker: Arc<Broker>,
    mode: DeliveryMode,
    allowed_buffers: u32,
    state: Mutex<ClientState>,
    signal: Condvar,
}

impl VirtualClient {
    pub(crate) fn new(broker: Arc<Broker>, mode: DeliveryMode, allowed_buffers: u32) -> Arc<Self> {
        Arc::new(Self {
            id: ClientId::next(),
            broker,
            mode,
            allowed_buffers,
            state: Mutex::new(ClientState {
                phase: StreamPhase::Stopped,
                buffers: [None, None],
                ready: None,
                held: None,
                held_since: None,
                listener: None,
                last_delivered_us: 0,
                stats: ClientFrameStats::default(),
            }),
            signal: Condvar::new(),
        })
    }

    /// This client's identifier
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// How this client receives frames
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.mode
    }

    /// This client's share of the device buffer pool
    pub fn allowed_buffers(&self) -> u32 {
        self.allowed_buffers
    }

    /// The broker this client is attached to
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Install the event listener. Replaces any previous one.
    pub fn set_event_listener(&self, listener: Arc<dyn ClientEventListener>) {
        self.state.lock().unwrap().listener = Some(listener);
    }

    /// Whether this client considers itself streaming
    pub fn is_streaming(&self) -> bool {
        self.state.lock().unwrap().phase == StreamPhase::Running
    }

    /// Snapshot of this client's frame accounting
    pub fn frame_stats(&self) -> ClientFrameStats {
        self.state.lock().unwrap().stats.clone()
    }

    // ── Stream lifecycle ──────────────────────────────────────────

    /// Start receiving frames. Idempotent; the device stream is started on
    /// the first streaming client.
    pub fn start_stream(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match state.phase {
                StreamPhase::Running => return Ok(()),
                StreamPhase::Stopping => return Err(CameraError::StreamAlreadyRunning),
                StreamPhase::Stopped => state.phase = StreamPhase::Running,
            }
        }

        if let Err(error) = self.broker.on_client_starting() {
            self.state.lock().unwrap().phase = StreamPhase::Stopped;
            return Err(error);
        }
        Ok(())
    }

    /// Stop receiving frames without waiting for the device.
    ///
    /// The client observes its own `StreamStopped` event immediately; the
    /// device stream itself is stopped once no other client is streaming.
    pub fn stop_stream(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != StreamPhase::Running {
                return;
            }
            state.phase = StreamPhase::Stopping;
        }

        self.notify_event(CameraEvent::StreamStopped);
        self.broker.on_client_ending(self.id);
    }

    /// Stop receiving frames and wait until the stop is observed
    pub fn stop_stream_blocking(&self) {
        self.stop_stream();
        let mut state = self.state.lock().unwrap();
        while state.phase != StreamPhase::Stopped {
            state = self.signal.wait(state).unwrap();
        }
    }

    /// Unsupported on this service
    pub fn pause_stream(&self) -> Result<()> {
        Err(CameraError::UnderlyingServiceError)
    }

    /// Unsupported on this service
    pub fn resume_stream(&self) -> Result<()> {
        Err(CameraError::UnderlyingServiceError)
    }

    /// Stop, return any frames still in the slot pair, and detach from the
    /// broker. The client is unusable afterwards.
    pub fn shutdown(&self) {
        if self.is_streaming() {
            tracing::warn!(client = self.id.raw(), "Client shut down while streaming");
            self.stop_stream();
        }

        let leftovers: Vec<BufferDesc> = {
            let mut state = self.state.lock().unwrap();
            state.ready = None;
            state.held = None;
            state.held_since = None;
            state.buffers.iter_mut().filter_map(Option::take).collect()
        };
        if !leftovers.is_empty() {
            tracing::warn!(
                client = self.id.raw(),
                count = leftovers.len(),
                "Client shut down with frames in flight"
            );
            for frame in leftovers {
                self.broker.return_frame(frame.buffer_id);
            }
        }

        self.broker.detach_client(self.id);
    }

    // ── Frame acquisition ─────────────────────────────────────────

    /// Whether a frame is ready to take
    pub fn has_new_frame(&self) -> bool {
        self.state.lock().unwrap().ready.is_some()
    }

    /// Block until a frame is ready, the stream stops, or the timeout
    /// elapses. Returns `true` if a frame is ready.
    pub fn wait_for_frame(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.ready.is_some() {
                return true;
            }
            if state.phase == StreamPhase::Stopped {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self.signal.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// Move the ready frame into the held position and hand it out.
    ///
    /// Calling again while still holding a frame is an error that returns
    /// the currently held frame unchanged.
    pub fn take_frame(&self) -> Result<BufferDesc> {
        let mut state = self.state.lock().unwrap();

        if let Some(held) = state.held {
            tracing::error!(
                client = self.id.raw(),
                "Ignored request for a new frame while still holding the old one"
            );
            return Ok(state.buffers[held].clone().ok_or(CameraError::InternalError)?);
        }

        let ready = state.ready.take().ok_or(CameraError::BufferNotAvailable)?;
        state.held = Some(ready);
        state.held_since = Some(Instant::now());
        state.buffers[ready]
            .clone()
            .ok_or(CameraError::InternalError)
    }

    /// Give a taken frame back.
    ///
    /// The frame must be the one currently held; anything else is logged and
    /// rejected.
    pub fn release(&self, frame: &BufferDesc) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let held = match state.held {
                Some(held) => held,
                None => {
                    tracing::error!(
                        client = self.id.raw(),
                        buffer_id = frame.buffer_id,
                        "Frame released while none is held"
                    );
                    return Err(CameraError::InvalidArg);
                }
            };

            let matches = state.buffers[held]
                .as_ref()
                .is_some_and(|b| b.buffer_id == frame.buffer_id);
            if !matches {
                tracing::error!(
                    client = self.id.raw(),
                    buffer_id = frame.buffer_id,
                    "Released frame does not match the held buffer"
                );
                return Err(CameraError::InvalidArg);
            }

            state.buffers[held] = None;
            state.held = None;
            state.stats.frames_returned += 1;
            if let Some(taken_at) = state.held_since.take() {
                state.stats.record_round_trip(taken_at);
            }
        }

        self.broker.return_frame(frame.buffer_id);
        Ok(())
    }

    /// Ask for the next frame no sooner than the delivery threshold after
    /// the last one. The fence signals on delivery or cancellation.
    pub fn request_frame(self: &Arc<Self>) -> Fence {
        let last_timestamp_us = self.state.lock().unwrap().last_delivered_us;
        self.broker.request_frame(self, last_timestamp_us)
    }

    // ── Mastership & parameters ───────────────────────────────────

    /// Claim exclusive control of camera parameters
    pub fn set_master(self: &Arc<Self>) -> Result<()> {
        self.broker.set_master(self)
    }

    /// Take exclusive control, displacing the current master if any
    pub fn force_master(self: &Arc<Self>) -> Result<()> {
        self.broker.force_master(self)
    }

    /// Give up exclusive control
    pub fn unset_master(&self) -> Result<()> {
        self.broker.unset_master(self.id)
    }

    /// Parameters the device supports
    pub fn get_parameter_list(&self) -> Result<Vec<CameraParam>> {
        self.broker.parameter_list()
    }

    /// `(min, max, step)` for a parameter
    pub fn get_int_parameter_range(&self, id: CameraParam) -> Result<(i32, i32, i32)> {
        self.broker.parameter_range(id)
    }

    /// Read a parameter; permitted for any client
    pub fn get_int_parameter(&self, id: CameraParam) -> Result<i32> {
        self.broker.get_parameter(id)
    }

    /// Write a parameter; master only. Returns the value the device applied.
    pub fn set_int_parameter(&self, id: CameraParam, value: i32) -> Result<i32> {
        self.broker.set_parameter(self.id, id, value)
    }

    // ── Broker-facing surface ─────────────────────────────────────

    // Delivery policy: a new frame replaces an unconsumed ready frame
    // (reporting it back as evicted), lands in the free slot when the
    // consumer holds the other, or takes slot 0 on a cold start.
    pub(crate) fn deliver_frame(&self, frame: BufferDesc) -> DeliverOutcome {
        let mut state = self.state.lock().unwrap();

        if frame.is_end_of_stream() {
            // Legacy end-of-stream marker: carries no pixels, only the stop
            if state.phase == StreamPhase::Running {
                tracing::warn!(client = self.id.raw(), "Stream unexpectedly stopped");
            }
            state.phase = StreamPhase::Stopped;
            self.signal.notify_all();
            return DeliverOutcome::Refused;
        }

        if state.phase != StreamPhase::Running {
            return DeliverOutcome::Refused;
        }

        let timestamp_us = frame.timestamp_us;
        let evicted = match (state.ready, state.held) {
            (Some(ready), _) => {
                // The consumer never saw the previous frame; reuse its slot
                let evicted = state.buffers[ready].replace(frame);
                state.stats.frames_dropped += 1;
                evicted
            }
            (None, Some(held)) => {
                let ready = 1 - held;
                state.buffers[ready] = Some(frame);
                state.ready = Some(ready);
                None
            }
            (None, None) => {
                state.buffers[0] = Some(frame);
                state.ready = Some(0);
                None
            }
        };

        state.last_delivered_us = timestamp_us;
        state.stats.frames_received += 1;
        self.signal.notify_all();

        DeliverOutcome::Accepted { evicted }
    }

    // Forward an event to this client. Stream-stop events also advance the
    // client's own phase and wake blocked waiters. The listener runs with no
    // locks held; returns false when it reports a transport failure.
    pub(crate) fn notify_event(&self, event: CameraEvent) -> bool {
        let listener = {
            let mut state = self.state.lock().unwrap();
            state.stats.events_received += 1;
            if event == CameraEvent::StreamStopped {
                if state.phase == StreamPhase::Running {
                    tracing::warn!(client = self.id.raw(), "Stream unexpectedly stopped");
                }
                state.phase = StreamPhase::Stopped;
                self.signal.notify_all();
            }
            state.listener.clone()
        };

        match listener {
            Some(listener) => listener.on_event(event),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::buffer::PixelFormat;
    use crate::device::{DeviceAdapter, DeviceConfig, FrameSink, TestSource, VideoSource};

    fn test_client(mode: DeliveryMode) -> (Arc<Broker>, Arc<VirtualClient>) {
        let source = Arc::new(TestSource::new(8, 2));
        let adapter = DeviceAdapter::open(
            "cam-test",
            source as Arc<dyn VideoSource>,
            DeviceConfig::default().geometry(8, 2),
        )
        .unwrap();
        let broker = Broker::new(adapter, BrokerConfig::default());
        let client = broker.attach_client(mode, 2).unwrap();
        client.start_stream().unwrap();
        (broker, client)
    }

    fn frame(id: u32, timestamp_us: i64) -> BufferDesc {
        BufferDesc {
            buffer_id: id,
            device_id: Arc::from("cam-test"),
            width: 8,
            height: 2,
            stride: 32,
            format: PixelFormat::Rgba8888,
            usage: 0,
            timestamp_us,
            handle: Some(bytes::Bytes::from_static(&[0u8; 64])),
        }
    }

    #[test]
    fn test_ready_replaces_ready() {
        let (broker, client) = test_client(DeliveryMode::Continuous);

        // The consumer never pulls; each delivery replaces the ready frame
        for (id, ts) in [(1, 0), (2, 20_000), (3, 40_000)] {
            broker.deliver_frame(frame(id, ts));
        }

        assert!(client.has_new_frame());
        let taken = client.take_frame().unwrap();
        assert_eq!(taken.buffer_id, 3);

        // The two replaced frames are no longer tracked
        assert_eq!(broker.frame_ref_count(1), None);
        assert_eq!(broker.frame_ref_count(2), None);
        assert_eq!(broker.frame_ref_count(3), Some(1));

        let stats = client.frame_stats();
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.frames_dropped, 2);

        client.stop_stream_blocking();
    }

    #[test]
    fn test_held_and_ready_coexist() {
        let (broker, client) = test_client(DeliveryMode::Continuous);

        broker.deliver_frame(frame(1, 0));
        let held = client.take_frame().unwrap();
        assert_eq!(held.buffer_id, 1);

        // Next delivery uses the other slot
        broker.deliver_frame(frame(2, 20_000));
        assert!(client.has_new_frame());

        // A third delivery replaces the unconsumed ready frame
        broker.deliver_frame(frame(3, 40_000));
        assert_eq!(broker.frame_ref_count(2), None);

        client.release(&held).unwrap();
        assert_eq!(broker.frame_ref_count(1), None);

        let next = client.take_frame().unwrap();
        assert_eq!(next.buffer_id, 3);
        assert!(!client.has_new_frame());

        client.release(&next).unwrap();
        assert_eq!(broker.live_frames(), 0);

        client.stop_stream_blocking();
    }

    #[test]
    fn test_take_while_holding_returns_held_frame() {
        let (broker, client) = test_client(DeliveryMode::Continuous);

        broker.deliver_frame(frame(1, 0));
        broker.deliver_frame(frame(2, 20_000));

        // take moves frame 1... no: frame 2 replaced frame 1 in the ready
        // slot, so the consumer sees the newest frame
        let held = client.take_frame().unwrap();
        assert_eq!(held.buffer_id, 2);

        broker.deliver_frame(frame(3, 40_000));
        let again = client.take_frame().unwrap();
        assert_eq!(again.buffer_id, 2, "still the held frame");

        client.release(&held).unwrap();
        client.stop_stream_blocking();
    }

    #[test]
    fn test_take_with_nothing_ready() {
        let (_broker, client) = test_client(DeliveryMode::Continuous);
        assert_eq!(client.take_frame().err(), Some(CameraError::BufferNotAvailable));
        client.stop_stream_blocking();
    }

    #[test]
    fn test_release_validates_buffer() {
        let (broker, client) = test_client(DeliveryMode::Continuous);

        // Nothing held yet
        assert_eq!(client.release(&frame(1, 0)).err(), Some(CameraError::InvalidArg));

        broker.deliver_frame(frame(1, 0));
        let held = client.take_frame().unwrap();

        // Wrong id is rejected and the held frame stays put
        assert_eq!(client.release(&frame(9, 0)).err(), Some(CameraError::InvalidArg));
        client.release(&held).unwrap();

        client.stop_stream_blocking();
    }

    #[test]
    fn test_stopped_client_refuses_delivery() {
        let (broker, client) = test_client(DeliveryMode::Continuous);
        client.stop_stream_blocking();

        broker.deliver_frame(frame(1, 0));
        assert!(!client.has_new_frame());
        assert_eq!(broker.live_frames(), 0);
    }

    #[test]
    fn test_start_stream_is_idempotent() {
        let (_broker, client) = test_client(DeliveryMode::Continuous);
        client.start_stream().unwrap();
        client.start_stream().unwrap();
        client.stop_stream_blocking();
    }

    #[test]
    fn test_pause_resume_unsupported() {
        let (_broker, client) = test_client(DeliveryMode::Continuous);
        assert_eq!(client.pause_stream().err(), Some(CameraError::UnderlyingServiceError));
        assert_eq!(client.resume_stream().err(), Some(CameraError::UnderlyingServiceError));
        client.stop_stream_blocking();
    }

    #[test]
    fn test_shutdown_returns_frames_in_flight() {
        let (broker, client) = test_client(DeliveryMode::Continuous);

        broker.deliver_frame(frame(1, 0));
        let _held = client.take_frame().unwrap();
        broker.deliver_frame(frame(2, 20_000));
        assert_eq!(broker.live_frames(), 2);

        client.shutdown();
        assert_eq!(broker.live_frames(), 0);
        assert_eq!(broker.client_count(), 0);
    }

    #[test]
    fn test_end_of_stream_marker_stops_the_client() {
        let (broker, client) = test_client(DeliveryMode::Continuous);

        let marker = BufferDesc::end_of_stream(Arc::from("cam-test"));
        assert!(matches!(
            client.deliver_frame(marker),
            DeliverOutcome::Refused
        ));
        assert!(!client.is_streaming());
        assert!(!client.has_new_frame());

        // Wind the device down now that its last client is gone
        broker.on_client_ending(client.id());
        assert_eq!(broker.stream_phase(), StreamPhase::Stopped);
    }

    #[test]
    fn test_slots_never_alias() {
        let (broker, client) = test_client(DeliveryMode::Continuous);

        for round in 0..8i64 {
            broker.deliver_frame(frame(round as u32, round * 20_000));
            let taken = client.take_frame().unwrap();
            broker.deliver_frame(frame(100 + round as u32, round * 20_000 + 10_000));
            {
                let state = client.state.lock().unwrap();
                if let (Some(ready), Some(held)) = (state.ready, state.held) {
                    assert_ne!(ready, held);
                }
            }
            client.release(&taken).unwrap();
        }

        client.stop_stream_blocking();
    }
}
