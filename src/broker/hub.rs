//! The frame broker
//!
//! One broker owns one device adapter and fans its frames out to any number
//! of virtual clients. It keeps weak references to the clients so their
//! lifetime stays with their external holders, tracks every outstanding
//! frame by reference count, arbitrates the exclusive master role for
//! parameter writes, and converges the device stream to stopped when the
//! last streaming client ends.
//!
//! Locking: one broker lock guards the client set, the request deques, the
//! frame tracker, the timelines, the master pointer, and the stream phase.
//! The lock is held while storing frames into a client's slot pair (that
//! path never re-enters the broker) but is always released before invoking a
//! client's event listener or before any blocking device call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::broker::config::BrokerConfig;
use crate::broker::requests::{FrameRequest, RequestQueue};
use crate::broker::tracker::{Decrement, FrameTracker};
use crate::buffer::{BufferDesc, CameraEvent, CameraParam, DeviceEvent};
use crate::client::{ClientId, DeliverOutcome, DeliveryMode, VirtualClient};
use crate::device::{DeviceAdapter, FrameSink};
use crate::error::{CameraError, Result};
use crate::sync::{Fence, Timeline};

/// Device stream lifecycle as seen by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// No frames are being produced
    Stopped,
    /// The device is producing frames
    Running,
    /// A stop was requested; waiting for the device to confirm
    Stopping,
}

struct BrokerState {
    clients: Vec<Weak<VirtualClient>>,
    master: Weak<VirtualClient>,
    tracker: FrameTracker,
    requests: RequestQueue,
    timelines: HashMap<ClientId, Timeline>,
    stream_phase: StreamPhase,
}

/// Multiplexes one capture device across many virtual clients
pub struct Broker {
    adapter: Arc<DeviceAdapter>,
    threshold_us: i64,
    state: Mutex<BrokerState>,
}

impl Broker {
    /// Create a broker over an opened device adapter
    pub fn new(adapter: Arc<DeviceAdapter>, config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            threshold_us: config.delivery_threshold.as_micros() as i64,
            state: Mutex::new(BrokerState {
                clients: Vec::new(),
                master: Weak::new(),
                tracker: FrameTracker::new(),
                requests: RequestQueue::new(),
                timelines: HashMap::new(),
                stream_phase: StreamPhase::Stopped,
            }),
        })
    }

    /// The device adapter this broker drives
    pub fn adapter(&self) -> &Arc<DeviceAdapter> {
        &self.adapter
    }

    /// Create a new virtual client bound to this broker.
    ///
    /// Grows the device buffer pool by the client's share; when the pool
    /// cannot be enlarged the attach fails and the partially-constructed
    /// client is released.
    pub fn attach_client(
        self: &Arc<Self>,
        mode: DeliveryMode,
        allowed_buffers: u32,
    ) -> Result<Arc<VirtualClient>> {
        let client = VirtualClient::new(Arc::clone(self), mode, allowed_buffers);

        let mut state = self.state.lock().unwrap();
        self.recompute_pool_locked(&mut state, allowed_buffers as i64)?;
        state.timelines.insert(client.id(), Timeline::new());
        state.clients.push(Arc::downgrade(&client));
        drop(state);

        tracing::info!(client = client.id().raw(), ?mode, allowed_buffers, "Attached client");
        Ok(client)
    }

    /// Remove a client from the broker.
    ///
    /// Cancels its pending requests (signalling their fences), destroys its
    /// timeline, releases mastership if it held it, and shrinks the buffer
    /// pool.
    pub fn detach_client(&self, id: ClientId) {
        let (master_released, observers) = {
            let mut state = self.state.lock().unwrap();
            state
                .clients
                .retain(|weak| weak.upgrade().is_some_and(|c| c.id() != id));
            state.requests.remove_client(id);
            if let Some(timeline) = state.timelines.remove(&id) {
                timeline.signal_all();
            }

            let master_released = match state.master.upgrade() {
                Some(master) if master.id() == id => {
                    state.master = Weak::new();
                    true
                }
                _ => false,
            };

            if let Err(error) = self.recompute_pool_locked(&mut state, 0) {
                tracing::warn!(%error, "Failed to shrink the buffer pool after detach");
            }

            let observers = if master_released {
                snapshot_clients(&state)
            } else {
                Vec::new()
            };
            (master_released, observers)
        };

        if master_released {
            broadcast(&observers, CameraEvent::MasterReleased);
        }
        tracing::info!(client = id.raw(), "Detached client");
    }

    /// Start the device stream if it is not already up. Idempotent across
    /// clients.
    pub fn on_client_starting(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match state.stream_phase {
                StreamPhase::Running | StreamPhase::Stopping => return Ok(()),
                StreamPhase::Stopped => state.stream_phase = StreamPhase::Running,
            }
        }

        let sink: Arc<dyn FrameSink> = Arc::clone(self) as Arc<dyn FrameSink>;
        if let Err(error) = self.adapter.start_stream(sink) {
            self.state.lock().unwrap().stream_phase = StreamPhase::Stopped;
            tracing::error!(%error, "Underlying camera stream failed to start");
            return Err(match error {
                CameraError::OwnershipLost => CameraError::OwnershipLost,
                _ => CameraError::UnderlyingServiceError,
            });
        }
        Ok(())
    }

    /// A client stopped streaming.
    ///
    /// Cancels its pending requests and, when no attached client is still
    /// streaming, asks the device to stop. The broker enters `Stopped` only
    /// when the device confirms with its stream-stopped event.
    pub fn on_client_ending(&self, id: ClientId) {
        let stop_device = {
            let mut state = self.state.lock().unwrap();
            if state.requests.remove_client(id) > 0 {
                if let Some(timeline) = state.timelines.get(&id) {
                    timeline.signal_all();
                }
            }

            let still_streaming = state
                .clients
                .iter()
                .filter_map(Weak::upgrade)
                .any(|client| client.id() != id && client.is_streaming());

            if !still_streaming && state.stream_phase == StreamPhase::Running {
                state.stream_phase = StreamPhase::Stopping;
                true
            } else {
                false
            }
        };

        if stop_device {
            tracing::info!("Last streaming client ended, stopping the device");
            self.adapter.stop_stream();
        }
    }

    /// Register a paced frame request.
    ///
    /// The returned fence signals when a frame is delivered to the client or
    /// when the request is cancelled.
    pub(crate) fn request_frame(
        &self,
        client: &Arc<VirtualClient>,
        last_timestamp_us: i64,
    ) -> Fence {
        let mut state = self.state.lock().unwrap();
        let timeline = match state.timelines.get(&client.id()) {
            Some(timeline) => timeline.clone(),
            None => {
                tracing::warn!(client = client.id().raw(), "Frame request from a detached client");
                let timeline = Timeline::new();
                let fence = timeline.create_fence();
                timeline.signal_all();
                return fence;
            }
        };

        let fence = timeline.create_fence();
        if client.delivery_mode() == DeliveryMode::Continuous {
            // Unpaced clients get every frame anyway; don't gate them
            tracing::warn!(client = client.id().raw(), "Ignoring frame request from an unpaced client");
            timeline.signal_all();
            return fence;
        }

        state.requests.push(FrameRequest {
            client: Arc::downgrade(client),
            last_timestamp_us,
        });
        fence
    }

    /// A client finished with a frame; on the last reference the buffer goes
    /// back to the device. Unknown ids are logged and ignored.
    pub(crate) fn return_frame(&self, buffer_id: u32) {
        let mut state = self.state.lock().unwrap();
        if state.tracker.decrement(buffer_id) == Decrement::ReturnToDevice {
            tracing::debug!(buffer_id, "Returning frame to the device");
            self.adapter.mark_frame_consumed(buffer_id);
        }
    }

    // ── Mastership ────────────────────────────────────────────────

    /// Claim the master role; fails if another client holds it
    pub(crate) fn set_master(&self, client: &Arc<VirtualClient>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.master.upgrade() {
            Some(_) => {
                tracing::debug!("This camera already has a master client");
                Err(CameraError::OwnershipLost)
            }
            None => {
                tracing::debug!(client = client.id().raw(), "Client becomes master");
                state.master = Arc::downgrade(client);
                Ok(())
            }
        }
    }

    /// Take the master role unconditionally, notifying the displaced owner
    pub(crate) fn force_master(&self, client: &Arc<VirtualClient>) -> Result<()> {
        let displaced = {
            let mut state = self.state.lock().unwrap();
            let previous = state.master.upgrade();
            match previous {
                Some(ref prev) if prev.id() == client.id() => None,
                _ => {
                    state.master = Arc::downgrade(client);
                    previous
                }
            }
        };

        if let Some(previous) = displaced {
            tracing::debug!(
                new = client.id().raw(),
                previous = previous.id().raw(),
                "Master role taken over"
            );
            if !previous.notify_event(CameraEvent::MasterReleased) {
                tracing::error!("Failed to deliver the master role loss notification");
            }
        }
        Ok(())
    }

    /// Release the master role; only the current owner may do so
    pub(crate) fn unset_master(&self, id: ClientId) -> Result<()> {
        let observers = {
            let mut state = self.state.lock().unwrap();
            match state.master.upgrade() {
                Some(master) if master.id() == id => {
                    state.master = Weak::new();
                    snapshot_clients(&state)
                }
                _ => return Err(CameraError::InvalidArg),
            }
        };

        tracing::debug!(client = id.raw(), "Master role released");
        broadcast(&observers, CameraEvent::MasterReleased);
        Ok(())
    }

    /// Whether `id` currently holds the master role
    pub fn is_master(&self, id: ClientId) -> bool {
        let state = self.state.lock().unwrap();
        state.master.upgrade().map(|m| m.id()) == Some(id)
    }

    // ── Parameters ────────────────────────────────────────────────

    /// Write a camera parameter on behalf of `requester`.
    ///
    /// Only the master may write; everyone (master included) observes the
    /// change through a `ParameterChanged` event. Returns the value the
    /// device actually applied.
    pub(crate) fn set_parameter(
        &self,
        requester: ClientId,
        id: CameraParam,
        value: i32,
    ) -> Result<i32> {
        let (applied, observers) = {
            let state = self.state.lock().unwrap();
            if state.master.upgrade().map(|m| m.id()) != Some(requester) {
                tracing::debug!(
                    client = requester.raw(),
                    "Parameter change from a non-master client declined"
                );
                return Err(CameraError::OwnershipLost);
            }
            let applied = self.adapter.set_parameter(id, value)?;
            (applied, snapshot_clients(&state))
        };

        broadcast(&observers, CameraEvent::ParameterChanged { id, value: applied });
        Ok(applied)
    }

    /// Read a camera parameter; permitted for any client
    pub fn get_parameter(&self, id: CameraParam) -> Result<i32> {
        self.adapter.get_parameter(id)
    }

    /// `(min, max, step)` for a camera parameter
    pub fn parameter_range(&self, id: CameraParam) -> Result<(i32, i32, i32)> {
        self.adapter.parameter_range(id)
    }

    /// Parameters the device supports
    pub fn parameter_list(&self) -> Result<Vec<CameraParam>> {
        self.adapter.parameter_list()
    }

    // ── Introspection ─────────────────────────────────────────────

    /// Current device stream phase
    pub fn stream_phase(&self) -> StreamPhase {
        self.state.lock().unwrap().stream_phase
    }

    /// Attached clients that are still alive
    pub fn client_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.clients.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Requests waiting across both delivery cycles
    pub fn pending_requests(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    /// Frames currently referenced by at least one client
    pub fn live_frames(&self) -> usize {
        self.state.lock().unwrap().tracker.live_count()
    }

    /// Reference count of a live frame
    pub fn frame_ref_count(&self, buffer_id: u32) -> Option<u32> {
        self.state.lock().unwrap().tracker.ref_count(buffer_id)
    }

    // ── Internal ──────────────────────────────────────────────────

    // Pool size is the sum of every live client's share plus `delta`,
    // clamped to at least one buffer. Succeeds iff the device agrees; no
    // client state is touched on failure.
    fn recompute_pool_locked(&self, state: &mut BrokerState, delta: i64) -> Result<()> {
        let mut buffer_count = delta;
        for client in state.clients.iter().filter_map(Weak::upgrade) {
            buffer_count += i64::from(client.allowed_buffers());
        }
        let buffer_count = buffer_count.max(1) as u32;

        self.adapter.set_max_frames_in_flight(buffer_count)?;
        state.tracker.resize(buffer_count as usize);
        Ok(())
    }

    // Handles a frame a client bounced out of its ready slot: one reference
    // drops, and the buffer goes home if that was the last one.
    fn drop_evicted_locked(&self, state: &mut BrokerState, evicted: BufferDesc) {
        if state.tracker.decrement(evicted.buffer_id) == Decrement::ReturnToDevice {
            tracing::debug!(buffer_id = evicted.buffer_id, "Returning replaced frame to the device");
            self.adapter.mark_frame_consumed(evicted.buffer_id);
        }
    }
}

impl FrameSink for Broker {
    // The hot path: runs on the device producer thread for every captured
    // frame.
    fn deliver_frame(&self, frame: BufferDesc) {
        let mut dropped_notices: Vec<Arc<VirtualClient>> = Vec::new();

        {
            let mut state = self.state.lock().unwrap();
            let mut accept_count = 0u32;

            // Paced clients: serve the snapshot of requests for this cycle;
            // new requests accumulate separately.
            state.requests.swap_cycles();
            while let Some(request) = state.requests.pop_current() {
                let client = match request.client.upgrade() {
                    Some(client) => client,
                    // A client that died before delivery is dropped silently
                    None => continue,
                };

                if frame.timestamp_us - request.last_timestamp_us < self.threshold_us {
                    // Frame arrives too soon for this client; hold the
                    // request for the next cycle unchanged.
                    tracing::debug!(
                        client = client.id().raw(),
                        timestamp_us = frame.timestamp_us,
                        "Skipping a frame that arrived too soon"
                    );
                    state.requests.defer(request);
                    continue;
                }

                match client.deliver_frame(frame.clone()) {
                    DeliverOutcome::Accepted { evicted } => {
                        if let Some(evicted) = evicted {
                            self.drop_evicted_locked(&mut state, evicted);
                            dropped_notices.push(Arc::clone(&client));
                        }
                        if let Some(timeline) = state.timelines.get(&client.id()) {
                            timeline.signal();
                        }
                        accept_count += 1;
                    }
                    DeliverOutcome::Refused => {}
                }
            }

            // Unpaced clients receive every frame
            let continuous: Vec<Arc<VirtualClient>> = state
                .clients
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|client| client.delivery_mode() == DeliveryMode::Continuous)
                .collect();
            for client in continuous {
                match client.deliver_frame(frame.clone()) {
                    DeliverOutcome::Accepted { evicted } => {
                        if let Some(evicted) = evicted {
                            self.drop_evicted_locked(&mut state, evicted);
                            dropped_notices.push(client);
                        }
                        accept_count += 1;
                    }
                    DeliverOutcome::Refused => {}
                }
            }

            if accept_count == 0 {
                // Nobody took it; hand it straight back
                tracing::debug!(
                    buffer_id = frame.buffer_id,
                    "Rejecting frame with no acceptance"
                );
                self.adapter.mark_frame_consumed(frame.buffer_id);
            } else {
                state.tracker.register(frame.buffer_id, accept_count);
            }
        }

        // Listener callbacks happen outside the broker lock
        for client in dropped_notices {
            if !client.notify_event(CameraEvent::FrameDropped) {
                tracing::info!("Failed to forward a frame-dropped event");
            }
        }
    }

    fn notify(&self, event: DeviceEvent) {
        let decoded = match CameraEvent::from_device(&event) {
            Some(decoded) => decoded,
            None => {
                tracing::warn!(code = event.code, "Dropping unknown device event");
                return;
            }
        };

        let observers = {
            let mut state = self.state.lock().unwrap();
            if decoded == CameraEvent::StreamStopped {
                // This event arrives once there is no more active producer
                if state.stream_phase != StreamPhase::Stopping {
                    tracing::warn!("Stream stopped unexpectedly");
                }
                state.stream_phase = StreamPhase::Stopped;
            }
            snapshot_clients(&state)
        };

        broadcast(&observers, decoded);
    }
}

fn snapshot_clients(state: &BrokerState) -> Vec<Arc<VirtualClient>> {
    state.clients.iter().filter_map(Weak::upgrade).collect()
}

fn broadcast(clients: &[Arc<VirtualClient>], event: CameraEvent) {
    for client in clients {
        if !client.notify_event(event) {
            tracing::info!(client = client.id().raw(), "Failed to forward an event");
        }
    }
}
