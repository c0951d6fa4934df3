//! Device adapter: one capture device, one producer thread
//!
//! The adapter negotiates the capture format at open, owns the pool of
//! output buffers sized by `set_max_frames_in_flight`, and runs the producer
//! worker that converts each raw capture into a [`BufferDesc`] for the sink.
//!
//! Locking: the adapter lock is only ever held for short bookkeeping
//! sections. Pixel conversion and the sink callback run with the lock
//! released, and the sink is never invoked with the lock held.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::BytesMut;

use crate::buffer::{event_code, BufferDesc, DeviceEvent, FourCc, PixelFormat};
use crate::convert::{self, FillFunction};
use crate::device::source::{RawFrame, VideoSource};
use crate::error::{CameraError, Result};
use crate::stats::PoolStats;

/// Receiver for produced frames and device events.
///
/// Implemented by the broker. Callbacks arrive on the adapter's producer
/// thread (frames) or on the thread driving a stop (events).
pub trait FrameSink: Send + Sync {
    fn deliver_frame(&self, frame: BufferDesc);
    fn notify(&self, event: DeviceEvent);
}

/// Output configuration for a device adapter
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Requested capture width in pixels
    pub width: u32,

    /// Requested capture height in pixels
    pub height: u32,

    /// Output pixel format delivered to clients
    pub format: PixelFormat,

    /// Opaque usage flags stamped on every buffer descriptor
    pub usage: u64,

    /// Hard ceiling on the output buffer pool
    pub max_buffers: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: PixelFormat::Rgba8888,
            usage: 0,
            max_buffers: 100,
        }
    }
}

impl DeviceConfig {
    /// Set the capture geometry
    pub fn geometry(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the output pixel format
    pub fn format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Cap the output buffer pool
    pub fn max_buffers(mut self, max: u32) -> Self {
        self.max_buffers = max;
        self
    }
}

// Producer run mode bits, combined atomically so a stop request can overlap
// a running worker without taking the adapter lock.
const STOPPED: u32 = 0;
const RUN: u32 = 1;
const STOPPING: u32 = 2;

#[derive(Debug, Clone, Copy, Default)]
struct BufferSlot {
    allocated: bool,
    in_use: bool,
}

struct AdapterState {
    sink: Option<Arc<dyn FrameSink>>,
    fill: Option<FillFunction>,
    slots: Vec<BufferSlot>,
    frames_allowed: u32,
    frames_in_use: u32,
    frames_produced: u64,
    frames_returned: u64,
    frames_skipped: u64,
    worker: Option<JoinHandle<()>>,
}

/// Owns one capture device and produces frames for a single sink
pub struct DeviceAdapter {
    source: Arc<dyn VideoSource>,
    device_id: Arc<str>,
    config: DeviceConfig,
    width: u32,
    height: u32,
    run_mode: AtomicU32,
    state: Mutex<AdapterState>,
}

impl DeviceAdapter {
    /// Acquire the device and negotiate the capture format.
    ///
    /// Fails when the driver rejects the device or the requested geometry.
    pub fn open(
        device_id: impl Into<Arc<str>>,
        source: Arc<dyn VideoSource>,
        config: DeviceConfig,
    ) -> Result<Arc<Self>> {
        let device_id = device_id.into();
        source.open(config.width, config.height)?;
        let (width, height) = source.dimensions();

        tracing::info!(
            device = %device_id,
            width,
            height,
            source_format = %source.source_format(),
            output_format = %config.format,
            "Opened capture device"
        );

        Ok(Arc::new(Self {
            source,
            device_id,
            config,
            width,
            height,
            run_mode: AtomicU32::new(STOPPED),
            state: Mutex::new(AdapterState {
                sink: None,
                fill: None,
                slots: Vec::new(),
                frames_allowed: 0,
                frames_in_use: 0,
                frames_produced: 0,
                frames_returned: 0,
                frames_skipped: 0,
                worker: None,
            }),
        }))
    }

    /// Identifier of the underlying device
    pub fn device_id(&self) -> Arc<str> {
        Arc::clone(&self.device_id)
    }

    /// Negotiated capture dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Output pixel format
    pub fn output_format(&self) -> PixelFormat {
        self.config.format
    }

    /// Source pixel layout as negotiated by the driver
    pub fn source_format(&self) -> FourCc {
        self.source.source_format()
    }

    /// Snapshot of the buffer pool counters
    pub fn pool_stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            frames_allowed: state.frames_allowed,
            frames_in_use: state.frames_in_use,
            frames_produced: state.frames_produced,
            frames_returned: state.frames_returned,
            frames_skipped: state.frames_skipped,
        }
    }

    /// Resize the output buffer pool.
    ///
    /// Growth that cannot be satisfied in full is rolled back and reported
    /// as `BufferNotAvailable`; a shrink only releases buffers that are not
    /// currently in use.
    pub fn set_max_frames_in_flight(&self, buffer_count: u32) -> Result<()> {
        if !self.source.is_open() {
            tracing::warn!(device = %self.device_id, "Ignoring pool resize on a lost device");
            return Err(CameraError::OwnershipLost);
        }
        if buffer_count < 1 {
            tracing::error!("Ignoring pool resize to zero buffers");
            return Err(CameraError::InvalidArg);
        }

        let mut state = self.state.lock().unwrap();
        self.resize_pool_locked(&mut state, buffer_count)
    }

    fn resize_pool_locked(&self, state: &mut AdapterState, buffer_count: u32) -> Result<()> {
        if state.frames_allowed < buffer_count {
            let needed = buffer_count - state.frames_allowed;
            let added = self.grow_pool_locked(state, needed);
            if added != needed {
                tracing::error!(
                    requested = buffer_count,
                    added,
                    "Pool growth failed, rolling back"
                );
                self.shrink_pool_locked(state, added);
                return Err(CameraError::BufferNotAvailable);
            }
        } else if state.frames_allowed > buffer_count {
            let excess = state.frames_allowed - buffer_count;
            let released = self.shrink_pool_locked(state, excess);
            if released != excess {
                tracing::warn!(
                    requested = buffer_count,
                    released,
                    "Pool shrink left buffers in use"
                );
            }
        }

        tracing::debug!(frames_allowed = state.frames_allowed, "Buffer pool resized");
        Ok(())
    }

    fn grow_pool_locked(&self, state: &mut AdapterState, count: u32) -> u32 {
        let mut added = 0;
        while added < count {
            if state.frames_allowed >= self.config.max_buffers {
                tracing::error!(
                    limit = self.config.max_buffers,
                    "Buffer request exceeds the pool limit"
                );
                break;
            }

            match state.slots.iter_mut().find(|slot| !slot.allocated) {
                Some(slot) => {
                    slot.allocated = true;
                    slot.in_use = false;
                }
                None => state.slots.push(BufferSlot {
                    allocated: true,
                    in_use: false,
                }),
            }
            state.frames_allowed += 1;
            added += 1;
        }
        added
    }

    fn shrink_pool_locked(&self, state: &mut AdapterState, count: u32) -> u32 {
        let mut released = 0;
        for slot in state.slots.iter_mut() {
            if released == count {
                break;
            }
            if slot.allocated && !slot.in_use {
                slot.allocated = false;
                state.frames_allowed -= 1;
                released += 1;
            }
        }
        released
    }

    /// Begin producing frames into `sink`.
    ///
    /// Selects the pixel conversion for the negotiated formats; an
    /// unsupported pair is a fatal configuration error.
    pub fn start_stream(self: &Arc<Self>, sink: Arc<dyn FrameSink>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();

            if !self.source.is_open() {
                tracing::warn!(device = %self.device_id, "Ignoring stream start on a lost device");
                return Err(CameraError::OwnershipLost);
            }
            if state.sink.is_some() {
                tracing::error!(device = %self.device_id, "Ignoring stream start while running");
                return Err(CameraError::StreamAlreadyRunning);
            }

            // We cannot function without at least one output buffer
            if state.frames_allowed < 1 {
                self.resize_pool_locked(&mut state, 1)?;
            }

            let src = self.source.source_format();
            let fill = convert::select_fill(src, self.config.format).ok_or_else(|| {
                tracing::error!(
                    source = %src,
                    output = %self.config.format,
                    "No pixel conversion for this format pair"
                );
                CameraError::InvalidArg
            })?;

            let prev = self.run_mode.fetch_or(RUN, Ordering::SeqCst);
            if prev & RUN != 0 {
                tracing::error!("Producer already running, cannot start a new stream");
                return Err(CameraError::StreamAlreadyRunning);
            }

            if let Err(error) = self.source.start() {
                tracing::error!(%error, "Underlying capture start failed");
                self.run_mode.store(STOPPED, Ordering::SeqCst);
                return Err(CameraError::UnderlyingServiceError);
            }

            state.fill = Some(fill);
            state.sink = Some(Arc::clone(&sink));
        }

        sink.notify(DeviceEvent::new(event_code::STREAM_STARTED));

        let worker = {
            let adapter = Arc::clone(self);
            std::thread::spawn(move || adapter.collect_frames())
        };
        self.state.lock().unwrap().worker = Some(worker);

        tracing::info!(device = %self.device_id, "Capture stream started");
        Ok(())
    }

    /// Stop the producer and block until it has exited.
    ///
    /// Emits `STREAM_STOPPED` to the sink once the worker is down. Calling
    /// while already stopping is a logged error; calling while stopped is a
    /// no-op.
    pub fn stop_stream(&self) {
        let prev = self.run_mode.fetch_or(STOPPING, Ordering::SeqCst);
        if prev == STOPPED {
            self.run_mode.store(STOPPED, Ordering::SeqCst);
            return;
        }
        if prev & STOPPING != 0 {
            tracing::error!("stop_stream called while already stopping, re-entrancy unsupported");
            return;
        }

        // Wake the worker out of a blocking dequeue, then wait for it
        self.source.stop();
        let worker = self.state.lock().unwrap().worker.take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Capture worker panicked during shutdown");
            }
        }
        self.run_mode.store(STOPPED, Ordering::SeqCst);

        let sink = {
            let mut state = self.state.lock().unwrap();
            state.fill = None;
            state.sink.take()
        };
        if let Some(sink) = sink {
            sink.notify(DeviceEvent::new(event_code::STREAM_STOPPED));
        }

        tracing::info!(device = %self.device_id, "Capture stream stopped");
    }

    /// Return one output buffer to the pool
    pub fn mark_frame_consumed(&self, buffer_id: u32) {
        let mut state = self.state.lock().unwrap();
        let slot = match state.slots.get_mut(buffer_id as usize) {
            Some(slot) if slot.allocated => slot,
            _ => {
                tracing::error!(buffer_id, "Ignoring frame return with unknown buffer id");
                return;
            }
        };
        if !slot.in_use {
            tracing::error!(buffer_id, "Ignoring frame return for a buffer already free");
            return;
        }
        slot.in_use = false;
        state.frames_in_use -= 1;
        state.frames_returned += 1;
    }

    /// Read a control parameter
    pub fn get_parameter(&self, id: crate::buffer::CameraParam) -> Result<i32> {
        if !self.source.is_open() {
            return Err(CameraError::OwnershipLost);
        }
        self.source.get_parameter(id)
    }

    /// Program a control parameter; returns the value actually applied
    pub fn set_parameter(&self, id: crate::buffer::CameraParam, value: i32) -> Result<i32> {
        if !self.source.is_open() {
            return Err(CameraError::OwnershipLost);
        }
        self.source.set_parameter(id, value)
    }

    /// `(min, max, step)` of a control parameter
    pub fn parameter_range(&self, id: crate::buffer::CameraParam) -> Result<(i32, i32, i32)> {
        if !self.source.is_open() {
            return Err(CameraError::OwnershipLost);
        }
        self.source.parameter_range(id)
    }

    /// Controls supported by the device
    pub fn parameter_list(&self) -> Result<Vec<crate::buffer::CameraParam>> {
        if !self.source.is_open() {
            return Err(CameraError::OwnershipLost);
        }
        Ok(self.source.parameter_list())
    }

    /// Release the device. The stream must already be stopped.
    pub fn close(&self) {
        if self.run_mode.load(Ordering::SeqCst) != STOPPED {
            tracing::error!(device = %self.device_id, "Closing device while stream is active");
            self.stop_stream();
        }
        self.source.close();
        tracing::info!(device = %self.device_id, "Closed capture device");
    }

    fn collect_frames(self: Arc<Self>) {
        while self.run_mode.load(Ordering::SeqCst) == RUN {
            match self.source.dequeue_frame() {
                Some(raw) => self.forward_frame(raw),
                None => break,
            }
        }
        tracing::debug!(device = %self.device_id, "Capture worker ending");
    }

    // Claims a pool slot, converts the raw capture, and hands the result to
    // the sink. The raw driver buffer is re-queued before the sink callback
    // so the device can capture the next frame in the meantime.
    fn forward_frame(&self, raw: RawFrame) {
        let claimed = {
            let mut state = self.state.lock().unwrap();
            if state.sink.is_none() {
                None
            } else if state.frames_in_use >= state.frames_allowed {
                state.frames_skipped += 1;
                tracing::warn!("Skipped a frame because too many are in flight");
                None
            } else {
                match state
                    .slots
                    .iter()
                    .position(|slot| slot.allocated && !slot.in_use)
                {
                    Some(idx) => {
                        state.slots[idx].in_use = true;
                        state.frames_in_use += 1;
                        state.frames_produced += 1;
                        let sink = state.sink.clone();
                        let fill = state.fill;
                        sink.zip(fill).map(|(sink, fill)| (idx as u32, sink, fill))
                    }
                    None => {
                        tracing::error!("Failed to find an available buffer slot");
                        None
                    }
                }
            }
        };

        let (buffer_id, sink, fill) = match claimed {
            Some(claimed) => claimed,
            None => {
                self.source.mark_frame_consumed();
                return;
            }
        };

        let size = self.config.format.buffer_size(self.width, self.height);
        let mut pixels = BytesMut::zeroed(size);
        fill(
            &mut pixels,
            self.width,
            self.height,
            &raw.data,
            self.source.stride(),
        );

        let desc = BufferDesc {
            buffer_id,
            device_id: Arc::clone(&self.device_id),
            width: self.width,
            height: self.height,
            stride: self.config.format.bytes_per_line(self.width),
            format: self.config.format,
            usage: self.config.usage,
            timestamp_us: raw.timestamp_us,
            handle: Some(pixels.freeze()),
        };

        // Give the capture buffer back before the callback so the device has
        // more time to grab the next frame
        self.source.mark_frame_consumed();

        sink.deliver_frame(desc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CameraParam;
    use crate::device::test_source::TestSource;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        frames: StdMutex<Vec<BufferDesc>>,
        events: StdMutex<Vec<DeviceEvent>>,
    }

    impl FrameSink for RecordingSink {
        fn deliver_frame(&self, frame: BufferDesc) {
            self.frames.lock().unwrap().push(frame);
        }
        fn notify(&self, event: DeviceEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn open_adapter(source: &Arc<TestSource>, config: DeviceConfig) -> Arc<DeviceAdapter> {
        DeviceAdapter::open(
            "/dev/video9",
            Arc::clone(source) as Arc<dyn VideoSource>,
            config,
        )
        .unwrap()
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "timed out: {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_pool_resize_and_rollback() {
        let source = Arc::new(TestSource::new(8, 2));
        let adapter = open_adapter(&source, DeviceConfig::default().max_buffers(3));

        adapter.set_max_frames_in_flight(3).unwrap();
        assert_eq!(adapter.pool_stats().frames_allowed, 3);

        // Over the cap: rolled back to the previous size
        assert_eq!(
            adapter.set_max_frames_in_flight(4),
            Err(CameraError::BufferNotAvailable)
        );
        assert_eq!(adapter.pool_stats().frames_allowed, 3);

        adapter.set_max_frames_in_flight(1).unwrap();
        assert_eq!(adapter.pool_stats().frames_allowed, 1);

        assert_eq!(
            adapter.set_max_frames_in_flight(0),
            Err(CameraError::InvalidArg)
        );
    }

    #[test]
    fn test_stream_produces_converted_frames() {
        let source = Arc::new(TestSource::new(8, 2));
        let adapter = open_adapter(&source, DeviceConfig::default().geometry(8, 2));
        adapter.set_max_frames_in_flight(2).unwrap();

        let sink = Arc::new(RecordingSink::default());
        adapter.start_stream(sink.clone()).unwrap();

        source.inject_frame(1_000);
        wait_until("first frame", || !sink.frames.lock().unwrap().is_empty());

        adapter.stop_stream();

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.timestamp_us, 1_000);
        assert_eq!(frame.format, PixelFormat::Rgba8888);
        assert_eq!(
            frame.handle.as_ref().unwrap().len(),
            PixelFormat::Rgba8888.buffer_size(8, 2)
        );

        let events = sink.events.lock().unwrap();
        assert_eq!(events.first().map(|e| e.code), Some(event_code::STREAM_STARTED));
        assert_eq!(events.last().map(|e| e.code), Some(event_code::STREAM_STOPPED));

        // The raw capture buffer went back to the driver
        assert_eq!(source.consumed_frames(), 1);
    }

    #[test]
    fn test_pool_exhaustion_skips_frames() {
        let source = Arc::new(TestSource::new(8, 2));
        let adapter = open_adapter(&source, DeviceConfig::default().geometry(8, 2));
        adapter.set_max_frames_in_flight(1).unwrap();

        let sink = Arc::new(RecordingSink::default());
        adapter.start_stream(sink.clone()).unwrap();

        source.inject_frame(1_000);
        wait_until("first frame", || !sink.frames.lock().unwrap().is_empty());

        // The only buffer is still out; this capture must be skipped
        source.inject_frame(2_000);
        wait_until("skip recorded", || adapter.pool_stats().frames_skipped == 1);
        assert_eq!(sink.frames.lock().unwrap().len(), 1);

        // Returning the buffer lets production resume
        adapter.mark_frame_consumed(0);
        source.inject_frame(3_000);
        wait_until("second frame", || sink.frames.lock().unwrap().len() == 2);

        adapter.stop_stream();
    }

    #[test]
    fn test_mark_frame_consumed_validates_ids() {
        let source = Arc::new(TestSource::new(8, 2));
        let adapter = open_adapter(&source, DeviceConfig::default());
        adapter.set_max_frames_in_flight(2).unwrap();

        // Unknown id and double free are both ignored
        adapter.mark_frame_consumed(42);
        adapter.mark_frame_consumed(0);
        assert_eq!(adapter.pool_stats().frames_returned, 0);
    }

    #[test]
    fn test_start_rejected_while_running() {
        let source = Arc::new(TestSource::new(8, 2));
        let adapter = open_adapter(&source, DeviceConfig::default().geometry(8, 2));

        let sink = Arc::new(RecordingSink::default());
        adapter.start_stream(sink.clone()).unwrap();
        assert_eq!(
            adapter.start_stream(sink.clone()),
            Err(CameraError::StreamAlreadyRunning)
        );
        adapter.stop_stream();
    }

    #[test]
    fn test_start_failure_propagates() {
        let source = Arc::new(TestSource::new(8, 2));
        source.set_start_failure(true);
        let adapter = open_adapter(&source, DeviceConfig::default().geometry(8, 2));

        let sink = Arc::new(RecordingSink::default());
        assert_eq!(
            adapter.start_stream(sink),
            Err(CameraError::UnderlyingServiceError)
        );
    }

    #[test]
    fn test_lost_device_reports_ownership_lost() {
        let source = Arc::new(TestSource::new(8, 2));
        let adapter = open_adapter(&source, DeviceConfig::default().geometry(8, 2));
        source.simulate_loss();

        assert_eq!(
            adapter.set_max_frames_in_flight(2),
            Err(CameraError::OwnershipLost)
        );
        assert_eq!(
            adapter.get_parameter(CameraParam::Brightness),
            Err(CameraError::OwnershipLost)
        );
        let sink = Arc::new(RecordingSink::default());
        assert_eq!(adapter.start_stream(sink), Err(CameraError::OwnershipLost));
    }

    #[test]
    fn test_unsupported_conversion_is_fatal() {
        let source = Arc::new(TestSource::with_format(FourCc::NV21, 8, 2));
        let adapter = open_adapter(
            &source,
            DeviceConfig::default().geometry(8, 2).format(PixelFormat::Rgba8888),
        );

        let sink = Arc::new(RecordingSink::default());
        assert_eq!(adapter.start_stream(sink), Err(CameraError::InvalidArg));
    }
}
