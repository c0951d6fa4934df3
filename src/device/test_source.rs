//! Synthetic capture source for tests and hardware-free development
//!
//! Frames are injected by the test (or a pacing loop) rather than captured,
//! which gives scenarios full control over delivery timestamps. The source
//! also exposes a handful of failure knobs so the adapter's error paths can
//! be exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

use bytes::Bytes;

use crate::buffer::{CameraParam, FourCc};
use crate::device::source::{RawFrame, VideoSource};
use crate::error::{CameraError, Result};

#[derive(Debug, Clone, Copy)]
struct ParamState {
    value: i32,
    min: i32,
    max: i32,
    step: i32,
}

struct SourceState {
    open: bool,
    streaming: bool,
    width: u32,
    height: u32,
    queue: VecDeque<RawFrame>,
    sequence: u64,
    consumed: u64,
    stops: u64,
    params: HashMap<CameraParam, ParamState>,
    fail_start: bool,
}

/// A scripted in-memory capture source
pub struct TestSource {
    format: FourCc,
    state: Mutex<SourceState>,
    frame_ready: Condvar,
}

impl TestSource {
    /// A YUYV source with the given native geometry
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_format(FourCc::YUYV, width, height)
    }

    /// A source producing the given fourcc
    pub fn with_format(format: FourCc, width: u32, height: u32) -> Self {
        let params = CameraParam::ALL
            .iter()
            .map(|&id| {
                (
                    id,
                    ParamState {
                        value: 128,
                        min: 0,
                        max: 255,
                        step: 1,
                    },
                )
            })
            .collect();

        Self {
            format,
            state: Mutex::new(SourceState {
                open: false,
                streaming: false,
                width,
                height,
                queue: VecDeque::new(),
                sequence: 0,
                consumed: 0,
                stops: 0,
                params,
                fail_start: false,
            }),
            frame_ready: Condvar::new(),
        }
    }

    fn bytes_per_line(&self, width: u32) -> u32 {
        match self.format {
            FourCc::NV21 => width,
            _ => width * 2,
        }
    }

    fn frame_size(&self, width: u32, height: u32) -> usize {
        match self.format {
            FourCc::NV21 => (width * height + width * height / 2) as usize,
            _ => (width * height * 2) as usize,
        }
    }

    /// Queue one synthetic frame with the given capture timestamp
    pub fn inject_frame(&self, timestamp_us: i64) {
        let mut state = self.state.lock().unwrap();
        state.sequence += 1;
        let size = self.frame_size(state.width, state.height);
        let frame = RawFrame {
            data: Bytes::from(vec![(state.sequence & 0x7F) as u8 + 0x10; size]),
            timestamp_us,
            sequence: state.sequence,
        };
        state.queue.push_back(frame);
        self.frame_ready.notify_all();
    }

    /// Number of driver buffers re-queued so far
    pub fn consumed_frames(&self) -> u64 {
        self.state.lock().unwrap().consumed
    }

    /// Injected frames not yet dequeued
    pub fn pending_frames(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// How many times the stream has been stopped
    pub fn stop_count(&self) -> u64 {
        self.state.lock().unwrap().stops
    }

    /// Make the next `start` call fail
    pub fn set_start_failure(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    /// Simulate losing the device to another owner
    pub fn simulate_loss(&self) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.streaming = false;
        self.frame_ready.notify_all();
    }
}

impl VideoSource for TestSource {
    fn open(&self, width: u32, height: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if width == 0 || height == 0 {
            return Err(CameraError::InvalidArg);
        }
        state.width = width;
        state.height = height;
        state.open = true;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.queue.clear();
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn source_format(&self) -> FourCc {
        self.format
    }

    fn dimensions(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap();
        (state.width, state.height)
    }

    fn stride(&self) -> u32 {
        let state = self.state.lock().unwrap();
        self.bytes_per_line(state.width)
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(CameraError::OwnershipLost);
        }
        if state.fail_start {
            return Err(CameraError::UnderlyingServiceError);
        }
        state.streaming = true;
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.streaming {
            state.stops += 1;
        }
        state.streaming = false;
        state.queue.clear();
        self.frame_ready.notify_all();
    }

    fn dequeue_frame(&self) -> Option<RawFrame> {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.streaming {
                return None;
            }
            if let Some(frame) = state.queue.pop_front() {
                return Some(frame);
            }
            state = self.frame_ready.wait(state).unwrap();
        }
    }

    fn mark_frame_consumed(&self) {
        self.state.lock().unwrap().consumed += 1;
    }

    fn get_parameter(&self, id: CameraParam) -> Result<i32> {
        let state = self.state.lock().unwrap();
        state
            .params
            .get(&id)
            .map(|p| p.value)
            .ok_or(CameraError::InvalidArg)
    }

    fn set_parameter(&self, id: CameraParam, value: i32) -> Result<i32> {
        let mut state = self.state.lock().unwrap();
        let param = state.params.get_mut(&id).ok_or(CameraError::InvalidArg)?;
        // The driver clamps rather than rejects out-of-range values
        param.value = value.clamp(param.min, param.max);
        Ok(param.value)
    }

    fn parameter_range(&self, id: CameraParam) -> Result<(i32, i32, i32)> {
        let state = self.state.lock().unwrap();
        state
            .params
            .get(&id)
            .map(|p| (p.min, p.max, p.step))
            .ok_or(CameraError::InvalidArg)
    }

    fn parameter_list(&self) -> Vec<CameraParam> {
        CameraParam::ALL.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_dequeue_blocks_until_injection() {
        let source = Arc::new(TestSource::new(4, 2));
        source.open(4, 2).unwrap();
        source.start().unwrap();

        let worker = {
            let source = Arc::clone(&source);
            std::thread::spawn(move || source.dequeue_frame())
        };

        std::thread::sleep(Duration::from_millis(10));
        source.inject_frame(123);

        let frame = worker.join().unwrap().expect("expected a frame");
        assert_eq!(frame.timestamp_us, 123);
        assert_eq!(frame.data.len(), 4 * 2 * 2);
    }

    #[test]
    fn test_stop_wakes_blocked_dequeue() {
        let source = Arc::new(TestSource::new(4, 2));
        source.open(4, 2).unwrap();
        source.start().unwrap();

        let worker = {
            let source = Arc::clone(&source);
            std::thread::spawn(move || source.dequeue_frame())
        };

        std::thread::sleep(Duration::from_millis(10));
        source.stop();
        assert!(worker.join().unwrap().is_none());
    }

    #[test]
    fn test_parameters_clamp_to_range() {
        let source = TestSource::new(4, 2);
        source.open(4, 2).unwrap();

        assert_eq!(source.set_parameter(CameraParam::Brightness, 300), Ok(255));
        assert_eq!(source.get_parameter(CameraParam::Brightness), Ok(255));
        assert_eq!(
            source.parameter_range(CameraParam::Contrast),
            Ok((0, 255, 1))
        );
        assert_eq!(source.parameter_list().len(), CameraParam::ALL.len());
    }

    #[test]
    fn test_open_rejects_degenerate_geometry() {
        let source = TestSource::new(4, 2);
        assert_eq!(source.open(0, 480), Err(CameraError::InvalidArg));
    }
}
