//! Capture driver contract
//!
//! The raw capture layer (V4L2-style ioctls, vendor SDKs) sits behind this
//! trait. Implementations carry their own interior synchronization: control
//! calls arrive from arbitrary threads while the adapter's producer thread
//! blocks inside [`VideoSource::dequeue_frame`].

use bytes::Bytes;

use crate::buffer::{CameraParam, FourCc};
use crate::error::Result;

/// One captured image as handed over by the driver
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Raw pixel bytes in the source fourcc layout
    pub data: Bytes,
    /// Driver capture timestamp in microseconds
    pub timestamp_us: i64,
    /// Monotonic capture sequence number
    pub sequence: u64,
}

/// The capture driver abstraction consumed by the device adapter
pub trait VideoSource: Send + Sync {
    /// Acquire the device and negotiate the capture geometry.
    ///
    /// Fails when the device cannot stream or the geometry is unsupported.
    fn open(&self, width: u32, height: u32) -> Result<()>;

    /// Release the device. The stream must be stopped first.
    fn close(&self);

    /// Whether the device is currently owned by this source
    fn is_open(&self) -> bool;

    /// Negotiated capture pixel layout
    fn source_format(&self) -> FourCc;

    /// Negotiated capture dimensions
    fn dimensions(&self) -> (u32, u32);

    /// Bytes per captured line
    fn stride(&self) -> u32;

    /// Begin producing frames
    fn start(&self) -> Result<()>;

    /// Stop producing frames and wake any blocked dequeue
    fn stop(&self);

    /// Block until the next captured frame is available.
    ///
    /// Returns `None` once the stream is stopping; the producer worker exits
    /// on that.
    fn dequeue_frame(&self) -> Option<RawFrame>;

    /// Re-queue the most recently dequeued capture buffer
    fn mark_frame_consumed(&self);

    /// Read a control parameter
    fn get_parameter(&self, id: CameraParam) -> Result<i32>;

    /// Program a control parameter; returns the value actually applied
    fn set_parameter(&self, id: CameraParam, value: i32) -> Result<i32>;

    /// `(min, max, step)` for a control parameter
    fn parameter_range(&self, id: CameraParam) -> Result<(i32, i32, i32)>;

    /// Controls this device supports
    fn parameter_list(&self) -> Vec<CameraParam>;
}
