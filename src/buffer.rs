//! Buffer descriptors, pixel formats, parameters, and events
//!
//! This module defines the types that travel between the device adapter, the
//! broker, and the virtual clients. A [`BufferDesc`] is cheap to clone: the
//! pixel memory is `bytes::Bytes`, so fanning a frame out to many clients
//! only bumps a reference count.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::CameraError;

/// A four-character code identifying a capture-side pixel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// Packed 4:2:2 YUV, Y0 Cb Y1 Cr byte order
    pub const YUYV: FourCc = FourCc(*b"YUYV");
    /// Packed 4:2:2 YUV, Cb Y0 Cr Y1 byte order
    pub const UYVY: FourCc = FourCc(*b"UYVY");
    /// Semi-planar 4:2:0 YUV with a VU-interleaved chroma plane
    pub const NV21: FourCc = FourCc(*b"NV21");
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "\\x{:02x}", byte)?;
            }
        }
        Ok(())
    }
}

/// Client-facing output pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 32-bit RGBA, 8 bits per channel
    Rgba8888,
    /// Interleaved 4:2:2 YCbCr (YUYV byte order)
    YCbCr422I,
    /// Semi-planar 4:2:0 YCrCb (NV21 layout)
    YCrCb420Sp,
}

impl PixelFormat {
    /// Bytes per output line for the given width in pixels.
    ///
    /// For the semi-planar format this is the luma line; the chroma plane is
    /// accounted for by [`PixelFormat::buffer_size`].
    pub fn bytes_per_line(&self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgba8888 => width * 4,
            PixelFormat::YCbCr422I => width * 2,
            PixelFormat::YCrCb420Sp => width,
        }
    }

    /// Total output buffer size in bytes for the given dimensions
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        match self {
            PixelFormat::Rgba8888 => (width * height * 4) as usize,
            PixelFormat::YCbCr422I => (width * height * 2) as usize,
            // Full-size luma plane plus a half-height interleaved chroma plane
            PixelFormat::YCrCb420Sp => (width * height + width * height / 2) as usize,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Rgba8888 => "RGBA8888",
            PixelFormat::YCbCr422I => "YCBCR_422_I",
            PixelFormat::YCrCb420Sp => "YCRCB_420_SP",
        };
        f.write_str(name)
    }
}

/// Descriptor for one capture buffer in flight
///
/// Identity is the pair `(device_id, buffer_id)`; `buffer_id` is assigned by
/// the device adapter and is stable across deliveries of the same underlying
/// buffer. A descriptor with `handle == None` is the end-of-stream marker
/// used on the legacy delivery path.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    /// Adapter-assigned buffer identifier
    pub buffer_id: u32,

    /// Identifier of the producing device
    pub device_id: Arc<str>,

    /// Image width in pixels
    pub width: u32,

    /// Image height in pixels
    pub height: u32,

    /// Bytes per line of the output image
    pub stride: u32,

    /// Output pixel format
    pub format: PixelFormat,

    /// Opaque usage flags
    pub usage: u64,

    /// Capture timestamp in microseconds
    pub timestamp_us: i64,

    /// Pixel memory; `None` signals end of stream
    pub handle: Option<Bytes>,
}

impl BufferDesc {
    /// The end-of-stream marker for the legacy delivery path
    pub fn end_of_stream(device_id: Arc<str>) -> Self {
        Self {
            buffer_id: 0,
            device_id,
            width: 0,
            height: 0,
            stride: 0,
            format: PixelFormat::Rgba8888,
            usage: 0,
            timestamp_us: 0,
            handle: None,
        }
    }

    /// Whether this descriptor is the end-of-stream marker
    pub fn is_end_of_stream(&self) -> bool {
        self.handle.is_none()
    }
}

/// The closed set of camera control parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraParam {
    Brightness,
    Contrast,
    AutoWhiteBalance,
    WhiteBalanceTemperature,
    Sharpness,
    AutoExposure,
    AbsoluteExposure,
    AutoFocus,
    AbsoluteFocus,
    AbsoluteZoom,
}

impl CameraParam {
    /// All known parameters, in wire order
    pub const ALL: [CameraParam; 10] = [
        CameraParam::Brightness,
        CameraParam::Contrast,
        CameraParam::AutoWhiteBalance,
        CameraParam::WhiteBalanceTemperature,
        CameraParam::Sharpness,
        CameraParam::AutoExposure,
        CameraParam::AbsoluteExposure,
        CameraParam::AutoFocus,
        CameraParam::AbsoluteFocus,
        CameraParam::AbsoluteZoom,
    ];

    /// Wire identifier of the parameter
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

impl TryFrom<u32> for CameraParam {
    type Error = CameraError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(CameraError::InvalidArg)
    }
}

/// Raw event codes on the device delivery path
pub mod event_code {
    pub const STREAM_STARTED: u32 = 0;
    pub const STREAM_STOPPED: u32 = 1;
    pub const FRAME_DROPPED: u32 = 2;
    pub const TIMEOUT: u32 = 3;
    pub const PARAMETER_CHANGED: u32 = 4;
    pub const MASTER_RELEASED: u32 = 5;
}

/// A raw event as emitted by the device adapter
///
/// The broker decodes these into [`CameraEvent`]s; unknown codes are logged
/// and dropped there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEvent {
    /// Event code (see [`event_code`])
    pub code: u32,
    /// Event payload; meaning depends on the code
    pub payload: [i32; 2],
}

impl DeviceEvent {
    pub fn new(code: u32) -> Self {
        Self { code, payload: [0; 2] }
    }
}

/// Events delivered to a virtual client's listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraEvent {
    /// The device stream started producing frames
    StreamStarted,
    /// The device stream stopped; no further frames will arrive
    StreamStopped,
    /// A frame addressed to this client was dropped before it was consumed
    FrameDropped,
    /// The device failed to produce a frame in time
    Timeout,
    /// The master changed a camera parameter
    ParameterChanged { id: CameraParam, value: i32 },
    /// The master role was released and is available to claim
    MasterReleased,
}

impl CameraEvent {
    /// Decode a raw device event; `None` for unrecognized codes
    pub fn from_device(event: &DeviceEvent) -> Option<CameraEvent> {
        match event.code {
            event_code::STREAM_STARTED => Some(CameraEvent::StreamStarted),
            event_code::STREAM_STOPPED => Some(CameraEvent::StreamStopped),
            event_code::FRAME_DROPPED => Some(CameraEvent::FrameDropped),
            event_code::TIMEOUT => Some(CameraEvent::Timeout),
            event_code::PARAMETER_CHANGED => {
                let id = CameraParam::try_from(event.payload[0] as u32).ok()?;
                Some(CameraEvent::ParameterChanged {
                    id,
                    value: event.payload[1],
                })
            }
            event_code::MASTER_RELEASED => Some(CameraEvent::MasterReleased),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_display() {
        assert_eq!(FourCc::YUYV.to_string(), "YUYV");
        assert_eq!(FourCc::NV21.to_string(), "NV21");
    }

    #[test]
    fn test_pixel_format_sizes() {
        assert_eq!(PixelFormat::Rgba8888.buffer_size(640, 480), 640 * 480 * 4);
        assert_eq!(PixelFormat::YCbCr422I.buffer_size(640, 480), 640 * 480 * 2);
        // 4:2:0 semi-planar carries half a frame of chroma
        assert_eq!(
            PixelFormat::YCrCb420Sp.buffer_size(640, 480),
            640 * 480 * 3 / 2
        );
    }

    #[test]
    fn test_param_round_trip() {
        for param in CameraParam::ALL {
            assert_eq!(CameraParam::try_from(param.as_u32()), Ok(param));
        }
    }

    #[test]
    fn test_param_unknown_id_rejected() {
        assert_eq!(CameraParam::try_from(10), Err(CameraError::InvalidArg));
        assert_eq!(CameraParam::try_from(u32::MAX), Err(CameraError::InvalidArg));
    }

    #[test]
    fn test_end_of_stream_marker() {
        let desc = BufferDesc::end_of_stream(Arc::from("cam0"));
        assert!(desc.is_end_of_stream());
        assert!(desc.handle.is_none());
    }

    #[test]
    fn test_event_decoding() {
        let ev = DeviceEvent::new(event_code::STREAM_STOPPED);
        assert_eq!(CameraEvent::from_device(&ev), Some(CameraEvent::StreamStopped));

        let ev = DeviceEvent {
            code: event_code::PARAMETER_CHANGED,
            payload: [CameraParam::Brightness.as_u32() as i32, 42],
        };
        assert_eq!(
            CameraEvent::from_device(&ev),
            Some(CameraEvent::ParameterChanged {
                id: CameraParam::Brightness,
                value: 42
            })
        );
    }

    #[test]
    fn test_event_unknown_code() {
        let ev = DeviceEvent::new(0xDEAD);
        assert_eq!(CameraEvent::from_device(&ev), None);
    }

    #[test]
    fn test_event_parameter_changed_bad_id() {
        let ev = DeviceEvent {
            code: event_code::PARAMETER_CHANGED,
            payload: [99, 1],
        };
        assert_eq!(CameraEvent::from_device(&ev), None);
    }
}
