//! # camshare
//!
//! A shared camera core for embedded video services: one physical capture
//! device, many independently-lifecycled clients.
//!
//! The [`broker::Broker`] sits between three concurrent actors with
//! incompatible preferences: a capture device that drops frames unless its
//! buffers come back quickly, consumers that hold frames for unpredictable
//! lengths of time and may die at any moment, and a control plane mutating
//! shared camera parameters. The crate guarantees that no buffer leaks, no
//! buffer is returned to the device twice, slow clients never block the
//! capture path, and the stream shuts down cleanly under partial failure.
//!
//! ## Structure
//!
//! - [`device`]: the adapter over one capture driver, producing frames on a
//!   dedicated worker thread
//! - [`broker`]: reference-counted fan-out, request pacing, mastership
//!   arbitration, stream lifecycle
//! - [`client`]: the per-subscriber slot pair and pull-style consumer API
//! - [`service`]: camera enumeration and session setup
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use camshare::{CameraService, StreamConfig, TestSource};
//!
//! let service = CameraService::new();
//! service.register_camera(
//!     "cam0",
//!     Arc::new(TestSource::new(64, 48)),
//!     vec![StreamConfig::with_geometry(64, 48)],
//! );
//!
//! let camera = service
//!     .open_camera("cam0", Some(StreamConfig::with_geometry(64, 48)))
//!     .unwrap();
//! camera.start_stream().unwrap();
//! // ... frames arrive via wait_for_frame / take_frame / release ...
//! camera.stop_stream_blocking();
//! service.close_camera(&camera);
//! ```

pub mod broker;
pub mod buffer;
pub mod client;
pub mod convert;
pub mod device;
pub mod error;
pub mod service;
pub mod stats;
pub mod sync;

pub use broker::{Broker, BrokerConfig, StreamPhase};
pub use buffer::{BufferDesc, CameraEvent, CameraParam, DeviceEvent, FourCc, PixelFormat};
pub use client::{ClientEventListener, ClientId, DeliveryMode, VirtualClient};
pub use device::{DeviceAdapter, DeviceConfig, FrameSink, TestSource, VideoSource};
pub use error::{CameraError, Result};
pub use service::{CameraDesc, CameraService, StreamConfig};
pub use stats::{ClientFrameStats, PoolStats};
pub use sync::{Fence, Timeline};
