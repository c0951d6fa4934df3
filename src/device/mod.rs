//! Device ownership and frame production
//!
//! [`DeviceAdapter`] wraps one capture driver behind the [`VideoSource`]
//! contract. It owns the producer worker thread and the adapter-side buffer
//! pool; captured frames are converted into client-visible buffers and handed
//! to a single [`FrameSink`] (the broker). The adapter knows nothing about
//! clients.

pub mod adapter;
pub mod source;
pub mod test_source;

pub use adapter::{DeviceAdapter, DeviceConfig, FrameSink};
pub use source::{RawFrame, VideoSource};
pub use test_source::TestSource;
