//! Camera enumeration and session setup
//!
//! [`CameraService`] is the client-facing entry point: it knows which capture
//! devices exist, matches a requested stream configuration against what each
//! device supports, and hands out [`VirtualClient`] sessions. All clients
//! opened on the same camera id share one broker (and therefore one device
//! stream); the broker and device are torn down when the last client closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::broker::{Broker, BrokerConfig};
use crate::buffer::PixelFormat;
use crate::client::{DeliveryMode, VirtualClient};
use crate::device::{DeviceAdapter, DeviceConfig, VideoSource};
use crate::error::{CameraError, Result};

/// A requested or advertised stream configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Output pixel format
    pub format: PixelFormat,
    /// Nominal frame rate
    pub fps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: PixelFormat::Rgba8888,
            fps: 30,
        }
    }
}

impl StreamConfig {
    /// Configuration with the given geometry, default format and rate
    pub fn with_geometry(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Set the output pixel format
    pub fn format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the nominal frame rate
    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Description of one registered camera
#[derive(Debug, Clone)]
pub struct CameraDesc {
    /// Camera identifier, unique within the service
    pub id: String,
    /// Stream configurations the camera supports
    pub supported: Vec<StreamConfig>,
}

struct CameraEntry {
    source: Arc<dyn VideoSource>,
    supported: Vec<StreamConfig>,
    broker: Option<Arc<Broker>>,
    active_config: Option<StreamConfig>,
}

/// The camera enumeration and session service
pub struct CameraService {
    cameras: Mutex<HashMap<String, CameraEntry>>,
    broker_config: BrokerConfig,
}

impl Default for CameraService {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraService {
    /// An empty service with default broker tuning
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// An empty service with custom broker tuning
    pub fn with_config(broker_config: BrokerConfig) -> Self {
        Self {
            cameras: Mutex::new(HashMap::new()),
            broker_config,
        }
    }

    /// The process-wide service instance, created lazily
    pub fn global() -> Arc<CameraService> {
        static HOLDER: Lazy<Mutex<Option<Arc<CameraService>>>> = Lazy::new(|| Mutex::new(None));

        let mut holder = HOLDER.lock().unwrap();
        match holder.as_ref() {
            Some(service) => Arc::clone(service),
            None => {
                let service = Arc::new(CameraService::new());
                *holder = Some(Arc::clone(&service));
                service
            }
        }
    }

    /// Make a capture device available under `id`
    pub fn register_camera(
        &self,
        id: impl Into<String>,
        source: Arc<dyn VideoSource>,
        supported: Vec<StreamConfig>,
    ) {
        let id = id.into();
        let mut cameras = self.cameras.lock().unwrap();
        if cameras.contains_key(&id) {
            tracing::warn!(camera = %id, "Replacing an already registered camera");
        }
        tracing::info!(camera = %id, configs = supported.len(), "Registered camera");
        cameras.insert(
            id,
            CameraEntry {
                source,
                supported,
                broker: None,
                active_config: None,
            },
        );
    }

    /// Registered cameras and their supported configurations
    pub fn list_cameras(&self) -> Vec<CameraDesc> {
        let cameras = self.cameras.lock().unwrap();
        let mut list: Vec<CameraDesc> = cameras
            .iter()
            .map(|(id, entry)| CameraDesc {
                id: id.clone(),
                supported: entry.supported.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Open a paced session on a camera with a single-buffer share
    pub fn open_camera(
        &self,
        id: &str,
        config: Option<StreamConfig>,
    ) -> Result<Arc<VirtualClient>> {
        self.open_camera_with(id, config, DeliveryMode::Paced, 1)
    }

    /// Open a session with explicit delivery mode and buffer share.
    ///
    /// The first open on a camera decides the stream configuration; later
    /// opens join the running stream and a differing request is logged and
    /// ignored.
    pub fn open_camera_with(
        &self,
        id: &str,
        config: Option<StreamConfig>,
        mode: DeliveryMode,
        allowed_buffers: u32,
    ) -> Result<Arc<VirtualClient>> {
        let mut cameras = self.cameras.lock().unwrap();
        let entry = cameras.get_mut(id).ok_or(CameraError::InvalidArg)?;

        if let Some(broker) = entry.broker.clone() {
            if let (Some(active), Some(requested)) = (entry.active_config.as_ref(), config.as_ref())
            {
                if active != requested {
                    tracing::warn!(
                        camera = %id,
                        "Camera already streaming with a different configuration, joining it"
                    );
                }
            }
            return broker.attach_client(mode, allowed_buffers);
        }

        let chosen = select_stream_config(&entry.supported, config.as_ref());
        tracing::info!(
            camera = %id,
            width = chosen.width,
            height = chosen.height,
            format = %chosen.format,
            "Opening camera"
        );

        let adapter = DeviceAdapter::open(
            id,
            Arc::clone(&entry.source),
            DeviceConfig::default()
                .geometry(chosen.width, chosen.height)
                .format(chosen.format),
        )?;
        let broker = Broker::new(adapter, self.broker_config.clone());

        match broker.attach_client(mode, allowed_buffers) {
            Ok(client) => {
                entry.broker = Some(broker);
                entry.active_config = Some(chosen);
                Ok(client)
            }
            Err(error) => {
                broker.adapter().close();
                Err(error)
            }
        }
    }

    /// Close a session; tears the camera down when it was the last one
    pub fn close_camera(&self, client: &Arc<VirtualClient>) {
        client.shutdown();

        let mut cameras = self.cameras.lock().unwrap();
        for (id, entry) in cameras.iter_mut() {
            let matches = entry
                .broker
                .as_ref()
                .is_some_and(|broker| Arc::ptr_eq(broker, client.broker()));
            if matches && client.broker().client_count() == 0 {
                tracing::info!(camera = %id, "Last client closed, releasing the camera");
                client.broker().adapter().close();
                entry.broker = None;
                entry.active_config = None;
            }
        }
    }
}

/// Pick the stream configuration to run.
///
/// An exact geometry/format match wins; otherwise the largest-area supported
/// configuration with the requested format that fits within the requested
/// bounds; otherwise the 640x480 RGBA default.
fn select_stream_config(
    supported: &[StreamConfig],
    requested: Option<&StreamConfig>,
) -> StreamConfig {
    let requested = match requested {
        Some(requested) => requested,
        None => return StreamConfig::default(),
    };

    let exact = supported.iter().find(|cfg| {
        cfg.width == requested.width
            && cfg.height == requested.height
            && cfg.format == requested.format
    });
    if let Some(exact) = exact {
        return exact.clone();
    }

    supported
        .iter()
        .filter(|cfg| {
            cfg.format == requested.format
                && cfg.width <= requested.width
                && cfg.height <= requested.height
        })
        .max_by_key(|cfg| cfg.area())
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TestSource;

    fn configs() -> Vec<StreamConfig> {
        vec![
            StreamConfig::with_geometry(320, 240),
            StreamConfig::with_geometry(640, 480),
            StreamConfig::with_geometry(1280, 720),
            StreamConfig::with_geometry(1280, 720).format(PixelFormat::YCbCr422I),
        ]
    }

    #[test]
    fn test_select_exact_match() {
        let requested = StreamConfig::with_geometry(1280, 720);
        assert_eq!(
            select_stream_config(&configs(), Some(&requested)),
            StreamConfig::with_geometry(1280, 720)
        );
    }

    #[test]
    fn test_select_largest_fit() {
        // 1000x600 has no exact match; 640x480 is the largest RGBA fit
        let requested = StreamConfig::with_geometry(1000, 600);
        assert_eq!(
            select_stream_config(&configs(), Some(&requested)),
            StreamConfig::with_geometry(640, 480)
        );
    }

    #[test]
    fn test_select_respects_format() {
        let requested = StreamConfig::with_geometry(1280, 720).format(PixelFormat::YCbCr422I);
        let chosen = select_stream_config(&configs(), Some(&requested));
        assert_eq!(chosen.format, PixelFormat::YCbCr422I);
    }

    #[test]
    fn test_select_falls_back_to_default() {
        // Nothing fits inside 100x100: fall back to the default
        let requested = StreamConfig::with_geometry(100, 100);
        assert_eq!(
            select_stream_config(&configs(), Some(&requested)),
            StreamConfig::default()
        );

        assert_eq!(select_stream_config(&configs(), None), StreamConfig::default());
    }

    #[test]
    fn test_open_unknown_camera() {
        let service = CameraService::new();
        assert_eq!(
            service.open_camera("nope", None).err(),
            Some(CameraError::InvalidArg)
        );
    }

    #[test]
    fn test_list_cameras_sorted() {
        let service = CameraService::new();
        service.register_camera("cam-b", Arc::new(TestSource::new(8, 2)), configs());
        service.register_camera("cam-a", Arc::new(TestSource::new(8, 2)), configs());

        let listed = service.list_cameras();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "cam-a");
        assert_eq!(listed[1].id, "cam-b");
    }

    #[test]
    fn test_clients_share_one_broker() {
        let service = CameraService::new();
        service.register_camera("cam0", Arc::new(TestSource::new(8, 2)), configs());

        let first = service.open_camera("cam0", None).unwrap();
        let second = service.open_camera("cam0", None).unwrap();
        assert!(Arc::ptr_eq(first.broker(), second.broker()));
        assert_eq!(first.broker().client_count(), 2);

        service.close_camera(&second);
        assert_eq!(first.broker().client_count(), 1);

        service.close_camera(&first);
        // The camera is released and can be opened again
        let third = service.open_camera("cam0", None).unwrap();
        assert_eq!(third.broker().client_count(), 1);
        service.close_camera(&third);
    }

    #[test]
    fn test_global_returns_one_instance() {
        let a = CameraService::global();
        let b = CameraService::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
