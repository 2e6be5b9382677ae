//! Flat device-state records
//!
//! One record per device class. Each record sits behind its own
//! `parking_lot::RwLock`: the router is the only writer, callers read
//! snapshots. The camera image is held as [`Bytes`]; installing a new image
//! drops the previous one.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::BusSettings;

/// Camera activity as seen from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CameraState {
    /// Ready for an exposure.
    Idle,
    /// Exposure in progress.
    Exposing,
    /// Image being transferred.
    Downloading,
    /// Last exposure or download failed.
    Error,
}

impl CameraState {
    /// Integer code used by the flat getter surface.
    pub fn code(self) -> i32 {
        match self {
            CameraState::Idle => 0,
            CameraState::Exposing => 1,
            CameraState::Downloading => 2,
            CameraState::Error => -1,
        }
    }
}

/// Camera fields mirrored from its properties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraRecord {
    /// Device name on the bus.
    pub name: String,
    /// Model reported in `INFO`.
    pub model: String,
    /// Device reports `CONNECTED`.
    pub connected: bool,
    /// Exposure state.
    pub state: CameraState,
    /// Seconds left in the current exposure.
    pub exposure_progress: f64,
    /// Whether the camera defines `CCD_COOLER`.
    pub cooler_available: bool,
    /// Sensor temperature, degrees Celsius.
    pub cooler_temperature: f64,
    /// Percent, 0 to 100.
    pub cooler_power: f64,
    /// Cooler switched on.
    pub cooler_on: bool,
    /// Sensor gain.
    pub gain: f64,
    /// Sensor offset.
    pub offset: f64,
    /// Sensor width, pixels.
    pub width: f64,
    /// Sensor height, pixels.
    pub height: f64,
    /// Micrometres.
    pub pixel_size: f64,
    /// Micrometres.
    pub pixel_width: f64,
    /// Micrometres.
    pub pixel_height: f64,
    /// Latest image, RAW format.
    #[serde(skip)]
    pub image: Option<Bytes>,
    /// Length of [`CameraRecord::image`], 0 when absent.
    pub image_len: usize,
}

impl CameraRecord {
    /// Disconnected camera with unknown values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: String::new(),
            connected: false,
            state: CameraState::Idle,
            exposure_progress: 0.0,
            cooler_available: false,
            // Unknown until the device reports it.
            cooler_temperature: 1e5,
            cooler_power: 0.0,
            cooler_on: false,
            gain: 0.0,
            offset: 0.0,
            width: 0.0,
            height: 0.0,
            pixel_size: 0.0,
            pixel_width: 0.0,
            pixel_height: 0.0,
            image: None,
            image_len: 0,
        }
    }

    /// Replace the held image. The previous buffer is released.
    pub fn install_image(&mut self, image: Bytes) {
        self.image_len = image.len();
        self.image = Some(image);
    }

    /// Drop the held image and mark the exposure failed.
    pub fn fail_download(&mut self) {
        self.image = None;
        self.image_len = 0;
        self.state = CameraState::Error;
    }
}

/// Mount fields mirrored from its properties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MountRecord {
    /// Device name on the bus.
    pub name: String,
    /// Model reported in `INFO`.
    pub model: String,
    /// Device reports `CONNECTED`.
    pub connected: bool,
    /// Sidereal tracking on.
    pub tracking: bool,
    /// Parked.
    pub parked: bool,
    /// At the home position.
    pub at_home: bool,
    /// A goto is in progress.
    pub slewing: bool,
    /// Right ascension, hours.
    pub ra: f64,
    /// Declination, degrees.
    pub dec: f64,
}

impl MountRecord {
    /// Disconnected, unparked mount at 0h, 0°.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: String::new(),
            connected: false,
            tracking: false,
            parked: false,
            at_home: false,
            slewing: false,
            ra: 0.0,
            dec: 0.0,
        }
    }
}

/// Focuser fields mirrored from its properties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FocuserRecord {
    /// Device name on the bus.
    pub name: String,
    /// Model reported in `INFO`.
    pub model: String,
    /// Device reports `CONNECTED`.
    pub connected: bool,
    /// Absolute step position; -1 until reported.
    pub position: f64,
}

impl FocuserRecord {
    /// Disconnected focuser at an unknown position.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: String::new(),
            connected: false,
            position: -1.0,
        }
    }
}

/// The three records, each independently locked.
#[derive(Debug)]
pub struct DeviceStates {
    camera: RwLock<CameraRecord>,
    mount: RwLock<MountRecord>,
    focuser: RwLock<FocuserRecord>,
}

impl DeviceStates {
    /// Fresh records for the devices in `names`.
    pub fn new(names: &BusSettings) -> Self {
        Self {
            camera: RwLock::new(CameraRecord::new(&names.camera)),
            mount: RwLock::new(MountRecord::new(&names.mount)),
            focuser: RwLock::new(FocuserRecord::new(&names.focuser)),
        }
    }

    /// Camera snapshot.
    pub fn camera(&self) -> CameraRecord {
        self.camera.read().clone()
    }

    /// Mount snapshot.
    pub fn mount(&self) -> MountRecord {
        self.mount.read().clone()
    }

    /// Focuser snapshot.
    pub fn focuser(&self) -> FocuserRecord {
        self.focuser.read().clone()
    }

    /// Current camera image without copying the rest of the record.
    pub fn camera_image(&self) -> Option<Bytes> {
        self.camera.read().image.clone()
    }

    /// Mutate the camera record under its write lock.
    pub fn update_camera<R>(&self, f: impl FnOnce(&mut CameraRecord) -> R) -> R {
        f(&mut self.camera.write())
    }

    /// Mutate the mount record under its write lock.
    pub fn update_mount<R>(&self, f: impl FnOnce(&mut MountRecord) -> R) -> R {
        f(&mut self.mount.write())
    }

    /// Mutate the focuser record under its write lock.
    pub fn update_focuser<R>(&self, f: impl FnOnce(&mut FocuserRecord) -> R) -> R {
        f(&mut self.focuser.write())
    }

    /// Names of the devices whose `connected` flag differs from `connected`.
    pub fn devices_not(&self, connected: bool) -> Vec<String> {
        let mut pending = Vec::new();
        {
            let camera = self.camera.read();
            if camera.connected != connected {
                pending.push(camera.name.clone());
            }
        }
        {
            let mount = self.mount.read();
            if mount.connected != connected {
                pending.push(mount.name.clone());
            }
        }
        {
            let focuser = self.focuser.read();
            if focuser.connected != connected {
                pending.push(focuser.name.clone());
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let states = DeviceStates::new(&BusSettings::default());
        let camera = states.camera();
        assert_eq!(camera.name, "CCD Imager Simulator");
        assert_eq!(camera.state.code(), 0);
        assert_eq!(camera.cooler_temperature, 1e5);
        assert_eq!(states.focuser().position, -1.0);
        assert_eq!(states.devices_not(true).len(), 3);
    }

    #[test]
    fn test_install_image_replaces_previous() {
        let mut camera = CameraRecord::new("cam");
        camera.install_image(Bytes::from_static(b"first"));
        camera.install_image(Bytes::from_static(b"second!"));
        assert_eq!(camera.image.as_deref(), Some(&b"second!"[..]));
        assert_eq!(camera.image_len, 7);
    }

    #[test]
    fn test_snapshot_serializes_without_image() {
        let mut camera = CameraRecord::new("cam");
        camera.install_image(Bytes::from_static(b"pixels"));
        let json = serde_json::to_value(&camera).unwrap();
        assert!(json.get("image").is_none());
        assert_eq!(json["image_len"], 6);
    }
}
