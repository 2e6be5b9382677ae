//! Caller-facing device-bus surface.
//!
//! [`Observatory`] owns the bus connection, the [`PropertyRouter`] and the
//! request worker. Getters return snapshots of the device-state records;
//! setters issue property changes and return once the bus has accepted them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::names::*;
use super::router::{
    request_channel, run_request_worker, PropertyRouter, RequestQueue, RequestReceiver,
};
use super::state::{CameraRecord, CameraState, DeviceStates, FocuserRecord, MountRecord};
use super::DeviceBus;
use crate::config::BusSettings;
use crate::error::{AppResult, CaptureError};

/// Frame type of the next camera exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Regular sky frame.
    Light,
    /// Shutter-closed calibration frame.
    Dark,
}

/// Sensor geometry reported by the camera.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct SensorGeometry {
    /// Sensor width in pixels.
    pub width: f64,
    /// Sensor height in pixels.
    pub height: f64,
    /// Nominal pixel size in micrometres.
    pub pixel_size: f64,
    /// Pixel width in micrometres.
    pub pixel_width: f64,
    /// Pixel height in micrometres.
    pub pixel_height: f64,
}

/// Client of the device bus driving one camera, mount and focuser.
///
/// Dropping an initialized observatory without [`Observatory::close`] still
/// detaches its router from the bus.
pub struct Observatory {
    bus: Arc<dyn DeviceBus>,
    settings: BusSettings,
    states: Arc<DeviceStates>,
    router: Arc<PropertyRouter>,
    queue: RequestQueue,
    receiver: Option<RequestReceiver>,
    worker: Option<JoinHandle<()>>,
    attached: bool,
}

impl Observatory {
    /// Build an observatory for the devices named in `settings`. Nothing is
    /// sent to the bus until [`Observatory::initialize`].
    pub fn new(bus: Arc<dyn DeviceBus>, settings: BusSettings) -> Self {
        let states = Arc::new(DeviceStates::new(&settings));
        let (queue, receiver) = request_channel();
        let router = Arc::new(PropertyRouter::new(
            &settings,
            states.clone(),
            bus.clone(),
            queue.clone(),
        ));
        Self {
            bus,
            settings,
            states,
            router,
            queue,
            receiver: Some(receiver),
            worker: None,
            attached: false,
        }
    }

    /// Start the bus, load the drivers, attach and wait for every device to
    /// connect.
    pub async fn initialize(&mut self) -> AppResult<()> {
        let Some(receiver) = self.receiver.take() else {
            return Err(CaptureError::Bus("observatory already initialized".to_string()));
        };
        info!("Starting device bus");
        self.bus.start()?;
        for driver in &self.settings.drivers {
            self.bus.load_driver(driver)?;
            debug!("Driver {} loaded", driver);
        }
        self.worker = Some(tokio::spawn(run_request_worker(self.bus.clone(), receiver)));

        let bus = self.bus.clone();
        let router = self.router.clone();
        tokio::task::spawn_blocking(move || bus.attach_client(router))
            .await
            .map_err(|e| CaptureError::Bus(format!("attach task failed: {e}")))??;
        self.attached = true;

        self.wait_for_connection(true).await?;
        info!("All devices connected");
        Ok(())
    }

    /// Disconnect every device, detach and shut the bus down.
    pub async fn close(mut self) -> AppResult<()> {
        for device in self.device_names() {
            if let Err(err) = self.bus.disconnect_device(&device) {
                warn!("Failed to disconnect {}: {}", device, err);
            }
        }
        let waited = self.wait_for_connection(false).await;

        self.bus.detach_client()?;
        self.attached = false;
        for driver in self.settings.drivers.iter().rev() {
            if let Err(err) = self.bus.remove_driver(driver) {
                warn!("Failed to remove driver {}: {}", driver, err);
            }
        }
        self.bus.stop()?;
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        info!("Device bus stopped");
        waited
    }

    fn device_names(&self) -> [String; 3] {
        [
            self.settings.camera.clone(),
            self.settings.mount.clone(),
            self.settings.focuser.clone(),
        ]
    }

    /// Poll until every device reports `connected` and no follow-up request
    /// is outstanding.
    async fn wait_for_connection(&self, connected: bool) -> AppResult<()> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        loop {
            let pending = self.states.devices_not(connected);
            if pending.is_empty() && self.queue.pending() == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::DevicesNotConnected { devices: pending });
            }
            debug!("Waiting for {:?}", pending);
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    // --- camera ---

    /// Snapshot of the camera record.
    pub fn camera(&self) -> CameraRecord {
        self.states.camera()
    }

    /// Current exposure state of the camera.
    pub fn camera_state(&self) -> CameraState {
        self.states.camera().state
    }

    /// Latest image received from the camera, if any.
    pub fn camera_image(&self) -> Option<Bytes> {
        self.states.camera_image()
    }

    /// Sensor dimensions from `CCD_INFO`.
    pub fn camera_geometry(&self) -> SensorGeometry {
        let camera = self.states.camera();
        SensorGeometry {
            width: camera.width,
            height: camera.height,
            pixel_size: camera.pixel_size,
            pixel_width: camera.pixel_width,
            pixel_height: camera.pixel_height,
        }
    }

    /// Select the frame type of the next exposure.
    pub fn set_camera_frame_type(&self, frame: FrameType) -> AppResult<()> {
        let item = match frame {
            FrameType::Light => CCD_FRAME_TYPE_LIGHT,
            FrameType::Dark => CCD_FRAME_TYPE_DARK,
        };
        self.bus
            .change_switch(&self.settings.camera, CCD_FRAME_TYPE, &[(item, true)])
    }

    /// Start an exposure of `seconds`. The camera is marked exposing before
    /// the request goes out.
    pub fn camera_start_exposure(&self, seconds: f64) -> AppResult<()> {
        self.states.update_camera(|camera| {
            camera.state = CameraState::Exposing;
            camera.exposure_progress = seconds;
        });
        let result = self.bus.change_number(
            &self.settings.camera,
            CCD_EXPOSURE,
            &[(CCD_EXPOSURE_ITEM, seconds)],
        );
        if result.is_err() {
            self.states
                .update_camera(|camera| camera.state = CameraState::Error);
        }
        result
    }

    /// Wait until the camera leaves the exposing and downloading states.
    pub async fn wait_for_exposure(&self, timeout: Duration) -> AppResult<CameraState> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.camera_state();
            if matches!(state, CameraState::Idle | CameraState::Error) {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::ExposureTimedOut {
                    device: self.settings.camera.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Switch the sensor cooler on or off.
    pub fn set_camera_cooler_on(&self, on: bool) -> AppResult<()> {
        let item = if on { CCD_COOLER_ON } else { CCD_COOLER_OFF };
        self.bus
            .change_switch(&self.settings.camera, CCD_COOLER, &[(item, true)])
    }

    /// Set the cooler target in degrees Celsius.
    pub fn set_camera_cooler_temperature(&self, celsius: f64) -> AppResult<()> {
        self.bus.change_number(
            &self.settings.camera,
            CCD_TEMPERATURE,
            &[(CCD_TEMPERATURE_ITEM, celsius)],
        )
    }

    /// Set the sensor gain.
    pub fn set_camera_gain(&self, gain: f64) -> AppResult<()> {
        self.bus
            .change_number(&self.settings.camera, CCD_GAIN, &[(CCD_GAIN_ITEM, gain)])
    }

    /// Set the sensor offset.
    pub fn set_camera_offset(&self, offset: f64) -> AppResult<()> {
        self.bus.change_number(
            &self.settings.camera,
            CCD_OFFSET,
            &[(CCD_OFFSET_ITEM, offset)],
        )
    }

    // --- focuser ---

    /// Snapshot of the focuser record.
    pub fn focuser(&self) -> FocuserRecord {
        self.states.focuser()
    }

    /// Move the focuser to an absolute step position.
    pub fn set_focuser_position(&self, position: f64) -> AppResult<()> {
        self.bus.change_number(
            &self.settings.focuser,
            FOCUSER_POSITION,
            &[(FOCUSER_POSITION_ITEM, position)],
        )
    }

    // --- mount ---

    /// Snapshot of the mount record.
    pub fn mount(&self) -> MountRecord {
        self.states.mount()
    }

    /// Slew to `ra` hours, `dec` degrees and track.
    pub fn mount_move_to(&self, ra: f64, dec: f64) -> AppResult<()> {
        self.mount_coordinates(MOUNT_ON_COORDINATES_SET_TRACK, ra, dec)
    }

    /// Declare the mount to be pointing at `ra`, `dec`.
    pub fn mount_sync_to(&self, ra: f64, dec: f64) -> AppResult<()> {
        self.mount_coordinates(MOUNT_ON_COORDINATES_SET_SYNC, ra, dec)
    }

    fn mount_coordinates(&self, mode: &str, ra: f64, dec: f64) -> AppResult<()> {
        self.bus.change_switch(
            &self.settings.mount,
            MOUNT_ON_COORDINATES_SET,
            &[(mode, true)],
        )?;
        self.bus.change_number(
            &self.settings.mount,
            MOUNT_EQUATORIAL_COORDINATES,
            &[
                (MOUNT_EQUATORIAL_COORDINATES_RA, ra),
                (MOUNT_EQUATORIAL_COORDINATES_DEC, dec),
            ],
        )
    }

    /// Park (`true`) or unpark (`false`) the mount.
    pub fn mount_park(&self, park: bool) -> AppResult<()> {
        let item = if park {
            MOUNT_PARK_PARKED
        } else {
            MOUNT_PARK_UNPARKED
        };
        self.bus
            .change_switch(&self.settings.mount, MOUNT_PARK, &[(item, true)])
    }

    /// Slew to the home position.
    pub fn mount_go_home(&self) -> AppResult<()> {
        self.bus
            .change_switch(&self.settings.mount, MOUNT_HOME, &[(MOUNT_HOME_ITEM, true)])
    }

    /// Turn sidereal tracking on or off.
    pub fn mount_set_tracking(&self, on: bool) -> AppResult<()> {
        let item = if on {
            MOUNT_TRACKING_ON
        } else {
            MOUNT_TRACKING_OFF
        };
        self.bus
            .change_switch(&self.settings.mount, MOUNT_TRACKING, &[(item, true)])
    }
}

impl Drop for Observatory {
    fn drop(&mut self) {
        // The bus holds the router until detached.
        if self.attached {
            if let Err(err) = self.bus.detach_client() {
                warn!("Failed to detach from device bus: {}", err);
            }
            self.attached = false;
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{BusCall, SimulatedBus, MOUNT_DEVICE};
    use crate::bus::{BlobMode, BusVersion};

    fn settings() -> BusSettings {
        BusSettings {
            connect_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
            ..BusSettings::default()
        }
    }

    async fn ready(bus: Arc<SimulatedBus>) -> Observatory {
        let mut observatory = Observatory::new(bus, settings());
        observatory.initialize().await.unwrap();
        observatory
    }

    #[tokio::test]
    async fn test_initialize_connects_all_devices() {
        let bus = Arc::new(SimulatedBus::new());
        let observatory = ready(bus.clone()).await;

        assert!(observatory.camera().connected);
        assert!(observatory.mount().connected);
        assert!(observatory.focuser().connected);
        assert_eq!(observatory.camera().model, "CCD Imager Simulator");
        assert_eq!(observatory.camera_geometry().width, 1600.0);
        assert_eq!(observatory.focuser().position, 0.0);
        assert_eq!(bus.blob_mode(), BlobMode::Url);
        assert!(bus.calls().contains(&BusCall::Switch {
            device: settings().camera,
            property: CCD_IMAGE_FORMAT.to_string(),
            items: vec![(CCD_IMAGE_FORMAT_RAW.to_string(), true)],
        }));
    }

    #[tokio::test]
    async fn test_legacy_bus_delivers_images_inline() {
        let bus = Arc::new(SimulatedBus::with_version(BusVersion::LEGACY));
        let observatory = ready(bus.clone()).await;
        assert_eq!(bus.blob_mode(), BlobMode::Also);

        observatory.camera_start_exposure(1.0).unwrap();
        observatory
            .wait_for_exposure(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(observatory.camera_image().is_some());
        assert!(!bus
            .calls()
            .iter()
            .any(|call| matches!(call, BusCall::FetchBlob(_))));
    }

    #[tokio::test]
    async fn test_unresponsive_device_times_out() {
        let bus = Arc::new(SimulatedBus::new().unresponsive(MOUNT_DEVICE));
        let mut observatory = Observatory::new(bus, settings());

        let err = observatory.initialize().await.unwrap_err();
        match err {
            CaptureError::DevicesNotConnected { devices } => {
                assert_eq!(devices, vec![MOUNT_DEVICE.to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_drop_without_close_detaches() {
        let bus = Arc::new(SimulatedBus::new());
        let observatory = ready(bus.clone()).await;
        assert!(bus.is_attached());

        drop(observatory);
        assert!(!bus.is_attached());
        assert_eq!(
            bus.calls()
                .iter()
                .filter(|call| matches!(call, BusCall::Detach))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_initialize_detaches_on_drop() {
        let bus = Arc::new(SimulatedBus::new().unresponsive(MOUNT_DEVICE));
        let mut observatory = Observatory::new(bus.clone(), settings());

        assert!(observatory.initialize().await.is_err());
        assert!(bus.is_attached());
        drop(observatory);
        assert!(!bus.is_attached());
    }

    #[tokio::test]
    async fn test_close_detaches_once() {
        let bus = Arc::new(SimulatedBus::new());
        let observatory = ready(bus.clone()).await;

        observatory.close().await.unwrap();
        assert_eq!(
            bus.calls()
                .iter()
                .filter(|call| matches!(call, BusCall::Detach))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_setters_reach_records() {
        let bus = Arc::new(SimulatedBus::new());
        let observatory = ready(bus).await;

        observatory.set_camera_gain(200.0).unwrap();
        observatory.set_camera_offset(12.0).unwrap();
        observatory.set_camera_cooler_on(true).unwrap();
        observatory.set_camera_cooler_temperature(-10.0).unwrap();
        observatory.set_focuser_position(1500.0).unwrap();
        observatory.mount_park(false).unwrap();
        observatory.mount_go_home().unwrap();

        let camera = observatory.camera();
        assert_eq!(camera.gain, 200.0);
        assert_eq!(camera.offset, 12.0);
        assert!(camera.cooler_on);
        assert_eq!(camera.cooler_temperature, -10.0);
        assert_eq!(observatory.focuser().position, 1500.0);
        let mount = observatory.mount();
        assert!(!mount.parked);
        assert!(mount.at_home);
    }

    #[tokio::test]
    async fn test_mount_sync_selects_mode_before_coordinates() {
        let bus = Arc::new(SimulatedBus::new());
        let observatory = ready(bus.clone()).await;

        observatory.mount_sync_to(5.59, -5.39).unwrap();

        let calls = bus.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(
            tail[0],
            BusCall::Switch {
                device: MOUNT_DEVICE.to_string(),
                property: MOUNT_ON_COORDINATES_SET.to_string(),
                items: vec![(MOUNT_ON_COORDINATES_SET_SYNC.to_string(), true)],
            }
        );
        assert!(matches!(&tail[1], BusCall::Number { property, .. } if property == MOUNT_EQUATORIAL_COORDINATES));
        let mount = observatory.mount();
        assert_eq!((mount.ra, mount.dec), (5.59, -5.39));
        assert!(!mount.slewing);
    }

    #[tokio::test]
    async fn test_close_disconnects_and_stops() {
        let bus = Arc::new(SimulatedBus::new());
        let observatory = ready(bus.clone()).await;

        observatory.close().await.unwrap();
        assert!(!bus.is_running());
        assert!(!bus.is_attached());
        assert!(bus.loaded_drivers().is_empty());
        let calls = bus.calls();
        let removed: Vec<&BusCall> = calls
            .iter()
            .filter(|call| matches!(call, BusCall::RemoveDriver(_)))
            .collect();
        assert_eq!(
            removed,
            vec![
                &BusCall::RemoveDriver("indigo_mount_simulator".to_string()),
                &BusCall::RemoveDriver("indigo_ccd_simulator".to_string()),
            ]
        );
    }
}
