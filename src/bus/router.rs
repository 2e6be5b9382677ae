//! Property-event router
//!
//! Projects the bus's property feed onto [`DeviceStates`]. Dispatch is on
//! `(device, property)`: the device name selects the camera, mount or focuser
//! handler and each handler copies specific item values into its record.
//!
//! The router runs on the bus's delivery context, so it never calls back into
//! the bus re-entrantly for follow-up requests (connect, BLOB enabling, image
//! format). Those are queued as [`BusRequest`]s and executed by
//! [`run_request_worker`]. Fetching a BLOB delivered by reference is the one
//! synchronous bus call it makes.
//!
//! An update for a property that was never defined is handled as a
//! definition followed by the update.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::names::*;
use super::state::{CameraRecord, CameraState, DeviceStates};
use super::{BlobMode, BusClient, BusVersion, DeviceBus, Property, PropertyState};
use crate::config::BusSettings;
use crate::error::AppResult;

/// Follow-up request issued in reaction to a bus event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusRequest {
    /// Connect a device that appeared disconnected.
    Connect {
        /// Device to connect.
        device: String,
    },
    /// Set the BLOB delivery mode of an image property.
    EnableBlob {
        /// Device owning the property.
        device: String,
        /// BLOB property.
        property: String,
        /// Delivery mode matching the device version.
        mode: BlobMode,
    },
    /// Switch the camera to RAW image output.
    SelectRawFormat {
        /// Camera device.
        device: String,
        /// Image-format property.
        property: String,
    },
}

impl BusRequest {
    /// Issue the request on `bus`.
    pub fn execute(&self, bus: &dyn DeviceBus) -> AppResult<()> {
        match self {
            BusRequest::Connect { device } => bus.connect_device(device),
            BusRequest::EnableBlob {
                device,
                property,
                mode,
            } => bus.enable_blob(device, property, *mode),
            BusRequest::SelectRawFormat { device, property } => {
                bus.change_switch(device, property, &[(CCD_IMAGE_FORMAT_RAW, true)])
            }
        }
    }
}

/// Create a request queue and its receiving end.
pub fn request_channel() -> (RequestQueue, RequestReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        RequestQueue {
            tx,
            pending: pending.clone(),
        },
        RequestReceiver { rx, pending },
    )
}

/// Sending side of the follow-up request queue.
///
/// Counts requests that are queued or still executing, so callers can wait
/// for the bus to settle.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<BusRequest>,
    pending: Arc<AtomicUsize>,
}

impl RequestQueue {
    /// Queue `request`. Returns `false` once the worker is gone.
    pub fn send(&self, request: BusRequest) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(request).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Requests queued or still executing.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Receiving side of the follow-up request queue.
#[derive(Debug)]
pub struct RequestReceiver {
    rx: mpsc::UnboundedReceiver<BusRequest>,
    pending: Arc<AtomicUsize>,
}

impl RequestReceiver {
    /// Take a queued request without executing it.
    pub fn try_recv(&mut self) -> Option<BusRequest> {
        let request = self.rx.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(request)
    }
}

/// Execute queued requests until every sender is gone.
pub async fn run_request_worker(bus: Arc<dyn DeviceBus>, mut requests: RequestReceiver) {
    while let Some(request) = requests.rx.recv().await {
        debug!("Executing {:?}", request);
        let bus = bus.clone();
        let outcome =
            tokio::task::spawn_blocking(move || request.execute(bus.as_ref()).map(|_| request))
                .await;
        requests.pending.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(Ok(request)) => debug!("{:?} done", request),
            Ok(Err(err)) => warn!("Bus request failed: {}", err),
            Err(err) => warn!("Bus request task failed: {}", err),
        }
    }
    debug!("Bus request worker stopped");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceClass {
    Camera,
    Mount,
    Focuser,
}

/// [`BusClient`] that maintains the device-state records.
pub struct PropertyRouter {
    camera: String,
    mount: String,
    focuser: String,
    states: Arc<DeviceStates>,
    bus: Arc<dyn DeviceBus>,
    requests: RequestQueue,
    known: Mutex<HashSet<(String, String)>>,
}

impl PropertyRouter {
    /// Router for the devices named in `names`.
    pub fn new(
        names: &BusSettings,
        states: Arc<DeviceStates>,
        bus: Arc<dyn DeviceBus>,
        requests: RequestQueue,
    ) -> Self {
        Self {
            camera: names.camera.clone(),
            mount: names.mount.clone(),
            focuser: names.focuser.clone(),
            states,
            bus,
            requests,
            known: Mutex::new(HashSet::new()),
        }
    }

    /// Records this router writes.
    pub fn states(&self) -> &Arc<DeviceStates> {
        &self.states
    }

    fn class_of(&self, device: &str) -> Option<DeviceClass> {
        if device == self.camera {
            Some(DeviceClass::Camera)
        } else if device == self.mount {
            Some(DeviceClass::Mount)
        } else if device == self.focuser {
            Some(DeviceClass::Focuser)
        } else {
            None
        }
    }

    fn request(&self, request: BusRequest) {
        if !self.requests.send(request) {
            warn!("Bus request worker is gone; request dropped");
        }
    }

    /// Handle a property definition.
    pub fn on_property_defined(&self, property: &Property, version: BusVersion) {
        debug!("DEFN: device: {}, name: {}", property.device, property.name);
        let Some(class) = self.class_of(&property.device) else {
            return;
        };
        self.known
            .lock()
            .insert((property.device.clone(), property.name.clone()));

        if property.name == CONNECTION {
            if property.switch(CONNECTION_CONNECTED) {
                self.set_connected(class, true);
                info!("{} already connected", property.device);
            } else {
                self.request(BusRequest::Connect {
                    device: property.device.clone(),
                });
            }
            return;
        }

        match class {
            DeviceClass::Camera => self.define_camera(property, version),
            DeviceClass::Mount => self.mount_property(property),
            DeviceClass::Focuser => self.focuser_property(property),
        }
    }

    /// Handle a property update.
    pub fn on_property_updated(&self, property: &Property) {
        debug!(
            "UPD: device: {}, name: {}, state: {:?}",
            property.device, property.name, property.state
        );
        let Some(class) = self.class_of(&property.device) else {
            return;
        };

        let known = self
            .known
            .lock()
            .contains(&(property.device.clone(), property.name.clone()));
        if !known {
            debug!("{} not defined yet; defining first", property.name);
            self.on_property_defined(property, BusVersion::V2_0);
        }

        if property.name == CONNECTION {
            if property.state == PropertyState::Ok {
                let connected = property.switch(CONNECTION_CONNECTED);
                if self.set_connected(class, connected) {
                    info!(
                        "{} {}",
                        property.device,
                        if connected { "connected" } else { "disconnected" }
                    );
                }
            }
            return;
        }

        match class {
            DeviceClass::Camera => self.update_camera(property),
            DeviceClass::Mount => self.mount_property(property),
            DeviceClass::Focuser => self.focuser_property(property),
        }
    }

    /// Returns whether the flag changed.
    fn set_connected(&self, class: DeviceClass, connected: bool) -> bool {
        fn flip(flag: &mut bool, value: bool) -> bool {
            std::mem::replace(flag, value) != value
        }
        match class {
            DeviceClass::Camera => self
                .states
                .update_camera(|camera| flip(&mut camera.connected, connected)),
            DeviceClass::Mount => self
                .states
                .update_mount(|mount| flip(&mut mount.connected, connected)),
            DeviceClass::Focuser => self
                .states
                .update_focuser(|focuser| flip(&mut focuser.connected, connected)),
        }
    }

    fn define_camera(&self, property: &Property, version: BusVersion) {
        match property.name.as_str() {
            CCD_INFO => self.states.update_camera(|camera| {
                let number = |name| property.number(name).unwrap_or(0.0);
                camera.width = number(CCD_INFO_WIDTH);
                camera.height = number(CCD_INFO_HEIGHT);
                camera.pixel_size = number(CCD_INFO_PIXEL_SIZE);
                camera.pixel_width = number(CCD_INFO_PIXEL_WIDTH);
                camera.pixel_height = number(CCD_INFO_PIXEL_HEIGHT);
            }),
            INFO => {
                if let Some(model) = property.text(INFO_DEVICE_MODEL) {
                    self.states
                        .update_camera(|camera| camera.model = model.to_string());
                }
            }
            CCD_IMAGE => {
                let mode = if version >= BusVersion::V2_0 {
                    BlobMode::Url
                } else {
                    BlobMode::Also
                };
                self.request(BusRequest::EnableBlob {
                    device: property.device.clone(),
                    property: property.name.clone(),
                    mode,
                });
            }
            CCD_IMAGE_FORMAT => self.request(BusRequest::SelectRawFormat {
                device: property.device.clone(),
                property: property.name.clone(),
            }),
            _ => self
                .states
                .update_camera(|camera| camera_settings(camera, property)),
        }
    }

    fn update_camera(&self, property: &Property) {
        match property.name.as_str() {
            CCD_IMAGE if property.state == PropertyState::Ok => self.receive_image(property),
            CCD_EXPOSURE => self.states.update_camera(|camera| match property.state {
                PropertyState::Busy => {
                    camera.exposure_progress = property
                        .number(CCD_EXPOSURE_ITEM)
                        .or_else(|| property.first_number())
                        .unwrap_or(0.0);
                    debug!("exposure {}s...", camera.exposure_progress);
                }
                // A failed download outlives the exposure's completion.
                PropertyState::Ok if camera.state == CameraState::Error => {
                    debug!("exposure done without an image");
                }
                PropertyState::Ok => {
                    camera.state = CameraState::Idle;
                    debug!("exposure done");
                }
                PropertyState::Alert => {
                    camera.state = CameraState::Error;
                    warn!("exposure failed on {}", property.device);
                }
                PropertyState::Idle => {}
            }),
            _ => self
                .states
                .update_camera(|camera| camera_settings(camera, property)),
        }
    }

    fn receive_image(&self, property: &Property) {
        self.states
            .update_camera(|camera| camera.state = CameraState::Downloading);
        let Some(blob) = property.first_blob() else {
            return;
        };

        let image = match (&blob.data, &blob.url) {
            (Some(data), _) => Some(data.clone()),
            (None, Some(url)) => match self.bus.fetch_blob(url) {
                Ok(data) => {
                    info!("image URL received ({}, {} bytes)", url, data.len());
                    Some(data)
                }
                Err(err) => {
                    warn!("Failed to fetch image from {}: {}", url, err);
                    self.states.update_camera(|camera| camera.fail_download());
                    return;
                }
            },
            (None, None) => None,
        };

        if let Some(image) = image {
            self.states.update_camera(|camera| camera.install_image(image));
        }
    }

    fn mount_property(&self, property: &Property) {
        self.states.update_mount(|mount| match property.name.as_str() {
            INFO => {
                if let Some(model) = property.text(INFO_DEVICE_MODEL) {
                    mount.model = model.to_string();
                }
            }
            MOUNT_TRACKING => {
                mount.tracking = property.switch(MOUNT_TRACKING_ON);
                debug!("Tracking: {}", mount.tracking);
            }
            MOUNT_PARK => {
                mount.parked = property.switch(MOUNT_PARK_PARKED);
                debug!("Parked: {}", mount.parked);
            }
            MOUNT_HOME => {
                mount.at_home = property.switch(MOUNT_HOME_ITEM);
                debug!("At home: {}", mount.at_home);
            }
            MOUNT_EQUATORIAL_COORDINATES => {
                if let Some(ra) = property.number(MOUNT_EQUATORIAL_COORDINATES_RA) {
                    mount.ra = ra;
                }
                if let Some(dec) = property.number(MOUNT_EQUATORIAL_COORDINATES_DEC) {
                    mount.dec = dec;
                }
                mount.slewing = property.state == PropertyState::Busy;
                debug!("Position: {}, {}", mount.ra, mount.dec);
            }
            _ => {}
        });
    }

    fn focuser_property(&self, property: &Property) {
        self.states.update_focuser(|focuser| match property.name.as_str() {
            INFO => {
                if let Some(model) = property.text(INFO_DEVICE_MODEL) {
                    focuser.model = model.to_string();
                }
            }
            FOCUSER_POSITION => {
                if let Some(position) = property.number(FOCUSER_POSITION_ITEM) {
                    focuser.position = position;
                    debug!("Focuser: {}", position);
                }
            }
            _ => {}
        });
    }
}

/// Camera properties handled the same way on definition and update.
fn camera_settings(camera: &mut CameraRecord, property: &Property) {
    match property.name.as_str() {
        CCD_TEMPERATURE => {
            if let Some(value) = property.number(CCD_TEMPERATURE_ITEM) {
                camera.cooler_temperature = value;
                debug!("Cooler temp: {}", value);
            }
        }
        CCD_COOLER => {
            camera.cooler_available = true;
            camera.cooler_on = property.switch(CCD_COOLER_ON);
        }
        CCD_COOLER_POWER => {
            if let Some(value) = property.number(CCD_COOLER_POWER_ITEM) {
                camera.cooler_power = value;
            }
        }
        CCD_GAIN => {
            if let Some(value) = property.number(CCD_GAIN_ITEM) {
                camera.gain = value;
                debug!("Gain: {}", value);
            }
        }
        CCD_OFFSET => {
            if let Some(value) = property.number(CCD_OFFSET_ITEM) {
                camera.offset = value;
            }
        }
        INFO => {
            if let Some(model) = property.text(INFO_DEVICE_MODEL) {
                camera.model = model.to_string();
            }
        }
        _ => {}
    }
}

impl BusClient for PropertyRouter {
    fn attached(&self) {
        info!("Attached to device bus");
    }

    fn property_defined(&self, property: &Property, version: BusVersion) {
        self.on_property_defined(property, version);
    }

    fn property_updated(&self, property: &Property) {
        self.on_property_updated(property);
    }

    fn detached(&self) {
        info!("Detached from device bus");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::SimulatedBus;
    use crate::bus::BlobItem;
    use bytes::Bytes;

    struct Harness {
        router: PropertyRouter,
        bus: Arc<SimulatedBus>,
        requests: RequestReceiver,
    }

    fn harness() -> Harness {
        let settings = BusSettings::default();
        let bus = Arc::new(SimulatedBus::new());
        let (tx, rx) = request_channel();
        let router = PropertyRouter::new(
            &settings,
            Arc::new(DeviceStates::new(&settings)),
            bus.clone(),
            tx,
        );
        Harness {
            router,
            bus,
            requests: rx,
        }
    }

    fn connection(device: &str, connected: bool) -> Property {
        Property::new(device, CONNECTION, PropertyState::Ok)
            .with_switch(CONNECTION_CONNECTED, connected)
            .with_switch(CONNECTION_DISCONNECTED, !connected)
    }

    fn connect_all(h: &Harness) {
        let names = BusSettings::default();
        for device in [&names.camera, &names.mount, &names.focuser] {
            h.router
                .on_property_defined(&connection(device, true), BusVersion::V2_0);
        }
    }

    #[test]
    fn test_disconnect_flips_only_that_device() {
        let h = harness();
        connect_all(&h);
        let names = BusSettings::default();
        let camera_before = h.router.states().camera();
        let focuser_before = h.router.states().focuser();

        h.router.on_property_updated(&connection(&names.mount, false));

        let states = h.router.states();
        assert!(!states.mount().connected);
        assert_eq!(states.camera(), camera_before);
        assert_eq!(states.focuser(), focuser_before);
    }

    #[test]
    fn test_disconnected_definition_requests_connect() {
        let mut h = harness();
        let names = BusSettings::default();
        h.router
            .on_property_defined(&connection(&names.camera, false), BusVersion::V2_0);

        assert_eq!(
            h.requests.try_recv(),
            Some(BusRequest::Connect {
                device: names.camera.clone()
            })
        );
        assert!(!h.router.states().camera().connected);
    }

    #[test]
    fn test_busy_connection_update_is_ignored() {
        let h = harness();
        connect_all(&h);
        let names = BusSettings::default();
        let mut busy = connection(&names.focuser, false);
        busy.state = PropertyState::Busy;
        h.router.on_property_updated(&busy);
        assert!(h.router.states().focuser().connected);
    }

    #[test]
    fn test_second_image_replaces_first() {
        let h = harness();
        let names = BusSettings::default();
        let image = |bytes: &'static [u8]| {
            Property::new(&names.camera, CCD_IMAGE, PropertyState::Ok)
                .with_blob(CCD_IMAGE_ITEM, BlobItem::inline(Bytes::from_static(bytes)))
        };

        h.router.on_property_updated(&image(b"first frame"));
        h.router.on_property_updated(&image(b"second"));

        let camera = h.router.states().camera();
        assert_eq!(camera.image.as_deref(), Some(&b"second"[..]));
        assert_eq!(camera.image_len, 6);
        assert_eq!(camera.state, CameraState::Downloading);
    }

    #[test]
    fn test_url_blob_is_fetched() {
        let h = harness();
        let names = BusSettings::default();
        let url = h.bus.publish_blob(Bytes::from_static(b"remote pixels"));
        let property = Property::new(&names.camera, CCD_IMAGE, PropertyState::Ok)
            .with_blob(CCD_IMAGE_ITEM, BlobItem::by_url(url, 13));

        h.router.on_property_updated(&property);
        assert_eq!(
            h.router.states().camera_image().as_deref(),
            Some(&b"remote pixels"[..])
        );
        assert_eq!(h.router.states().camera().state, CameraState::Downloading);
    }

    #[test]
    fn test_failed_fetch_marks_error() {
        let h = harness();
        let names = BusSettings::default();
        h.router
            .states()
            .update_camera(|camera| camera.install_image(Bytes::from_static(b"stale")));
        let image = Property::new(&names.camera, CCD_IMAGE, PropertyState::Ok).with_blob(
            CCD_IMAGE_ITEM,
            BlobItem::by_url("http://localhost:7624/blob/missing.raw".to_string(), 5),
        );
        let done = Property::new(&names.camera, CCD_EXPOSURE, PropertyState::Ok)
            .with_number(CCD_EXPOSURE_ITEM, 0.0);

        h.router.on_property_updated(&image);
        h.router.on_property_updated(&done);

        let camera = h.router.states().camera();
        assert_eq!(camera.state, CameraState::Error);
        assert_eq!(camera.image, None);
        assert_eq!(camera.image_len, 0);
    }

    #[test]
    fn test_blob_mode_follows_version() {
        let mut h = harness();
        let names = BusSettings::default();
        let image = Property::new(&names.camera, CCD_IMAGE, PropertyState::Idle);

        h.router.on_property_defined(&image, BusVersion::V2_0);
        h.router.on_property_defined(&image, BusVersion::LEGACY);

        let modes: Vec<BlobMode> = std::iter::from_fn(|| h.requests.try_recv())
            .filter_map(|r| match r {
                BusRequest::EnableBlob { mode, .. } => Some(mode),
                _ => None,
            })
            .collect();
        assert_eq!(modes, vec![BlobMode::Url, BlobMode::Also]);
    }

    #[test]
    fn test_exposure_progress_and_completion() {
        let h = harness();
        let names = BusSettings::default();
        h.router
            .states()
            .update_camera(|camera| camera.state = CameraState::Exposing);

        let exposure = |state, value| {
            Property::new(&names.camera, CCD_EXPOSURE, state).with_number(CCD_EXPOSURE_ITEM, value)
        };
        h.router
            .on_property_updated(&exposure(PropertyState::Busy, 1.5));
        assert_eq!(h.router.states().camera().exposure_progress, 1.5);
        assert_eq!(h.router.states().camera().state, CameraState::Exposing);

        h.router.on_property_updated(&exposure(PropertyState::Ok, 0.0));
        assert_eq!(h.router.states().camera().state, CameraState::Idle);

        h.router
            .on_property_updated(&exposure(PropertyState::Alert, 0.0));
        assert_eq!(h.router.states().camera().state, CameraState::Error);
    }

    #[test]
    fn test_undefined_update_is_defined_first() {
        let h = harness();
        let names = BusSettings::default();
        let info = Property::new(&names.camera, CCD_INFO, PropertyState::Ok)
            .with_number(CCD_INFO_WIDTH, 1280.0)
            .with_number(CCD_INFO_HEIGHT, 1024.0)
            .with_number(CCD_INFO_PIXEL_SIZE, 5.2);

        h.router.on_property_updated(&info);
        let camera = h.router.states().camera();
        assert_eq!(camera.width, 1280.0);
        assert_eq!(camera.pixel_size, 5.2);
    }

    #[test]
    fn test_mount_slewing_follows_coordinate_state() {
        let h = harness();
        let names = BusSettings::default();
        let coords = |state| {
            Property::new(&names.mount, MOUNT_EQUATORIAL_COORDINATES, state)
                .with_number(MOUNT_EQUATORIAL_COORDINATES_RA, 5.59)
                .with_number(MOUNT_EQUATORIAL_COORDINATES_DEC, -5.39)
        };
        h.router.on_property_updated(&coords(PropertyState::Busy));
        assert!(h.router.states().mount().slewing);
        h.router.on_property_updated(&coords(PropertyState::Ok));
        let mount = h.router.states().mount();
        assert!(!mount.slewing);
        assert_eq!(mount.ra, 5.59);
    }

    #[test]
    fn test_pending_counts_queued_requests() {
        let mut h = harness();
        let names = BusSettings::default();
        h.router
            .on_property_defined(&connection(&names.mount, false), BusVersion::V2_0);
        h.router
            .on_property_defined(&connection(&names.focuser, false), BusVersion::V2_0);
        assert_eq!(h.router.requests.pending(), 2);

        h.requests.try_recv();
        assert_eq!(h.router.requests.pending(), 1);
    }

    #[test]
    fn test_unknown_device_is_ignored() {
        let h = harness();
        let before = h.router.states().camera();
        h.router
            .on_property_updated(&connection("Guider Simulator", true));
        assert_eq!(h.router.states().camera(), before);
    }
}
