//! Simulated device bus
//!
//! In-process stand-in for a bus running the CCD imager and mount
//! simulators. The CCD driver provides the camera and its focuser; the mount
//! driver provides the mount. Devices start disconnected and define their
//! full property set once connected, the way real drivers do.
//!
//! Requests are applied synchronously and the resulting events are delivered
//! to the attached client on the calling thread, after the internal lock has
//! been released. Every request is recorded as a [`BusCall`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::names::*;
use super::{
    BlobItem, BlobMode, BusClient, BusVersion, DeviceBus, Property, PropertyState,
};
use crate::error::{AppResult, CaptureError};

/// Driver providing the camera and focuser.
pub const CCD_DRIVER: &str = "indigo_ccd_simulator";
/// Driver providing the mount.
pub const MOUNT_DRIVER: &str = "indigo_mount_simulator";
/// Simulated camera.
pub const CAMERA_DEVICE: &str = "CCD Imager Simulator";
/// Simulated focuser.
pub const FOCUSER_DEVICE: &str = "CCD Imager Simulator (focuser)";
/// Simulated mount.
pub const MOUNT_DEVICE: &str = "Mount Simulator";

/// Requests recorded by [`SimulatedBus`].
#[derive(Debug, Clone, PartialEq)]
pub enum BusCall {
    /// [`DeviceBus::start`]
    Start,
    /// [`DeviceBus::stop`]
    Stop,
    /// [`DeviceBus::load_driver`]
    LoadDriver(String),
    /// [`DeviceBus::remove_driver`]
    RemoveDriver(String),
    /// [`DeviceBus::attach_client`]
    Attach,
    /// [`DeviceBus::detach_client`]
    Detach,
    /// [`DeviceBus::connect_device`]
    Connect(String),
    /// [`DeviceBus::disconnect_device`]
    Disconnect(String),
    /// [`DeviceBus::change_switch`]
    Switch {
        /// Target device.
        device: String,
        /// Target property.
        property: String,
        /// Requested item values.
        items: Vec<(String, bool)>,
    },
    /// [`DeviceBus::change_number`]
    Number {
        /// Target device.
        device: String,
        /// Target property.
        property: String,
        /// Requested item values.
        items: Vec<(String, f64)>,
    },
    /// [`DeviceBus::enable_blob`]
    EnableBlob {
        /// Target device.
        device: String,
        /// Requested delivery mode.
        mode: BlobMode,
    },
    /// [`DeviceBus::fetch_blob`]
    FetchBlob(String),
}

enum Event {
    Define(Property, BusVersion),
    Update(Property),
}

#[derive(Debug)]
struct SimDevice {
    driver: &'static str,
    connected: bool,
    properties: BTreeMap<String, Property>,
}

struct SimState {
    running: bool,
    drivers: HashSet<String>,
    devices: BTreeMap<String, SimDevice>,
    client: Option<Arc<dyn BusClient>>,
    blob_mode: BlobMode,
    blobs: HashMap<String, Bytes>,
    frames: u32,
    calls: Vec<BusCall>,
}

/// Simulated camera, mount and focuser.
pub struct SimulatedBus {
    version: BusVersion,
    unresponsive: HashSet<String>,
    state: Mutex<SimState>,
}

impl SimulatedBus {
    /// Bus whose devices speak interface 2.0.
    pub fn new() -> Self {
        Self::with_version(BusVersion::V2_0)
    }

    /// Devices speak `version`; below 2.0 BLOBs are delivered inline.
    pub fn with_version(version: BusVersion) -> Self {
        let mut devices = BTreeMap::new();
        for (name, driver) in [
            (CAMERA_DEVICE, CCD_DRIVER),
            (FOCUSER_DEVICE, CCD_DRIVER),
            (MOUNT_DEVICE, MOUNT_DRIVER),
        ] {
            devices.insert(
                name.to_string(),
                SimDevice {
                    driver,
                    connected: false,
                    properties: BTreeMap::new(),
                },
            );
        }
        Self {
            version,
            unresponsive: HashSet::new(),
            state: Mutex::new(SimState {
                running: false,
                drivers: HashSet::new(),
                devices,
                client: None,
                blob_mode: BlobMode::Never,
                blobs: HashMap::new(),
                frames: 0,
                calls: Vec::new(),
            }),
        }
    }

    /// Ignore connect and disconnect requests for `device`.
    pub fn unresponsive(mut self, device: &str) -> Self {
        self.unresponsive.insert(device.to_string());
        self
    }

    /// Every request so far, in order.
    pub fn calls(&self) -> Vec<BusCall> {
        self.state.lock().calls.clone()
    }

    /// Whether the bus has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Whether a client is attached.
    pub fn is_attached(&self) -> bool {
        self.state.lock().client.is_some()
    }

    /// Loaded drivers, sorted by name.
    pub fn loaded_drivers(&self) -> Vec<String> {
        let mut drivers: Vec<String> = self.state.lock().drivers.iter().cloned().collect();
        drivers.sort();
        drivers
    }

    /// Delivery mode last requested for the camera image.
    pub fn blob_mode(&self) -> BlobMode {
        self.state.lock().blob_mode
    }

    /// Make `data` fetchable and return its URL.
    pub fn publish_blob(&self, data: Bytes) -> String {
        let mut state = self.state.lock();
        state.frames += 1;
        let url = format!("http://localhost:7624/blob/{}.raw", state.frames);
        state.blobs.insert(url.clone(), data);
        url
    }

    /// Deliver an arbitrary update to the attached client.
    pub fn emit_update(&self, property: Property) {
        self.dispatch(vec![Event::Update(property)]);
    }

    /// Deliver an arbitrary definition to the attached client.
    pub fn emit_define(&self, property: Property) {
        self.dispatch(vec![Event::Define(property, self.version)]);
    }

    fn dispatch(&self, events: Vec<Event>) {
        let Some(client) = self.state.lock().client.clone() else {
            return;
        };
        for event in events {
            match event {
                Event::Define(property, version) => client.property_defined(&property, version),
                Event::Update(property) => client.property_updated(&property),
            }
        }
    }

    fn record(&self, call: BusCall) -> parking_lot::MutexGuard<'_, SimState> {
        let mut state = self.state.lock();
        state.calls.push(call);
        state
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

fn connection(device: &str, connected: bool) -> Property {
    Property::new(device, CONNECTION, PropertyState::Ok)
        .with_switch(CONNECTION_CONNECTED, connected)
        .with_switch(CONNECTION_DISCONNECTED, !connected)
}

fn frame(number: u32) -> Bytes {
    let mut data = format!("SIMPLE  = T / simulated frame {number}\n").into_bytes();
    data.extend((0..2048u32).map(|i| (i.wrapping_mul(number + 7) % 256) as u8));
    Bytes::from(data)
}

/// Properties a device defines once connected.
fn device_properties(device: &str) -> Vec<Property> {
    let ok = PropertyState::Ok;
    let info = |model: &str| Property::new(device, INFO, ok).with_text(INFO_DEVICE_MODEL, model);
    match device {
        CAMERA_DEVICE => vec![
            info("CCD Imager Simulator"),
            Property::new(device, CCD_INFO, ok)
                .with_number(CCD_INFO_WIDTH, 1600.0)
                .with_number(CCD_INFO_HEIGHT, 1200.0)
                .with_number(CCD_INFO_PIXEL_SIZE, 5.2)
                .with_number(CCD_INFO_PIXEL_WIDTH, 5.2)
                .with_number(CCD_INFO_PIXEL_HEIGHT, 5.2),
            Property::new(device, CCD_IMAGE_FORMAT, ok)
                .with_switch(CCD_IMAGE_FORMAT_RAW, false)
                .with_switch("FITS", true),
            Property::new(device, CCD_IMAGE, PropertyState::Idle)
                .with_blob(CCD_IMAGE_ITEM, BlobItem::default()),
            Property::new(device, CCD_EXPOSURE, ok).with_number(CCD_EXPOSURE_ITEM, 0.0),
            Property::new(device, CCD_FRAME_TYPE, ok)
                .with_switch(CCD_FRAME_TYPE_LIGHT, true)
                .with_switch(CCD_FRAME_TYPE_DARK, false),
            Property::new(device, CCD_TEMPERATURE, ok).with_number(CCD_TEMPERATURE_ITEM, 25.0),
            Property::new(device, CCD_COOLER, ok)
                .with_switch(CCD_COOLER_ON, false)
                .with_switch(CCD_COOLER_OFF, true),
            Property::new(device, CCD_COOLER_POWER, ok).with_number(CCD_COOLER_POWER_ITEM, 0.0),
            Property::new(device, CCD_GAIN, ok).with_number(CCD_GAIN_ITEM, 100.0),
            Property::new(device, CCD_OFFSET, ok).with_number(CCD_OFFSET_ITEM, 10.0),
        ],
        MOUNT_DEVICE => vec![
            info("Mount Simulator"),
            Property::new(device, MOUNT_TRACKING, ok)
                .with_switch(MOUNT_TRACKING_ON, true)
                .with_switch(MOUNT_TRACKING_OFF, false),
            Property::new(device, MOUNT_PARK, ok)
                .with_switch(MOUNT_PARK_PARKED, true)
                .with_switch(MOUNT_PARK_UNPARKED, false),
            Property::new(device, MOUNT_HOME, ok).with_switch(MOUNT_HOME_ITEM, false),
            Property::new(device, MOUNT_EQUATORIAL_COORDINATES, ok)
                .with_number(MOUNT_EQUATORIAL_COORDINATES_RA, 0.0)
                .with_number(MOUNT_EQUATORIAL_COORDINATES_DEC, 90.0),
            Property::new(device, MOUNT_ON_COORDINATES_SET, ok)
                .with_switch(MOUNT_ON_COORDINATES_SET_TRACK, true)
                .with_switch(MOUNT_ON_COORDINATES_SET_SYNC, false),
        ],
        FOCUSER_DEVICE => vec![
            info("CCD Imager Simulator (focuser)"),
            Property::new(device, FOCUSER_POSITION, ok).with_number(FOCUSER_POSITION_ITEM, 0.0),
        ],
        _ => Vec::new(),
    }
}

impl SimState {
    fn device(&mut self, name: &str) -> AppResult<&mut SimDevice> {
        let loaded = &self.drivers;
        match self.devices.get_mut(name) {
            Some(device) if loaded.contains(device.driver) => Ok(device),
            _ => Err(CaptureError::Bus(format!("no such device '{name}'"))),
        }
    }

    fn connected_device(&mut self, name: &str) -> AppResult<&mut SimDevice> {
        let device = self.device(name)?;
        if device.connected {
            Ok(device)
        } else {
            Err(CaptureError::Bus(format!("device '{name}' is not connected")))
        }
    }

    /// Store `property` as the device's current value and return it as an update.
    fn set(&mut self, property: Property) -> AppResult<Event> {
        let device = self.connected_device(&property.device)?;
        device
            .properties
            .insert(property.name.clone(), property.clone());
        Ok(Event::Update(property))
    }

    fn exposure(&mut self, device: &str, seconds: f64) -> AppResult<Vec<Event>> {
        let busy = Property::new(device, CCD_EXPOSURE, PropertyState::Busy)
            .with_number(CCD_EXPOSURE_ITEM, seconds);
        let mut events = vec![self.set(busy)?];

        self.frames += 1;
        let data = frame(self.frames);
        let blob = match self.blob_mode {
            BlobMode::Url => {
                let url = format!("http://localhost:7624/blob/{}.raw", self.frames);
                self.blobs.insert(url.clone(), data.clone());
                Some(BlobItem::by_url(url, data.len()))
            }
            BlobMode::Also => Some(BlobItem::inline(data)),
            BlobMode::Never => None,
        };
        if let Some(blob) = blob {
            let image =
                Property::new(device, CCD_IMAGE, PropertyState::Ok).with_blob(CCD_IMAGE_ITEM, blob);
            events.push(self.set(image)?);
        }

        let done = Property::new(device, CCD_EXPOSURE, PropertyState::Ok)
            .with_number(CCD_EXPOSURE_ITEM, 0.0);
        events.push(self.set(done)?);
        Ok(events)
    }
}

impl DeviceBus for SimulatedBus {
    fn start(&self) -> AppResult<()> {
        self.record(BusCall::Start).running = true;
        Ok(())
    }

    fn stop(&self) -> AppResult<()> {
        self.record(BusCall::Stop).running = false;
        Ok(())
    }

    fn load_driver(&self, name: &str) -> AppResult<()> {
        let mut state = self.record(BusCall::LoadDriver(name.to_string()));
        if !state.running {
            return Err(CaptureError::Bus("bus is not running".to_string()));
        }
        if name != CCD_DRIVER && name != MOUNT_DRIVER {
            return Err(CaptureError::Bus(format!("unknown driver '{name}'")));
        }
        state.drivers.insert(name.to_string());
        debug!("Simulated driver {} loaded", name);
        Ok(())
    }

    fn remove_driver(&self, name: &str) -> AppResult<()> {
        let mut state = self.record(BusCall::RemoveDriver(name.to_string()));
        if !state.drivers.remove(name) {
            return Err(CaptureError::Bus(format!("driver '{name}' is not loaded")));
        }
        for device in state.devices.values_mut().filter(|d| d.driver == name) {
            device.connected = false;
            device.properties.clear();
        }
        Ok(())
    }

    fn attach_client(&self, client: Arc<dyn BusClient>) -> AppResult<()> {
        let events = {
            let mut state = self.record(BusCall::Attach);
            state.client = Some(client.clone());
            let loaded = state.drivers.clone();
            let mut events = Vec::new();
            for (name, device) in &state.devices {
                if !loaded.contains(device.driver) {
                    continue;
                }
                events.push(Event::Define(
                    connection(name, device.connected),
                    self.version,
                ));
                for property in device.properties.values() {
                    events.push(Event::Define(property.clone(), self.version));
                }
            }
            events
        };
        client.attached();
        self.dispatch(events);
        Ok(())
    }

    fn detach_client(&self) -> AppResult<()> {
        let client = self.record(BusCall::Detach).client.take();
        if let Some(client) = client {
            client.detached();
        }
        Ok(())
    }

    fn connect_device(&self, device: &str) -> AppResult<()> {
        let events = {
            let mut state = self.record(BusCall::Connect(device.to_string()));
            let sim = state.device(device)?;
            if self.unresponsive.contains(device) || sim.connected {
                return Ok(());
            }
            sim.connected = true;
            let mut events = vec![Event::Update(connection(device, true))];
            for property in device_properties(device) {
                sim.properties
                    .insert(property.name.clone(), property.clone());
                events.push(Event::Define(property, self.version));
            }
            events
        };
        debug!("Simulated {} connected", device);
        self.dispatch(events);
        Ok(())
    }

    fn disconnect_device(&self, device: &str) -> AppResult<()> {
        let events = {
            let mut state = self.record(BusCall::Disconnect(device.to_string()));
            let sim = state.device(device)?;
            if self.unresponsive.contains(device) || !sim.connected {
                return Ok(());
            }
            sim.connected = false;
            sim.properties.clear();
            vec![Event::Update(connection(device, false))]
        };
        self.dispatch(events);
        Ok(())
    }

    fn change_switch(
        &self,
        device: &str,
        property: &str,
        items: &[(&str, bool)],
    ) -> AppResult<()> {
        let events = {
            let mut state = self.record(BusCall::Switch {
                device: device.to_string(),
                property: property.to_string(),
                items: items.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
            });
            let current = state
                .connected_device(device)?
                .properties
                .get(property)
                .cloned()
                .ok_or_else(|| CaptureError::Bus(format!("no property '{property}'")))?;

            let mut updated = current;
            updated.state = PropertyState::Ok;
            for item in &mut updated.items {
                if let Some((_, on)) = items.iter().find(|(name, _)| *name == item.name) {
                    item.value = super::ItemValue::Switch(*on);
                } else if property != MOUNT_HOME {
                    // One-of-many switches: selecting an item clears the others.
                    if items.iter().any(|(_, on)| *on) {
                        item.value = super::ItemValue::Switch(false);
                    }
                }
            }
            vec![state.set(updated)?]
        };
        self.dispatch(events);
        Ok(())
    }

    fn change_number(
        &self,
        device: &str,
        property: &str,
        items: &[(&str, f64)],
    ) -> AppResult<()> {
        let events = {
            let mut state = self.record(BusCall::Number {
                device: device.to_string(),
                property: property.to_string(),
                items: items.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
            });
            let current = state
                .connected_device(device)?
                .properties
                .get(property)
                .cloned()
                .ok_or_else(|| CaptureError::Bus(format!("no property '{property}'")))?;

            let mut updated = current;
            for item in &mut updated.items {
                if let Some((_, value)) = items.iter().find(|(name, _)| *name == item.name) {
                    item.value = super::ItemValue::Number(*value);
                }
            }

            match property {
                CCD_EXPOSURE => {
                    let seconds = updated.number(CCD_EXPOSURE_ITEM).unwrap_or(0.0);
                    state.exposure(device, seconds)?
                }
                MOUNT_EQUATORIAL_COORDINATES => {
                    let mut slewing = updated.clone();
                    slewing.state = PropertyState::Busy;
                    updated.state = PropertyState::Ok;
                    vec![state.set(slewing)?, state.set(updated)?]
                }
                _ => {
                    updated.state = PropertyState::Ok;
                    vec![state.set(updated)?]
                }
            }
        };
        self.dispatch(events);
        Ok(())
    }

    fn enable_blob(&self, device: &str, property: &str, mode: BlobMode) -> AppResult<()> {
        let mut state = self.record(BusCall::EnableBlob {
            device: device.to_string(),
            mode,
        });
        state.device(device)?;
        debug!("BLOB delivery for {}.{} set to {:?}", device, property, mode);
        state.blob_mode = mode;
        Ok(())
    }

    fn fetch_blob(&self, url: &str) -> AppResult<Bytes> {
        // A BLOB is served once, the way the bus drops it after download.
        let mut state = self.record(BusCall::FetchBlob(url.to_string()));
        state
            .blobs
            .remove(url)
            .ok_or_else(|| CaptureError::Bus(format!("no BLOB at {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        defined: Mutex<Vec<String>>,
        updated: Mutex<Vec<(String, PropertyState)>>,
    }

    impl BusClient for Recorder {
        fn property_defined(&self, property: &Property, _version: BusVersion) {
            self.defined
                .lock()
                .push(format!("{}.{}", property.device, property.name));
        }

        fn property_updated(&self, property: &Property) {
            self.updated
                .lock()
                .push((property.name.clone(), property.state));
        }
    }

    fn running_bus() -> SimulatedBus {
        let bus = SimulatedBus::new();
        bus.start().unwrap();
        bus.load_driver(CCD_DRIVER).unwrap();
        bus.load_driver(MOUNT_DRIVER).unwrap();
        bus
    }

    #[test]
    fn test_attach_defines_connection_properties() {
        let bus = running_bus();
        let recorder = Arc::new(Recorder::default());
        bus.attach_client(recorder.clone()).unwrap();

        let defined = recorder.defined.lock().clone();
        assert_eq!(defined.len(), 3);
        assert!(defined.contains(&format!("{MOUNT_DEVICE}.{CONNECTION}")));
    }

    #[test]
    fn test_exposure_emits_busy_image_ok() {
        let bus = running_bus();
        let recorder = Arc::new(Recorder::default());
        bus.attach_client(recorder.clone()).unwrap();
        bus.connect_device(CAMERA_DEVICE).unwrap();
        bus.enable_blob(CAMERA_DEVICE, CCD_IMAGE, BlobMode::Also)
            .unwrap();
        recorder.updated.lock().clear();

        bus.change_number(CAMERA_DEVICE, CCD_EXPOSURE, &[(CCD_EXPOSURE_ITEM, 2.0)])
            .unwrap();

        let updates = recorder.updated.lock().clone();
        assert_eq!(
            updates,
            vec![
                (CCD_EXPOSURE.to_string(), PropertyState::Busy),
                (CCD_IMAGE.to_string(), PropertyState::Ok),
                (CCD_EXPOSURE.to_string(), PropertyState::Ok),
            ]
        );
    }

    #[test]
    fn test_requests_to_disconnected_device_fail() {
        let bus = running_bus();
        let err = bus
            .change_number(FOCUSER_DEVICE, FOCUSER_POSITION, &[(FOCUSER_POSITION_ITEM, 10.0)])
            .unwrap_err();
        assert!(matches!(err, CaptureError::Bus(_)));
    }

    #[test]
    fn test_unloaded_driver_hides_devices() {
        let bus = SimulatedBus::new();
        bus.start().unwrap();
        assert!(bus.connect_device(MOUNT_DEVICE).is_err());
    }
}
