//! Astronomy device bus
//!
//! Devices on the bus (camera, mount, focuser) publish named properties made
//! of typed items. The bus pushes property definitions and updates to an
//! attached [`BusClient`] from its own delivery context; requests flow the
//! other way through [`DeviceBus`].
//!
//! - [`router`] projects the event stream onto flat per-device records.
//! - [`state`] holds those records behind per-record locks.
//! - [`observatory`] is the caller-facing surface (initialize, setters, getters).
//! - [`mock`] is an in-process simulator of the three devices.

pub mod mock;
pub mod names;
pub mod observatory;
pub mod router;
pub mod state;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// State of a property as reported by its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyState {
    /// Defined but not in use.
    Idle,
    /// Last change succeeded.
    Ok,
    /// A change is in progress.
    Busy,
    /// Last change failed.
    Alert,
}

/// Binary payload of a BLOB item, inline or by reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlobItem {
    /// Where the payload can be fetched, when delivered by reference.
    pub url: Option<String>,
    /// Inline payload.
    pub data: Option<Bytes>,
    /// Size announced by the device.
    pub size: usize,
}

impl BlobItem {
    /// Payload carried in the event itself.
    pub fn inline(data: Bytes) -> Self {
        Self {
            url: None,
            size: data.len(),
            data: Some(data),
        }
    }

    /// Payload left on the bus at `url`.
    pub fn by_url(url: impl Into<String>, size: usize) -> Self {
        Self {
            url: Some(url.into()),
            data: None,
            size,
        }
    }
}

/// Typed value of one property item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemValue {
    /// On/off switch.
    Switch(bool),
    /// Numeric value.
    Number(f64),
    /// Free text.
    Text(String),
    /// Binary payload.
    Blob(BlobItem),
}

/// One named item of a [`Property`].
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyItem {
    /// Item name, unique within the property.
    pub name: String,
    /// Current value.
    pub value: ItemValue,
}

/// A named property of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Device publishing the property.
    pub device: String,
    /// Property name, e.g. `CCD_EXPOSURE`.
    pub name: String,
    /// State reported with the latest event.
    pub state: PropertyState,
    /// Items in device order.
    pub items: Vec<PropertyItem>,
}

impl Property {
    /// Property with no items.
    pub fn new(device: impl Into<String>, name: impl Into<String>, state: PropertyState) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            state,
            items: Vec::new(),
        }
    }

    /// Append a switch item.
    pub fn with_switch(mut self, name: &str, on: bool) -> Self {
        self.push(name, ItemValue::Switch(on));
        self
    }

    /// Append a number item.
    pub fn with_number(mut self, name: &str, value: f64) -> Self {
        self.push(name, ItemValue::Number(value));
        self
    }

    /// Append a text item.
    pub fn with_text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.push(name, ItemValue::Text(value.into()));
        self
    }

    /// Append a BLOB item.
    pub fn with_blob(mut self, name: &str, blob: BlobItem) -> Self {
        self.push(name, ItemValue::Blob(blob));
        self
    }

    fn push(&mut self, name: &str, value: ItemValue) {
        self.items.push(PropertyItem {
            name: name.to_string(),
            value,
        });
    }

    /// Item called `name`, if present.
    pub fn item(&self, name: &str) -> Option<&PropertyItem> {
        self.items.iter().find(|item| item.name == name)
    }

    /// Switch value of item `name`; `false` when absent.
    pub fn switch(&self, name: &str) -> bool {
        matches!(
            self.item(name).map(|item| &item.value),
            Some(ItemValue::Switch(true))
        )
    }

    /// Number value of item `name`.
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.item(name).map(|item| &item.value) {
            Some(ItemValue::Number(value)) => Some(*value),
            _ => None,
        }
    }

    /// Text value of item `name`.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.item(name).map(|item| &item.value) {
            Some(ItemValue::Text(value)) => Some(value),
            _ => None,
        }
    }

    /// First BLOB item of the property.
    pub fn first_blob(&self) -> Option<&BlobItem> {
        self.items.iter().find_map(|item| match &item.value {
            ItemValue::Blob(blob) => Some(blob),
            _ => None,
        })
    }

    /// Value of the first number item.
    pub fn first_number(&self) -> Option<f64> {
        self.items.iter().find_map(|item| match item.value {
            ItemValue::Number(value) => Some(value),
            _ => None,
        })
    }
}

/// Interface version a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusVersion {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl BusVersion {
    /// Last version without BLOB URLs.
    pub const LEGACY: BusVersion = BusVersion { major: 1, minor: 7 };
    /// First version that can deliver BLOBs by URL.
    pub const V2_0: BusVersion = BusVersion { major: 2, minor: 0 };
}

impl fmt::Display for BusVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// How BLOB payloads are delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobMode {
    /// Not delivered.
    Never,
    /// Inline, alongside other traffic.
    Also,
    /// By reference; the client fetches the URL.
    Url,
}

/// Receiver of bus events. Called from the bus's delivery context.
pub trait BusClient: Send + Sync {
    /// The client has been attached.
    fn attached(&self) {}

    /// A property was defined, or enumerated on attach.
    fn property_defined(&self, property: &Property, version: BusVersion);

    /// A defined property changed.
    fn property_updated(&self, property: &Property);

    /// The client has been detached. No events follow.
    fn detached(&self) {}
}

/// Requests a client can make of the bus.
///
/// Implementations must not hold internal locks while calling into the
/// attached [`BusClient`].
pub trait DeviceBus: Send + Sync {
    /// Start the bus server.
    fn start(&self) -> AppResult<()>;

    /// Stop the bus server.
    fn stop(&self) -> AppResult<()>;

    /// Load the driver called `name`.
    fn load_driver(&self, name: &str) -> AppResult<()>;

    /// Unload the driver called `name`.
    fn remove_driver(&self, name: &str) -> AppResult<()>;

    /// Attach `client` and enumerate all properties to it.
    fn attach_client(&self, client: Arc<dyn BusClient>) -> AppResult<()>;

    /// Detach the current client, if any.
    fn detach_client(&self) -> AppResult<()>;

    /// Ask `device` to connect.
    fn connect_device(&self, device: &str) -> AppResult<()>;

    /// Ask `device` to disconnect.
    fn disconnect_device(&self, device: &str) -> AppResult<()>;

    /// Request new values for switch items of a property.
    fn change_switch(&self, device: &str, property: &str, items: &[(&str, bool)])
        -> AppResult<()>;

    /// Request new values for number items of a property.
    fn change_number(&self, device: &str, property: &str, items: &[(&str, f64)])
        -> AppResult<()>;

    /// Choose how BLOBs of a property are delivered.
    fn enable_blob(&self, device: &str, property: &str, mode: BlobMode) -> AppResult<()>;

    /// Download a BLOB delivered by reference.
    fn fetch_blob(&self, url: &str) -> AppResult<Bytes>;
}
