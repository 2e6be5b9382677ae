//! Vendor capture SDK boundary
//!
//! Lightweight, object-safe view of a capability-driven camera SDK. The SDK
//! exposes a tree of objects (module, source, item, data object); every object
//! advertises a set of capabilities, and each capability supports some subset
//! of get/set/start operations.
//!
//! Implementations must be `Send + Sync`: the orchestration layer calls into
//! them from tokio tasks, and completion/data callbacks handed to the SDK may
//! be invoked from any thread.
//!
//! A simulated implementation lives in [`mock`].

pub mod mock;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use crate::bridge::CompletionToken;

/// Data-object type flag for image payloads.
pub const DATA_OBJ_TYPE_IMAGE: u32 = 0x0001;
/// Data-object type flag for embedded thumbnails.
pub const DATA_OBJ_TYPE_THUMBNAIL: u32 = 0x0004;

/// Module mode value that puts the module into remote-controller mode.
pub const MODULE_MODE_CONTROLLER: u32 = 1;

/// Opaque handle to an opened vendor object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

/// Fault reported by the vendor SDK.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("vendor error {code}: {message}")]
pub struct SdkError {
    /// Vendor result code (negative values are failures).
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl SdkError {
    /// Build an error from a vendor code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Result type for raw vendor SDK calls.
pub type SdkResult<T> = Result<T, SdkError>;

/// Capabilities the orchestration layer touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityId {
    /// Module operating mode.
    ModuleMode,
    /// Number of child objects.
    Children,
    /// Start a capture (process).
    Capture,
    /// End a bulb capture (process).
    TerminateCapture,
    /// Body type code.
    CameraType,
    /// Data-type mask of an item.
    DataTypes,
    /// Data delivery callback.
    DataProc,
    /// Stream item data (process).
    Acquire,
    /// ISO sensitivity.
    Sensitivity,
    /// Auto ISO.
    IsoControl,
    /// Shutter speed, including bulb.
    ShutterSpeed,
    /// White balance mode.
    WbMode,
    /// Long-exposure noise reduction.
    NoiseReduction,
    /// High-ISO noise reduction.
    NoiseReductionHighIso,
    /// Image quality and compression.
    CompressionLevel,
    /// Picture control preset.
    PictureControl,
    /// Active D-Lighting level.
    ActiveDLighting,
}

/// Declared data type of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapType {
    /// Started, not read or written.
    Process,
    /// On/off.
    Boolean,
    /// Unsigned integer.
    Unsigned,
    /// Selection from a list.
    Enum,
    /// Function pointer.
    Callback,
    /// Byte array.
    Array,
}

bitflags! {
    /// Operations a capability supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CapOperations: u8 {
        /// Value can be read.
        const GET = 0b001;
        /// Value can be written.
        const SET = 0b010;
        /// Process can be started.
        const START = 0b100;
    }
}

/// Capability descriptor advertised by a vendor object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityInfo {
    /// Capability described.
    pub id: CapabilityId,
    /// Declared type.
    pub cap_type: CapType,
    /// Supported operations.
    pub operations: CapOperations,
}

impl CapabilityInfo {
    /// Shorthand constructor.
    pub const fn new(id: CapabilityId, cap_type: CapType, operations: CapOperations) -> Self {
        Self {
            id,
            cap_type,
            operations,
        }
    }

    /// Whether every operation in `op` is supported.
    pub fn supports(&self, op: CapOperations) -> bool {
        self.operations.contains(op)
    }
}

/// Enumerated capability value (current selection plus element count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnumValue {
    /// Selected element.
    pub value: u32,
    /// Number of elements.
    pub elements: u32,
}

/// Parameters of the terminate-capture process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TerminateParams {
    /// First vendor parameter.
    pub parameter1: u32,
    /// Second vendor parameter.
    pub parameter2: u32,
}

/// Callback the SDK invokes with each delivered chunk of item data.
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Events a module object reports asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleEvent {
    /// A child object appeared.
    AddChild(u32),
    /// A child object went away.
    RemoveChild(u32),
    /// A capability value changed.
    CapabilityChanged(CapabilityId),
    /// Vendor warning text.
    Warning(String),
}

/// Handler for module events.
pub type EventHandler = Arc<dyn Fn(ModuleEvent) + Send + Sync>;

/// Value passed to or returned from a capability.
#[derive(Clone)]
pub enum CapValue {
    /// No payload.
    Null,
    /// Boolean payload.
    Boolean(bool),
    /// Unsigned payload.
    Unsigned(u32),
    /// Enum payload.
    Enum(EnumValue),
    /// Terminate-capture parameters.
    Terminate(TerminateParams),
    /// Data delivery callback.
    Callback(DataCallback),
}

impl CapValue {
    /// Unsigned payload, if this is an unsigned value.
    pub fn as_unsigned(&self) -> Option<u32> {
        match self {
            CapValue::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    /// Enum payload, if this is an enum value.
    pub fn as_enum(&self) -> Option<EnumValue> {
        match self {
            CapValue::Enum(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Debug for CapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapValue::Null => write!(f, "Null"),
            CapValue::Boolean(v) => write!(f, "Boolean({v})"),
            CapValue::Unsigned(v) => write!(f, "Unsigned({v})"),
            CapValue::Enum(v) => write!(f, "Enum({}/{})", v.value, v.elements),
            CapValue::Terminate(p) => write!(f, "Terminate({}, {})", p.parameter1, p.parameter2),
            CapValue::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

/// Vendor capture SDK.
///
/// Every call is fallible. `cap_start` returns once the operation has been
/// accepted; completion is signalled later through the supplied
/// [`CompletionToken`], possibly from another thread and possibly only while
/// [`pump`](CaptureSdk::pump) is being driven.
pub trait CaptureSdk: Send + Sync {
    /// Locate the driver module on disk.
    fn search_module(&self) -> Option<PathBuf>;

    /// Load a located driver module.
    fn load_module(&self, path: &Path) -> SdkResult<()>;

    /// Unload the driver module.
    fn unload_module(&self);

    /// Open object `id` under `parent` (`None` opens the module object).
    fn open_object(&self, parent: Option<ObjectHandle>, id: u32) -> SdkResult<ObjectHandle>;

    /// Close an opened object.
    fn close_object(&self, handle: ObjectHandle) -> SdkResult<()>;

    /// List the capabilities an object advertises.
    fn enum_capabilities(&self, handle: ObjectHandle) -> SdkResult<Vec<CapabilityInfo>>;

    /// Install (or clear) the module event handler.
    fn set_event_handler(&self, handle: ObjectHandle, handler: Option<EventHandler>)
        -> SdkResult<()>;

    /// Read a capability value.
    fn cap_get(&self, handle: ObjectHandle, cap: CapabilityId) -> SdkResult<CapValue>;

    /// Write a capability value.
    fn cap_set(&self, handle: ObjectHandle, cap: CapabilityId, value: CapValue) -> SdkResult<()>;

    /// Start an asynchronous capability process.
    fn cap_start(
        &self,
        handle: ObjectHandle,
        cap: CapabilityId,
        param: CapValue,
        completion: CompletionToken,
    ) -> SdkResult<()>;

    /// Read an array-valued capability.
    fn cap_get_array(&self, handle: ObjectHandle, cap: CapabilityId) -> SdkResult<Vec<u32>>;

    /// Give the SDK a chance to run pending work and deliver callbacks.
    fn pump(&self, handle: ObjectHandle) -> SdkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_supports() {
        let info = CapabilityInfo::new(
            CapabilityId::Children,
            CapType::Enum,
            CapOperations::GET | CapOperations::SET,
        );
        assert!(info.supports(CapOperations::GET));
        assert!(!info.supports(CapOperations::START));
        assert!(!info.supports(CapOperations::GET | CapOperations::START));
    }

    #[test]
    fn test_cap_value_accessors() {
        assert_eq!(CapValue::Unsigned(7).as_unsigned(), Some(7));
        assert_eq!(CapValue::Boolean(true).as_unsigned(), None);
        let e = EnumValue {
            value: 1,
            elements: 3,
        };
        assert_eq!(CapValue::Enum(e).as_enum(), Some(e));
        assert_eq!(format!("{:?}", CapValue::Enum(e)), "Enum(1/3)");
    }
}
