//! Custom error types for the capture layer.
//!
//! This module defines the primary error type, `CaptureError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to report
//! the failures that can occur while driving capture hardware.
//!
//! ## Error Hierarchy
//!
//! - **Setup errors** (`ModuleNotFound`, `ModuleOpenFailed`, `CapabilityEnumerationFailed`):
//!   fatal to a camera session. A handle is never returned to the caller when one of
//!   these occurs.
//! - **Gate errors** (`CapabilityUnsupported`): the targeted node does not advertise the
//!   operation. Raised before any call reaches the vendor SDK; never retried.
//! - **Vendor call errors** (`CapabilityGetFailed`, `CapabilitySetFailed`,
//!   `CapabilityStartFailed`, `CompletionFailed`, `CompletionTimedOut`,
//!   `ChildCreationFailed`): the vendor SDK rejected or never finished a call.
//! - **Capture errors** (`NoImageProduced`, `UnsupportedDataType`, `DeviceNotResponding`):
//!   bounded retry budgets were exhausted or the produced item is not an image.
//! - **Bus errors** (`Bus`, `DevicesNotConnected`, `ExposureTimedOut`): failures reported by the astronomy
//!   device bus.
//!
//! Vendor faults are carried as [`SdkError`] so the vendor status code survives in the
//! error chain.

use std::time::Duration;

use thiserror::Error;

use crate::sdk::{CapOperations, CapabilityId, SdkError};

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, CaptureError>;

/// Sentinel returned by the integer capture surface when a capture fails.
pub const CAPTURE_FAILED: i64 = -1;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// No vendor module on this machine.
    #[error("Capture module not found")]
    ModuleNotFound,

    /// The module was found but would not load or open.
    #[error("Capture module could not be opened: {0}")]
    ModuleOpenFailed(#[source] SdkError),

    /// An object would not list its capabilities.
    #[error("Failed to enumerate capabilities of object {object_id}: {source}")]
    CapabilityEnumerationFailed {
        /// Object that failed.
        object_id: u32,
        /// Vendor fault.
        #[source]
        source: SdkError,
    },

    /// The node does not advertise the operation.
    #[error("Capability {capability:?} does not support {operation:?}")]
    CapabilityUnsupported {
        /// Capability requested.
        capability: CapabilityId,
        /// Operation requested.
        operation: CapOperations,
    },

    /// Reading a capability failed.
    #[error("Failed to get capability {capability:?}: {source}")]
    CapabilityGetFailed {
        /// Capability read.
        capability: CapabilityId,
        /// Vendor fault.
        #[source]
        source: SdkError,
    },

    /// Writing a capability failed.
    #[error("Failed to set capability {capability:?}: {source}")]
    CapabilitySetFailed {
        /// Capability written.
        capability: CapabilityId,
        /// Vendor fault.
        #[source]
        source: SdkError,
    },

    /// Starting a process capability failed.
    #[error("Failed to start capability {capability:?}: {source}")]
    CapabilityStartFailed {
        /// Process started.
        capability: CapabilityId,
        /// Vendor fault.
        #[source]
        source: SdkError,
    },

    /// A started process finished with a fault.
    #[error("Capability {capability:?} completed with an error: {source}")]
    CompletionFailed {
        /// Process that finished.
        capability: CapabilityId,
        /// Fault reported through the completion.
        #[source]
        source: SdkError,
    },

    /// A started process never finished.
    #[error("Capability {capability:?} did not complete within {timeout:?}")]
    CompletionTimedOut {
        /// Process awaited.
        capability: CapabilityId,
        /// Deadline that passed.
        timeout: Duration,
    },

    /// The shutter release never echoed a command.
    #[error("Shutter release did not respond to '{command}' after {attempts} attempts")]
    DeviceNotResponding {
        /// Command byte sent.
        command: char,
        /// Attempts made.
        attempts: u32,
    },

    /// No item appeared on the source.
    #[error("No image produced after {attempts} polls")]
    NoImageProduced {
        /// Polls made.
        attempts: u32,
    },

    /// The new item holds no image.
    #[error("Item does not carry image data (data types {data_types:#x})")]
    UnsupportedDataType {
        /// Data-type mask reported by the item.
        data_types: u32,
    },

    /// A child object could not be opened.
    #[error("Child object {id} could not be created: {reason}")]
    ChildCreationFailed {
        /// Child id.
        id: u32,
        /// What went wrong.
        reason: String,
    },

    /// The operation exists on other bodies only.
    #[error("'{0}' is not supported by this camera")]
    Unimplemented(&'static str),

    /// The ISO label is not in the model table.
    #[error("ISO label '{label}' is not known for camera model {model}")]
    UnknownIsoLabel {
        /// Camera model.
        model: String,
        /// Label looked up.
        label: String,
    },

    /// A shutter command was sent with no session open.
    #[error("Serial shutter session is not open")]
    SerialPortNotOpen,

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings were read but are invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The device bus rejected a request.
    #[error("Device bus error: {0}")]
    Bus(String),

    /// Devices left in the wrong connection state at the deadline.
    #[error("Devices did not reach the expected connection state: {devices:?}")]
    DevicesNotConnected {
        /// Devices still in the old state.
        devices: Vec<String>,
    },

    /// The camera stayed busy past the deadline.
    #[error("Exposure on {device} did not finish within {timeout:?}")]
    ExposureTimedOut {
        /// Camera device.
        device: String,
        /// Deadline that passed.
        timeout: Duration,
    },
}

impl CaptureError {
    /// Whether the failure is a contract violation rather than a hardware fault.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            CaptureError::CapabilityUnsupported { .. } | CaptureError::Unimplemented(_)
        )
    }
}

impl From<figment::Error> for CaptureError {
    fn from(err: figment::Error) -> Self {
        CaptureError::Config(Box::new(err))
    }
}
