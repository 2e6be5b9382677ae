//! Capture orchestration for DSLR bodies and astronomy device-bus equipment.
//!
//! Two independent stacks share the error, configuration and logging layers:
//!
//! - The DSLR path drives a vendor capture SDK through an object tree
//!   ([`tree`]), a capability gate ([`capability`]) and the capture state
//!   machine ([`capture`]). Exposures are timed by the camera or by an
//!   external serial shutter release ([`shutter`]). [`camera::DslrCamera`] is
//!   the handle callers use.
//! - The device-bus path ([`bus`]) projects the property feed of a camera,
//!   mount and focuser onto pollable state records.

pub mod bridge;
pub mod bus;
pub mod camera;
pub mod capability;
pub mod capture;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod logging;
pub mod sdk;
pub mod shutter;
pub mod tree;

pub use camera::{CameraModel, CameraOptions, CapturedImage, DslrCamera};
pub use config::Settings;
pub use error::{AppResult, CaptureError};
