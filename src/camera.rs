//! DSLR camera handle
//!
//! [`DslrCamera`] is the caller-facing surface over the vendor SDK: it loads
//! the driver module, opens one camera body (source), applies the capture
//! profile used for astrophotography (bulb shutter, fixed white balance, no
//! in-camera noise reduction, RAW), and runs exposures through the
//! [`CaptureEngine`].
//!
//! Setup failures never hand out a handle: anything opened before the failure
//! is closed again and the module is unloaded.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::CapabilityGate;
use crate::capture::{CaptureEngine, CaptureSession, Trigger};
use crate::config::CaptureSettings;
use crate::error::{AppResult, CaptureError, CAPTURE_FAILED};
use crate::sdk::{
    CapOperations, CapType, CapValue, CapabilityId, CaptureSdk, EventHandler, ModuleEvent,
    MODULE_MODE_CONTROLLER,
};
use crate::tree::DeviceNode;

/// Shutter-speed enum index selecting bulb.
pub const SHUTTER_SPEED_BULB: u32 = 2;
/// White-balance code applied on open.
pub const DEFAULT_WHITE_BALANCE: u32 = 3;
/// Compression level selecting RAW output.
pub const COMPRESSION_RAW: u32 = 3;
/// Picture control selecting the neutral style.
pub const PICTURE_CONTROL_NEUTRAL: u32 = 1;
/// High-ISO noise reduction off.
pub const NOISE_REDUCTION_HIGH_ISO_OFF: u32 = 0;
/// Active D-Lighting off.
pub const ACTIVE_D_LIGHTING_OFF: u32 = 3;

/// Supported camera bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraModel {
    /// Nikon D750.
    D750,
    /// Nikon D90.
    D90,
    /// Nikon D5300.
    D5300,
}

const D750_ISO: &[(&str, u32)] = &[
    ("LO-1", 0),
    ("LO-0.7", 1),
    ("LO-0.3", 2),
    ("100", 3),
    ("125", 4),
    ("160", 5),
    ("200", 6),
    ("250", 7),
    ("320", 8),
    ("400", 9),
    ("500", 10),
    ("640", 11),
    ("800", 12),
    ("1000", 13),
    ("1250", 14),
    ("1600", 15),
    ("2000", 16),
    ("2500", 17),
    ("3200", 18),
    ("4000", 19),
    ("5000", 20),
    ("6400", 21),
    ("8000", 22),
    ("10000", 23),
    ("12800", 24),
    ("Hi-0.3", 25),
    ("Hi-0.7", 26),
    ("Hi-1.0", 27),
    ("Hi-2.0", 28),
];

const D90_ISO: &[(&str, u32)] = &[
    ("200", 3),
    ("250", 4),
    ("320", 5),
    ("400", 6),
    ("500", 7),
    ("640", 8),
    ("800", 9),
    ("1000", 10),
    ("1250", 11),
    ("1600", 12),
    ("2000", 13),
    ("2500", 14),
    ("3200", 15),
];

const D5300_ISO: &[(&str, u32)] = &[
    ("100", 0),
    ("125", 1),
    ("160", 2),
    ("200", 3),
    ("250", 4),
    ("320", 5),
    ("400", 6),
    ("500", 7),
    ("640", 8),
    ("800", 9),
    ("1000", 10),
    ("1250", 11),
    ("1600", 12),
    ("2000", 13),
    ("2500", 14),
    ("3200", 15),
    ("4000", 16),
    ("5000", 17),
    ("6400", 18),
    ("8000", 19),
    ("10000", 20),
    ("12800", 21),
    ("Hi-0.3", 22),
    ("Hi-0.7", 23),
    ("Hi-1.0", 24),
];

impl CameraModel {
    /// Model from its numeric designation (750, 90, 5300).
    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            750 => Some(CameraModel::D750),
            90 => Some(CameraModel::D90),
            5300 => Some(CameraModel::D5300),
            _ => None,
        }
    }

    /// Model number without the `D` prefix.
    pub fn number(self) -> u32 {
        match self {
            CameraModel::D750 => 750,
            CameraModel::D90 => 90,
            CameraModel::D5300 => 5300,
        }
    }

    /// ISO label to sensitivity code table, in ascending sensitivity.
    pub fn iso_table(self) -> &'static [(&'static str, u32)] {
        match self {
            CameraModel::D750 => D750_ISO,
            CameraModel::D90 => D90_ISO,
            CameraModel::D5300 => D5300_ISO,
        }
    }

    /// Sensitivity code for an ISO label such as `"800"` or `"Hi-0.3"`.
    pub fn iso_code(self, label: &str) -> Option<u32> {
        self.iso_table()
            .iter()
            .find(|(name, _)| *name == label)
            .map(|(_, code)| *code)
    }
}

impl fmt::Display for CameraModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.number())
    }
}

/// Parameters for opening a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraOptions {
    /// Body model, selects the ISO table.
    pub model: CameraModel,
    /// Id of the camera body under the module.
    pub source_id: u32,
    /// Where captured images are written, if anywhere.
    pub dest_dir: Option<PathBuf>,
}

impl CameraOptions {
    /// Options for source 1 with no destination directory.
    pub fn new(model: CameraModel) -> Self {
        Self {
            model,
            source_id: 1,
            dest_dir: None,
        }
    }

    /// Write captured images into `dir`.
    pub fn with_dest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dest_dir = Some(dir.into());
        self
    }
}

/// Image bytes returned by a successful capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    /// Sequence number within the camera handle, starting at 1.
    pub id: u32,
    /// When the image was acquired.
    pub captured_at: DateTime<Utc>,
    /// Raw NEF bytes.
    pub bytes: Bytes,
}

impl CapturedImage {
    /// File name used when the image is written out.
    pub fn file_name(&self) -> String {
        format!("Image{:05}.nef", self.id)
    }

    /// Write the raw bytes into `dir`, returning the file path.
    pub fn write_to_dir(&self, dir: &Path) -> AppResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, &self.bytes)?;
        debug!("Wrote {} bytes to {}", self.bytes.len(), path.display());
        Ok(path)
    }
}

/// An opened DSLR body.
pub struct DslrCamera {
    sdk: Arc<dyn CaptureSdk>,
    gate: CapabilityGate,
    engine: CaptureEngine,
    module: Option<DeviceNode>,
    options: CameraOptions,
    trigger: Trigger,
    last_image_id: u32,
}

impl DslrCamera {
    /// Load the driver module, open the camera body and apply the default
    /// capture profile.
    pub fn open(
        sdk: Arc<dyn CaptureSdk>,
        options: CameraOptions,
        trigger: Trigger,
        settings: &CaptureSettings,
    ) -> AppResult<Self> {
        let path = sdk.search_module().ok_or(CaptureError::ModuleNotFound)?;
        sdk.load_module(&path)
            .map_err(CaptureError::ModuleOpenFailed)?;
        info!("Loaded capture module {}", path.display());

        let module = match DeviceNode::open_module(sdk.as_ref()) {
            Ok(module) => module,
            Err(err) => {
                sdk.unload_module();
                return Err(err);
            }
        };

        let gate = CapabilityGate::new(sdk.clone());
        let mut camera = Self {
            engine: CaptureEngine::new(gate.clone(), settings),
            gate,
            sdk,
            module: Some(module),
            options,
            trigger,
            last_image_id: 0,
        };
        // On failure the partially opened camera is dropped, which releases
        // the tree and unloads the module.
        camera.configure_module()?;
        camera.open_source()?;
        camera.apply_default_profile()?;
        info!(
            "Camera {} ready (source {}, {} trigger)",
            camera.options.model,
            camera.options.source_id,
            camera.trigger.name()
        );
        Ok(camera)
    }

    /// Body model the camera was opened as.
    pub fn model(&self) -> CameraModel {
        self.options.model
    }

    /// Options the camera was opened with.
    pub fn options(&self) -> &CameraOptions {
        &self.options
    }

    /// Direct access to the capability gate, for settings this type does
    /// not wrap.
    pub fn gate(&self) -> &CapabilityGate {
        &self.gate
    }

    fn module(&self) -> AppResult<&DeviceNode> {
        self.module.as_ref().ok_or(CaptureError::ChildCreationFailed {
            id: 0,
            reason: "module is closed".to_string(),
        })
    }

    /// The opened camera body.
    pub fn source(&self) -> AppResult<&DeviceNode> {
        let id = self.options.source_id;
        self.module()?
            .find_child(id)
            .ok_or(CaptureError::ChildCreationFailed {
                id,
                reason: "source is not open".to_string(),
            })
    }

    fn configure_module(&mut self) -> AppResult<()> {
        let module = self.module()?;
        let handler: EventHandler = Arc::new(|event: ModuleEvent| match event {
            ModuleEvent::Warning(message) => warn!("Module warning: {}", message),
            other => debug!("Module event {:?}", other),
        });
        self.sdk
            .set_event_handler(module.handle(), Some(handler))
            .map_err(CaptureError::ModuleOpenFailed)?;

        if module.supports(CapabilityId::ModuleMode, CapOperations::SET) {
            self.gate.set(
                module,
                CapabilityId::ModuleMode,
                CapValue::Unsigned(MODULE_MODE_CONTROLLER),
            )?;
        }
        Ok(())
    }

    fn open_source(&mut self) -> AppResult<()> {
        let source_id = self.options.source_id;
        let module = self.module()?;
        self.gate
            .require_type(module, CapabilityId::Children, CapType::Enum)?;
        let children = self.gate.get_enum(module, CapabilityId::Children)?;
        debug!("Module reports {} source(s)", children.elements);

        let sdk = self.sdk.clone();
        let module = self
            .module
            .as_mut()
            .ok_or(CaptureError::ChildCreationFailed {
                id: source_id,
                reason: "module is closed".to_string(),
            })?;
        module.ensure_child(sdk.as_ref(), source_id)?;
        Ok(())
    }

    /// Bulb shutter, white balance, noise reduction off, neutral picture
    /// control, RAW, Active D-Lighting off.
    pub fn apply_default_profile(&self) -> AppResult<()> {
        self.set_bulb_mode()?;
        self.set_white_balance(DEFAULT_WHITE_BALANCE)?;
        self.turn_off_noise_reduction()?;
        self.set_picture_control(PICTURE_CONTROL_NEUTRAL)?;
        self.set_compression_level(COMPRESSION_RAW)?;
        self.turn_off_d_lighting()
    }

    /// Select a sensitivity code and disable automatic ISO.
    pub fn set_iso(&self, code: u32) -> AppResult<()> {
        let source = self.source()?;
        self.gate
            .set_enum_value(source, CapabilityId::Sensitivity, code)?;
        self.gate
            .set(source, CapabilityId::IsoControl, CapValue::Boolean(false))
    }

    /// Select a sensitivity by label using the model's ISO table.
    pub fn set_iso_label(&self, label: &str) -> AppResult<()> {
        let model = self.options.model;
        let code = model
            .iso_code(label)
            .ok_or_else(|| CaptureError::UnknownIsoLabel {
                model: model.to_string(),
                label: label.to_string(),
            })?;
        self.set_iso(code)
    }

    /// Select bulb so the exposure length is set by the capture.
    pub fn set_bulb_mode(&self) -> AppResult<()> {
        self.gate
            .set_enum_value(self.source()?, CapabilityId::ShutterSpeed, SHUTTER_SPEED_BULB)
    }

    /// Set the white balance mode code.
    pub fn set_white_balance(&self, code: u32) -> AppResult<()> {
        self.gate
            .set_enum_value(self.source()?, CapabilityId::WbMode, code)
    }

    /// Disable both high-ISO and long-exposure noise reduction.
    pub fn turn_off_noise_reduction(&self) -> AppResult<()> {
        let source = self.source()?;
        self.gate.set(
            source,
            CapabilityId::NoiseReductionHighIso,
            CapValue::Unsigned(NOISE_REDUCTION_HIGH_ISO_OFF),
        )?;
        self.gate
            .set(source, CapabilityId::NoiseReduction, CapValue::Boolean(false))
    }

    /// Set the image compression level code.
    pub fn set_compression_level(&self, level: u32) -> AppResult<()> {
        self.gate
            .set_enum_value(self.source()?, CapabilityId::CompressionLevel, level)
    }

    /// Set the picture control code.
    pub fn set_picture_control(&self, code: u32) -> AppResult<()> {
        self.gate
            .set_enum_value(self.source()?, CapabilityId::PictureControl, code)
    }

    /// Disable Active D-Lighting.
    pub fn turn_off_d_lighting(&self) -> AppResult<()> {
        self.gate.set(
            self.source()?,
            CapabilityId::ActiveDLighting,
            CapValue::Unsigned(ACTIVE_D_LIGHTING_OFF),
        )
    }

    /// Exposure delay is not supported by the bodies this crate drives.
    pub fn turn_on_exposure_delay(&self) -> AppResult<()> {
        Err(CaptureError::Unimplemented("exposure delay"))
    }

    /// Expose for `exposure` and return the image.
    ///
    /// When a destination directory is configured the image is also written
    /// there as `ImageNNNNN.nef`. A failed write is logged and the image is
    /// still returned.
    pub async fn take_picture(&mut self, exposure: Duration) -> AppResult<CapturedImage> {
        let source_id = self.options.source_id;
        let source = self
            .module
            .as_mut()
            .and_then(|module| module.find_child_mut(source_id))
            .ok_or(CaptureError::ChildCreationFailed {
                id: source_id,
                reason: "source is not open".to_string(),
            })?;

        let mut session = CaptureSession::new(exposure);
        let bytes = self
            .engine
            .run(&mut session, source, &mut self.trigger)
            .await?;

        self.last_image_id += 1;
        let image = CapturedImage {
            id: self.last_image_id,
            captured_at: Utc::now(),
            bytes,
        };
        if let Some(dir) = &self.options.dest_dir {
            if let Err(err) = image.write_to_dir(dir) {
                warn!(
                    "Failed to write {} to {}: {}",
                    image.file_name(),
                    dir.display(),
                    err
                );
            }
        }
        Ok(image)
    }

    /// Integer form of [`take_picture`](Self::take_picture): the image id, or
    /// [`CAPTURE_FAILED`].
    pub async fn take_picture_code(&mut self, exposure: Duration) -> i64 {
        match self.take_picture(exposure).await {
            Ok(image) => i64::from(image.id),
            Err(err) => {
                warn!("take_picture failed: {}", err);
                CAPTURE_FAILED
            }
        }
    }

    /// Close the shutter-release session, the object tree and the module.
    pub async fn close(mut self) -> AppResult<()> {
        if let Trigger::Serial(shutter) = &mut self.trigger {
            shutter.close_session().await?;
        }
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut module) = self.module.take() {
            module.remove_child(self.sdk.as_ref(), self.options.source_id);
            module.close(self.sdk.as_ref());
            self.sdk.unload_module();
            info!("Camera {} closed", self.options.model);
        }
    }
}

impl Drop for DslrCamera {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DslrCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DslrCamera")
            .field("options", &self.options)
            .field("trigger", &self.trigger)
            .field("open", &self.module.is_some())
            .field("last_image_id", &self.last_image_id)
            .finish()
    }
}
