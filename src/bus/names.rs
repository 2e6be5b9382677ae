//! Property and item names used on the device bus.

/// `CONNECTION` property.
pub const CONNECTION: &str = "CONNECTION";
/// `CONNECTED` item of [`CONNECTION`].
pub const CONNECTION_CONNECTED: &str = "CONNECTED";
/// `DISCONNECTED` item of [`CONNECTION`].
pub const CONNECTION_DISCONNECTED: &str = "DISCONNECTED";

/// `INFO` property.
pub const INFO: &str = "INFO";
/// `DEVICE_MODEL` item of [`INFO`].
pub const INFO_DEVICE_MODEL: &str = "DEVICE_MODEL";

/// `CCD_INFO` property.
pub const CCD_INFO: &str = "CCD_INFO";
/// `WIDTH` item of [`CCD_INFO`].
pub const CCD_INFO_WIDTH: &str = "WIDTH";
/// `HEIGHT` item of [`CCD_INFO`].
pub const CCD_INFO_HEIGHT: &str = "HEIGHT";
/// `PIXEL_SIZE` item of [`CCD_INFO`].
pub const CCD_INFO_PIXEL_SIZE: &str = "PIXEL_SIZE";
/// `PIXEL_WIDTH` item of [`CCD_INFO`].
pub const CCD_INFO_PIXEL_WIDTH: &str = "PIXEL_WIDTH";
/// `PIXEL_HEIGHT` item of [`CCD_INFO`].
pub const CCD_INFO_PIXEL_HEIGHT: &str = "PIXEL_HEIGHT";

/// `CCD_IMAGE` property.
pub const CCD_IMAGE: &str = "CCD_IMAGE";
/// `IMAGE` item of [`CCD_IMAGE`].
pub const CCD_IMAGE_ITEM: &str = "IMAGE";

/// `CCD_IMAGE_FORMAT` property.
pub const CCD_IMAGE_FORMAT: &str = "CCD_IMAGE_FORMAT";
/// `RAW` item of [`CCD_IMAGE_FORMAT`].
pub const CCD_IMAGE_FORMAT_RAW: &str = "RAW";

/// `CCD_EXPOSURE` property.
pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
/// `EXPOSURE` item of [`CCD_EXPOSURE`].
pub const CCD_EXPOSURE_ITEM: &str = "EXPOSURE";

/// `CCD_FRAME_TYPE` property.
pub const CCD_FRAME_TYPE: &str = "CCD_FRAME_TYPE";
/// `LIGHT` item of [`CCD_FRAME_TYPE`].
pub const CCD_FRAME_TYPE_LIGHT: &str = "LIGHT";
/// `DARK` item of [`CCD_FRAME_TYPE`].
pub const CCD_FRAME_TYPE_DARK: &str = "DARK";

/// `CCD_TEMPERATURE` property.
pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
/// `TEMPERATURE` item of [`CCD_TEMPERATURE`].
pub const CCD_TEMPERATURE_ITEM: &str = "TEMPERATURE";

/// `CCD_COOLER` property.
pub const CCD_COOLER: &str = "CCD_COOLER";
/// `ON` item of [`CCD_COOLER`].
pub const CCD_COOLER_ON: &str = "ON";
/// `OFF` item of [`CCD_COOLER`].
pub const CCD_COOLER_OFF: &str = "OFF";

/// `CCD_COOLER_POWER` property.
pub const CCD_COOLER_POWER: &str = "CCD_COOLER_POWER";
/// `POWER` item of [`CCD_COOLER_POWER`].
pub const CCD_COOLER_POWER_ITEM: &str = "POWER";

/// `CCD_GAIN` property.
pub const CCD_GAIN: &str = "CCD_GAIN";
/// `GAIN` item of [`CCD_GAIN`].
pub const CCD_GAIN_ITEM: &str = "GAIN";

/// `CCD_OFFSET` property.
pub const CCD_OFFSET: &str = "CCD_OFFSET";
/// `OFFSET` item of [`CCD_OFFSET`].
pub const CCD_OFFSET_ITEM: &str = "OFFSET";

/// `MOUNT_TRACKING` property.
pub const MOUNT_TRACKING: &str = "MOUNT_TRACKING";
/// `ON` item of [`MOUNT_TRACKING`].
pub const MOUNT_TRACKING_ON: &str = "ON";
/// `OFF` item of [`MOUNT_TRACKING`].
pub const MOUNT_TRACKING_OFF: &str = "OFF";

/// `MOUNT_PARK` property.
pub const MOUNT_PARK: &str = "MOUNT_PARK";
/// `PARKED` item of [`MOUNT_PARK`].
pub const MOUNT_PARK_PARKED: &str = "PARKED";
/// `UNPARKED` item of [`MOUNT_PARK`].
pub const MOUNT_PARK_UNPARKED: &str = "UNPARKED";

/// `MOUNT_HOME` property.
pub const MOUNT_HOME: &str = "MOUNT_HOME";
/// `HOME` item of [`MOUNT_HOME`].
pub const MOUNT_HOME_ITEM: &str = "HOME";

/// `MOUNT_EQUATORIAL_COORDINATES` property.
pub const MOUNT_EQUATORIAL_COORDINATES: &str = "MOUNT_EQUATORIAL_COORDINATES";
/// `RA` item of [`MOUNT_EQUATORIAL_COORDINATES`].
pub const MOUNT_EQUATORIAL_COORDINATES_RA: &str = "RA";
/// `DEC` item of [`MOUNT_EQUATORIAL_COORDINATES`].
pub const MOUNT_EQUATORIAL_COORDINATES_DEC: &str = "DEC";

/// `MOUNT_ON_COORDINATES_SET` property.
pub const MOUNT_ON_COORDINATES_SET: &str = "MOUNT_ON_COORDINATES_SET";
/// `TRACK` item of [`MOUNT_ON_COORDINATES_SET`].
pub const MOUNT_ON_COORDINATES_SET_TRACK: &str = "TRACK";
/// `SYNC` item of [`MOUNT_ON_COORDINATES_SET`].
pub const MOUNT_ON_COORDINATES_SET_SYNC: &str = "SYNC";

/// `FOCUSER_POSITION` property.
pub const FOCUSER_POSITION: &str = "FOCUSER_POSITION";
/// `POSITION` item of [`FOCUSER_POSITION`].
pub const FOCUSER_POSITION_ITEM: &str = "POSITION";
