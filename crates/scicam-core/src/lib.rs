//! scicam-core — Shared types for the SciCam camera daemon and its client.
//!
//! Status codes, the JSON daemon configuration, the FITS writer used by the
//! output workers, frame timestamp decoding and the persistent exposure
//! counter.

pub mod config;
pub mod counter;
pub mod fits;
pub mod header;
pub mod status;
pub mod telemetry;
pub mod timestamp;

pub use config::{BusKind, Config, ConfigError};
pub use counter::ExposureCounter;
pub use header::FrameMetadata;
pub use status::{CameraStatus, CommandStatus, CoolerMode};
pub use telemetry::{CameraInfo, CoolerTelemetry, StatusReport};

/// Object path of the camera daemon interface.
pub const CAMERA_OBJECT_PATH: &str = "/org/rockit/Camera";
