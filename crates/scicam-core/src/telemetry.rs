//! Camera identification, cooler readings and the status report returned
//! by `ReportStatus`.

use crate::status::{CameraStatus, CoolerMode};
use serde::{Deserialize, Serialize};

/// Identification strings read from the camera and grabber at initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraInfo {
    /// `<model> (<part number><version>)`.
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub software: String,
    pub library: String,
    pub grabber_model: String,
}

/// Last cooler and temperature readings polled from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoolerTelemetry {
    pub cooler_mode: CoolerMode,
    /// `None` when the cooler has been told to warm up.
    pub cooler_setpoint: Option<f64>,
    pub cooler_voltage: f64,
    pub sensor_temperature: f64,
    pub case_temperature: f64,
    pub senpcb_temperature: f64,
    pub digpcb_temperature: f64,
}

impl CoolerTelemetry {
    pub fn new(setpoint: f64) -> Self {
        Self {
            cooler_mode: CoolerMode::Unknown,
            cooler_setpoint: Some(setpoint),
            cooler_voltage: 0.0,
            sensor_temperature: 0.0,
            case_temperature: 0.0,
            senpcb_temperature: 0.0,
            digpcb_temperature: 0.0,
        }
    }
}

/// Snapshot of the daemon state, serialized as JSON over D-Bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: CameraStatus,
    #[serde(flatten)]
    pub cooler: CoolerTelemetry,
    pub temperature_locked: bool,
    /// Seconds.
    pub exposure_time: f64,
    /// Seconds elapsed in the current exposure.
    pub exposure_progress: f64,
    /// 0 means the sequence runs until stopped.
    pub sequence_frame_limit: u64,
    pub sequence_frame_count: u64,
}

impl StatusReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatusReport {
        StatusReport {
            state: CameraStatus::Acquiring,
            cooler: CoolerTelemetry {
                cooler_mode: CoolerMode::Locked,
                ..CoolerTelemetry::new(-40.0)
            },
            temperature_locked: true,
            exposure_time: 1.5,
            exposure_progress: 0.25,
            sequence_frame_limit: 10,
            sequence_frame_count: 3,
        }
    }

    #[test]
    fn test_report_fields_are_flat() {
        let value: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(value["state"], 4);
        assert_eq!(value["cooler_mode"], 3);
        assert_eq!(value["cooler_setpoint"], -40.0);
        assert_eq!(value["sequence_frame_count"], 3);
        assert!(value.get("cooler").is_none());
    }

    #[test]
    fn test_warm_setpoint_is_null() {
        let mut report = sample();
        report.cooler.cooler_setpoint = None;
        let json = report.to_json().unwrap();
        assert!(json.contains("\"cooler_setpoint\":null"));
        assert_eq!(StatusReport::from_json(&json).unwrap(), report);
    }

    #[test]
    fn test_unknown_state_rejected() {
        let json = sample().to_json().unwrap().replace("\"state\":4", "\"state\":42");
        assert!(StatusReport::from_json(&json).is_err());
    }
}
