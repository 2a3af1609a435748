//! FITS header contents for an acquired frame.

use crate::fits::Card;
use crate::status::CoolerMode;
use crate::telemetry::{CameraInfo, CoolerTelemetry};
use crate::timestamp::format_fits_time;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Everything the output workers need to describe a frame, captured by the
/// acquisition thread at readout.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub width: usize,
    pub height: usize,
    /// Exposure time in seconds.
    pub exposure: f64,
    /// Frame period (cadence) in seconds.
    pub frame_period: f64,
    /// Frame count reported by the grabber since initialization.
    pub field: u32,
    /// PC clock when the readout finished.
    pub read_end_time: DateTime<Utc>,
    pub cooler: CoolerTelemetry,
    pub camera: Arc<CameraInfo>,
    pub exposure_count: u64,
    pub exposure_count_reference: String,
}

/// Format a 0-indexed inclusive `[x1, x2, y1, y2]` region as a 1-indexed FITS region.
pub fn format_sensor_region(region: [usize; 4]) -> String {
    format!(
        "[{}:{},{}:{}]",
        region[0] + 1,
        region[1] + 1,
        region[2] + 1,
        region[3] + 1
    )
}

fn round(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Header cards describing `frame`, whose exposure started at `date_start`.
pub fn frame_header(frame: &FrameMetadata, camera_id: &str, date_start: DateTime<Utc>) -> Vec<Card> {
    let date_end = date_start + Duration::nanoseconds((frame.exposure * 1e9).round() as i64);
    let region = format_sensor_region([0, frame.width - 1, 0, frame.height - 1]);
    let cooler = &frame.cooler;
    let camera = &frame.camera;

    let setpoint = match cooler.cooler_setpoint {
        Some(setpoint) => Card::new("TEMP-SET", setpoint, "[deg c] sensor temperature set point"),
        None => Card::comment(" TEMP-SET not available"),
    };

    vec![
        Card::Blank,
        Card::comment(" ---                DATE/TIME                --- "),
        Card::new("DATE-OBS", format_fits_time(&date_start), "[utc] estimated exposure start time"),
        Card::new("DATE-END", format_fits_time(&date_end), "[utc] estimated exposure end time"),
        Card::new("TIME-SRC", "NTP", "DATE-OBS is estimated from NTP-synced PC clock"),
        Card::new("EXPTIME", round(frame.exposure, 3), "[s] actual exposure length"),
        Card::new("EXPCADNC", round(frame.frame_period, 3), "[s] exposure cadence"),
        Card::new(
            "PC-RDEND",
            format_fits_time(&frame.read_end_time),
            "[utc] local PC time when readout completed",
        ),
        Card::Blank,
        Card::comment(" ---           CAMERA INFORMATION            --- "),
        Card::new("CAMID", camera_id, "camera identifier"),
        Card::new("CAMERA", camera.model.as_str(), "camera model"),
        Card::new("CAMSER", camera.serial.as_str(), "camera serial number"),
        Card::new("CAMFIRM", camera.firmware.as_str(), "camera firmware version"),
        Card::new("CAMSOFT", camera.software.as_str(), "camera software version"),
        Card::new("CAMGRAB", camera.grabber_model.as_str(), "frame grabber model"),
        Card::new("CAMSDK", camera.library.as_str(), "frame grabber sdk"),
        Card::new(
            "CAM-TEMP",
            round(cooler.sensor_temperature, 2),
            "[deg c] sensor temperature at end of exposure",
        ),
        Card::new(
            "CAM-SPT",
            round(cooler.senpcb_temperature, 2),
            "[deg c] sensor pcb assembly temperature ",
        ),
        Card::new(
            "CAM-DPT",
            round(cooler.digpcb_temperature, 2),
            "[deg c] digital pcb assembly temperature",
        ),
        Card::new("TEC-MODE", cooler.cooler_mode.label(), "temperature control mode"),
        setpoint,
        Card::new(
            "TEC-LOCK",
            cooler.cooler_mode == CoolerMode::Locked,
            "sensor temperature is locked to set point",
        ),
        Card::new("TEC-VOLT", cooler.cooler_voltage, "[V] voltage applied to the tec"),
        Card::new("CAM-BIN", 1i64, "[px] binning factor"),
        Card::new("CAM-WIND", region.as_str(), "[x1:x2,y1:y2] readout region (detector coords)"),
        Card::new("IMAG-RGN", region.as_str(), "[x1:x2,y1:y2] image region (image coords)"),
        Card::new("FIELD", frame.field, "frame count since camera initialization"),
        Card::new("EXPCNT", frame.exposure_count, "running exposure count since EXPCREF"),
        Card::new(
            "EXPCREF",
            frame.exposure_count_reference.as_str(),
            "date the exposure counter was reset",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::Value;
    use chrono::TimeZone;

    fn sample_frame() -> FrameMetadata {
        FrameMetadata {
            width: 1280,
            height: 1024,
            exposure: 0.5,
            frame_period: 0.50006666,
            field: 17,
            read_end_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap(),
            cooler: CoolerTelemetry {
                cooler_mode: CoolerMode::Locked,
                cooler_setpoint: Some(-40.0),
                cooler_voltage: 3.2,
                sensor_temperature: -39.996,
                case_temperature: 21.0,
                senpcb_temperature: 25.123,
                digpcb_temperature: 30.5,
            },
            camera: Arc::new(CameraInfo {
                model: "NINOX 1280 (NX1280x1)".into(),
                serial: "1234".into(),
                ..Default::default()
            }),
            exposure_count: 99,
            exposure_count_reference: "2024-01-01".into(),
        }
    }

    fn find<'a>(cards: &'a [Card], key: &str) -> Option<&'a Value> {
        cards.iter().find_map(|c| match c {
            Card::Keyword { keyword, value, .. } if keyword == key => Some(value),
            _ => None,
        })
    }

    #[test]
    fn test_region_format() {
        assert_eq!(format_sensor_region([0, 1279, 0, 1023]), "[1:1280,1:1024]");
    }

    #[test]
    fn test_header_values() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let cards = frame_header(&sample_frame(), "CAM1", start);

        assert_eq!(
            find(&cards, "DATE-OBS"),
            Some(&Value::Str("2024-01-01T00:00:00.000000".into()))
        );
        assert_eq!(
            find(&cards, "DATE-END"),
            Some(&Value::Str("2024-01-01T00:00:00.500000".into()))
        );
        assert_eq!(find(&cards, "EXPCADNC"), Some(&Value::Float(0.5)));
        assert_eq!(find(&cards, "CAM-TEMP"), Some(&Value::Float(-40.0)));
        assert_eq!(find(&cards, "TEC-LOCK"), Some(&Value::Bool(true)));
        assert_eq!(find(&cards, "TEMP-SET"), Some(&Value::Float(-40.0)));
        assert_eq!(find(&cards, "CAM-WIND"), Some(&Value::Str("[1:1280,1:1024]".into())));
        assert_eq!(find(&cards, "EXPCNT"), Some(&Value::Int(99)));
        assert_eq!(find(&cards, "FIELD"), Some(&Value::Int(17)));
    }

    #[test]
    fn test_header_order() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let cards = frame_header(&sample_frame(), "CAM1", start);
        assert_eq!(cards.len(), 30);
        assert_eq!(cards[0], Card::Blank);
        assert!(matches!(&cards[2], Card::Keyword { keyword, .. } if keyword == "DATE-OBS"));
        assert!(matches!(&cards[29], Card::Keyword { keyword, .. } if keyword == "EXPCREF"));
    }

    #[test]
    fn test_warm_setpoint_becomes_comment() {
        let mut frame = sample_frame();
        frame.cooler.cooler_setpoint = None;
        frame.cooler.cooler_mode = CoolerMode::Off;
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let cards = frame_header(&frame, "CAM1", start);

        assert!(find(&cards, "TEMP-SET").is_none());
        assert!(cards.contains(&Card::comment(" TEMP-SET not available")));
        assert_eq!(find(&cards, "TEC-LOCK"), Some(&Value::Bool(false)));
        assert_eq!(find(&cards, "TEC-MODE"), Some(&Value::Str("OFF".into())));
    }
}
