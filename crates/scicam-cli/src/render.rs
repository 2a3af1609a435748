//! Human-readable status output.

use scicam_core::status::LabelColor;
use scicam_core::{CameraStatus, StatusReport};

/// Terminal styling; disabled when stdout is not a terminal.
#[derive(Debug, Clone, Copy)]
pub struct Style {
    pub ansi: bool,
}

impl Style {
    fn wrap(self, code: &str, text: &str) -> String {
        if self.ansi {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    pub fn bold(self, text: &str) -> String {
        self.wrap("1", text)
    }

    pub fn label(self, text: &str, color: LabelColor) -> String {
        match color {
            LabelColor::Default => self.bold(text),
            LabelColor::Red => self.wrap("1;31", text),
            LabelColor::Yellow => self.wrap("1;33", text),
            LabelColor::Green => self.wrap("1;32", text),
        }
    }
}

pub fn status_lines(report: &StatusReport, style: Style) -> Vec<String> {
    let mut state = style.label(report.state.label(), report.state.color());
    if report.state == CameraStatus::Acquiring {
        let progress = format!(
            "{:.1} / {:.1}s",
            report.exposure_progress, report.exposure_time
        );
        state.push_str(&format!(" ({})", style.bold(&progress)));
    }

    let mut lines = vec![format!("   Camera is {state}")];
    if report.state == CameraStatus::Disabled {
        return lines;
    }

    if report.state > CameraStatus::Idle {
        if report.sequence_frame_limit > 0 {
            let frame = format!(
                "{} / {}",
                report.sequence_frame_count + 1,
                report.sequence_frame_limit
            );
            lines.push(format!("   Acquiring frame {}", style.bold(&frame)));
        } else {
            lines.push(format!("   Acquiring {}", style.bold("UNTIL STOPPED")));
        }
    }

    let cooler = &report.cooler;
    let temperature = format!("{:.0}\u{b0}C", cooler.sensor_temperature);
    lines.push(format!(
        "   Temperature is {} ({})",
        style.bold(&temperature),
        style.label(cooler.cooler_mode.label(), cooler.cooler_mode.color())
    ));

    if let Some(setpoint) = cooler.cooler_setpoint {
        let setpoint = format!("{setpoint:.0}\u{b0}C");
        lines.push(format!("   Temperature set point is {}", style.bold(&setpoint)));
    }

    let exposure = format!("{:.3} s", report.exposure_time);
    lines.push(format!("   Exposure time is {}", style.bold(&exposure)));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use scicam_core::{CoolerMode, CoolerTelemetry};

    const PLAIN: Style = Style { ansi: false };

    fn report(state: CameraStatus) -> StatusReport {
        let mut cooler = CoolerTelemetry::new(-40.0);
        cooler.cooler_mode = CoolerMode::Locked;
        cooler.sensor_temperature = -39.8;
        StatusReport {
            state,
            cooler,
            temperature_locked: true,
            exposure_time: 2.0,
            exposure_progress: 0.75,
            sequence_frame_limit: 5,
            sequence_frame_count: 1,
        }
    }

    #[test]
    fn test_disabled_shows_only_state() {
        assert_eq!(
            status_lines(&report(CameraStatus::Disabled), PLAIN),
            vec!["   Camera is OFFLINE"]
        );
    }

    #[test]
    fn test_idle_status() {
        assert_eq!(
            status_lines(&report(CameraStatus::Idle), PLAIN),
            vec![
                "   Camera is IDLE",
                "   Temperature is -40\u{b0}C (LOCKED)",
                "   Temperature set point is -40\u{b0}C",
                "   Exposure time is 2.000 s",
            ]
        );
    }

    #[test]
    fn test_exposing_status() {
        let lines = status_lines(&report(CameraStatus::Acquiring), PLAIN);
        assert_eq!(lines[0], "   Camera is EXPOSING (0.8 / 2.0s)");
        assert_eq!(lines[1], "   Acquiring frame 2 / 5");
    }

    #[test]
    fn test_continuous_and_warm() {
        let mut report = report(CameraStatus::Reading);
        report.sequence_frame_limit = 0;
        report.cooler.cooler_setpoint = None;
        report.cooler.cooler_mode = CoolerMode::Off;
        let lines = status_lines(&report, PLAIN);
        assert_eq!(lines[0], "   Camera is READING");
        assert_eq!(lines[1], "   Acquiring UNTIL STOPPED");
        assert_eq!(lines[2], "   Temperature is -40\u{b0}C (OFF)");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_ansi_colors() {
        let lines = status_lines(&report(CameraStatus::Disabled), Style { ansi: true });
        assert_eq!(lines[0], "   Camera is \x1b[1;31mOFFLINE\x1b[0m");
    }
}
