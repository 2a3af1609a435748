//! In-process simulated camera.
//!
//! Speaks the same serial protocol as the real camera, models the sensor
//! cooling towards its set point, and produces timestamped frames at the
//! programmed frame period while triggered and live. Used for bench work
//! without a frame grabber and by the daemon's tests.

use crate::grabber::{FrameGrabber, GrabberError};
use crate::SENSOR_CLOCK_HZ;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rand::Rng;
use scicam_core::timestamp::encode_frame_timestamp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shortest frame period the sensor supports (30 Hz).
const MIN_FRAME_PERIOD_COUNTS: u64 = 500_000;
const EXPOSURE_GAP_COUNTS: u64 = 1000;
const DEFAULT_EXPOSURE_COUNTS: u64 = 15_000;
const LOCK_TOLERANCE: f64 = 0.5;
const BIAS_LEVEL: u16 = 1000;

/// Simulated hardware parameters.
#[derive(Debug, Clone)]
pub struct SimulatedOptions {
    pub width: usize,
    pub height: usize,
    /// DMA buffers reported by the grabber.
    pub buffer_count: usize,
    pub ambient_temperature: f64,
    /// Time constant of the exponential approach to the set point.
    pub cooling_time_constant: Duration,
    /// How long `REBOOT` blocks before acknowledging.
    pub reboot_delay: Duration,
    connected: Arc<AtomicBool>,
}

impl Default for SimulatedOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
            buffer_count: 8,
            ambient_temperature: 20.0,
            cooling_time_constant: Duration::from_secs(20),
            reboot_delay: Duration::ZERO,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl SimulatedOptions {
    /// Plug or unplug the camera link; serial traffic fails while unplugged.
    /// Shared by every camera opened from clones of these options.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
struct CapturedBuffer {
    field: u32,
    exposure_start: DateTime<Utc>,
}

#[derive(Debug)]
struct Sensor {
    tec_enabled: bool,
    setpoint: f64,
    temperature: f64,
    last_thermal_update: Instant,
    exposure_counts: u64,
    frame_period_counts: u64,
    triggered: bool,
    stamp: bool,
}

impl Sensor {
    fn new(ambient: f64) -> Self {
        Self {
            tec_enabled: false,
            setpoint: 0.0,
            temperature: ambient,
            last_thermal_update: Instant::now(),
            exposure_counts: DEFAULT_EXPOSURE_COUNTS,
            frame_period_counts: MIN_FRAME_PERIOD_COUNTS,
            triggered: false,
            stamp: false,
        }
    }

    fn min_frame_period(&self) -> u64 {
        (self.exposure_counts + EXPOSURE_GAP_COUNTS).max(MIN_FRAME_PERIOD_COUNTS)
    }
}

pub struct SimulatedCamera {
    options: SimulatedOptions,
    sensor: Sensor,
    /// Bytes waiting to be read from the camera.
    rx: Vec<u8>,
    /// Partial command line written to the camera.
    tx: Vec<u8>,
    live: bool,
    trigger_start: Option<(Instant, DateTime<Utc>)>,
    frames_since_trigger: u64,
    field: u32,
    buffers: Vec<Option<CapturedBuffer>>,
    last_buffer: usize,
}

impl SimulatedCamera {
    pub fn new(options: SimulatedOptions) -> Self {
        let buffer_count = options.buffer_count.max(1);
        Self {
            sensor: Sensor::new(options.ambient_temperature),
            options,
            rx: Vec::new(),
            tx: Vec::new(),
            live: false,
            trigger_start: None,
            frames_since_trigger: 0,
            field: 0,
            buffers: vec![None; buffer_count],
            last_buffer: buffer_count,
        }
    }

    fn update_thermal(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.sensor.last_thermal_update).as_secs_f64();
        self.sensor.last_thermal_update = now;

        let target = if self.sensor.tec_enabled {
            self.sensor.setpoint
        } else {
            self.options.ambient_temperature
        };
        let tau = self.options.cooling_time_constant.as_secs_f64();
        self.sensor.temperature = if tau > 0.0 {
            target + (self.sensor.temperature - target) * (-dt / tau).exp()
        } else {
            target
        };
    }

    /// Record frames completed since the trigger was enabled.
    fn advance_frames(&mut self) {
        let Some((start, start_utc)) = self.trigger_start else {
            return;
        };
        if !self.live {
            return;
        }

        let period = self.sensor.frame_period_counts as f64 / SENSOR_CLOCK_HZ;
        let completed = (start.elapsed().as_secs_f64() / period).floor() as u64;
        if completed <= self.frames_since_trigger {
            return;
        }
        let count = self.buffers.len() as u64;
        // Older frames would have been overwritten by the ring anyway
        let first = self.frames_since_trigger.max(completed.saturating_sub(count));
        self.field = self
            .field
            .wrapping_add((first - self.frames_since_trigger) as u32);

        for k in first..completed {
            self.field = self.field.wrapping_add(1);
            self.last_buffer = self.last_buffer % self.buffers.len() + 1;
            let offset = ChronoDuration::nanoseconds((k as f64 * period * 1e9) as i64);
            self.buffers[self.last_buffer - 1] = Some(CapturedBuffer {
                field: self.field,
                exposure_start: start_utc + offset,
            });
        }
        self.frames_since_trigger = completed;
    }

    fn set_trigger(&mut self, enabled: bool) {
        self.advance_frames();
        self.sensor.triggered = enabled;
        self.trigger_start = enabled.then(|| (Instant::now(), Utc::now()));
        self.frames_since_trigger = 0;
    }

    fn handle_command(&mut self, command: &str) -> Result<Option<String>, String> {
        let (name, arg) = match command.split_once(' ') {
            Some((name, arg)) => (name, Some(arg.trim())),
            None => (command, None),
        };

        match (name, arg) {
            ("REBOOT", None) => {
                std::thread::sleep(self.options.reboot_delay);
                self.sensor = Sensor::new(self.options.ambient_temperature);
                self.trigger_start = None;
                Ok(None)
            }
            ("SOC", Some(_)) => Ok(None),
            ("DATA:STAMP", Some(value)) => {
                self.sensor.stamp = parse_switch(value)?;
                Ok(None)
            }
            ("TEMP:SENS:SET", Some(value)) => {
                self.update_thermal();
                self.sensor.setpoint = value
                    .parse()
                    .map_err(|_| "ERR: invalid argument".to_string())?;
                Ok(None)
            }
            ("TEC:EN", Some(value)) => {
                self.update_thermal();
                self.sensor.tec_enabled = parse_switch(value)?;
                Ok(None)
            }
            ("TEC:EN?", None) => Ok(Some(switch(self.sensor.tec_enabled))),
            ("TEC:LOCK?", None) => {
                self.update_thermal();
                let locked = self.sensor.tec_enabled
                    && (self.sensor.temperature - self.sensor.setpoint).abs() < LOCK_TOLERANCE;
                Ok(Some(switch(locked)))
            }
            ("TEC:V?", None) => {
                let voltage = if self.sensor.tec_enabled {
                    0.08 * (self.options.ambient_temperature - self.sensor.setpoint).max(0.0)
                } else {
                    0.0
                };
                Ok(Some(format!("{voltage:.2}")))
            }
            ("TEMP:SENS?", None) => {
                self.update_thermal();
                Ok(Some(format!("{:.2}", self.sensor.temperature)))
            }
            ("TEMP:DIGPCB?", None) => Ok(Some(format!("{:.2}", self.options.ambient_temperature + 10.0))),
            ("TEMP:SENSPCB?", None) => Ok(Some(format!("{:.2}", self.options.ambient_temperature + 5.0))),
            ("TEMP:CASE?", None) => Ok(Some(format!("{:.2}", self.options.ambient_temperature + 3.0))),
            ("SENS:EXPPER?", None) => Ok(Some(self.sensor.exposure_counts.to_string())),
            ("SENS:EXPPER", Some(value)) => {
                let counts: u64 = value.parse().map_err(|_| "ERR: invalid argument".to_string())?;
                if counts == 0 || counts + EXPOSURE_GAP_COUNTS > self.sensor.frame_period_counts {
                    return Err("ERR: value out of range".into());
                }
                self.sensor.exposure_counts = counts;
                Ok(None)
            }
            ("SENS:FRAMEPER?", None) => Ok(Some(self.sensor.frame_period_counts.to_string())),
            ("SENS:FRAMEPER:MIN?", None) => Ok(Some(self.sensor.min_frame_period().to_string())),
            ("SENS:FRAMEPER", Some(value)) => {
                let counts: u64 = value.parse().map_err(|_| "ERR: invalid argument".to_string())?;
                if counts < self.sensor.min_frame_period() {
                    return Err("ERR: value out of range".into());
                }
                self.sensor.frame_period_counts = counts;
                Ok(None)
            }
            ("SENS:TRIG", Some(value)) => {
                let enabled = parse_switch(value)?;
                self.set_trigger(enabled);
                Ok(None)
            }
            ("TIME", Some(value)) => {
                NaiveDateTime::parse_from_str(value, "%Y:%m:%d:%H:%M:%S")
                    .map_err(|_| "ERR: invalid argument".to_string())?;
                Ok(None)
            }
            ("SYS:MODEL?", None) => Ok(Some("SIMCAM".into())),
            ("SYS:PN?", None) => Ok(Some(format!("SC-{}", self.options.width))),
            ("SYS:VER?", None) => Ok(Some("A".into())),
            ("SYS:SN?", None) => Ok(Some("000001".into())),
            ("SYS:FW?", None) => Ok(Some("1.0.0".into())),
            ("SYS:SW?", None) => Ok(Some(env!("CARGO_PKG_VERSION").into())),
            _ => Err("ERR: unknown command".into()),
        }
    }
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err("ERR: invalid argument".into()),
    }
}

fn switch(value: bool) -> String {
    (if value { "ON" } else { "OFF" }).to_string()
}

impl FrameGrabber for SimulatedCamera {
    fn library_id(&self) -> String {
        "SIMULATED".into()
    }

    fn model(&self) -> String {
        "SIMULATED".into()
    }

    fn configure_serial(&mut self, _baud: f64) -> Result<(), GrabberError> {
        Ok(())
    }

    fn serial_flush(&mut self) {
        self.rx.clear();
        self.tx.clear();
    }

    fn serial_write(&mut self, data: &[u8]) -> Result<(), GrabberError> {
        if !self.options.is_connected() {
            return Err(GrabberError::Disconnected);
        }

        self.tx.extend_from_slice(data);
        while let Some(end) = self.tx.iter().position(|&b| b == b'\r') {
            let line: Vec<u8> = self.tx.drain(..=end).collect();
            let command = String::from_utf8_lossy(&line[..end]).into_owned();

            let mut response = format!("{command}\r");
            match self.handle_command(&command) {
                Ok(Some(value)) => response.push_str(&format!("{value}\r")),
                Ok(None) => {}
                Err(error) => response.push_str(&format!("{error}\r")),
            }
            response.push('>');
            self.rx.extend_from_slice(response.as_bytes());
        }
        Ok(())
    }

    fn serial_read(&mut self, buf: &mut [u8]) -> Result<usize, GrabberError> {
        if !self.options.is_connected() {
            return Err(GrabberError::Disconnected);
        }
        let count = buf.len().min(self.rx.len());
        buf[..count].copy_from_slice(&self.rx[..count]);
        self.rx.drain(..count);
        Ok(count)
    }

    fn image_width(&self) -> usize {
        self.options.width
    }

    fn image_height(&self) -> usize {
        self.options.height
    }

    fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn captured_buffer(&mut self) -> usize {
        self.advance_frames();
        self.last_buffer
    }

    fn field_count(&mut self, buffer: usize) -> u32 {
        buffer
            .checked_sub(1)
            .and_then(|i| self.buffers.get(i).copied().flatten())
            .map_or(0, |b| b.field)
    }

    fn read_buffer(&mut self, buffer: usize, out: &mut [u16]) -> Result<(), GrabberError> {
        let expected = self.options.width * self.options.height;
        if out.len() != expected {
            return Err(GrabberError::BufferSize {
                expected,
                actual: out.len(),
            });
        }
        let captured = buffer
            .checked_sub(1)
            .and_then(|i| self.buffers.get(i).copied().flatten())
            .ok_or_else(|| GrabberError::Sdk {
                call: "read_buffer",
                message: format!("buffer {buffer} holds no frame"),
            })?;

        let mut rng = rand::thread_rng();
        for pixel in out.iter_mut() {
            *pixel = BIAS_LEVEL + rng.gen_range(0..64);
        }
        if self.sensor.stamp {
            encode_frame_timestamp(captured.exposure_start, &mut out[..self.options.width])
                .map_err(|e| GrabberError::Sdk {
                    call: "read_buffer",
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn queue_live(&mut self, buffer: usize) -> Result<(), GrabberError> {
        if buffer == 0 || buffer > self.buffers.len() {
            return Err(GrabberError::Sdk {
                call: "queue_live",
                message: format!("invalid buffer {buffer}"),
            });
        }
        if !self.live {
            // Frames only count from the moment capture goes live
            self.live = true;
            if self.sensor.triggered {
                self.set_trigger(true);
            }
        }
        Ok(())
    }

    fn stop_live(&mut self) {
        self.advance_frames();
        self.live = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{query, query_parsed, send};
    use scicam_core::timestamp::decode_frame_timestamp;

    fn small_options() -> SimulatedOptions {
        SimulatedOptions {
            width: 16,
            height: 4,
            buffer_count: 4,
            cooling_time_constant: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_cooling_locks_at_setpoint() {
        let mut camera = SimulatedCamera::new(small_options());
        send(&mut camera, "TEMP:SENS:SET -40").unwrap();
        assert_eq!(query(&mut camera, "TEC:LOCK?").unwrap(), "OFF");

        send(&mut camera, "TEC:EN ON").unwrap();
        let temp: f64 = query_parsed(&mut camera, "TEMP:SENS?").unwrap();
        assert_eq!(temp, -40.0);
        assert_eq!(query(&mut camera, "TEC:LOCK?").unwrap(), "ON");

        send(&mut camera, "TEC:EN OFF").unwrap();
        let temp: f64 = query_parsed(&mut camera, "TEMP:SENS?").unwrap();
        assert_eq!(temp, 20.0);
    }

    #[test]
    fn test_exposure_requires_longer_frame_period() {
        let mut camera = SimulatedCamera::new(small_options());
        let long = 15_000_000u64;
        assert!(send(&mut camera, &format!("SENS:EXPPER {long}")).is_err());

        let min: u64 = query_parsed(&mut camera, "SENS:FRAMEPER:MIN?").unwrap();
        send(&mut camera, &format!("SENS:FRAMEPER {}", (long + 1000).max(min))).unwrap();
        send(&mut camera, &format!("SENS:EXPPER {long}")).unwrap();

        let min: u64 = query_parsed(&mut camera, "SENS:FRAMEPER:MIN?").unwrap();
        assert_eq!(min, long + 1000);
        assert!(send(&mut camera, "SENS:FRAMEPER 500000").is_err());
    }

    #[test]
    fn test_time_sync_validates_format() {
        let mut camera = SimulatedCamera::new(small_options());
        send(&mut camera, "TIME 2024:01:02:03:04:05").unwrap();
        assert!(send(&mut camera, "TIME yesterday").is_err());
    }

    #[test]
    fn test_frames_only_while_triggered_and_live() {
        let mut camera = SimulatedCamera::new(small_options());
        send(&mut camera, "DATA:STAMP ON").unwrap();

        camera.queue_live(1).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        let buffer = camera.captured_buffer();
        assert_eq!(camera.field_count(buffer), 0, "no frames before trigger");

        let before = Utc::now();
        send(&mut camera, "SENS:TRIG ON").unwrap();
        std::thread::sleep(Duration::from_millis(120));
        let buffer = camera.captured_buffer();
        assert!(camera.field_count(buffer) >= 1);

        let mut frame = vec![0u16; 64];
        camera.read_buffer(buffer, &mut frame).unwrap();
        let start = decode_frame_timestamp(&frame[..16]).unwrap();
        assert!(start >= before - ChronoDuration::milliseconds(1));

        send(&mut camera, "SENS:TRIG OFF").unwrap();
        let stopped = camera.captured_buffer();
        let field = camera.field_count(stopped);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(camera.captured_buffer(), stopped);
        assert_eq!(camera.field_count(stopped), field);
    }

    #[test]
    fn test_read_buffer_checks_size() {
        let mut camera = SimulatedCamera::new(small_options());
        let mut frame = vec![0u16; 10];
        assert!(matches!(
            camera.read_buffer(1, &mut frame),
            Err(GrabberError::BufferSize { expected: 64, actual: 10 })
        ));
    }

    #[test]
    fn test_serial_read_drains_response() {
        let mut camera = SimulatedCamera::new(small_options());
        camera.serial_write(b"TEC:EN?\r").unwrap();
        let mut buf = [0u8; 4];
        let mut response = Vec::new();
        loop {
            let n = camera.serial_read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
        }
        assert_eq!(response, b"TEC:EN?\rOFF\r>");
    }
}
