//! Camera controller: owns the grabber and implements every control
//! command. Runs on the engine thread; the acquisition thread shares the
//! grabber and the mutable state through [`CameraShared`].

use crate::acquisition::{self, SequenceContext};
use crate::output::OutputQueue;
use scicam_core::{
    CameraInfo, CameraStatus, CommandStatus, Config, CoolerMode, CoolerTelemetry, ExposureCounter,
    StatusReport,
};
use scicam_hw::serial::{self, query, query_parsed, send, BAUD_RATE};
use scicam_hw::{open_grabber, Backend, FrameGrabber, GrabberError, SerialError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Allowed range for `set_target_temperature`, in deg C.
pub const MIN_TARGET_TEMPERATURE: f64 = -65.0;
pub const MAX_TARGET_TEMPERATURE: f64 = 25.0;

const REBOOT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EXPOSURE_TIME: f64 = 1.0;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("frame grabber: {0}")]
    Grabber(#[from] GrabberError),
    #[error("serial: {0}")]
    Serial(#[from] SerialError),
    #[error("camera is not initialized")]
    NotInitialized,
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(std::io::Error),
}

/// Lock a mutex, recovering the data if another thread panicked with it held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mutable camera state read by status queries and the acquisition thread.
#[derive(Debug)]
pub struct CameraState {
    pub info: Arc<CameraInfo>,
    pub width: usize,
    pub height: usize,
    pub cooler: CoolerTelemetry,
    /// Seconds.
    pub exposure_time: f64,
    pub sequence_frame_limit: u64,
    pub sequence_frame_count: u64,
    pub exposure_start: Option<Instant>,
    pub counter: ExposureCounter,
}

/// State shared between the engine and acquisition threads.
///
/// Never hold `grabber` and `state` locked at the same time.
pub struct CameraShared {
    pub grabber: Mutex<Option<Box<dyn FrameGrabber>>>,
    pub state: Mutex<CameraState>,
    pub stop_acquisition: AtomicBool,
    /// Set while `initialize` is talking to the camera.
    pub initializing: AtomicBool,
    pub initialized: AtomicBool,
    /// Set from `start_sequence` until the sequence thread has cleaned up.
    pub acquiring: AtomicBool,
}

impl CameraShared {
    /// Run `f` with exclusive access to the open grabber.
    pub fn with_grabber<T>(
        &self,
        f: impl FnOnce(&mut dyn FrameGrabber) -> Result<T, CameraError>,
    ) -> Result<T, CameraError> {
        let mut grabber = lock(&self.grabber);
        let grabber = grabber.as_deref_mut().ok_or(CameraError::NotInitialized)?;
        f(grabber)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_acquisition.load(Ordering::SeqCst)
    }

    /// Snapshot of the camera state. Never touches the grabber, so it
    /// answers while the engine thread is busy with a slow command.
    pub fn report_status(&self) -> StatusReport {
        let initializing = self.initializing.load(Ordering::SeqCst);
        let initialized = self.initialized.load(Ordering::SeqCst);
        let acquiring = self.acquiring.load(Ordering::SeqCst);
        let stopping = self.stop_requested();
        let state = lock(&self.state);

        let mut status = if initializing {
            CameraStatus::Initializing
        } else if initialized {
            CameraStatus::Idle
        } else {
            CameraStatus::Disabled
        };
        let mut exposure_progress = 0.0;
        if acquiring {
            status = CameraStatus::Acquiring;
            if stopping {
                status = CameraStatus::Aborting;
            } else if let Some(start) = state.exposure_start {
                exposure_progress = start.elapsed().as_secs_f64();
                if exposure_progress >= state.exposure_time {
                    status = CameraStatus::Reading;
                }
            }
        }

        StatusReport {
            state: status,
            cooler: state.cooler,
            temperature_locked: state.cooler.cooler_mode == CoolerMode::Locked,
            exposure_time: state.exposure_time,
            exposure_progress,
            sequence_frame_limit: state.sequence_frame_limit,
            sequence_frame_count: state.sequence_frame_count,
        }
    }
}

struct CoolerReadings {
    sensor: f64,
    digpcb: f64,
    senpcb: f64,
    case: f64,
    voltage: f64,
    mode: CoolerMode,
}

pub struct Camera {
    config: Arc<Config>,
    backend: Backend,
    shared: Arc<CameraShared>,
    output: OutputQueue,
    acquisition: Option<JoinHandle<()>>,
}

impl Camera {
    pub fn new(config: Arc<Config>, backend: Backend, output: OutputQueue) -> Self {
        let state = CameraState {
            info: Arc::new(CameraInfo::default()),
            width: 0,
            height: 0,
            cooler: CoolerTelemetry::new(config.cooler_setpoint),
            exposure_time: DEFAULT_EXPOSURE_TIME,
            sequence_frame_limit: 0,
            sequence_frame_count: 0,
            exposure_start: None,
            counter: ExposureCounter::reset(),
        };

        Self {
            config,
            backend,
            shared: Arc::new(CameraShared {
                grabber: Mutex::new(None),
                state: Mutex::new(state),
                stop_acquisition: AtomicBool::new(false),
                initializing: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                acquiring: AtomicBool::new(false),
            }),
            output,
            acquisition: None,
        }
    }

    fn log_name(&self) -> &str {
        &self.config.log_name
    }

    /// State readable from other threads without going through the engine.
    pub fn shared(&self) -> Arc<CameraShared> {
        Arc::clone(&self.shared)
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    pub fn is_acquiring(&self) -> bool {
        self.shared.acquiring.load(Ordering::SeqCst)
    }

    /// Connect to the camera and apply the observing configuration.
    pub fn initialize(&mut self) -> CommandStatus {
        if self.is_initialized() {
            return CommandStatus::CameraNotUninitialized;
        }

        self.shared.initializing.store(true, Ordering::SeqCst);
        let status = self.connect();
        self.shared.initializing.store(false, Ordering::SeqCst);
        status
    }

    fn connect(&mut self) -> CommandStatus {
        let grabber = match open_grabber(&self.backend, &self.config.camera_config_path) {
            Ok(grabber) => grabber,
            Err(GrabberError::Unavailable(reason)) => {
                tracing::error!(camera = %self.log_name(), %reason, "camera hardware not found");
                return CommandStatus::CameraNotFound;
            }
            Err(e) => {
                tracing::error!(camera = %self.log_name(), error = %e, "failed to initialize camera");
                return CommandStatus::Failed;
            }
        };

        // Dropping the grabber on failure closes the driver again.
        let (grabber, info, width, height) = match self.configure(grabber) {
            Ok(configured) => configured,
            Err(e) => {
                tracing::error!(camera = %self.log_name(), error = %e, "failed to initialize camera");
                return CommandStatus::Failed;
            }
        };

        *lock(&self.shared.grabber) = Some(grabber);
        {
            let mut state = lock(&self.shared.state);
            state.info = Arc::new(info);
            state.width = width;
            state.height = height;
            state.cooler = CoolerTelemetry::new(self.config.cooler_setpoint);
            state.counter = ExposureCounter::load(&self.config.expcount_path);
        }
        self.shared.initialized.store(true, Ordering::SeqCst);
        tracing::info!(camera = %self.log_name(), width, height, "initialized camera");

        self.update_cooler();
        CommandStatus::Succeeded
    }

    fn configure(
        &self,
        mut grabber: Box<dyn FrameGrabber>,
    ) -> Result<(Box<dyn FrameGrabber>, CameraInfo, usize, usize), CameraError> {
        let g = grabber.as_mut();
        let library = g.library_id();
        let grabber_model = g.model();

        g.configure_serial(BAUD_RATE)?;
        g.serial_flush();

        serial::serial_command(g, "REBOOT", REBOOT_TIMEOUT)?;
        send(g, "SOC 30HZ_1MSEXP_-40C_LOWNOISE")?;
        send(g, "DATA:STAMP ON")?;
        send(g, &format!("TEMP:SENS:SET {}", self.config.cooler_setpoint))?;
        send(g, "TEC:EN ON")?;

        let width = g.image_width();
        let height = g.image_height();

        // No frames until a sequence starts
        send(g, "SENS:TRIG OFF")?;

        let model = query(g, "SYS:MODEL?")?;
        let part_number = query(g, "SYS:PN?")?;
        let version = query(g, "SYS:VER?")?;
        let info = CameraInfo {
            model: format!("{model} ({part_number}{version})"),
            serial: query(g, "SYS:SN?")?,
            firmware: query(g, "SYS:FW?")?,
            software: query(g, "SYS:SW?")?,
            library,
            grabber_model,
        };

        Ok((grabber, info, width, height))
    }

    /// Stop any sequence and disconnect from the camera.
    pub fn shutdown(&mut self) -> CommandStatus {
        if !self.is_initialized() {
            return CommandStatus::CameraNotInitialized;
        }

        if let Some(thread) = self.acquisition.take() {
            tracing::info!(camera = %self.log_name(), "waiting for acquisition to complete");
            self.shared.stop_acquisition.store(true, Ordering::SeqCst);
            if thread.join().is_err() {
                tracing::error!(camera = %self.log_name(), "acquisition thread panicked");
            }
        }

        *lock(&self.shared.grabber) = None;
        lock(&self.shared.state).cooler.cooler_mode = CoolerMode::Unknown;
        self.shared.initialized.store(false, Ordering::SeqCst);
        tracing::info!(camera = %self.log_name(), "shutdown camera");
        CommandStatus::Succeeded
    }

    /// Poll the cooler and temperature sensors.
    pub fn update_cooler(&mut self) {
        if !self.is_initialized() {
            return;
        }

        let readings = self.shared.with_grabber(|g| {
            let enabled = query(g, "TEC:EN?")? == "ON";
            let mode = if !enabled {
                CoolerMode::Off
            } else if query(g, "TEC:LOCK?")? == "ON" {
                CoolerMode::Locked
            } else {
                CoolerMode::Locking
            };

            Ok(CoolerReadings {
                sensor: query_parsed(g, "TEMP:SENS?")?,
                digpcb: query_parsed(g, "TEMP:DIGPCB?")?,
                senpcb: query_parsed(g, "TEMP:SENSPCB?")?,
                case: query_parsed(g, "TEMP:CASE?")?,
                voltage: query_parsed(g, "TEC:V?")?,
                mode,
            })
        });

        let mut state = lock(&self.shared.state);
        match readings {
            Ok(r) => {
                state.cooler.sensor_temperature = r.sensor;
                state.cooler.digpcb_temperature = r.digpcb;
                state.cooler.senpcb_temperature = r.senpcb;
                state.cooler.case_temperature = r.case;
                state.cooler.cooler_voltage = r.voltage;
                state.cooler.cooler_mode = r.mode;
            }
            Err(e) => {
                tracing::warn!(camera = %self.config.log_name, error = %e, "failed to query cooler");
                state.cooler.cooler_mode = CoolerMode::Unknown;
            }
        }
    }

    /// Set the sensor set point, or warm up when `temperature` is `None`.
    pub fn set_target_temperature(&mut self, temperature: Option<f64>, quiet: bool) -> CommandStatus {
        if !self.is_initialized() {
            return CommandStatus::CameraNotInitialized;
        }
        if let Some(t) = temperature {
            if !(MIN_TARGET_TEMPERATURE..=MAX_TARGET_TEMPERATURE).contains(&t) {
                return CommandStatus::TemperatureOutsideLimits;
            }
        }

        let result = self.shared.with_grabber(|g| {
            match temperature {
                Some(t) => {
                    send(g, &format!("TEMP:SENS:SET {t}"))?;
                    send(g, "TEC:EN ON")?;
                }
                None => send(g, "TEC:EN OFF")?,
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::error!(camera = %self.log_name(), error = %e, "failed to set temperature");
            return CommandStatus::Failed;
        }

        lock(&self.shared.state).cooler.cooler_setpoint = temperature;
        if !quiet {
            match temperature {
                Some(t) => tracing::info!(camera = %self.log_name(), "Target temperature set to {t}"),
                None => tracing::info!(camera = %self.log_name(), "Target temperature set to warm"),
            }
        }
        CommandStatus::Succeeded
    }

    /// Set the exposure time in seconds used by the next sequence.
    pub fn set_exposure(&mut self, exposure: f64, quiet: bool) -> CommandStatus {
        if !self.is_initialized() {
            return CommandStatus::CameraNotInitialized;
        }
        if self.is_acquiring() {
            return CommandStatus::CameraNotIdle;
        }
        if !exposure.is_finite() || exposure <= 0.0 {
            return CommandStatus::Failed;
        }

        lock(&self.shared.state).exposure_time = exposure;
        if !quiet {
            tracing::info!(camera = %self.log_name(), "Exposure time set to {exposure:.3}s");
        }
        CommandStatus::Succeeded
    }

    /// Start a sequence of `count` frames, or until stopped when 0.
    pub fn start_sequence(&mut self, count: u32, quiet: bool) -> CommandStatus {
        if !self.is_initialized() {
            return CommandStatus::CameraNotInitialized;
        }
        if self.is_acquiring() {
            return CommandStatus::CameraNotIdle;
        }

        // Reap the previous sequence
        if let Some(thread) = self.acquisition.take() {
            let _ = thread.join();
        }

        {
            let mut state = lock(&self.shared.state);
            state.sequence_frame_limit = u64::from(count);
            state.sequence_frame_count = 0;
            state.exposure_start = None;
        }
        self.shared.stop_acquisition.store(false, Ordering::SeqCst);
        self.shared.acquiring.store(true, Ordering::SeqCst);
        self.output.clear_stop();

        let context = SequenceContext {
            config: Arc::clone(&self.config),
            shared: Arc::clone(&self.shared),
            output: self.output.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name("scicam-acquire".into())
            .spawn(move || acquisition::run_exposure_sequence(context, quiet))
            .map_err(CameraError::Spawn);
        match spawned {
            Ok(thread) => self.acquisition = Some(thread),
            Err(e) => {
                self.shared.acquiring.store(false, Ordering::SeqCst);
                tracing::error!(camera = %self.log_name(), error = %e, "failed to start sequence");
                return CommandStatus::Failed;
            }
        }

        if !quiet {
            let count_msg = match count {
                0 => "until stopped".to_string(),
                1 => "1 frame".to_string(),
                n => format!("{n} frames"),
            };
            tracing::info!(camera = %self.log_name(), "Starting exposure sequence ({count_msg})");
        }
        CommandStatus::Succeeded
    }

    /// Abort the running sequence after the current frame.
    pub fn stop_sequence(&mut self, quiet: bool) -> CommandStatus {
        if !self.is_acquiring() || self.shared.stop_requested() {
            return CommandStatus::CameraNotAcquiring;
        }

        if !quiet {
            tracing::info!(camera = %self.log_name(), "Aborting exposure sequence");
        }
        lock(&self.shared.state).sequence_frame_count = 0;
        self.shared.stop_acquisition.store(true, Ordering::SeqCst);
        CommandStatus::Succeeded
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.shutdown();
        }
    }
}
