//! scicam-hw — Hardware abstraction for the SciCam frame grabber.
//!
//! Provides the [`FrameGrabber`] trait, the camera's serial command
//! protocol (tunnelled through the grabber's camera link UART), the EPIX
//! XCLIB backend loaded at runtime, and a simulated camera for bench work
//! and tests.

pub mod grabber;
pub mod serial;
pub mod simulated;
pub mod xclib;

/// Sensor clock ticks per second used by `SENS:EXPPER` and `SENS:FRAMEPER`.
pub const SENSOR_CLOCK_HZ: f64 = 15e6;

pub use grabber::{open_grabber, Backend, FrameGrabber, GrabberError};
pub use serial::{serial_command, SerialError};
pub use simulated::{SimulatedCamera, SimulatedOptions};
