//! Frame grabber abstraction.

use crate::simulated::{SimulatedCamera, SimulatedOptions};
use crate::xclib::XclibGrabber;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GrabberError {
    #[error("frame grabber library unavailable: {0}")]
    Unavailable(String),
    #[error("failed to open frame grabber: {0}")]
    Open(String),
    #[error("{call} failed: {message}")]
    Sdk { call: &'static str, message: String },
    #[error("frame buffer holds {expected} pixels, destination holds {actual}")]
    BufferSize { expected: usize, actual: usize },
    #[error("camera disconnected")]
    Disconnected,
}

/// Operations the daemon needs from a frame grabber with a camera attached.
///
/// Buffer indices are 1-based, matching the EPIX SDK. All calls go through
/// a single lock in the daemon, so implementations need not be `Sync`.
pub trait FrameGrabber: Send {
    /// SDK identification string.
    fn library_id(&self) -> String;

    /// Grabber board model.
    fn model(&self) -> String;

    /// Configure the camera link UART (8N1 at `baud`).
    fn configure_serial(&mut self, baud: f64) -> Result<(), GrabberError>;

    /// Discard anything pending in both serial directions.
    fn serial_flush(&mut self);

    fn serial_write(&mut self, data: &[u8]) -> Result<(), GrabberError>;

    /// Read whatever serial data is available, returning the byte count.
    fn serial_read(&mut self, buf: &mut [u8]) -> Result<usize, GrabberError>;

    fn image_width(&self) -> usize;

    fn image_height(&self) -> usize;

    /// Number of DMA frame buffers allocated by the driver.
    fn buffer_count(&self) -> usize;

    /// Index of the most recently captured buffer.
    fn captured_buffer(&mut self) -> usize;

    /// Field count (frames since open) at which `buffer` was captured.
    fn field_count(&mut self, buffer: usize) -> u32;

    /// Copy `buffer` as 16-bit grey pixels into `out` (`width * height` long).
    fn read_buffer(&mut self, buffer: usize, out: &mut [u16]) -> Result<(), GrabberError>;

    /// Queue `buffer` for live capture.
    fn queue_live(&mut self, buffer: usize) -> Result<(), GrabberError>;

    /// Stop live capture.
    fn stop_live(&mut self);
}

/// Which grabber implementation to open.
#[derive(Debug, Clone)]
pub enum Backend {
    /// EPIX XCLIB, loaded from the given shared library path.
    Xclib { library: String },
    Simulated(SimulatedOptions),
}

impl Backend {
    pub fn xclib() -> Self {
        Backend::Xclib {
            library: crate::xclib::DEFAULT_LIBRARY_PATH.to_string(),
        }
    }
}

/// Open a grabber using the `.fmt` video format file at `format_path`.
pub fn open_grabber(
    backend: &Backend,
    format_path: &Path,
) -> Result<Box<dyn FrameGrabber>, GrabberError> {
    match backend {
        Backend::Xclib { library } => {
            let grabber = XclibGrabber::open(library, format_path)?;
            Ok(Box::new(grabber))
        }
        Backend::Simulated(options) => {
            tracing::info!(
                width = options.width,
                height = options.height,
                "opening simulated camera"
            );
            Ok(Box::new(SimulatedCamera::new(options.clone())))
        }
    }
}
