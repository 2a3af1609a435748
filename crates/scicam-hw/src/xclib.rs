//! EPIX XCLIB frame grabber backend.
//!
//! XCLIB is distributed as a prebuilt shared object outside the system
//! library path, so it is opened with `dlopen` when the camera is
//! initialized instead of being linked at build time. A daemon built on a
//! machine without the SDK still runs against the simulated camera.

use crate::grabber::{FrameGrabber, GrabberError};
use libc::{c_char, c_double, c_int, c_long, c_uint, c_ushort, c_void, size_t};
use std::ffi::{CStr, CString};
use std::path::Path;

pub const DEFAULT_LIBRARY_PATH: &str = "/usr/local/xclib/lib/xclib_x86_64.so";

/// All calls address the first (only) grabber.
const UNITMAP: c_int = 1;
/// Driver parameters: 8 frame buffers.
const DRIVER_PARAMS: &[u8] = b"-CQ 8\0";
const COLORSPACE_GREY: &[u8] = b"GREY\0";
const MODEL_PIXCI_E8: c_int = 0x0030;

type PxBuffer = c_long;

/// Driver open/close entry points.
struct DriverApi {
    pixci_open: unsafe extern "C" fn(*const c_char, *const c_char, *const c_char) -> c_int,
    pixci_close: unsafe extern "C" fn() -> c_int,
    mesg_error_code: unsafe extern "C" fn(c_int) -> *const c_char,
}

impl DriverApi {
    /// Open the driver with the video format file at `format`.
    ///
    /// # Safety
    ///
    /// The function pointers must be XCLIB's, or match their contracts.
    unsafe fn open(&self, format: &CStr) -> Result<(), GrabberError> {
        // SAFETY: all pointers are NUL-terminated strings that outlive the call.
        let ret = unsafe {
            (self.pixci_open)(
                DRIVER_PARAMS.as_ptr().cast(),
                std::ptr::null(),
                format.as_ptr(),
            )
        };
        if ret != 0 {
            let message = self.error_message(ret);
            // A failed open still has to be closed before the library is unloaded
            // SAFETY: pxd_PIXCIclose is valid after any pxd_PIXCIopen call.
            unsafe {
                (self.pixci_close)();
            }
            return Err(GrabberError::Open(message));
        }
        Ok(())
    }

    fn error_message(&self, code: c_int) -> String {
        // SAFETY: pxd_mesgErrorCode returns a static string for any code.
        unsafe {
            let message = (self.mesg_error_code)(code);
            if message.is_null() {
                format!("error {code}")
            } else {
                CStr::from_ptr(message).to_string_lossy().into_owned()
            }
        }
    }
}

/// Function table resolved from the shared object.
struct Api {
    driver: DriverApi,
    info_library_id: unsafe extern "C" fn() -> *const c_char,
    info_model: unsafe extern "C" fn(c_int) -> c_int,
    serial_configure: unsafe extern "C" fn(
        c_int,
        c_int,
        c_double,
        c_int,
        c_int,
        c_int,
        c_int,
        c_int,
        c_int,
    ) -> c_int,
    serial_flush: unsafe extern "C" fn(c_int, c_int, c_int, c_int) -> c_int,
    serial_write: unsafe extern "C" fn(c_int, c_int, *const c_char, c_int) -> c_int,
    serial_read: unsafe extern "C" fn(c_int, c_int, *mut c_char, c_int) -> c_int,
    image_x_dim: unsafe extern "C" fn() -> c_int,
    image_y_dim: unsafe extern "C" fn() -> c_int,
    image_z_dim: unsafe extern "C" fn() -> c_int,
    captured_buffer: unsafe extern "C" fn(c_int) -> PxBuffer,
    buffers_field_count: unsafe extern "C" fn(c_int, PxBuffer) -> c_uint,
    read_ushort: unsafe extern "C" fn(
        c_int,
        PxBuffer,
        c_int,
        c_int,
        c_int,
        c_int,
        *mut c_ushort,
        size_t,
        *const c_char,
    ) -> c_int,
    qu_live: unsafe extern "C" fn(c_int, PxBuffer) -> c_int,
    go_unlive: unsafe extern "C" fn(c_int) -> c_int,
}

/// Resolve `$name` from `$handle` as the function pointer type expected by
/// the surrounding field.
macro_rules! resolve {
    ($handle:expr, $name:literal) => {{
        let symbol = libc::dlsym($handle, concat!($name, "\0").as_ptr().cast());
        if symbol.is_null() {
            return Err(GrabberError::Unavailable(format!("missing symbol {}", $name)));
        }
        std::mem::transmute::<*mut c_void, _>(symbol)
    }};
}

impl Api {
    /// # Safety
    ///
    /// `handle` must be a live `dlopen` handle for XCLIB, whose exported
    /// functions match the signatures declared in [`Api`].
    unsafe fn load(handle: *mut c_void) -> Result<Self, GrabberError> {
        // SAFETY: forwarded from the caller's contract.
        unsafe {
            Ok(Self {
                driver: DriverApi {
                    pixci_open: resolve!(handle, "pxd_PIXCIopen"),
                    pixci_close: resolve!(handle, "pxd_PIXCIclose"),
                    mesg_error_code: resolve!(handle, "pxd_mesgErrorCode"),
                },
                info_library_id: resolve!(handle, "pxd_infoLibraryId"),
                info_model: resolve!(handle, "pxd_infoModel"),
                serial_configure: resolve!(handle, "pxd_serialConfigure"),
                serial_flush: resolve!(handle, "pxd_serialFlush"),
                serial_write: resolve!(handle, "pxd_serialWrite"),
                serial_read: resolve!(handle, "pxd_serialRead"),
                image_x_dim: resolve!(handle, "pxd_imageXdim"),
                image_y_dim: resolve!(handle, "pxd_imageYdim"),
                image_z_dim: resolve!(handle, "pxd_imageZdim"),
                captured_buffer: resolve!(handle, "pxd_capturedBuffer"),
                buffers_field_count: resolve!(handle, "pxd_buffersFieldCount"),
                read_ushort: resolve!(handle, "pxd_readushort"),
                qu_live: resolve!(handle, "pxd_quLive"),
                go_unlive: resolve!(handle, "pxd_goUnLive"),
            })
        }
    }
}

/// Owned `dlopen` handle.
struct Library {
    handle: *mut c_void,
}

impl Library {
    fn open(path: &str) -> Result<Self, GrabberError> {
        let c_path = CString::new(path)
            .map_err(|_| GrabberError::Unavailable(format!("invalid library path {path}")))?;
        // SAFETY: c_path is a valid NUL-terminated string.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(GrabberError::Unavailable(format!("{path}: {}", dlerror())));
        }
        Ok(Self { handle })
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: handle came from a successful dlopen and is closed once.
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

fn dlerror() -> String {
    // SAFETY: dlerror returns NULL or a valid NUL-terminated string owned by libc.
    unsafe {
        let message = libc::dlerror();
        if message.is_null() {
            "unknown error".into()
        } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
        }
    }
}

/// An open PIXCI grabber. Closed on drop.
pub struct XclibGrabber {
    api: Api,
    width: usize,
    height: usize,
    buffers: usize,
    // Dropped after `Drop::drop` has closed the driver.
    _library: Library,
}

// SAFETY: XCLIB may be called from any thread as long as calls are
// serialized; the daemon only touches the grabber through a mutex.
unsafe impl Send for XclibGrabber {}

impl XclibGrabber {
    /// Load XCLIB from `library` and open the grabber with the `.fmt` file
    /// at `format_path`.
    pub fn open(library: &str, format_path: &Path) -> Result<Self, GrabberError> {
        let lib = Library::open(library)?;
        // SAFETY: lib.handle is a live XCLIB handle.
        let api = unsafe { Api::load(lib.handle)? };

        let format = CString::new(format_path.to_string_lossy().as_bytes())
            .map_err(|_| GrabberError::Open(format!("invalid format path {}", format_path.display())))?;

        // SAFETY: api was resolved from XCLIB.
        unsafe { api.driver.open(&format)? };

        // SAFETY: the driver is open.
        let (width, height, buffers) = unsafe {
            (
                (api.image_x_dim)(),
                (api.image_y_dim)(),
                (api.image_z_dim)(),
            )
        };
        tracing::info!(width, height, buffers, "opened PIXCI frame grabber");

        Ok(Self {
            api,
            width: width.max(0) as usize,
            height: height.max(0) as usize,
            buffers: buffers.max(0) as usize,
            _library: lib,
        })
    }

    fn check(&self, call: &'static str, ret: c_int) -> Result<c_int, GrabberError> {
        if ret < 0 {
            Err(GrabberError::Sdk {
                call,
                message: self.api.driver.error_message(ret),
            })
        } else {
            Ok(ret)
        }
    }
}

impl Drop for XclibGrabber {
    fn drop(&mut self) {
        // SAFETY: the driver was opened in `open` and is closed exactly once.
        unsafe {
            (self.api.driver.pixci_close)();
        }
    }
}

impl FrameGrabber for XclibGrabber {
    fn library_id(&self) -> String {
        // SAFETY: returns a static NUL-terminated string or NULL.
        unsafe {
            let id = (self.api.info_library_id)();
            if id.is_null() {
                String::new()
            } else {
                CStr::from_ptr(id).to_string_lossy().into_owned()
            }
        }
    }

    fn model(&self) -> String {
        // SAFETY: the driver is open.
        let model = unsafe { (self.api.info_model)(UNITMAP) };
        if model == MODEL_PIXCI_E8 {
            "PIXCI_E8".into()
        } else {
            format!("UNKNOWN ({model:04x})")
        }
    }

    fn configure_serial(&mut self, baud: f64) -> Result<(), GrabberError> {
        // SAFETY: the driver is open; 8 data bits, no parity, 1 stop bit.
        let ret = unsafe { (self.api.serial_configure)(UNITMAP, 0, baud, 8, 0, 1, 0, 0, 0) };
        if ret != 0 {
            return Err(GrabberError::Sdk {
                call: "pxd_serialConfigure",
                message: self.api.driver.error_message(ret),
            });
        }
        Ok(())
    }

    fn serial_flush(&mut self) {
        // SAFETY: the driver is open.
        unsafe {
            (self.api.serial_flush)(UNITMAP, 0, 1, 1);
        }
    }

    fn serial_write(&mut self, data: &[u8]) -> Result<(), GrabberError> {
        let len = c_int::try_from(data.len()).map_err(|_| GrabberError::Sdk {
            call: "pxd_serialWrite",
            message: "command too long".into(),
        })?;
        // SAFETY: data is valid for len bytes.
        let ret = unsafe { (self.api.serial_write)(UNITMAP, 0, data.as_ptr().cast(), len) };
        self.check("pxd_serialWrite", ret).map(|_| ())
    }

    fn serial_read(&mut self, buf: &mut [u8]) -> Result<usize, GrabberError> {
        let len = c_int::try_from(buf.len()).unwrap_or(c_int::MAX);
        // SAFETY: buf is valid and writable for len bytes.
        let ret = unsafe { (self.api.serial_read)(UNITMAP, 0, buf.as_mut_ptr().cast(), len) };
        self.check("pxd_serialRead", ret).map(|n| n as usize)
    }

    fn image_width(&self) -> usize {
        self.width
    }

    fn image_height(&self) -> usize {
        self.height
    }

    fn buffer_count(&self) -> usize {
        self.buffers
    }

    fn captured_buffer(&mut self) -> usize {
        // SAFETY: the driver is open.
        let buffer = unsafe { (self.api.captured_buffer)(UNITMAP) };
        buffer.max(0) as usize
    }

    fn field_count(&mut self, buffer: usize) -> u32 {
        // SAFETY: the driver is open; invalid buffers return 0.
        unsafe { (self.api.buffers_field_count)(UNITMAP, buffer as PxBuffer) }
    }

    fn read_buffer(&mut self, buffer: usize, out: &mut [u16]) -> Result<(), GrabberError> {
        let expected = self.width * self.height;
        if out.len() != expected {
            return Err(GrabberError::BufferSize {
                expected,
                actual: out.len(),
            });
        }
        // SAFETY: out holds exactly width*height u16 values.
        let ret = unsafe {
            (self.api.read_ushort)(
                UNITMAP,
                buffer as PxBuffer,
                0,
                0,
                self.width as c_int,
                self.height as c_int,
                out.as_mut_ptr(),
                out.len(),
                COLORSPACE_GREY.as_ptr().cast(),
            )
        };
        self.check("pxd_readushort", ret).map(|_| ())
    }

    fn queue_live(&mut self, buffer: usize) -> Result<(), GrabberError> {
        // SAFETY: the driver is open.
        let ret = unsafe { (self.api.qu_live)(UNITMAP, buffer as PxBuffer) };
        self.check("pxd_quLive", ret).map(|_| ())
    }

    fn stop_live(&mut self) {
        // SAFETY: the driver is open.
        unsafe {
            (self.api.go_unlive)(UNITMAP);
        }
    }
}
