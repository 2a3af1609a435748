//! Camera serial command protocol.
//!
//! Commands are ASCII lines terminated by `\r`. The camera echoes the
//! command, optionally sends a value or `ERR:` line, and finishes with a
//! `>` prompt:
//!
//! ```text
//! TEMP:SENS?\r-40.02\r>
//! TEC:EN ON\r>
//! SENS:EXPPER x\rERR: invalid argument\r>
//! ```

use crate::grabber::{FrameGrabber, GrabberError};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const BAUD_RATE: f64 = 115_200.0;

const READ_CHUNK: usize = 255;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("failed to send command `{command}`: {source}")]
    Write {
        command: String,
        source: GrabberError,
    },
    #[error("failed to read response: {0}")]
    Read(GrabberError),
    #[error("timeout while waiting for `{command}` response")]
    Timeout { command: String },
    #[error("echo response mismatch: `{expected}` != `{actual}`")]
    EchoMismatch { expected: String, actual: String },
    #[error("command `{command}`: {message}")]
    Camera { command: String, message: String },
    #[error("command `{command}` returned no value")]
    MissingValue { command: String },
    #[error("command `{command}` returned unparseable value `{value}`")]
    InvalidValue { command: String, value: String },
}

/// Send `command` and wait for the camera's reply.
///
/// Returns `Ok(None)` for commands that only acknowledge, or the value
/// line for queries. The caller must hold the grabber lock.
pub fn serial_command(
    grabber: &mut dyn FrameGrabber,
    command: &str,
    timeout: Duration,
) -> Result<Option<String>, SerialError> {
    grabber.serial_flush();

    let data = format!("{command}\r");
    grabber
        .serial_write(data.as_bytes())
        .map_err(|source| SerialError::Write {
            command: command.to_string(),
            source,
        })?;

    let mut buf = [0u8; READ_CHUNK];
    let mut response = String::new();
    let start = Instant::now();
    loop {
        let available = grabber.serial_read(&mut buf).map_err(SerialError::Read)?;
        if available > 0 {
            response.push_str(&String::from_utf8_lossy(&buf[..available]));
            if response.ends_with('>') {
                break;
            }
        }

        if start.elapsed() > timeout {
            return Err(SerialError::Timeout {
                command: command.to_string(),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    tracing::trace!(command, response = %response.escape_debug(), "serial exchange");
    parse_response(command, &response)
}

/// Interpret a complete (prompt-terminated) response to `command`.
pub fn parse_response(command: &str, response: &str) -> Result<Option<String>, SerialError> {
    let mut lines = response.split('\r');
    let echo = lines.next().unwrap_or_default();
    if echo != command {
        return Err(SerialError::EchoMismatch {
            expected: command.to_string(),
            actual: echo.to_string(),
        });
    }

    match lines.next() {
        Some(">") => Ok(None),
        Some(line) if line.starts_with("ERR:") => Err(SerialError::Camera {
            command: command.to_string(),
            message: line.to_string(),
        }),
        Some(line) => Ok(Some(line.to_string())),
        None => Err(SerialError::MissingValue {
            command: command.to_string(),
        }),
    }
}

/// Send a query and return its value line.
pub fn query(grabber: &mut dyn FrameGrabber, command: &str) -> Result<String, SerialError> {
    serial_command(grabber, command, DEFAULT_TIMEOUT)?.ok_or_else(|| SerialError::MissingValue {
        command: command.to_string(),
    })
}

/// Send a query and parse its value.
pub fn query_parsed<T: FromStr>(
    grabber: &mut dyn FrameGrabber,
    command: &str,
) -> Result<T, SerialError> {
    let value = query(grabber, command)?;
    value.trim().parse().map_err(|_| SerialError::InvalidValue {
        command: command.to_string(),
        value,
    })
}

/// Send a command whose reply carries no value.
pub fn send(grabber: &mut dyn FrameGrabber, command: &str) -> Result<(), SerialError> {
    serial_command(grabber, command, DEFAULT_TIMEOUT).map(|_| ())
}
