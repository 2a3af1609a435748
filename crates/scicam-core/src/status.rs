//! Command return codes and camera/cooler state enumerations.
//!
//! The numeric values are part of the control interface: they travel over
//! D-Bus as plain integers and are shared with the observatory's other
//! camera daemons, so they must never be renumbered.

use serde::{Deserialize, Serialize};

/// Numeric return codes for control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CommandStatus {
    Succeeded = 0,
    Failed = 1,
    Blocked = 2,
    InvalidControlIP = 3,
    CameraNotFound = 5,
    CameraNotInitialized = 10,
    CameraNotIdle = 11,
    CameraNotUninitialized = 14,
    CameraNotAcquiring = 15,
    TemperatureOutsideLimits = 20,
    /// Client side: the command was interrupted with ctrl-c.
    TerminatedByUser = -100,
    /// Client side: the daemon could not be reached.
    DaemonUnreachable = -101,
}

impl CommandStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let status = match code {
            0 => Self::Succeeded,
            1 => Self::Failed,
            2 => Self::Blocked,
            3 => Self::InvalidControlIP,
            5 => Self::CameraNotFound,
            10 => Self::CameraNotInitialized,
            11 => Self::CameraNotIdle,
            14 => Self::CameraNotUninitialized,
            15 => Self::CameraNotAcquiring,
            20 => Self::TemperatureOutsideLimits,
            -100 => Self::TerminatedByUser,
            -101 => Self::DaemonUnreachable,
            _ => return None,
        };
        Some(status)
    }

    /// Human readable description of a return code.
    pub fn message(code: i32) -> String {
        let text = match Self::from_code(code) {
            Some(Self::Failed) => "error: command failed",
            Some(Self::Blocked) => "error: another command is already running",
            Some(Self::InvalidControlIP) => "error: command not accepted from this IP",
            Some(Self::CameraNotFound) => "error: camera hardware not found",
            Some(Self::CameraNotInitialized) => "error: camera has not been initialized",
            Some(Self::CameraNotIdle) => "error: camera is not idle",
            Some(Self::CameraNotUninitialized) => "error: camera has already been initialized",
            Some(Self::CameraNotAcquiring) => "error: camera is not acquiring",
            Some(Self::TemperatureOutsideLimits) => {
                "error: requested temperature is outside the supported limits"
            }
            Some(Self::TerminatedByUser) => "error: terminated by user",
            Some(Self::DaemonUnreachable) => "error: unable to communicate with camera daemon",
            Some(Self::Succeeded) | None => return format!("error: Unknown error code {code}"),
        };
        text.to_string()
    }
}

impl From<CommandStatus> for i32 {
    fn from(status: CommandStatus) -> Self {
        status.code()
    }
}

/// Terminal color hint for a status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelColor {
    Default,
    Red,
    Yellow,
    Green,
}

/// Status of the camera hardware.
///
/// `Reading` is derived when the status is queried and is never stored
/// as the engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CameraStatus {
    Disabled = 0,
    Initializing = 1,
    Idle = 2,
    Waiting = 3,
    Acquiring = 4,
    Reading = 5,
    Aborting = 6,
}

impl CameraStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Disabled => "OFFLINE",
            Self::Initializing => "INITIALIZING",
            Self::Idle => "IDLE",
            Self::Waiting => "WAITING",
            Self::Acquiring => "EXPOSING",
            Self::Reading => "READING",
            Self::Aborting => "ABORTING",
        }
    }

    pub fn color(self) -> LabelColor {
        match self {
            Self::Disabled | Self::Initializing | Self::Aborting => LabelColor::Red,
            Self::Idle => LabelColor::Default,
            Self::Waiting | Self::Reading => LabelColor::Yellow,
            Self::Acquiring => LabelColor::Green,
        }
    }
}

impl From<CameraStatus> for u8 {
    fn from(status: CameraStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for CameraStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Initializing),
            2 => Ok(Self::Idle),
            3 => Ok(Self::Waiting),
            4 => Ok(Self::Acquiring),
            5 => Ok(Self::Reading),
            6 => Ok(Self::Aborting),
            other => Err(format!("unknown camera status {other}")),
        }
    }
}

/// Camera temperature control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CoolerMode {
    Unknown = 0,
    Off = 1,
    Locking = 2,
    Locked = 3,
}

impl CoolerMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Off => "OFF",
            Self::Locking => "LOCKING",
            Self::Locked => "LOCKED",
        }
    }

    pub fn color(self) -> LabelColor {
        match self {
            Self::Unknown | Self::Off => LabelColor::Red,
            Self::Locking => LabelColor::Yellow,
            Self::Locked => LabelColor::Green,
        }
    }
}

impl From<CoolerMode> for u8 {
    fn from(mode: CoolerMode) -> Self {
        mode as u8
    }
}

impl TryFrom<u8> for CoolerMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Off),
            2 => Ok(Self::Locking),
            3 => Ok(Self::Locked),
            other => Err(format!("unknown cooler mode {other}")),
        }
    }
}
