//! Error types for the device/bus fabric.
//!
//! Only *setup* failures are modeled as `Result` errors. Everything else a
//! guest can trigger — open-bus reads, dropped writes, IDE/SCSI
//! status-register faults, CPU-visible exceptions — is guest-visible data,
//! never a host-side `Err`, and is carried instead through [`crate::effects`]
//! or device registers.

use thiserror::Error;

/// Unrecoverable errors raised while constructing or reconfiguring a
/// machine. `System::add_device` and `DeviceOps::init` return this; nothing
/// else in the fabric does.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("ROM image not found: {0}")]
    RomNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("device '{device}' failed to initialize: {reason}")]
    DeviceInitFailed { device: &'static str, reason: String },

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    #[error("no free PCI slot for class {0:?}")]
    NoFreePciSlot(crate::pci::SlotClass),

    #[error("unknown device type '{0}'")]
    UnknownDeviceType(String),
}

pub type SetupResult<T> = Result<T, SetupError>;

/// Errors surfaced by NVR (CMOS) persistence. These are host I/O errors and
/// never terminate the emulator on their own; callers decide whether a
/// failed restore should fall back to defaults.
#[derive(Debug, Error)]
pub enum NvrError {
    #[error("NVR image has wrong size: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("I/O error accessing NVR image: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from loading the INI-like configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: malformed entry: {text}")]
    Malformed { line: usize, text: String },

    #[error("line {line}: value '{value}' is not valid for option '{option}'")]
    InvalidValue {
        line: usize,
        option: String,
        value: String,
    },
}
