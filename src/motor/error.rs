// Error taxonomy for the motor bus
//
// Every variant belongs to exactly one ErrorClass. The retry loop in the bus
// looks only at the class, never at messages.

use std::path::PathBuf;

use super::calibration::DriveMode;
use super::control_table::Access;

/// Whether an error is worth another attempt on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts and corrupted frames: the next exchange may succeed
    Transient,
    /// Programming, configuration or hardware-reported errors
    Terminal,
}

/// Error types for motor bus operations
#[derive(Debug, thiserror::Error)]
pub enum MotorBusError {
    #[error("Failed to connect on {port}: {reason}")]
    Connection { port: String, reason: String },

    #[error("Bus on {port} is not connected")]
    NotConnected { port: String },

    #[error("Bus on {port} is already connected")]
    AlreadyConnected { port: String },

    #[error("Timeout waiting for response from motor {id}")]
    CommunicationTimeout { id: u8 },

    #[error("Corrupt frame from motor {id}: {reason}")]
    CorruptFrame { id: u8, reason: String },

    #[error("Register {register:?} does not exist on model {model}")]
    UnknownRegister { model: String, register: String },

    #[error("Register {register:?} on model {model} is {access:?}")]
    InvalidAccess {
        model: String,
        register: String,
        access: Access,
    },

    #[error("Motor {id}: value {value} is outside calibrated range [{min}, {max}]")]
    CalibrationRange {
        id: u8,
        value: f64,
        min: i32,
        max: i32,
    },

    #[error("Unknown motor model {model:?}")]
    UnknownModel { model: String },

    #[error("Motor {id} is not configured on this bus")]
    UnknownDevice { id: u8 },

    #[error("Value {value} does not fit register {register:?} ({width} bytes)")]
    ValueOutOfRange {
        register: String,
        value: f64,
        width: u8,
    },

    #[error("Instruction {instruction} cannot be sent to the broadcast id")]
    BroadcastNotAllowed { instruction: &'static str },

    #[error("Motor {id} returned error status: 0x{status:02X}")]
    DeviceStatus { id: u8, status: u8 },

    #[error("Motor {id} has no calibration record")]
    NotCalibrated { id: u8 },

    #[error("Invalid calibration for motor {id}: {reason} (drive mode {drive_mode:?})")]
    InvalidCalibration {
        id: u8,
        drive_mode: DriveMode,
        reason: String,
    },

    #[error("{} of {total} motors failed during sync {operation}: {failed:?}", failed.len())]
    SyncFailed {
        operation: &'static str,
        failed: Vec<u8>,
        total: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Calibration file {path}: {source}")]
    CalibrationFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MotorBusError {
    /// Classify the error for the retry loop
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CommunicationTimeout { .. } | Self::CorruptFrame { .. } => ErrorClass::Transient,
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Motor id the error is about, when there is one
    pub fn device_id(&self) -> Option<u8> {
        match self {
            Self::CommunicationTimeout { id }
            | Self::CorruptFrame { id, .. }
            | Self::CalibrationRange { id, .. }
            | Self::UnknownDevice { id }
            | Self::DeviceStatus { id, .. }
            | Self::NotCalibrated { id }
            | Self::InvalidCalibration { id, .. } => Some(*id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MotorBusError>;
