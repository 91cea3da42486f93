//! Error taxonomy shared by the history engine, sensor backends and driver.
//!
//! Nothing in this crate is fatal: every failure resolves to a retry, a
//! degraded reading, or one of these values handed back to the caller.

use thiserror_no_std::Error;

/// Errors raised by a sensor backend while talking to the device.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// The I2C transaction itself failed (NACK, arbitration loss, bus stuck).
    #[error("{sensor}: I2C bus error during {operation}")]
    Bus {
        /// Sensor model name
        sensor: &'static str,
        /// Operation that was in flight
        operation: &'static str,
    },

    /// A response word failed its CRC-8 check
    #[error("{sensor}: CRC mismatch in {operation} response")]
    Crc {
        sensor: &'static str,
        operation: &'static str,
    },

    /// The device answered, but with a value that cannot be a measurement
    #[error("{sensor}: invalid data from {operation}")]
    InvalidData {
        sensor: &'static str,
        operation: &'static str,
    },

    /// The backend has no such command
    #[error("{sensor}: {operation} is not supported")]
    Unsupported {
        sensor: &'static str,
        operation: &'static str,
    },
}

impl SensorError {
    /// Bus errors are transient: a loose connector that comes good again
    /// needs the device re-initialized, nothing more.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Bus { .. })
    }
}

/// Errors from [`crate::driver::SensorDriver::begin`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// The backend could not be brought up
    #[error("sensor initialization failed: {cause}")]
    BeginFailed { cause: SensorError },

    /// The operation is not allowed while the driver is in this state
    #[error("operation not allowed while driver is {state:?}")]
    InvalidState { state: crate::driver::DriverState },

    /// A device command failed
    #[error("{0}")]
    Sensor(SensorError),
}

impl From<SensorError> for DriverError {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

/// Forced recalibration failed. Always distinct from a zero correction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationError {
    /// The backend cannot be recalibrated against a reference
    #[error("{sensor} does not support forced recalibration")]
    Unsupported { sensor: &'static str },

    /// The driver is not in a state that can be quiesced for calibration
    #[error("sensor is not ready for calibration ({state:?})")]
    NotReady { state: crate::driver::DriverState },

    /// Another calibration session has not finished yet
    #[error("a calibration session is already in progress")]
    SessionActive,

    /// Communication failed during the calibration sequence
    #[error("calibration failed: {0}")]
    Sensor(SensorError),

    /// The device ran the command and reported failure
    #[error("{sensor} rejected forced recalibration to {target_ppm} ppm")]
    Rejected {
        sensor: &'static str,
        target_ppm: u16,
    },
}

impl From<SensorError> for CalibrationError {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

/// Individual persisted device setting, in the order they are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    TemperatureOffset,
    Altitude,
    AutoSelfCalibration,
    Persist,
}

/// Errors reading or writing device settings.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    /// A write stopped partway. Fields written before `failed` stay applied;
    /// the device protocol has no transaction to roll back.
    #[error("settings write failed at {failed:?} after {applied} field(s): {cause}")]
    PartialWrite {
        applied: u8,
        failed: SettingsField,
        cause: SensorError,
    },

    /// Reading back the current settings failed
    #[error("settings read failed: {0}")]
    Read(SensorError),
}

/// Index past the retained entries of a ring buffer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("index {index} out of range (count: {count})")]
pub struct IndexOutOfRange {
    pub index: usize,
    pub count: usize,
}
