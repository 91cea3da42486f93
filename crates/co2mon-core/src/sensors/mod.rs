//! CO2 sensor backends.
//!
//! Each supported Sensirion part implements [`Co2Sensor`]. Backends differ in
//! what they can do, so every one advertises a [`Capabilities`] set; asking a
//! backend for something it lacks returns a fixed neutral value instead of an
//! error. [`AnySensor`] picks the backend at runtime from a [`SensorKind`].

mod scd30;
mod scd41;
pub(crate) mod sensirion;
mod sgp30;

use embassy_time::Instant;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, SensorError, SettingsError};

pub use scd30::Scd30;
pub use scd41::Scd41;
pub use sgp30::Sgp30;

/// Supported sensor models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SensorKind {
    /// Sensirion SCD30 NDIR sensor
    Scd30,
    /// Sensirion SCD41 photoacoustic sensor
    #[default]
    Scd41,
    /// Sensirion SGP30 metal-oxide sensor (equivalent CO2 only)
    Sgp30,
}

impl SensorKind {
    /// Model name for logs and the display title
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scd30 => "SCD-30",
            Self::Scd41 => "SCD-41",
            Self::Sgp30 => "SGP-30",
        }
    }

    /// 7-bit I2C address
    pub const fn address(self) -> u8 {
        match self {
            Self::Scd30 => 0x61,
            Self::Scd41 => 0x62,
            Self::Sgp30 => 0x58,
        }
    }

    /// Seconds between new measurements
    pub const fn sample_period_secs(self) -> u16 {
        match self {
            Self::Scd30 => 2,
            Self::Scd41 => 5,
            Self::Sgp30 => 1,
        }
    }

    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::Scd30 => Capabilities {
                temperature: true,
                humidity: true,
                altitude_compensation: true,
                auto_self_calibration: true,
                factory_reset: false,
                forced_recalibration: true,
            },
            Self::Scd41 => Capabilities {
                temperature: true,
                humidity: true,
                altitude_compensation: true,
                auto_self_calibration: true,
                factory_reset: true,
                forced_recalibration: true,
            },
            Self::Sgp30 => Capabilities::NONE,
        }
    }
}

/// Feature support of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub temperature: bool,
    pub humidity: bool,
    pub altitude_compensation: bool,
    pub auto_self_calibration: bool,
    /// Persistent calibration memory that can be wiped
    pub factory_reset: bool,
    /// Can be shifted to a known reference concentration
    pub forced_recalibration: bool,
}

impl Capabilities {
    /// CO2 only
    pub const NONE: Self = Self {
        temperature: false,
        humidity: false,
        altitude_compensation: false,
        auto_self_calibration: false,
        factory_reset: false,
        forced_recalibration: false,
    };

    /// Whether the device keeps any configurable settings at all
    pub const fn has_settings(&self) -> bool {
        self.altitude_compensation || self.auto_self_calibration
    }
}

/// One reading from the sensor.
///
/// `co2_ppm == 0` is the error sentinel. Temperature and humidity are zero
/// on backends that do not measure them.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurement {
    /// CO2 concentration in ppm
    pub co2_ppm: u16,
    /// Temperature in °C
    pub temperature: f32,
    /// Relative humidity in %
    pub humidity: f32,
}

impl Measurement {
    /// Reading reported in place of real data after a fault
    pub const ERROR: Self = Self {
        co2_ppm: 0,
        temperature: 0.0,
        humidity: 0.0,
    };

    pub const fn new(co2_ppm: u16, temperature: f32, humidity: f32) -> Self {
        Self {
            co2_ppm,
            temperature,
            humidity,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.co2_ppm != 0
    }
}

/// Configuration persisted in the sensor's own non-volatile memory
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceSettings {
    /// Subtracted from the measured temperature, °C
    pub temperature_offset: f32,
    /// Metres above sea level, for pressure compensation
    pub altitude_m: u16,
    /// Automatic self-calibration (ASC)
    pub auto_self_calibration: bool,
}

impl DeviceSettings {
    /// Reported by backends without configurable settings
    pub const NEUTRAL: Self = Self {
        temperature_offset: 0.0,
        altitude_m: 0,
        auto_self_calibration: false,
    };
}

/// Common protocol of every CO2 sensor backend.
///
/// Methods that a backend cannot support complete successfully with a neutral
/// result; the capability flags tell the caller which ones are real.
pub trait Co2Sensor {
    fn kind(&self) -> SensorKind;

    fn capabilities(&self) -> Capabilities {
        self.kind().capabilities()
    }

    /// Seconds between new measurements
    fn sample_period_secs(&self) -> u16 {
        self.kind().sample_period_secs()
    }

    /// Whether periodic sampling is currently running on the device
    fn is_sampling(&self) -> bool;

    /// Bring the device up and start periodic sampling.
    fn begin(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    /// Non-blocking check for a new measurement.
    ///
    /// `now` lets backends that must be triggered at a fixed rate pace
    /// themselves; the others ignore it.
    fn poll(&mut self, now: Instant) -> impl Future<Output = Result<Option<Measurement>, SensorError>>;

    /// Forced recalibration to `target_ppm`; returns the applied correction.
    fn calibrate(&mut self, target_ppm: u16) -> impl Future<Output = Result<i16, CalibrationError>>;

    /// Wipe stored calibration and settings.
    fn factory_reset(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    fn settings(&mut self) -> impl Future<Output = Result<DeviceSettings, SettingsError>>;

    /// Write settings in order (offset, altitude, ASC). Fields written before
    /// a failure stay applied.
    fn set_settings(
        &mut self,
        settings: DeviceSettings,
    ) -> impl Future<Output = Result<(), SettingsError>>;
}

/// Backend selected at runtime
pub enum AnySensor<I, D> {
    Scd30(Scd30<I, D>),
    Scd41(Scd41<I, D>),
    Sgp30(Sgp30<I, D>),
}

impl<I: I2c, D: DelayNs> AnySensor<I, D> {
    /// Construct the backend for `kind` on the given bus
    pub fn new(kind: SensorKind, i2c: I, delay: D) -> Self {
        match kind {
            SensorKind::Scd30 => Self::Scd30(Scd30::new(i2c, delay)),
            SensorKind::Scd41 => Self::Scd41(Scd41::new(i2c, delay)),
            SensorKind::Sgp30 => Self::Sgp30(Sgp30::new(i2c, delay)),
        }
    }
}

impl<I: I2c, D: DelayNs> Co2Sensor for AnySensor<I, D> {
    fn kind(&self) -> SensorKind {
        match self {
            Self::Scd30(s) => s.kind(),
            Self::Scd41(s) => s.kind(),
            Self::Sgp30(s) => s.kind(),
        }
    }

    fn is_sampling(&self) -> bool {
        match self {
            Self::Scd30(s) => s.is_sampling(),
            Self::Scd41(s) => s.is_sampling(),
            Self::Sgp30(s) => s.is_sampling(),
        }
    }

    async fn begin(&mut self) -> Result<(), SensorError> {
        match self {
            Self::Scd30(s) => s.begin().await,
            Self::Scd41(s) => s.begin().await,
            Self::Sgp30(s) => s.begin().await,
        }
    }

    async fn poll(&mut self, now: Instant) -> Result<Option<Measurement>, SensorError> {
        match self {
            Self::Scd30(s) => s.poll(now).await,
            Self::Scd41(s) => s.poll(now).await,
            Self::Sgp30(s) => s.poll(now).await,
        }
    }

    async fn calibrate(&mut self, target_ppm: u16) -> Result<i16, CalibrationError> {
        match self {
            Self::Scd30(s) => s.calibrate(target_ppm).await,
            Self::Scd41(s) => s.calibrate(target_ppm).await,
            Self::Sgp30(s) => s.calibrate(target_ppm).await,
        }
    }

    async fn factory_reset(&mut self) -> Result<(), SensorError> {
        match self {
            Self::Scd30(s) => s.factory_reset().await,
            Self::Scd41(s) => s.factory_reset().await,
            Self::Sgp30(s) => s.factory_reset().await,
        }
    }

    async fn settings(&mut self) -> Result<DeviceSettings, SettingsError> {
        match self {
            Self::Scd30(s) => s.settings().await,
            Self::Scd41(s) => s.settings().await,
            Self::Sgp30(s) => s.settings().await,
        }
    }

    async fn set_settings(&mut self, settings: DeviceSettings) -> Result<(), SettingsError> {
        match self {
            Self::Scd30(s) => s.set_settings(settings).await,
            Self::Scd41(s) => s.set_settings(settings).await,
            Self::Sgp30(s) => s.set_settings(settings).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_per_model() {
        let sgp = SensorKind::Sgp30.capabilities();
        assert_eq!(sgp, Capabilities::NONE);
        assert!(!sgp.has_settings());

        let scd30 = SensorKind::Scd30.capabilities();
        assert!(scd30.temperature && scd30.forced_recalibration);
        assert!(!scd30.factory_reset);

        assert!(SensorKind::Scd41.capabilities().factory_reset);
    }

    #[test]
    fn test_error_sentinel() {
        assert!(!Measurement::ERROR.is_valid());
        assert!(Measurement::new(415, 21.0, 40.0).is_valid());
    }
}
