use embassy_time::Instant;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use log::{error, info};

use super::sensirion::SensirionBus;
use super::{Co2Sensor, DeviceSettings, Measurement, SensorKind};
use crate::error::{CalibrationError, SensorError, SettingsError, SettingsField};

const TRIGGER_CONTINUOUS_MEASUREMENT: u16 = 0x0010;
const SET_MEASUREMENT_INTERVAL: u16 = 0x4600;
const GET_DATA_READY: u16 = 0x0202;
const READ_MEASUREMENT: u16 = 0x0300;
const AUTOMATIC_SELF_CALIBRATION: u16 = 0x5306;
const FORCED_RECALIBRATION_VALUE: u16 = 0x5204;
const TEMPERATURE_OFFSET: u16 = 0x5403;
const ALTITUDE_COMPENSATION: u16 = 0x5102;
const READ_FIRMWARE_VERSION: u16 = 0xD100;

/// The SCD30 needs a few ms between a command and its response
const READ_EXEC_MS: u32 = 3;
const FRC_EXEC_MS: u32 = 400;
/// Pause between consecutive settings writes
const SETTINGS_WRITE_GAP_MS: u32 = 100;

/// Ambient pressure argument that disables pressure compensation
const NO_PRESSURE_COMPENSATION: u16 = 0;

/// Sensirion SCD30 NDIR CO2 sensor.
///
/// Runs in continuous mode with a 2 s interval. Settings are stored by the
/// device as soon as they are written and do not interrupt sampling.
pub struct Scd30<I, D> {
    bus: SensirionBus<I, D>,
    sampling: bool,
}

impl<I: I2c, D: DelayNs> Scd30<I, D> {
    pub fn new(i2c: I, delay: D) -> Self {
        let kind = SensorKind::Scd30;
        Self {
            bus: SensirionBus::new(i2c, delay, kind.address(), kind.name()),
            sampling: false,
        }
    }

    async fn read_word(&mut self, cmd: u16, operation: &'static str) -> Result<u16, SensorError> {
        let [word] = self.bus.read_words::<1>(cmd, READ_EXEC_MS, operation).await?;
        Ok(word)
    }
}

impl<I: I2c, D: DelayNs> Co2Sensor for Scd30<I, D> {
    fn kind(&self) -> SensorKind {
        SensorKind::Scd30
    }

    fn is_sampling(&self) -> bool {
        self.sampling
    }

    async fn begin(&mut self) -> Result<(), SensorError> {
        let version = self
            .read_word(READ_FIRMWARE_VERSION, "read firmware version")
            .await?;
        info!("SCD-30: firmware {}.{}", version >> 8, version & 0xFF);

        let interval = SensorKind::Scd30.sample_period_secs();
        self.bus
            .command_with_arg(SET_MEASUREMENT_INTERVAL, interval, "set measurement interval")
            .await?;
        self.bus
            .command_with_arg(
                TRIGGER_CONTINUOUS_MEASUREMENT,
                NO_PRESSURE_COMPENSATION,
                "trigger continuous measurement",
            )
            .await?;
        self.sampling = true;
        info!("SCD-30: continuous measurement started ({} s interval)", interval);
        Ok(())
    }

    async fn poll(&mut self, _now: Instant) -> Result<Option<Measurement>, SensorError> {
        if self.read_word(GET_DATA_READY, "get data ready").await? != 1 {
            return Ok(None);
        }

        let words = self
            .bus
            .read_words::<6>(READ_MEASUREMENT, READ_EXEC_MS, "read measurement")
            .await?;
        let [co2, temperature, humidity] = decode_floats(words);

        if !co2.is_finite() || co2 < 1.0 || co2 > f32::from(u16::MAX) {
            return Err(SensorError::InvalidData {
                sensor: self.bus.sensor(),
                operation: "read measurement",
            });
        }

        Ok(Some(Measurement {
            co2_ppm: libm::roundf(co2) as u16,
            temperature,
            humidity,
        }))
    }

    /// The SCD30 does not report a correction; the reference value it
    /// accepted is returned instead.
    async fn calibrate(&mut self, target_ppm: u16) -> Result<i16, CalibrationError> {
        self.bus
            .command_with_arg(FORCED_RECALIBRATION_VALUE, target_ppm, "set forced recalibration")
            .await?;
        self.bus.delay_ms(FRC_EXEC_MS).await;

        let applied = self
            .read_word(FORCED_RECALIBRATION_VALUE, "get forced recalibration")
            .await?;
        if applied != target_ppm {
            error!(
                "SCD-30: forced recalibration to {} ppm not applied (device reports {})",
                target_ppm, applied
            );
            return Err(CalibrationError::Rejected {
                sensor: self.bus.sensor(),
                target_ppm,
            });
        }

        info!("SCD-30: forced recalibration value {} ppm", applied);
        Ok(applied as i16)
    }

    async fn factory_reset(&mut self) -> Result<(), SensorError> {
        info!("SCD-30: factory reset not supported, ignoring");
        Ok(())
    }

    async fn settings(&mut self) -> Result<DeviceSettings, SettingsError> {
        let offset = self
            .read_word(TEMPERATURE_OFFSET, "get temperature offset")
            .await
            .map_err(SettingsError::Read)?;
        let altitude = self
            .read_word(ALTITUDE_COMPENSATION, "get altitude compensation")
            .await
            .map_err(SettingsError::Read)?;
        let asc = self
            .read_word(AUTOMATIC_SELF_CALIBRATION, "get automatic self-calibration")
            .await
            .map_err(SettingsError::Read)?;

        Ok(DeviceSettings {
            temperature_offset: f32::from(offset) / 100.0,
            altitude_m: altitude,
            auto_self_calibration: asc == 1,
        })
    }

    async fn set_settings(&mut self, settings: DeviceSettings) -> Result<(), SettingsError> {
        let steps = [
            (
                SettingsField::TemperatureOffset,
                TEMPERATURE_OFFSET,
                libm::roundf(settings.temperature_offset.max(0.0) * 100.0) as u16,
                "set temperature offset",
            ),
            (
                SettingsField::Altitude,
                ALTITUDE_COMPENSATION,
                settings.altitude_m,
                "set altitude compensation",
            ),
            (
                SettingsField::AutoSelfCalibration,
                AUTOMATIC_SELF_CALIBRATION,
                u16::from(settings.auto_self_calibration),
                "set automatic self-calibration",
            ),
        ];

        let mut applied = 0;
        for (field, cmd, word, operation) in steps {
            if let Err(cause) = self.bus.command_with_arg(cmd, word, operation).await {
                let e = SettingsError::PartialWrite {
                    applied,
                    failed: field,
                    cause,
                };
                error!("SCD-30: {}", e);
                return Err(e);
            }
            self.bus.delay_ms(SETTINGS_WRITE_GAP_MS).await;
            applied += 1;
        }

        info!("SCD-30: settings written: {:?}", settings);
        Ok(())
    }
}

/// Big-endian IEEE-754 floats, each spread over two words
fn decode_floats(words: [u16; 6]) -> [f32; 3] {
    core::array::from_fn(|i| {
        let bits = (u32::from(words[2 * i]) << 16) | u32::from(words[2 * i + 1]);
        f32::from_bits(bits)
    })
}
