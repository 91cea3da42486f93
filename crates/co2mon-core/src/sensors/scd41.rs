use embassy_time::Instant;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use log::{error, info, warn};

use super::sensirion::SensirionBus;
use super::{Co2Sensor, DeviceSettings, Measurement, SensorKind};
use crate::error::{CalibrationError, SensorError, SettingsError, SettingsField};

const START_PERIODIC_MEASUREMENT: u16 = 0x21B1;
const STOP_PERIODIC_MEASUREMENT: u16 = 0x3F86;
const READ_MEASUREMENT: u16 = 0xEC05;
const GET_DATA_READY_STATUS: u16 = 0xE4B8;
const SET_TEMPERATURE_OFFSET: u16 = 0x241D;
const GET_TEMPERATURE_OFFSET: u16 = 0x2318;
const SET_SENSOR_ALTITUDE: u16 = 0x2427;
const GET_SENSOR_ALTITUDE: u16 = 0x2322;
const SET_ASC_ENABLED: u16 = 0x2416;
const GET_ASC_ENABLED: u16 = 0x2313;
const PERFORM_FORCED_RECALIBRATION: u16 = 0x362F;
const PERSIST_SETTINGS: u16 = 0x3615;
const PERFORM_FACTORY_RESET: u16 = 0x3632;

/// The device ignores commands for this long after a stop
const STOP_SETTLE_MS: u32 = 500;
/// Forced recalibration execution time
const FRC_EXEC_MS: u32 = 400;
const PERSIST_EXEC_MS: u32 = 800;
const FACTORY_RESET_SETTLE_MS: u32 = 10_000;
const READ_EXEC_MS: u32 = 1;

/// Start-up handshake attempts, with a short pause between them
const BEGIN_ATTEMPTS: u8 = 3;
const BEGIN_RETRY_DELAY_MS: u32 = 10;

/// Reported by forced recalibration when the device rejected the command
const FRC_FAILED: u16 = 0xFFFF;
const FRC_CORRECTION_BIAS: i32 = 0x8000;

/// Lower 11 bits of the data-ready word are non-zero when a measurement waits
const DATA_READY_MASK: u16 = 0x07FF;

/// Sensirion SCD41 photoacoustic CO2 sensor.
///
/// Runs in periodic mode, producing one measurement every 5 s. Commands
/// other than reads require periodic mode to be stopped first; every
/// operation here that stops it starts it again before returning, even
/// when the operation itself failed.
pub struct Scd41<I, D> {
    bus: SensirionBus<I, D>,
    sampling: bool,
}

impl<I: I2c, D: DelayNs> Scd41<I, D> {
    pub fn new(i2c: I, delay: D) -> Self {
        let kind = SensorKind::Scd41;
        Self {
            bus: SensirionBus::new(i2c, delay, kind.address(), kind.name()),
            sampling: false,
        }
    }

    async fn start_periodic(&mut self) -> Result<(), SensorError> {
        self.bus
            .command(START_PERIODIC_MEASUREMENT, "start periodic measurement")
            .await?;
        self.sampling = true;
        Ok(())
    }

    async fn stop_periodic(&mut self) -> Result<(), SensorError> {
        self.bus
            .command(STOP_PERIODIC_MEASUREMENT, "stop periodic measurement")
            .await?;
        self.sampling = false;
        self.bus.delay_ms(STOP_SETTLE_MS).await;
        Ok(())
    }

    /// Restart periodic mode after a command sequence, logging but not
    /// returning a failure so the sequence's own result is preserved.
    async fn resume_periodic(&mut self) {
        if let Err(e) = self.start_periodic().await {
            warn!("SCD-41: failed to restart periodic measurement: {}", e);
        }
    }

    async fn handshake(&mut self) -> Result<(), SensorError> {
        // After an MCU reset the device may still be sampling; a stop is
        // harmless otherwise.
        if let Err(e) = self.stop_periodic().await {
            warn!("SCD-41: stop before start failed: {}", e);
        }
        self.start_periodic().await
    }

    async fn forced_recalibration(&mut self, target_ppm: u16) -> Result<i16, CalibrationError> {
        self.stop_periodic().await?;
        self.bus
            .command_with_arg(PERFORM_FORCED_RECALIBRATION, target_ppm, "forced recalibration")
            .await?;
        self.bus.delay_ms(FRC_EXEC_MS).await;
        let [word] = self.bus.read_response::<1>("forced recalibration").await?;

        if word == FRC_FAILED {
            error!("SCD-41: forced recalibration to {} ppm rejected", target_ppm);
            return Err(CalibrationError::Rejected {
                sensor: self.bus.sensor(),
                target_ppm,
            });
        }
        Ok(frc_correction(word))
    }

    async fn read_settings(&mut self) -> Result<DeviceSettings, SensorError> {
        let [offset] = self
            .bus
            .read_words::<1>(GET_TEMPERATURE_OFFSET, READ_EXEC_MS, "get temperature offset")
            .await?;
        let [altitude] = self
            .bus
            .read_words::<1>(GET_SENSOR_ALTITUDE, READ_EXEC_MS, "get sensor altitude")
            .await?;
        let [asc] = self
            .bus
            .read_words::<1>(GET_ASC_ENABLED, READ_EXEC_MS, "get automatic self-calibration")
            .await?;

        Ok(DeviceSettings {
            temperature_offset: offset_from_word(offset),
            altitude_m: altitude,
            auto_self_calibration: asc != 0,
        })
    }

    async fn write_settings(&mut self, settings: DeviceSettings) -> Result<(), SettingsError> {
        let steps = [
            (
                SettingsField::TemperatureOffset,
                SET_TEMPERATURE_OFFSET,
                offset_to_word(settings.temperature_offset),
                "set temperature offset",
            ),
            (
                SettingsField::Altitude,
                SET_SENSOR_ALTITUDE,
                settings.altitude_m,
                "set sensor altitude",
            ),
            (
                SettingsField::AutoSelfCalibration,
                SET_ASC_ENABLED,
                u16::from(settings.auto_self_calibration),
                "set automatic self-calibration",
            ),
        ];

        let mut applied = 0;
        for (field, cmd, word, operation) in steps {
            self.bus
                .command_with_arg(cmd, word, operation)
                .await
                .map_err(|cause| SettingsError::PartialWrite {
                    applied,
                    failed: field,
                    cause,
                })?;
            self.bus.delay_ms(READ_EXEC_MS).await;
            applied += 1;
        }

        self.bus
            .command(PERSIST_SETTINGS, "persist settings")
            .await
            .map_err(|cause| SettingsError::PartialWrite {
                applied,
                failed: SettingsField::Persist,
                cause,
            })?;
        self.bus.delay_ms(PERSIST_EXEC_MS).await;
        Ok(())
    }
}

impl<I: I2c, D: DelayNs> Co2Sensor for Scd41<I, D> {
    fn kind(&self) -> SensorKind {
        SensorKind::Scd41
    }

    fn is_sampling(&self) -> bool {
        self.sampling
    }

    async fn begin(&mut self) -> Result<(), SensorError> {
        let mut attempt = 1;
        loop {
            match self.handshake().await {
                Ok(()) => {
                    info!("SCD-41: periodic measurement started (attempt {})", attempt);
                    return Ok(());
                }
                Err(e) if attempt < BEGIN_ATTEMPTS => {
                    warn!("SCD-41: begin attempt {} failed: {}", attempt, e);
                    attempt += 1;
                    self.bus.delay_ms(BEGIN_RETRY_DELAY_MS).await;
                }
                Err(e) => {
                    error!("SCD-41: begin failed after {} attempts: {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn poll(&mut self, _now: Instant) -> Result<Option<Measurement>, SensorError> {
        let [status] = self
            .bus
            .read_words::<1>(GET_DATA_READY_STATUS, READ_EXEC_MS, "get data ready status")
            .await?;
        if status & DATA_READY_MASK == 0 {
            return Ok(None);
        }

        let [co2, t, rh] = self
            .bus
            .read_words::<3>(READ_MEASUREMENT, READ_EXEC_MS, "read measurement")
            .await?;
        if co2 == 0 {
            return Err(SensorError::InvalidData {
                sensor: self.bus.sensor(),
                operation: "read measurement",
            });
        }

        Ok(Some(Measurement {
            co2_ppm: co2,
            temperature: -45.0 + 175.0 * f32::from(t) / 65535.0,
            humidity: 100.0 * f32::from(rh) / 65535.0,
        }))
    }

    async fn calibrate(&mut self, target_ppm: u16) -> Result<i16, CalibrationError> {
        let result = self.forced_recalibration(target_ppm).await;
        self.resume_periodic().await;

        match result {
            Ok(correction) => {
                info!(
                    "SCD-41: forced recalibration to {} ppm, correction {} ppm",
                    target_ppm, correction
                );
                Ok(correction)
            }
            Err(e) => {
                error!("SCD-41: forced recalibration failed: {}", e);
                Err(e)
            }
        }
    }

    async fn factory_reset(&mut self) -> Result<(), SensorError> {
        self.stop_periodic().await?;
        let result = self
            .bus
            .command(PERFORM_FACTORY_RESET, "perform factory reset")
            .await;
        if result.is_ok() {
            self.bus.delay_ms(FACTORY_RESET_SETTLE_MS).await;
            info!("SCD-41: factory reset complete");
        }
        self.resume_periodic().await;
        result
    }

    async fn settings(&mut self) -> Result<DeviceSettings, SettingsError> {
        let result = match self.stop_periodic().await {
            Ok(()) => self.read_settings().await,
            Err(e) => Err(e),
        };
        self.resume_periodic().await;
        result.map_err(SettingsError::Read)
    }

    async fn set_settings(&mut self, settings: DeviceSettings) -> Result<(), SettingsError> {
        let result = match self.stop_periodic().await {
            Ok(()) => self.write_settings(settings).await,
            Err(cause) => Err(SettingsError::PartialWrite {
                applied: 0,
                failed: SettingsField::TemperatureOffset,
                cause,
            }),
        };
        self.resume_periodic().await;

        match &result {
            Ok(()) => info!("SCD-41: settings written and persisted: {:?}", settings),
            Err(e) => error!("SCD-41: {}", e),
        }
        result
    }
}

/// Signed correction in ppm from the FRC response word
fn frc_correction(word: u16) -> i16 {
    (i32::from(word) - FRC_CORRECTION_BIAS) as i16
}

fn offset_to_word(offset: f32) -> u16 {
    libm::roundf(offset.max(0.0) * 65535.0 / 175.0) as u16
}

fn offset_from_word(word: u16) -> f32 {
    f32::from(word) * 175.0 / 65535.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{NoDelay, SensirionEmulator};
    use embassy_futures::block_on;

    fn sensor(emulator: &SensirionEmulator) -> Scd41<SensirionEmulator, NoDelay> {
        Scd41::new(emulator.clone(), NoDelay)
    }

    #[test]
    fn test_frc_correction_is_centred_on_bias() {
        assert_eq!(frc_correction(0x8000), 0);
        assert_eq!(frc_correction(0x8000 + 37), 37);
        assert_eq!(frc_correction(0x8000 - 12), -12);
    }

    #[test]
    fn test_offset_encoding_round_trips_within_resolution() {
        let decoded = offset_from_word(offset_to_word(4.0));
        assert!((decoded - 4.0).abs() < 0.01);
        assert_eq!(offset_to_word(-3.0), 0);
    }

    #[test]
    fn test_begin_starts_periodic_measurement() {
        let emulator = SensirionEmulator::new(SensorKind::Scd41);
        let mut scd41 = sensor(&emulator);

        block_on(scd41.begin()).unwrap();

        assert!(scd41.is_sampling());
        assert!(emulator.is_sampling());
        assert_eq!(emulator.start_count(), 1);
    }

    #[test]
    fn test_begin_retries_handshake() {
        let emulator = SensirionEmulator::new(SensorKind::Scd41);
        emulator.fail_command_once(START_PERIODIC_MEASUREMENT);
        let mut scd41 = sensor(&emulator);

        block_on(scd41.begin()).unwrap();
        assert!(emulator.is_sampling());
    }

    #[test]
    fn test_begin_gives_up_after_three_attempts() {
        let emulator = SensirionEmulator::new(SensorKind::Scd41);
        emulator.fail_next_ops(usize::MAX);
        let mut scd41 = sensor(&emulator);

        let err = block_on(scd41.begin()).unwrap_err();
        assert!(err.is_transient());
        assert!(!scd41.is_sampling());
    }

    #[test]
    fn test_poll_reads_measurement_when_ready() {
        let emulator = SensirionEmulator::new(SensorKind::Scd41);
        emulator.set_reading(Measurement::new(812, 22.5, 41.0));
        let mut scd41 = sensor(&emulator);
        block_on(scd41.begin()).unwrap();

        assert_eq!(block_on(scd41.poll(Instant::from_secs(0))).unwrap(), None);

        emulator.advance(5000);
        let m = block_on(scd41.poll(Instant::from_secs(5))).unwrap().unwrap();
        assert_eq!(m.co2_ppm, 812);
        assert!((m.temperature - 22.5).abs() < 0.01);
        assert!((m.humidity - 41.0).abs() < 0.01);

        // Consumed
        assert_eq!(block_on(scd41.poll(Instant::from_secs(5))).unwrap(), None);
    }

    #[test]
    fn test_calibrate_returns_correction_and_restarts() {
        let emulator = SensirionEmulator::new(SensorKind::Scd41);
        emulator.set_reading(Measurement::new(450, 20.0, 50.0));
        let mut scd41 = sensor(&emulator);
        block_on(scd41.begin()).unwrap();

        let correction = block_on(scd41.calibrate(425)).unwrap();

        assert_eq!(correction, -25);
        assert!(emulator.is_sampling());
        assert_eq!(emulator.start_count(), 2);
    }

    #[test]
    fn test_rejected_calibration_is_an_error_not_zero() {
        let emulator = SensirionEmulator::new(SensorKind::Scd41);
        emulator.reject_calibration();
        let mut scd41 = sensor(&emulator);
        block_on(scd41.begin()).unwrap();

        let err = block_on(scd41.calibrate(425)).unwrap_err();

        assert_eq!(
            err,
            CalibrationError::Rejected {
                sensor: "SCD-41",
                target_ppm: 425
            }
        );
        assert!(emulator.is_sampling());
    }

    #[test]
    fn test_settings_are_persisted() {
        let emulator = SensirionEmulator::new(SensorKind::Scd41);
        let mut scd41 = sensor(&emulator);
        block_on(scd41.begin()).unwrap();

        let wanted = DeviceSettings {
            temperature_offset: 4.0,
            altitude_m: 120,
            auto_self_calibration: true,
        };
        block_on(scd41.set_settings(wanted)).unwrap();

        let read = block_on(scd41.settings()).unwrap();
        assert_eq!(read.altitude_m, 120);
        assert!(read.auto_self_calibration);
        assert!((read.temperature_offset - 4.0).abs() < 0.01);
        assert_eq!(emulator.persisted_settings().map(|s| s.altitude_m), Some(120));
        assert!(emulator.is_sampling());
    }

    #[test]
    fn test_partial_settings_write_keeps_earlier_fields() {
        let emulator = SensirionEmulator::new(SensorKind::Scd41);
        emulator.fail_command_once(SET_ASC_ENABLED);
        let mut scd41 = sensor(&emulator);
        block_on(scd41.begin()).unwrap();

        let err = block_on(scd41.set_settings(DeviceSettings {
            temperature_offset: 2.0,
            altitude_m: 300,
            auto_self_calibration: false,
        }))
        .unwrap_err();

        assert!(matches!(
            err,
            SettingsError::PartialWrite {
                applied: 2,
                failed: SettingsField::AutoSelfCalibration,
                ..
            }
        ));
        assert_eq!(emulator.settings().altitude_m, 300);
        // Factory default left untouched
        assert!(emulator.settings().auto_self_calibration);
        assert_eq!(emulator.persisted_settings(), None);
        assert!(emulator.is_sampling());
    }

    #[test]
    fn test_factory_reset_restores_defaults() {
        let emulator = SensirionEmulator::new(SensorKind::Scd41);
        let mut scd41 = sensor(&emulator);
        block_on(scd41.begin()).unwrap();
        block_on(scd41.set_settings(DeviceSettings {
            temperature_offset: 1.0,
            altitude_m: 900,
            auto_self_calibration: false,
        }))
        .unwrap();

        block_on(scd41.factory_reset()).unwrap();

        assert_eq!(emulator.settings(), SensirionEmulator::FACTORY_SETTINGS);
        assert_eq!(emulator.persisted_settings(), None);
        assert!(emulator.is_sampling());
    }
}
