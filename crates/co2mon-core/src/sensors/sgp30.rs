use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use log::{debug, info};

use super::sensirion::SensirionBus;
use super::{Co2Sensor, DeviceSettings, Measurement, SensorKind};
use crate::error::{CalibrationError, SensorError, SettingsError};

const GET_SERIAL_ID: u16 = 0x3682;
const INIT_AIR_QUALITY: u16 = 0x2003;
const MEASURE_AIR_QUALITY: u16 = 0x2008;

const SERIAL_EXEC_MS: u32 = 1;
const INIT_EXEC_MS: u32 = 10;
const MEASURE_EXEC_MS: u32 = 12;

/// The on-chip baseline compensation expects exactly one measurement per
/// second.
const MEASURE_INTERVAL: Duration = Duration::from_secs(1);

/// Sensirion SGP30 metal-oxide gas sensor.
///
/// Reports equivalent CO2 only, with no temperature or humidity, and has no
/// calibration or persisted settings.
pub struct Sgp30<I, D> {
    bus: SensirionBus<I, D>,
    sampling: bool,
    last_measure: Option<Instant>,
}

impl<I: I2c, D: DelayNs> Sgp30<I, D> {
    pub fn new(i2c: I, delay: D) -> Self {
        let kind = SensorKind::Sgp30;
        Self {
            bus: SensirionBus::new(i2c, delay, kind.address(), kind.name()),
            sampling: false,
            last_measure: None,
        }
    }

    fn measurement_due(&self, now: Instant) -> bool {
        match self.last_measure {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= MEASURE_INTERVAL,
        }
    }
}

impl<I: I2c, D: DelayNs> Co2Sensor for Sgp30<I, D> {
    fn kind(&self) -> SensorKind {
        SensorKind::Sgp30
    }

    fn is_sampling(&self) -> bool {
        self.sampling
    }

    async fn begin(&mut self) -> Result<(), SensorError> {
        let serial = self
            .bus
            .read_words::<3>(GET_SERIAL_ID, SERIAL_EXEC_MS, "get serial id")
            .await?;
        debug!("SGP-30: serial {:04x}{:04x}{:04x}", serial[0], serial[1], serial[2]);

        self.bus
            .command(INIT_AIR_QUALITY, "init air quality")
            .await?;
        self.bus.delay_ms(INIT_EXEC_MS).await;

        self.sampling = true;
        self.last_measure = None;
        info!("SGP-30: air quality measurement initialized");
        Ok(())
    }

    async fn poll(&mut self, now: Instant) -> Result<Option<Measurement>, SensorError> {
        if !self.measurement_due(now) {
            return Ok(None);
        }
        self.last_measure = Some(now);

        let [eco2, _tvoc] = self
            .bus
            .read_words::<2>(MEASURE_AIR_QUALITY, MEASURE_EXEC_MS, "measure air quality")
            .await?;
        if eco2 == 0 {
            return Err(SensorError::InvalidData {
                sensor: self.bus.sensor(),
                operation: "measure air quality",
            });
        }

        Ok(Some(Measurement {
            co2_ppm: eco2,
            temperature: 0.0,
            humidity: 0.0,
        }))
    }

    async fn calibrate(&mut self, _target_ppm: u16) -> Result<i16, CalibrationError> {
        info!("SGP-30: forced recalibration not supported");
        Err(CalibrationError::Unsupported {
            sensor: self.bus.sensor(),
        })
    }

    async fn factory_reset(&mut self) -> Result<(), SensorError> {
        info!("SGP-30: factory reset not supported, ignoring");
        Ok(())
    }

    async fn settings(&mut self) -> Result<DeviceSettings, SettingsError> {
        Ok(DeviceSettings::NEUTRAL)
    }

    async fn set_settings(&mut self, settings: DeviceSettings) -> Result<(), SettingsError> {
        info!("SGP-30: no device settings, ignoring {:?}", settings);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{NoDelay, SensirionEmulator};
    use embassy_futures::block_on;

    fn started(emulator: &SensirionEmulator) -> Sgp30<SensirionEmulator, NoDelay> {
        let mut sgp30 = Sgp30::new(emulator.clone(), NoDelay);
        block_on(sgp30.begin()).unwrap();
        sgp30
    }

    #[test]
    fn test_poll_is_paced_to_one_hertz() {
        let emulator = SensirionEmulator::new(SensorKind::Sgp30);
        emulator.set_reading(Measurement::new(530, 0.0, 0.0));
        let mut sgp30 = started(&emulator);

        let first = block_on(sgp30.poll(Instant::from_millis(0))).unwrap();
        assert_eq!(first, Some(Measurement::new(530, 0.0, 0.0)));

        assert_eq!(block_on(sgp30.poll(Instant::from_millis(400))).unwrap(), None);
        assert!(block_on(sgp30.poll(Instant::from_millis(1000))).unwrap().is_some());
    }

    #[test]
    fn test_unsupported_operations_are_neutral() {
        let emulator = SensirionEmulator::new(SensorKind::Sgp30);
        let mut sgp30 = started(&emulator);
        let before = emulator.commands().len();

        assert_eq!(block_on(sgp30.settings()), Ok(DeviceSettings::NEUTRAL));
        block_on(sgp30.set_settings(DeviceSettings {
            temperature_offset: 2.0,
            altitude_m: 100,
            auto_self_calibration: true,
        }))
        .unwrap();
        block_on(sgp30.factory_reset()).unwrap();

        assert_eq!(emulator.commands().len(), before);
        assert_eq!(
            block_on(sgp30.calibrate(425)),
            Err(CalibrationError::Unsupported { sensor: "SGP-30" })
        );
    }
}
