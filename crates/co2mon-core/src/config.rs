use embassy_time::Duration;
use serde::{Deserialize, Serialize};

use crate::sensors::{DeviceSettings, SensorKind};

/// Boot-time configuration of the monitor
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Which sensor model is fitted
    pub sensor: SensorKind,
    /// Reference concentration used by forced recalibration, ppm
    pub calibration_target_ppm: u16,
    /// Settling time in reference air before calibrating
    pub calibration_wait_secs: u32,
    /// How long to wait for a reading after calibrating
    pub verify_timeout_ms: u32,
    /// `begin` attempts before falling back to simulation
    pub begin_attempts: u8,
    /// Written to the sensor once at boot when set
    pub apply_settings: Option<DeviceSettings>,
    /// Seed for simulated readings
    pub simulation_seed: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sensor: SensorKind::Scd41,
            calibration_target_ppm: 425,
            calibration_wait_secs: 180,
            verify_timeout_ms: 5000,
            begin_attempts: 5,
            apply_settings: None,
            simulation_seed: 0x00C0_2C02,
        }
    }
}

impl MonitorConfig {
    pub fn calibration_wait(&self) -> Duration {
        Duration::from_secs(u64::from(self.calibration_wait_secs))
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.verify_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();

        assert_eq!(config.sensor, SensorKind::Scd41);
        assert_eq!(config.calibration_target_ppm, 425);
        assert_eq!(config.calibration_wait(), Duration::from_secs(180));
        assert_eq!(config.verify_timeout(), Duration::from_secs(5));
        assert_eq!(config.apply_settings, None);
    }

    #[test]
    fn test_postcard_round_trip_keeps_settings() {
        let config = MonitorConfig {
            sensor: SensorKind::Scd30,
            apply_settings: Some(DeviceSettings {
                temperature_offset: 1.25,
                altitude_m: 310,
                auto_self_calibration: false,
            }),
            ..MonitorConfig::default()
        };

        let bytes = postcard::to_allocvec(&config).unwrap();
        let decoded: MonitorConfig = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, config);
    }
}
