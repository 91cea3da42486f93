//! Top-level owner wiring the sensor driver to the history engine.
//!
//! The scheduler calls [`Monitor::poll_sensor`] several times a second and
//! [`Monitor::tick`] once per wall-clock second; everything else is read
//! through accessors.

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::calibration::{CalibrationSession, CalibrationState};
use crate::config::MonitorConfig;
use crate::driver::{PollOutcome, SensorDriver};
use crate::error::{CalibrationError, SettingsError};
use crate::history::{HistoryAggregator, TickOutcome};
use crate::sensors::{Co2Sensor, DeviceSettings, Measurement, SensorKind};
use crate::sim::SimulatedSensor;

/// Time of day as the display clock shows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WallClock {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl WallClock {
    pub const fn new(hours: u8, minutes: u8, seconds: u8) -> Self {
        Self {
            hours,
            minutes,
            seconds,
        }
    }

    /// Clock reading `secs` seconds after midnight, wrapping at 24 h
    pub const fn from_secs_of_day(secs: u32) -> Self {
        let secs = secs % 86_400;
        Self {
            hours: (secs / 3600) as u8,
            minutes: ((secs / 60) % 60) as u8,
            seconds: (secs % 60) as u8,
        }
    }
}

/// Where readings come from after [`Monitor::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Sensor,
    /// No sensor answered; readings are generated
    Simulated,
}

struct Simulation {
    generator: SimulatedSensor,
    latest: Measurement,
    updated: bool,
    last_sample: Option<Instant>,
}

/// The CO2 monitor: one sensor, one history, at most one calibration.
pub struct Monitor<S, D> {
    driver: SensorDriver<S, D>,
    history: HistoryAggregator,
    config: MonitorConfig,
    simulation: Option<Simulation>,
    calibration: Option<CalibrationSession>,
}

impl<S: Co2Sensor, D: DelayNs> Monitor<S, D> {
    pub fn new(driver: SensorDriver<S, D>, config: MonitorConfig) -> Self {
        let history = HistoryAggregator::new(driver.sample_period_secs());
        Self {
            driver,
            history,
            config,
            simulation: None,
            calibration: None,
        }
    }

    /// Search for the sensor, falling back to simulation if it never
    /// answers, then apply any configured device settings.
    pub async fn start(&mut self) -> Source {
        let kind = self.driver.kind();
        let attempts = self.config.begin_attempts.max(1);

        let mut found = false;
        for attempt in 1..=attempts {
            info!("Searching for {} sensor ({}/{})", kind.name(), attempt, attempts);
            if self.driver.begin().await.is_ok() {
                found = true;
                break;
            }
        }

        self.history.clear();

        if !found {
            warn!("{} sensor not connected, switching to simulation", kind.name());
            self.simulation = Some(Simulation {
                generator: SimulatedSensor::new(self.config.simulation_seed),
                latest: Measurement::new(400, 20.0, 25.0),
                updated: true,
                last_sample: None,
            });
            return Source::Simulated;
        }

        if let Some(settings) = self.config.apply_settings {
            match self.driver.set_settings(settings).await {
                Ok(()) => info!("{} settings applied: {:?}", kind.name(), settings),
                Err(e) => error!("Error applying {} settings: {}", kind.name(), e),
            }
        }
        match self.driver.settings().await {
            Ok(settings) => info!("{} settings: {:?}", kind.name(), settings),
            Err(e) => warn!("Could not read {} settings: {}", kind.name(), e),
        }

        Source::Sensor
    }

    /// Check the sensor (or the simulation) for a new reading.
    ///
    /// While a calibration session is running the session owns the sensor
    /// and this returns `NoData`.
    pub async fn poll_sensor(&mut self, now: Instant) -> PollOutcome {
        let period = Duration::from_secs(u64::from(self.history.sample_period_secs()));
        if let Some(sim) = &mut self.simulation {
            let due = sim
                .last_sample
                .is_none_or(|last| now.saturating_duration_since(last) >= period);
            if !due {
                return PollOutcome::NoData;
            }
            sim.last_sample = Some(now);
            sim.latest = sim.generator.next_measurement();
            sim.updated = true;
            return PollOutcome::Data(sim.latest);
        }

        if self.calibration_active() {
            return PollOutcome::NoData;
        }

        match self.driver.poll(now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Sensor poll skipped: {}", e);
                PollOutcome::NoData
            }
        }
    }

    /// Feed the current reading to the history at wall-clock time `clock`.
    pub fn tick(&mut self, clock: WallClock) -> TickOutcome {
        let value = self.latest().co2_ppm;
        self.history.tick(value, clock.seconds, clock.minutes)
    }

    /// Most recent reading, zero after a sensor fault
    pub fn latest(&self) -> Measurement {
        match &self.simulation {
            Some(sim) => sim.latest,
            None => self.driver.latest(),
        }
    }

    /// Return and clear the "data updated" latch.
    pub fn take_updated(&mut self) -> bool {
        match &mut self.simulation {
            Some(sim) => core::mem::take(&mut sim.updated),
            None => self.driver.take_updated(),
        }
    }

    /// Open a calibration session awaiting user confirmation.
    pub fn begin_calibration(&mut self) -> Result<&mut CalibrationSession, CalibrationError> {
        if self.calibration_active() {
            return Err(CalibrationError::SessionActive);
        }

        let session = CalibrationSession::start(&self.driver, self.config.calibration_target_ppm)?
            .with_timing(self.config.calibration_wait(), self.config.verify_timeout());
        Ok(self.calibration.insert(session))
    }

    /// Advance the running calibration session, if any.
    pub async fn step_calibration(&mut self, now: Instant) -> Option<CalibrationState> {
        let session = self.calibration.as_mut()?;
        Some(session.step(&mut self.driver, now).await)
    }

    pub fn calibration(&self) -> Option<&CalibrationSession> {
        self.calibration.as_ref()
    }

    /// For user input: confirm, cancel, ready now.
    pub fn calibration_mut(&mut self) -> Option<&mut CalibrationSession> {
        self.calibration.as_mut()
    }

    /// Remove the session once the user has seen its result.
    pub fn finish_calibration(&mut self) -> Option<CalibrationSession> {
        self.calibration.take()
    }

    fn calibration_active(&self) -> bool {
        self.calibration
            .as_ref()
            .is_some_and(|s| !s.state().is_finished())
    }

    /// Settings currently active on the sensor
    pub async fn sensor_settings(&mut self) -> Result<DeviceSettings, SettingsError> {
        self.driver.settings().await
    }

    pub fn history(&self) -> &HistoryAggregator {
        &self.history
    }

    pub fn driver(&self) -> &SensorDriver<S, D> {
        &self.driver
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn kind(&self) -> SensorKind {
        self.driver.kind()
    }

    pub fn is_simulated(&self) -> bool {
        self.simulation.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{NoDelay, SensirionEmulator};
    use crate::sensors::AnySensor;
    use embassy_futures::block_on;

    type TestMonitor = Monitor<AnySensor<SensirionEmulator, NoDelay>, NoDelay>;

    fn monitor(kind: SensorKind, config: MonitorConfig) -> (SensirionEmulator, TestMonitor) {
        let emulator = SensirionEmulator::new(kind);
        let sensor = AnySensor::new(kind, emulator.clone(), NoDelay);
        let driver = SensorDriver::new(sensor, NoDelay);
        (emulator, Monitor::new(driver, config))
    }

    #[test]
    fn test_wall_clock_from_seconds() {
        assert_eq!(WallClock::from_secs_of_day(3725), WallClock::new(1, 2, 5));
        assert_eq!(WallClock::from_secs_of_day(86_400 + 59), WallClock::new(0, 0, 59));
    }

    #[test]
    fn test_history_sized_for_sensor_period() {
        let (_emulator, monitor) = monitor(SensorKind::Scd30, MonitorConfig::default());
        assert_eq!(monitor.history().raw().capacity(), 1800);
    }

    #[test]
    fn test_missing_sensor_falls_back_to_simulation() {
        let (emulator, mut monitor) = monitor(SensorKind::Scd41, MonitorConfig::default());
        emulator.fail_next_ops(usize::MAX);

        assert_eq!(block_on(monitor.start()), Source::Simulated);
        assert!(monitor.is_simulated());
        assert!(monitor.take_updated());

        let outcome = block_on(monitor.poll_sensor(Instant::from_secs(0)));
        assert!(matches!(outcome, PollOutcome::Data(m) if m.is_valid()));
        assert_eq!(
            block_on(monitor.poll_sensor(Instant::from_secs(1))),
            PollOutcome::NoData
        );
        assert!(monitor.begin_calibration().is_err());
    }

    #[test]
    fn test_settings_applied_at_boot() {
        let settings = DeviceSettings {
            temperature_offset: 2.0,
            altitude_m: 540,
            auto_self_calibration: false,
        };
        let config = MonitorConfig {
            apply_settings: Some(settings),
            ..MonitorConfig::default()
        };
        let (emulator, mut monitor) = monitor(SensorKind::Scd41, config);

        assert_eq!(block_on(monitor.start()), Source::Sensor);
        assert_eq!(emulator.persisted_settings().map(|s| s.altitude_m), Some(540));
        assert!(emulator.is_sampling());
    }

    #[test]
    fn test_readings_flow_into_history() {
        let (emulator, mut monitor) = monitor(SensorKind::Scd41, MonitorConfig::default());
        block_on(monitor.start());
        emulator.set_reading(Measurement::new(900, 21.0, 40.0));

        // Nothing read yet: the zero sample is rejected
        assert!(!monitor.tick(WallClock::new(9, 0, 5)).accepted());

        emulator.advance(5000);
        block_on(monitor.poll_sensor(Instant::from_secs(5)));
        assert!(monitor.take_updated());

        for second in (10..60).step_by(5) {
            assert!(monitor.tick(WallClock::new(9, 0, second)).accepted());
        }
        let outcome = monitor.tick(WallClock::new(9, 1, 0));

        assert_eq!(outcome, TickOutcome::Minute { minute_avg: 900.0 });
        assert_eq!(monitor.history().raw().count(), 11);
    }

    #[test]
    fn test_calibration_through_monitor() {
        let config = MonitorConfig {
            calibration_wait_secs: 30,
            ..MonitorConfig::default()
        };
        let (emulator, mut monitor) = monitor(SensorKind::Scd41, config);
        block_on(monitor.start());
        emulator.set_reading(Measurement::new(500, 21.0, 40.0));

        monitor.begin_calibration().unwrap().confirm(Instant::from_secs(0));
        assert_eq!(
            monitor.begin_calibration().err(),
            Some(CalibrationError::SessionActive)
        );

        // The session owns the sensor while it runs
        emulator.advance(5000);
        assert_eq!(
            block_on(monitor.poll_sensor(Instant::from_secs(5))),
            PollOutcome::NoData
        );

        block_on(monitor.step_calibration(Instant::from_secs(30)));
        block_on(monitor.step_calibration(Instant::from_secs(31)));
        emulator.advance(5000);
        let state = block_on(monitor.step_calibration(Instant::from_secs(36)));
        assert_eq!(state, Some(CalibrationState::Done));

        let session = monitor.finish_calibration().unwrap();
        let outcome = session.outcome().unwrap();
        assert_eq!(outcome.pre_cal_ppm, Some(500));
        assert_eq!(outcome.correction, Ok(-75));
        assert_eq!(outcome.post_cal_ppm, Some(425));
        assert_eq!(monitor.latest().co2_ppm, 425);
    }
}
