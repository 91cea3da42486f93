//! Interactive forced-recalibration workflow.
//!
//! The user places the sensor in air of a known concentration, confirms,
//! waits for the reading to settle (three minutes by default, or less if
//! they say so), and the driver then recalibrates against that reference.
//! A short verification window afterwards captures the first post-calibration
//! reading.
//!
//! The session never sleeps: the caller feeds it the current time through
//! [`CalibrationSession::step`] from its main loop.

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use log::{error, info, warn};

use crate::driver::{DriverState, PollOutcome, SensorDriver};
use crate::error::CalibrationError;
use crate::sensors::Co2Sensor;

/// How long the sensor should sit in reference air before calibrating
pub const DEFAULT_STABLE_AIR_WAIT: Duration = Duration::from_secs(180);

/// How long to wait for a reading after calibrating
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    /// Waiting for the user to confirm or cancel
    AwaitConfirm,
    /// Sensor is settling in reference air
    WaitStableAir,
    /// Forced recalibration runs on the next step
    Calibrating,
    /// Waiting for the first reading after calibration
    Verifying,
    Done,
    Cancelled,
}

impl CalibrationState {
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// Result of a completed session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOutcome {
    pub target_ppm: u16,
    /// Last reading seen while waiting in reference air
    pub pre_cal_ppm: Option<u16>,
    /// Correction applied by the device, or why none was
    pub correction: Result<i16, CalibrationError>,
    /// First reading after calibration; `None` if none arrived in time
    pub post_cal_ppm: Option<u16>,
}

/// One run of the calibration workflow.
///
/// Created on user request and discarded when finished. Cancelling before
/// the `Calibrating` state issues no command to the sensor.
#[derive(Debug, Clone)]
pub struct CalibrationSession {
    target_ppm: u16,
    state: CalibrationState,
    stable_air_wait: Duration,
    verify_timeout: Duration,
    factory_reset_first: bool,
    factory_reset_done: bool,
    skip_wait: bool,
    wait_started: Option<Instant>,
    verify_started: Option<Instant>,
    pre_cal_ppm: Option<u16>,
    post_cal_ppm: Option<u16>,
    correction: Option<Result<i16, CalibrationError>>,
}

impl CalibrationSession {
    /// Open a session against `driver`.
    ///
    /// Refused when the backend cannot be recalibrated or the driver has
    /// not been started.
    pub fn start<S: Co2Sensor, D: DelayNs>(
        driver: &SensorDriver<S, D>,
        target_ppm: u16,
    ) -> Result<Self, CalibrationError> {
        if !driver.capabilities().forced_recalibration {
            let sensor = driver.kind().name();
            warn!("{}: can't calibrate", sensor);
            return Err(CalibrationError::Unsupported { sensor });
        }
        if matches!(
            driver.state(),
            DriverState::Uninitialized | DriverState::Probing | DriverState::Failed
        ) {
            return Err(CalibrationError::NotReady {
                state: driver.state(),
            });
        }

        info!("Calibration to {} ppm requested", target_ppm);
        Ok(Self {
            target_ppm,
            state: CalibrationState::AwaitConfirm,
            stable_air_wait: DEFAULT_STABLE_AIR_WAIT,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            factory_reset_first: false,
            factory_reset_done: false,
            skip_wait: false,
            wait_started: None,
            verify_started: None,
            pre_cal_ppm: None,
            post_cal_ppm: None,
            correction: None,
        })
    }

    /// Override the settling wait and verification timeout.
    pub fn with_timing(mut self, stable_air_wait: Duration, verify_timeout: Duration) -> Self {
        self.stable_air_wait = stable_air_wait;
        self.verify_timeout = verify_timeout;
        self
    }

    /// Wipe the sensor's stored calibration once the user confirms, before
    /// the settling wait. Ignored by backends without a factory reset.
    pub fn with_factory_reset_first(mut self, enabled: bool) -> Self {
        self.factory_reset_first = enabled;
        self
    }

    /// User confirmed; start the settling wait at `now`.
    pub fn confirm(&mut self, now: Instant) {
        if self.state == CalibrationState::AwaitConfirm {
            info!(
                "Calibration confirmed, waiting {} s in {} ppm air",
                self.stable_air_wait.as_secs(),
                self.target_ppm
            );
            self.state = CalibrationState::WaitStableAir;
            self.wait_started = Some(now);
        }
    }

    /// Abort the session. Only possible before calibration has started;
    /// returns whether the session was cancelled.
    pub fn cancel(&mut self) -> bool {
        match self.state {
            CalibrationState::AwaitConfirm | CalibrationState::WaitStableAir => {
                info!("Calibration cancelled");
                self.state = CalibrationState::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// User says the air has settled; calibrate on the next step.
    pub fn ready_now(&mut self) {
        if self.state == CalibrationState::WaitStableAir {
            self.skip_wait = true;
        }
    }

    /// Advance the timed states. Call once per main-loop iteration.
    pub async fn step<S: Co2Sensor, D: DelayNs>(
        &mut self,
        driver: &mut SensorDriver<S, D>,
        now: Instant,
    ) -> CalibrationState {
        match self.state {
            CalibrationState::WaitStableAir => self.wait_stable_air(driver, now).await,
            CalibrationState::Calibrating => {
                let result = driver.calibrate(self.target_ppm).await;
                match &result {
                    Ok(correction) => info!("Calibration correction {} ppm", correction),
                    Err(e) => error!("Error during calibration: {}", e),
                }
                self.correction = Some(result);
                self.verify_started = Some(now);
                self.state = CalibrationState::Verifying;
            }
            CalibrationState::Verifying => self.verify(driver, now).await,
            CalibrationState::AwaitConfirm
            | CalibrationState::Done
            | CalibrationState::Cancelled => {}
        }
        self.state
    }

    async fn wait_stable_air<S: Co2Sensor, D: DelayNs>(
        &mut self,
        driver: &mut SensorDriver<S, D>,
        now: Instant,
    ) {
        if self.factory_reset_first && !self.factory_reset_done {
            self.factory_reset_done = true;
            if let Err(e) = driver.factory_reset().await {
                warn!("Factory reset before calibration failed: {}", e);
            }
        }

        if let Ok(PollOutcome::Data(m)) = driver.poll(now).await {
            info!("Pre-cal CO2 = {} ppm", m.co2_ppm);
            self.pre_cal_ppm = Some(m.co2_ppm);
        }

        if self.skip_wait || self.remaining_wait(now) == Duration::from_ticks(0) {
            info!("Calibrating to {} ppm", self.target_ppm);
            self.state = CalibrationState::Calibrating;
        }
    }

    async fn verify<S: Co2Sensor, D: DelayNs>(
        &mut self,
        driver: &mut SensorDriver<S, D>,
        now: Instant,
    ) {
        if let Ok(PollOutcome::Data(m)) = driver.poll(now).await {
            info!("Post-cal CO2 = {} ppm", m.co2_ppm);
            self.post_cal_ppm = Some(m.co2_ppm);
            self.state = CalibrationState::Done;
            return;
        }

        let started = self.verify_started.unwrap_or(now);
        if now.saturating_duration_since(started) >= self.verify_timeout {
            warn!("No reading within {} ms of calibrating", self.verify_timeout.as_millis());
            self.state = CalibrationState::Done;
        }
    }

    fn remaining_wait(&self, now: Instant) -> Duration {
        match (self.state, self.wait_started) {
            (CalibrationState::AwaitConfirm, _) => self.stable_air_wait,
            (CalibrationState::WaitStableAir, Some(started)) => {
                let elapsed = now.saturating_duration_since(started);
                if elapsed >= self.stable_air_wait {
                    Duration::from_ticks(0)
                } else {
                    self.stable_air_wait - elapsed
                }
            }
            _ => Duration::from_ticks(0),
        }
    }

    /// Whole seconds left in the settling wait, for the countdown display
    pub fn remaining_wait_secs(&self, now: Instant) -> u64 {
        self.remaining_wait(now).as_secs()
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn target_ppm(&self) -> u16 {
        self.target_ppm
    }

    /// Live reading recorded during the settling wait
    pub fn pre_cal_ppm(&self) -> Option<u16> {
        self.pre_cal_ppm
    }

    /// Summary of the run, once it is `Done`
    pub fn outcome(&self) -> Option<CalibrationOutcome> {
        if self.state != CalibrationState::Done {
            return None;
        }
        Some(CalibrationOutcome {
            target_ppm: self.target_ppm,
            pre_cal_ppm: self.pre_cal_ppm,
            correction: self.correction?,
            post_cal_ppm: self.post_cal_ppm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{NoDelay, SensirionEmulator};
    use crate::sensors::{AnySensor, Measurement, SensorKind};
    use embassy_futures::block_on;

    type TestDriver = SensorDriver<AnySensor<SensirionEmulator, NoDelay>, NoDelay>;

    fn started(kind: SensorKind) -> (SensirionEmulator, TestDriver) {
        let emulator = SensirionEmulator::new(kind);
        let sensor = AnySensor::new(kind, emulator.clone(), NoDelay);
        let mut driver = SensorDriver::new(sensor, NoDelay);
        block_on(driver.begin()).unwrap();
        (emulator, driver)
    }

    fn at(secs: u64) -> Instant {
        Instant::from_secs(secs)
    }

    #[test]
    fn test_unsupported_backend_is_refused() {
        let (_emulator, driver) = started(SensorKind::Sgp30);

        assert_eq!(
            CalibrationSession::start(&driver, 425).unwrap_err(),
            CalibrationError::Unsupported { sensor: "SGP-30" }
        );
    }

    #[test]
    fn test_full_session_records_readings_and_correction() {
        let (emulator, mut driver) = started(SensorKind::Scd41);
        emulator.set_reading(Measurement::new(460, 21.0, 40.0));
        let mut session = CalibrationSession::start(&driver, 425).unwrap();

        session.confirm(at(0));
        assert_eq!(session.remaining_wait_secs(at(30)), 150);

        emulator.advance(5000);
        assert_eq!(
            block_on(session.step(&mut driver, at(5))),
            CalibrationState::WaitStableAir
        );
        assert_eq!(session.pre_cal_ppm(), Some(460));

        assert_eq!(
            block_on(session.step(&mut driver, at(180))),
            CalibrationState::Calibrating
        );
        assert_eq!(
            block_on(session.step(&mut driver, at(181))),
            CalibrationState::Verifying
        );

        emulator.advance(5000);
        assert_eq!(
            block_on(session.step(&mut driver, at(186))),
            CalibrationState::Done
        );

        let outcome = session.outcome().unwrap();
        assert_eq!(outcome.pre_cal_ppm, Some(460));
        assert_eq!(outcome.correction, Ok(-35));
        assert_eq!(outcome.post_cal_ppm, Some(425));
        assert!(emulator.is_sampling());
    }

    #[test]
    fn test_cancel_during_wait_leaves_sampling_untouched() {
        let (emulator, mut driver) = started(SensorKind::Scd41);
        let sampling_before = emulator.is_sampling();
        let starts_before = emulator.start_count();
        let mut session = CalibrationSession::start(&driver, 425).unwrap();

        session.confirm(at(0));
        block_on(session.step(&mut driver, at(1)));
        assert!(session.cancel());

        assert_eq!(session.state(), CalibrationState::Cancelled);
        assert_eq!(
            block_on(session.step(&mut driver, at(500))),
            CalibrationState::Cancelled
        );
        assert_eq!(emulator.is_sampling(), sampling_before);
        assert_eq!(emulator.start_count(), starts_before);
        assert!(!emulator.commands().contains(&0x362F));
        assert_eq!(session.outcome(), None);
    }

    #[test]
    fn test_ready_now_skips_remaining_wait() {
        let (_emulator, mut driver) = started(SensorKind::Scd30);
        let mut session = CalibrationSession::start(&driver, 425).unwrap();

        session.confirm(at(0));
        session.ready_now();

        assert_eq!(
            block_on(session.step(&mut driver, at(10))),
            CalibrationState::Calibrating
        );
    }

    #[test]
    fn test_verify_timeout_is_not_an_error() {
        let (emulator, mut driver) = started(SensorKind::Scd41);
        let mut session = CalibrationSession::start(&driver, 425)
            .unwrap()
            .with_timing(Duration::from_secs(10), Duration::from_secs(5));

        session.confirm(at(0));
        block_on(session.step(&mut driver, at(10)));
        block_on(session.step(&mut driver, at(11)));
        assert_eq!(session.state(), CalibrationState::Verifying);

        // No new measurement arrives
        assert_eq!(
            block_on(session.step(&mut driver, at(13))),
            CalibrationState::Verifying
        );
        assert_eq!(
            block_on(session.step(&mut driver, at(16))),
            CalibrationState::Done
        );

        let outcome = session.outcome().unwrap();
        assert!(outcome.correction.is_ok());
        assert_eq!(outcome.post_cal_ppm, None);
        assert!(emulator.is_sampling());
    }

    #[test]
    fn test_rejected_calibration_is_reported() {
        let (emulator, mut driver) = started(SensorKind::Scd41);
        emulator.reject_calibration();
        let mut session = CalibrationSession::start(&driver, 425).unwrap();

        session.confirm(at(0));
        session.ready_now();
        block_on(session.step(&mut driver, at(1)));
        block_on(session.step(&mut driver, at(2)));
        block_on(session.step(&mut driver, at(8)));

        let outcome = session.outcome().unwrap();
        assert_eq!(
            outcome.correction,
            Err(CalibrationError::Rejected {
                sensor: "SCD-41",
                target_ppm: 425
            })
        );
    }

    #[test]
    fn test_factory_reset_first_runs_before_waiting() {
        let (emulator, mut driver) = started(SensorKind::Scd41);
        let mut session = CalibrationSession::start(&driver, 425)
            .unwrap()
            .with_factory_reset_first(true);

        session.confirm(at(0));
        block_on(session.step(&mut driver, at(1)));

        assert!(emulator.commands().contains(&0x3632));
        assert_eq!(session.state(), CalibrationState::WaitStableAir);
        assert!(emulator.is_sampling());
    }
}
