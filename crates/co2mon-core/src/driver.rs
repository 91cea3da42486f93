//! Sensor driver state machine.
//!
//! Wraps one [`Co2Sensor`] backend with lifecycle tracking, transient-fault
//! recovery and the "data updated" latch the display polls.
//!
//! ```text
//! Uninitialized -> Probing -> Ready -> Polling <-> Recovering
//!                     |          \        |
//!                     v           Calibrating -> Ready
//!                   Failed
//! ```

use embassy_time::Instant;
use embedded_hal_async::delay::DelayNs;
use log::{error, info, warn};

use crate::error::{CalibrationError, DriverError, SettingsError};
use crate::sensors::{Capabilities, Co2Sensor, DeviceSettings, Measurement, SensorKind};

/// Pause before re-initializing after a bus fault
const RECOVERY_BACKOFF_MS: u32 = 1000;

/// Lifecycle of the driven sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// `begin` has not been called
    Uninitialized,
    /// `begin` is running
    Probing,
    /// Started, nothing polled yet
    Ready,
    /// Periodic sampling in progress
    Polling,
    /// A bus fault was seen; the next poll re-initializes again if the last
    /// attempt did not succeed
    Recovering,
    /// Sampling quiesced for forced recalibration
    Calibrating,
    /// `begin` failed; the caller decides whether to simulate
    Failed,
}

impl DriverState {
    /// States in which the sensor may be polled
    pub const fn can_poll(self) -> bool {
        matches!(self, Self::Ready | Self::Polling | Self::Recovering)
    }
}

/// Result of one [`SensorDriver::poll`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollOutcome {
    /// No new measurement yet
    NoData,
    /// A fresh measurement, also stored as [`SensorDriver::latest`]
    Data(Measurement),
    /// The read failed; a zero sample was surfaced in its place.
    /// `recovered` is true when the sensor was re-initialized successfully.
    Fault {
        error: crate::error::SensorError,
        recovered: bool,
    },
}

/// Drives one CO2 sensor backend.
pub struct SensorDriver<S, D> {
    sensor: S,
    delay: D,
    state: DriverState,
    latest: Measurement,
    updated: bool,
}

impl<S: Co2Sensor, D: DelayNs> SensorDriver<S, D> {
    pub fn new(sensor: S, delay: D) -> Self {
        Self {
            sensor,
            delay,
            state: DriverState::Uninitialized,
            latest: Measurement::default(),
            updated: false,
        }
    }

    /// Initialize the backend and start sampling.
    ///
    /// On failure the driver is left `Failed`; calling `begin` again retries.
    pub async fn begin(&mut self) -> Result<(), DriverError> {
        if self.state == DriverState::Calibrating {
            return Err(DriverError::InvalidState { state: self.state });
        }

        let name = self.kind().name();
        self.state = DriverState::Probing;
        info!("{}: probing", name);

        match self.sensor.begin().await {
            Ok(()) => {
                self.state = DriverState::Ready;
                info!("{}: ready", name);
                Ok(())
            }
            Err(cause) => {
                self.state = DriverState::Failed;
                error!("{}: initialization failed: {}", name, cause);
                Err(DriverError::BeginFailed { cause })
            }
        }
    }

    /// Check for a new measurement.
    ///
    /// A bus fault surfaces a zero sample, waits a fixed backoff and runs
    /// the backend's `begin` again, so a connector that comes good resumes
    /// without intervention. While that restart keeps failing, each poll
    /// retries it before reading. Other read errors (bad CRC, implausible
    /// data) surface a zero sample and leave the device alone.
    pub async fn poll(&mut self, now: Instant) -> Result<PollOutcome, DriverError> {
        if !self.state.can_poll() {
            return Err(DriverError::InvalidState { state: self.state });
        }

        // The last restart left the device idle
        if self.state == DriverState::Recovering
            && !self.sensor.is_sampling()
            && !self.restart().await
        {
            return Ok(PollOutcome::NoData);
        }

        match self.sensor.poll(now).await {
            Ok(None) => {
                if self.state == DriverState::Ready {
                    self.state = DriverState::Polling;
                }
                Ok(PollOutcome::NoData)
            }
            Ok(Some(measurement)) => {
                self.state = DriverState::Polling;
                self.latest = measurement;
                self.updated = true;
                Ok(PollOutcome::Data(measurement))
            }
            Err(error) => {
                let name = self.kind().name();
                self.latest = Measurement::ERROR;
                self.updated = true;

                if !error.is_transient() {
                    warn!("{}: discarding reading: {}", name, error);
                    return Ok(PollOutcome::Fault {
                        error,
                        recovered: false,
                    });
                }

                warn!("{}: {}; restarting sensor", name, error);
                let recovered = self.restart().await;
                Ok(PollOutcome::Fault { error, recovered })
            }
        }
    }

    /// Back off, then run the backend's `begin`. Leaves the driver `Polling`
    /// on success and `Recovering` otherwise.
    async fn restart(&mut self) -> bool {
        let name = self.kind().name();
        self.state = DriverState::Recovering;
        self.delay.delay_ms(RECOVERY_BACKOFF_MS).await;

        match self.sensor.begin().await {
            Ok(()) => {
                self.state = DriverState::Polling;
                info!("{}: recovered", name);
                true
            }
            Err(e) => {
                warn!("{}: restart failed: {}", name, e);
                false
            }
        }
    }

    /// Forced recalibration to `target_ppm`, returning the correction.
    ///
    /// Sampling is quiesced for the duration and resumed afterwards whatever
    /// the outcome.
    pub async fn calibrate(&mut self, target_ppm: u16) -> Result<i16, CalibrationError> {
        let name = self.kind().name();
        if !self.capabilities().forced_recalibration {
            warn!("{}: forced recalibration not supported", name);
            return Err(CalibrationError::Unsupported { sensor: name });
        }
        if !matches!(self.state, DriverState::Ready | DriverState::Polling) {
            return Err(CalibrationError::NotReady { state: self.state });
        }

        self.state = DriverState::Calibrating;
        info!("{}: calibrating to {} ppm", name, target_ppm);
        let result = self.sensor.calibrate(target_ppm).await;

        if !self.sensor.is_sampling() {
            warn!("{}: sampling did not resume after calibration, restarting", name);
            if let Err(e) = self.sensor.begin().await {
                error!("{}: restart after calibration failed: {}", name, e);
            }
        }
        self.state = if self.sensor.is_sampling() {
            DriverState::Ready
        } else {
            DriverState::Recovering
        };

        result
    }

    /// Wipe the device's stored calibration. No-op on backends without one.
    pub async fn factory_reset(&mut self) -> Result<(), DriverError> {
        let name = self.kind().name();
        if !self.capabilities().factory_reset {
            info!("{}: no factory reset, skipping", name);
            return Ok(());
        }
        if !matches!(self.state, DriverState::Ready | DriverState::Polling) {
            return Err(DriverError::InvalidState { state: self.state });
        }

        info!("{}: factory reset", name);
        self.sensor.factory_reset().await?;
        self.state = DriverState::Ready;
        Ok(())
    }

    pub async fn settings(&mut self) -> Result<DeviceSettings, SettingsError> {
        self.sensor.settings().await
    }

    /// Write device settings. Backends without settings accept and ignore
    /// them.
    pub async fn set_settings(&mut self, settings: DeviceSettings) -> Result<(), SettingsError> {
        self.sensor.set_settings(settings).await
    }

    /// Most recent measurement, zero after a fault
    pub fn latest(&self) -> Measurement {
        self.latest
    }

    /// Return and clear the "data updated" latch.
    pub fn take_updated(&mut self) -> bool {
        core::mem::take(&mut self.updated)
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn kind(&self) -> SensorKind {
        self.sensor.kind()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.sensor.capabilities()
    }

    pub fn sample_period_secs(&self) -> u16 {
        self.sensor.sample_period_secs()
    }

    /// Whether the device is currently sampling periodically
    pub fn is_sampling(&self) -> bool {
        self.sensor.is_sampling()
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }
}
