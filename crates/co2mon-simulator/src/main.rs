//! Desktop simulator for the co2mon CO2 monitor.
//!
//! Runs co2mon-core against an emulated Sensirion sensor on a fake I2C bus,
//! with a virtual clock so an hour of monitoring takes a few seconds. A small
//! room model drives the sensor; a bus fault and a forced recalibration are
//! scripted along the way so the recovery and calibration paths run too.
//!
//! # Environment
//!
//! Read from the process environment and from a `.env` file if present.
//!
//! | Variable                   | Meaning                                        | Default |
//! |----------------------------|------------------------------------------------|---------|
//! | `CO2MON_SENSOR`            | `scd30`, `scd41` or `sgp30`                    | `scd41` |
//! | `CO2MON_MINUTES`           | Simulated run time                             | `90`    |
//! | `CO2MON_SPEEDUP`           | Real-time factor, `0` runs flat out            | `0`     |
//! | `CO2MON_NO_SENSOR`         | `1` leaves the bus empty (simulation fallback) | unset   |
//! | `CO2MON_FAULT_AT_MIN`      | Minute at which one bus transaction fails      | `3`     |
//! | `CO2MON_CALIBRATE_AT_MIN`  | Minute at which calibration is requested       | `10`    |
//! | `CO2MON_DRIFT_PPM`         | Sensor offset before calibration               | `75`    |
//! | `CO2MON_CAL_TARGET`        | Calibration reference, ppm                     | `425`   |
//! | `CO2MON_CAL_WAIT_SECS`     | Settling time before calibrating               | `180`   |
//! | `CO2MON_BEGIN_ATTEMPTS`    | Sensor search attempts                         | `5`     |
//! | `CO2MON_SEED`              | Seed for simulated readings                    | fixed   |
//! | `CO2MON_ALTITUDE`          | Altitude written to the sensor at boot, m      | unset   |
//! | `CO2MON_TEMP_OFFSET`       | Temperature offset written at boot, °C         | unset   |
//! | `CO2MON_ASC`               | `0`/`1`, automatic self-calibration at boot    | unset   |
//! | `CO2MON_EEPROM`            | File keeping the sensor's EEPROM across runs   | unset   |

use std::cell::Cell;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use embassy_futures::block_on;
use embassy_time::Instant;
use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info, warn};

use co2mon_core::calibration::CalibrationState;
use co2mon_core::config::MonitorConfig;
use co2mon_core::driver::{PollOutcome, SensorDriver};
use co2mon_core::emulator::SensirionEmulator;
use co2mon_core::history::{Resolution, TickOutcome, bar_height};
use co2mon_core::monitor::{Monitor, Source, WallClock};
use co2mon_core::sensors::{AnySensor, Co2Sensor, DeviceSettings, Measurement, SensorKind};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Wall-clock time of day the run starts at (08:59:30).
const START_OF_DAY_SECS: u32 = 8 * 3600 + 59 * 60 + 30;

/// Height of the text bar graph, in rows of eighths.
const BAR_MAX_HEIGHT: u16 = 8;

const BAR_GLYPHS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

// ---------------------------------------------------------------------------
// Virtual clock
// ---------------------------------------------------------------------------

struct ClockState {
    now_ns: Cell<u64>,
    device: SensirionEmulator,
    speedup: u32,
}

/// Simulated time shared by the main loop and every driver delay.
///
/// Delays advance the clock and the emulated device together, so the sensor
/// sees time pass while the driver waits on it.
#[derive(Clone)]
struct VirtualClock {
    inner: Rc<ClockState>,
}

impl VirtualClock {
    fn new(device: SensirionEmulator, speedup: u32) -> Self {
        Self {
            inner: Rc::new(ClockState {
                now_ns: Cell::new(0),
                device,
                speedup,
            }),
        }
    }

    fn now(&self) -> Instant {
        Instant::from_micros(self.inner.now_ns.get() / 1_000)
    }

    fn elapsed_secs(&self) -> u64 {
        self.inner.now_ns.get() / 1_000_000_000
    }

    fn advance_ns(&self, ns: u64) {
        let before_ms = self.inner.now_ns.get() / 1_000_000;
        let now_ns = self.inner.now_ns.get() + ns;
        self.inner.now_ns.set(now_ns);
        self.inner.device.advance(now_ns / 1_000_000 - before_ms);

        if self.inner.speedup > 0 {
            std::thread::sleep(StdDuration::from_nanos(ns / u64::from(self.inner.speedup)));
        }
    }

    /// Move to the start of the next whole second.
    fn advance_to_next_second(&self) {
        let now_ns = self.inner.now_ns.get();
        self.advance_ns(1_000_000_000 - now_ns % 1_000_000_000);
    }
}

impl DelayNs for VirtualClock {
    async fn delay_ns(&mut self, ns: u32) {
        self.advance_ns(u64::from(ns));
    }
}

// ---------------------------------------------------------------------------
// Room model
// ---------------------------------------------------------------------------

/// CO2 in a room that fills up while occupied, plus the sensor's drift.
struct Room {
    /// Offset the sensor reads above the true concentration
    drift_ppm: i32,
}

impl Room {
    /// Fresh outdoor air, used while calibrating by an open window
    const OUTDOOR_PPM: f64 = 425.0;

    fn true_ppm(&self, elapsed_secs: u64, window_open: bool) -> f64 {
        if window_open {
            return Self::OUTDOOR_PPM;
        }
        let t = elapsed_secs as f64;
        // Occupancy build-up over ~40 minutes with breathing noise on top
        let build_up = 900.0 * (1.0 - (-t / 2400.0).exp());
        Self::OUTDOOR_PPM + 150.0 + build_up + 25.0 * (t / 47.0).sin()
    }

    fn reading(&self, elapsed_secs: u64, window_open: bool) -> Measurement {
        let t = elapsed_secs as f64;
        let ppm = self.true_ppm(elapsed_secs, window_open) + f64::from(self.drift_ppm);
        Measurement::new(
            ppm.clamp(1.0, f64::from(u16::MAX)) as u16,
            (22.0 + 1.5 * (t / 600.0).sin()) as f32,
            (45.0 + 5.0 * (t / 900.0).cos()) as f32,
        )
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

fn parse_sensor_kind(name: &str) -> Option<SensorKind> {
    match name.trim().to_ascii_lowercase().replace('-', "").as_str() {
        "scd30" => Some(SensorKind::Scd30),
        "scd41" => Some(SensorKind::Scd41),
        "sgp30" => Some(SensorKind::Sgp30),
        _ => None,
    }
}

/// Build the monitor configuration from `CO2MON_*` variables.
fn config_from_env() -> MonitorConfig {
    let mut config = MonitorConfig::default();

    if let Ok(name) = std::env::var("CO2MON_SENSOR") {
        match parse_sensor_kind(&name) {
            Some(kind) => config.sensor = kind,
            None => warn!("Unknown sensor {:?}, using {}", name, config.sensor.name()),
        }
    }
    if let Some(target) = env_parse("CO2MON_CAL_TARGET") {
        config.calibration_target_ppm = target;
    }
    if let Some(wait) = env_parse("CO2MON_CAL_WAIT_SECS") {
        config.calibration_wait_secs = wait;
    }
    if let Some(attempts) = env_parse("CO2MON_BEGIN_ATTEMPTS") {
        config.begin_attempts = attempts;
    }
    if let Some(seed) = env_parse("CO2MON_SEED") {
        config.simulation_seed = seed;
    }

    let altitude = env_parse::<u16>("CO2MON_ALTITUDE");
    let offset = env_parse::<f32>("CO2MON_TEMP_OFFSET");
    let asc = env_flag("CO2MON_ASC");
    if altitude.is_some() || offset.is_some() || asc.is_some() {
        let base = SensirionEmulator::FACTORY_SETTINGS;
        config.apply_settings = Some(DeviceSettings {
            temperature_offset: offset.unwrap_or(base.temperature_offset),
            altitude_m: altitude.unwrap_or(base.altitude_m),
            auto_self_calibration: asc.unwrap_or(base.auto_self_calibration),
        });
    }

    config
}

/// Power up the emulated device, restoring its EEPROM from `path` if given.
fn load_device(kind: SensorKind, path: Option<&str>) -> SensirionEmulator {
    let Some(path) = path else {
        return SensirionEmulator::new(kind);
    };
    match std::fs::read(path) {
        Ok(image) => {
            info!("Restoring sensor EEPROM from {} ({} bytes)", path, image.len());
            SensirionEmulator::with_eeprom(kind, &image)
        }
        Err(e) => {
            info!("No sensor EEPROM at {} ({}), starting from factory state", path, e);
            SensirionEmulator::new(kind)
        }
    }
}

fn save_device(device: &SensirionEmulator, path: Option<&str>) {
    let (Some(path), Some(image)) = (path, device.eeprom_image()) else {
        return;
    };
    match std::fs::write(path, &image) {
        Ok(()) => info!("Saved sensor EEPROM to {} ({} bytes)", path, image.len()),
        Err(e) => error!("Error saving sensor EEPROM to {}: {}", path, e),
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// One-line bar graph of a history tier, oldest bar first.
fn render_bars<S, D>(monitor: &Monitor<S, D>, resolution: Resolution) -> String
where
    S: Co2Sensor,
    D: DelayNs,
{
    monitor
        .history()
        .buffer(resolution)
        .iter_last(resolution.display_points())
        .map(|v| BAR_GLYPHS[usize::from(bar_height(v, BAR_MAX_HEIGHT))])
        .collect()
}

fn report_history<S, D>(monitor: &Monitor<S, D>)
where
    S: Co2Sensor,
    D: DelayNs,
{
    for resolution in [Resolution::Raw, Resolution::Minute, Resolution::Hour] {
        if let Some(stats) = monitor.history().window_stats(resolution) {
            info!(
                "[{:>3}] min {:>6.1} avg {:>6.1} max {:>6.1} ({} pts) |{}|",
                resolution.label(),
                stats.min,
                stats.avg,
                stats.max,
                stats.count,
                render_bars(monitor, resolution)
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        warn!("Could not load .env: {}", e);
    }

    let config = config_from_env();
    let minutes: u64 = env_parse("CO2MON_MINUTES").unwrap_or(90);
    let speedup: u32 = env_parse("CO2MON_SPEEDUP").unwrap_or(0);
    let fault_at_min: u64 = env_parse("CO2MON_FAULT_AT_MIN").unwrap_or(3);
    let calibrate_at_min: u64 = env_parse("CO2MON_CALIBRATE_AT_MIN").unwrap_or(10);
    let eeprom_path = std::env::var("CO2MON_EEPROM").ok();
    let mut room = Room {
        drift_ppm: env_parse("CO2MON_DRIFT_PPM").unwrap_or(75),
    };

    info!("Starting co2mon simulator");
    info!(
        "Sensor {} at 0x{:02X}, {} min simulated, speedup {}",
        config.sensor.name(),
        config.sensor.address(),
        minutes,
        if speedup == 0 { "max".to_string() } else { format!("{}x", speedup) }
    );

    let device = load_device(config.sensor, eeprom_path.as_deref());
    if env_flag("CO2MON_NO_SENSOR") == Some(true) {
        device.fail_next_ops(usize::MAX);
    }
    let clock = VirtualClock::new(device.clone(), speedup);

    let sensor = AnySensor::new(config.sensor, device.clone(), clock.clone());
    let driver = SensorDriver::new(sensor, clock.clone());
    let mut monitor = Monitor::new(driver, config);

    device.set_reading(room.reading(0, false));
    let source = block_on(monitor.start());
    info!("Readings from {:?}", source);

    let end_secs = minutes * 60;
    let mut fault_injected = false;
    let mut calibration_requested = false;

    // -----------------------------------------------------------------------
    // Main loop, one iteration per simulated second
    // -----------------------------------------------------------------------
    while clock.elapsed_secs() < end_secs {
        clock.advance_to_next_second();
        let now = clock.now();
        let elapsed = clock.elapsed_secs();

        // --- Room ---------------------------------------------------------
        // The device holds its forced-recalibrated value until verified
        let calibration_state = monitor.calibration().map(|s| s.state());
        let window_open = calibration_state.is_some_and(|s| !s.is_finished());
        if !matches!(
            calibration_state,
            Some(CalibrationState::Calibrating | CalibrationState::Verifying)
        ) {
            device.set_reading(room.reading(elapsed, window_open));
        }

        // --- Scripted events ------------------------------------------------
        if source == Source::Sensor && !fault_injected && elapsed >= fault_at_min * 60 {
            fault_injected = true;
            info!("Injecting a bus fault");
            device.fail_next_ops(1);
        }

        if source == Source::Sensor && !calibration_requested && elapsed >= calibrate_at_min * 60
        {
            calibration_requested = true;
            match monitor.begin_calibration() {
                Ok(session) => {
                    info!(
                        "Calibration to {} ppm confirmed, opening the window",
                        session.target_ppm()
                    );
                    session.confirm(now);
                }
                Err(e) => warn!("Calibration not available: {}", e),
            }
        }

        // --- Calibration ----------------------------------------------------
        if let Some(state) = block_on(monitor.step_calibration(now)) {
            if state == CalibrationState::WaitStableAir && elapsed % 30 == 0 {
                let remaining = monitor
                    .calibration()
                    .map_or(0, |s| s.remaining_wait_secs(now));
                info!("Calibration: {} s of settling left", remaining);
            }
            if state.is_finished()
                && let Some(session) = monitor.finish_calibration()
            {
                match session.outcome() {
                    Some(outcome) => {
                        info!(
                            "Calibration done: pre {:?} ppm, correction {:?}, post {:?} ppm",
                            outcome.pre_cal_ppm, outcome.correction, outcome.post_cal_ppm
                        );
                        // A successful recalibration pins outdoor air to the target
                        if outcome.correction.is_ok() {
                            room.drift_ppm =
                                i32::from(outcome.target_ppm) - Room::OUTDOOR_PPM as i32;
                        }
                    }
                    None => info!("Calibration cancelled"),
                }
            }
        }

        // --- Sensor ---------------------------------------------------------
        match block_on(monitor.poll_sensor(now)) {
            PollOutcome::Fault { error, recovered } => {
                warn!("Sensor fault: {} (recovered: {})", error, recovered);
            }
            PollOutcome::Data(_) | PollOutcome::NoData => {}
        }
        if monitor.take_updated() {
            let m = monitor.latest();
            debug!(
                "CO2 {} ppm, {:.1} °C, {:.1} %RH",
                m.co2_ppm,
                m.temperature,
                m.humidity
            );
        }

        // --- History --------------------------------------------------------
        let wall = WallClock::from_secs_of_day(START_OF_DAY_SECS + elapsed as u32);
        match monitor.tick(wall) {
            TickOutcome::Minute { minute_avg } => {
                info!(
                    "{:02}:{:02} minute average {:.1} ppm",
                    wall.hours, wall.minutes, minute_avg
                );
                if wall.minutes % 5 == 0 {
                    report_history(&monitor);
                }
            }
            TickOutcome::Hour {
                minute_avg,
                hour_avg,
            } => {
                info!(
                    "{:02}:00 minute average {:.1} ppm, hour average {:.1} ppm",
                    wall.hours, minute_avg, hour_avg
                );
                report_history(&monitor);
            }
            TickOutcome::Raw | TickOutcome::Rejected(_) => {}
        }
    }

    report_history(&monitor);
    if let Ok(settings) = block_on(monitor.sensor_settings()) {
        info!("{} settings at shutdown: {:?}", monitor.kind().name(), settings);
    }
    save_device(&device, eeprom_path.as_deref());
    info!("Simulator finished after {} s of simulated time", clock.elapsed_secs());
}
