//! In-memory Sensirion sensor on a fake I2C bus.
//!
//! Speaks the same command set as the real SCD30, SCD41 and SGP30 closely
//! enough to drive the backends end to end: sampling state, data-ready
//! timing, settings, forced recalibration and the SCD41's EEPROM. Faults can
//! be injected per transaction or per command.
//!
//! Handles are cheap clones sharing one device, so a test can keep one to
//! inspect and steer the device while the backend owns the other.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{ErrorType, I2c, Operation};

use crate::sensors::sensirion::{crc8, encode_word};
use crate::sensors::{DeviceSettings, Measurement, SensorKind};

/// Failure reported by the emulated bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorError {
    /// Wrong address, or the device refused the command in its current state
    Nack,
    /// Injected fault
    Injected,
}

impl embedded_hal::i2c::Error for EmulatorError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Nack => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data),
            Self::Injected => ErrorKind::Bus,
        }
    }
}

/// Delay that returns immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}

struct DeviceState {
    kind: SensorKind,
    sampling: bool,
    interval_secs: u16,
    elapsed_ms: u64,
    data_ready: bool,
    reading: Measurement,
    queued: VecDeque<Measurement>,
    response: Vec<u8>,
    settings: DeviceSettings,
    /// postcard image of the persisted settings
    eeprom: Option<Vec<u8>>,
    frc_reference: u16,
    reject_frc: bool,
    fail_ops: usize,
    fail_commands: Vec<u16>,
    corrupt_next_response: bool,
    start_count: u32,
    commands: Vec<u16>,
}

/// Handle to one emulated sensor
#[derive(Clone)]
pub struct SensirionEmulator {
    state: Rc<RefCell<DeviceState>>,
}

impl SensirionEmulator {
    /// Settings of a device fresh from the factory
    pub const FACTORY_SETTINGS: DeviceSettings = DeviceSettings {
        temperature_offset: 4.0,
        altitude_m: 0,
        auto_self_calibration: true,
    };

    const FIRMWARE_VERSION: u16 = 0x0342;
    const SERIAL: [u16; 3] = [0x0000, 0x0148, 0xA3F2];

    pub fn new(kind: SensorKind) -> Self {
        let settings = match kind {
            SensorKind::Sgp30 => DeviceSettings::NEUTRAL,
            _ => Self::FACTORY_SETTINGS,
        };
        Self {
            state: Rc::new(RefCell::new(DeviceState {
                kind,
                sampling: false,
                interval_secs: kind.sample_period_secs(),
                elapsed_ms: 0,
                data_ready: false,
                reading: Measurement::new(420, 21.0, 45.0),
                queued: VecDeque::new(),
                response: Vec::new(),
                settings,
                eeprom: None,
                frc_reference: 400,
                reject_frc: false,
                fail_ops: 0,
                fail_commands: Vec::new(),
                corrupt_next_response: false,
                start_count: 0,
                commands: Vec::new(),
            })),
        }
    }

    /// Restore a device whose EEPROM holds `image`.
    pub fn with_eeprom(kind: SensorKind, image: &[u8]) -> Self {
        let emulator = Self::new(kind);
        {
            let mut state = emulator.state.borrow_mut();
            if let Ok(settings) = postcard::from_bytes::<DeviceSettings>(image) {
                state.settings = settings;
                state.eeprom = Some(image.to_vec());
            }
        }
        emulator
    }

    pub fn kind(&self) -> SensorKind {
        self.state.borrow().kind
    }

    /// Let `ms` of device time pass. A sampling device produces one
    /// measurement per interval.
    pub fn advance(&self, ms: u64) {
        let mut state = self.state.borrow_mut();
        if !state.sampling || state.kind == SensorKind::Sgp30 {
            return;
        }
        let period_ms = u64::from(state.interval_secs.max(1)) * 1000;
        state.elapsed_ms += ms;
        while state.elapsed_ms >= period_ms {
            state.elapsed_ms -= period_ms;
            if let Some(next) = state.queued.pop_front() {
                state.reading = next;
            }
            state.data_ready = true;
        }
    }

    /// Value reported by every following measurement
    pub fn set_reading(&self, reading: Measurement) {
        self.state.borrow_mut().reading = reading;
    }

    /// Queue a value for the next measurement only; later ones repeat it
    /// until another is queued.
    pub fn push_measurement(&self, reading: Measurement) {
        self.state.borrow_mut().queued.push_back(reading);
    }

    pub fn reading(&self) -> Measurement {
        self.state.borrow().reading
    }

    /// Fail the next `n` bus transactions, whatever they carry.
    pub fn fail_next_ops(&self, n: usize) {
        self.state.borrow_mut().fail_ops = n;
    }

    /// Fail the next write of `cmd` only.
    pub fn fail_command_once(&self, cmd: u16) {
        self.state.borrow_mut().fail_commands.push(cmd);
    }

    /// Flip a CRC byte in the next response.
    pub fn corrupt_next_response(&self) {
        self.state.borrow_mut().corrupt_next_response = true;
    }

    /// Make forced recalibration fail as the device would.
    pub fn reject_calibration(&self) {
        self.state.borrow_mut().reject_frc = true;
    }

    pub fn is_sampling(&self) -> bool {
        self.state.borrow().sampling
    }

    /// Number of times sampling was started
    pub fn start_count(&self) -> u32 {
        self.state.borrow().start_count
    }

    /// Settings currently active in RAM
    pub fn settings(&self) -> DeviceSettings {
        self.state.borrow().settings
    }

    /// Settings decoded from the EEPROM image, if any were persisted
    pub fn persisted_settings(&self) -> Option<DeviceSettings> {
        let state = self.state.borrow();
        let image = state.eeprom.as_ref()?;
        postcard::from_bytes(image).ok()
    }

    /// Raw EEPROM image, as a real device would keep across power cycles
    pub fn eeprom_image(&self) -> Option<Vec<u8>> {
        self.state.borrow().eeprom.clone()
    }

    /// Every command word received, in order
    pub fn commands(&self) -> Vec<u16> {
        self.state.borrow().commands.clone()
    }
}

impl DeviceState {
    fn respond(&mut self, words: &[u16]) {
        self.response.clear();
        for &word in words {
            self.response.extend_from_slice(&encode_word(word));
        }
        if core::mem::take(&mut self.corrupt_next_response)
            && let Some(crc) = self.response.get_mut(2)
        {
            *crc ^= 0xFF;
        }
    }

    fn persist(&mut self) {
        self.eeprom = postcard::to_allocvec(&self.settings).ok();
    }

    fn start(&mut self) {
        self.sampling = true;
        self.start_count += 1;
        self.elapsed_ms = 0;
        self.data_ready = false;
    }

    fn stop(&mut self) {
        self.sampling = false;
        self.data_ready = false;
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), EmulatorError> {
        if bytes.len() < 2 {
            return Err(EmulatorError::Nack);
        }
        let cmd = u16::from_be_bytes([bytes[0], bytes[1]]);
        let arg = match bytes.len() {
            2 => None,
            5 if crc8(&bytes[2..4]) == bytes[4] => Some(u16::from_be_bytes([bytes[2], bytes[3]])),
            _ => return Err(EmulatorError::Nack),
        };

        self.commands.push(cmd);
        if let Some(pos) = self.fail_commands.iter().position(|&c| c == cmd) {
            self.fail_commands.remove(pos);
            return Err(EmulatorError::Injected);
        }

        match self.kind {
            SensorKind::Scd41 => self.scd41_command(cmd, arg),
            SensorKind::Scd30 => self.scd30_command(cmd, arg),
            SensorKind::Sgp30 => self.sgp30_command(cmd),
        }
    }

    fn scd41_command(&mut self, cmd: u16, arg: Option<u16>) -> Result<(), EmulatorError> {
        // Only reads and stop are accepted while sampling
        let idle_only = !matches!(cmd, 0x3F86 | 0xEC05 | 0xE4B8);
        if idle_only && self.sampling {
            return Err(EmulatorError::Nack);
        }

        match (cmd, arg) {
            (0x21B1, None) => self.start(),
            (0x3F86, None) => self.stop(),
            (0xE4B8, None) => {
                let status = if self.data_ready { 0x8006 } else { 0x8000 };
                self.respond(&[status]);
            }
            (0xEC05, None) => {
                let m = self.reading;
                let t = libm::roundf((m.temperature + 45.0) * 65535.0 / 175.0) as u16;
                let rh = libm::roundf(m.humidity * 65535.0 / 100.0) as u16;
                self.respond(&[m.co2_ppm, t, rh]);
                self.data_ready = false;
            }
            (0x241D, Some(word)) => {
                self.settings.temperature_offset = f32::from(word) * 175.0 / 65535.0;
            }
            (0x2427, Some(word)) => self.settings.altitude_m = word,
            (0x2416, Some(word)) => self.settings.auto_self_calibration = word != 0,
            (0x2318, None) => {
                let word = libm::roundf(self.settings.temperature_offset * 65535.0 / 175.0) as u16;
                self.respond(&[word]);
            }
            (0x2322, None) => self.respond(&[self.settings.altitude_m]),
            (0x2313, None) => self.respond(&[u16::from(self.settings.auto_self_calibration)]),
            (0x362F, Some(target)) => {
                if self.reject_frc {
                    self.respond(&[0xFFFF]);
                } else {
                    let correction = i32::from(target) - i32::from(self.reading.co2_ppm);
                    self.respond(&[(0x8000 + correction) as u16]);
                    self.reading.co2_ppm = target;
                }
            }
            (0x3615, None) => self.persist(),
            (0x3632, None) => {
                self.settings = SensirionEmulator::FACTORY_SETTINGS;
                self.eeprom = None;
            }
            _ => return Err(EmulatorError::Nack),
        }
        Ok(())
    }

    fn scd30_command(&mut self, cmd: u16, arg: Option<u16>) -> Result<(), EmulatorError> {
        match (cmd, arg) {
            (0x0010, Some(_pressure)) => self.start(),
            (0x0104, None) => self.stop(),
            (0x4600, Some(secs)) => self.interval_secs = secs.max(2),
            (0x4600, None) => self.respond(&[self.interval_secs]),
            (0x0202, None) => self.respond(&[u16::from(self.data_ready)]),
            (0x0300, None) => {
                let m = self.reading;
                let mut words = [0u16; 6];
                for (i, value) in [f32::from(m.co2_ppm), m.temperature, m.humidity]
                    .into_iter()
                    .enumerate()
                {
                    let bits = value.to_bits();
                    words[2 * i] = (bits >> 16) as u16;
                    words[2 * i + 1] = bits as u16;
                }
                self.respond(&words);
                self.data_ready = false;
            }
            (0x5306, Some(word)) => {
                self.settings.auto_self_calibration = word == 1;
                self.persist();
            }
            (0x5306, None) => self.respond(&[u16::from(self.settings.auto_self_calibration)]),
            (0x5204, Some(target)) => {
                if !self.reject_frc {
                    self.frc_reference = target;
                    self.reading.co2_ppm = target;
                }
            }
            (0x5204, None) => self.respond(&[self.frc_reference]),
            (0x5403, Some(word)) => {
                self.settings.temperature_offset = f32::from(word) / 100.0;
                self.persist();
            }
            (0x5403, None) => {
                let word = libm::roundf(self.settings.temperature_offset * 100.0) as u16;
                self.respond(&[word]);
            }
            (0x5102, Some(word)) => {
                self.settings.altitude_m = word;
                self.persist();
            }
            (0x5102, None) => self.respond(&[self.settings.altitude_m]),
            (0xD100, None) => self.respond(&[SensirionEmulator::FIRMWARE_VERSION]),
            (0xD304, None) => self.stop(),
            _ => return Err(EmulatorError::Nack),
        }
        Ok(())
    }

    fn sgp30_command(&mut self, cmd: u16) -> Result<(), EmulatorError> {
        match cmd {
            0x3682 => self.respond(&SensirionEmulator::SERIAL),
            0x2003 => self.start(),
            0x2008 if self.sampling => {
                if let Some(next) = self.queued.pop_front() {
                    self.reading = next;
                }
                self.respond(&[self.reading.co2_ppm, 0]);
            }
            _ => return Err(EmulatorError::Nack),
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), EmulatorError> {
        if self.response.len() < buf.len() {
            return Err(EmulatorError::Nack);
        }
        buf.copy_from_slice(&self.response[..buf.len()]);
        self.response.clear();
        Ok(())
    }
}

impl ErrorType for SensirionEmulator {
    type Error = EmulatorError;
}

impl I2c for SensirionEmulator {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        if state.fail_ops > 0 {
            state.fail_ops -= 1;
            return Err(EmulatorError::Injected);
        }
        if address != state.kind.address() {
            return Err(EmulatorError::Nack);
        }

        for op in operations {
            match op {
                Operation::Write(bytes) => state.write(bytes)?,
                Operation::Read(buf) => state.read(buf)?,
            }
        }
        Ok(())
    }
}
