//! Sensirion I2C command framing shared by every backend.
//!
//! All three parts speak the same protocol: a 16-bit big-endian command,
//! optionally followed by one argument word, and responses made of 16-bit
//! words each trailed by a CRC-8 byte.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use heapless::Vec;
use log::warn;

use crate::error::SensorError;

/// Longest response any backend reads (SCD30 measurement: 6 words)
pub const MAX_WORDS: usize = 6;

const WORD_LEN: usize = 3;

/// Sensirion CRC-8 (polynomial 0x31, init 0xFF) over one data word.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Encode one word followed by its CRC
pub fn encode_word(word: u16) -> [u8; WORD_LEN] {
    let [hi, lo] = word.to_be_bytes();
    [hi, lo, crc8(&[hi, lo])]
}

/// Command channel to one Sensirion device.
pub struct SensirionBus<I, D> {
    i2c: I,
    delay: D,
    address: u8,
    sensor: &'static str,
}

impl<I: I2c, D: DelayNs> SensirionBus<I, D> {
    pub fn new(i2c: I, delay: D, address: u8, sensor: &'static str) -> Self {
        Self {
            i2c,
            delay,
            address,
            sensor,
        }
    }

    pub fn sensor(&self) -> &'static str {
        self.sensor
    }

    /// Send a bare command.
    pub async fn command(&mut self, cmd: u16, operation: &'static str) -> Result<(), SensorError> {
        let bytes = cmd.to_be_bytes();
        self.write(&bytes, operation).await
    }

    /// Send a command with one argument word.
    pub async fn command_with_arg(
        &mut self,
        cmd: u16,
        arg: u16,
        operation: &'static str,
    ) -> Result<(), SensorError> {
        let [c0, c1] = cmd.to_be_bytes();
        let [a0, a1, crc] = encode_word(arg);
        self.write(&[c0, c1, a0, a1, crc], operation).await
    }

    /// Send `cmd`, wait `exec_ms` for the device to prepare its answer, then
    /// read `N` CRC-checked words.
    pub async fn read_words<const N: usize>(
        &mut self,
        cmd: u16,
        exec_ms: u32,
        operation: &'static str,
    ) -> Result<[u16; N], SensorError> {
        self.command(cmd, operation).await?;
        if exec_ms > 0 {
            self.delay.delay_ms(exec_ms).await;
        }
        self.read_response(operation).await
    }

    /// Read `N` CRC-checked words left by a previously sent command.
    pub async fn read_response<const N: usize>(
        &mut self,
        operation: &'static str,
    ) -> Result<[u16; N], SensorError> {
        let mut buf: Vec<u8, { MAX_WORDS * WORD_LEN }> = Vec::new();
        if buf.resize(N * WORD_LEN, 0).is_err() {
            return Err(SensorError::InvalidData {
                sensor: self.sensor,
                operation,
            });
        }
        if let Err(e) = self.i2c.read(self.address, &mut buf).await {
            warn!("{}: I2C read failed during {}: {:?}", self.sensor, operation, e);
            return Err(SensorError::Bus {
                sensor: self.sensor,
                operation,
            });
        }

        let mut words = [0u16; N];
        for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(WORD_LEN)) {
            if crc8(&chunk[..2]) != chunk[2] {
                warn!("{}: CRC mismatch in {} response", self.sensor, operation);
                return Err(SensorError::Crc {
                    sensor: self.sensor,
                    operation,
                });
            }
            *word = u16::from_be_bytes([chunk[0], chunk[1]]);
        }
        Ok(words)
    }

    pub async fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms).await;
    }

    async fn write(&mut self, bytes: &[u8], operation: &'static str) -> Result<(), SensorError> {
        self.i2c.write(self.address, bytes).await.map_err(|e| {
            warn!("{}: I2C write failed during {}: {:?}", self.sensor, operation, e);
            SensorError::Bus {
                sensor: self.sensor,
                operation,
            }
        })
    }
}
