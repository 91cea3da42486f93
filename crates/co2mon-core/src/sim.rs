//! Simulated readings for running without a sensor.
//!
//! Each quantity sweeps up and down between two limits in jittered steps,
//! which exercises the whole display range in a few minutes.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::sensors::Measurement;

/// Triangle wave with random step size
#[derive(Debug, Clone)]
struct Sweep {
    value: f32,
    rising: bool,
    low: f32,
    high: f32,
    step: f32,
    jitter: f32,
}

impl Sweep {
    fn advance(&mut self, rng: &mut SmallRng) -> f32 {
        if self.rising && self.value > self.high {
            self.rising = false;
        } else if !self.rising && self.value < self.low {
            self.rising = true;
        }

        let delta = self.step + rng.gen_range(-self.jitter..self.jitter);
        if self.rising {
            self.value += delta;
        } else {
            self.value -= delta;
        }
        self.value
    }
}

/// Generator of plausible-looking CO2, temperature and humidity values
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    rng: SmallRng,
    co2: Sweep,
    temperature: Sweep,
    humidity: Sweep,
}

impl SimulatedSensor {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            co2: Sweep {
                value: 400.0,
                rising: true,
                low: 400.0,
                high: 6000.0,
                step: 250.0,
                jitter: 50.0,
            },
            temperature: Sweep {
                value: 20.0,
                rising: true,
                low: 10.0,
                high: 45.0,
                step: 10.0,
                jitter: 3.0,
            },
            humidity: Sweep {
                value: 25.0,
                rising: true,
                low: 10.0,
                high: 100.0,
                step: 15.0,
                jitter: 5.0,
            },
        }
    }

    /// Produce the next simulated measurement. CO2 is never the zero sentinel.
    pub fn next_measurement(&mut self) -> Measurement {
        let co2 = self.co2.advance(&mut self.rng);
        let temperature = self.temperature.advance(&mut self.rng);
        let humidity = self.humidity.advance(&mut self.rng);

        Measurement {
            co2_ppm: co2.clamp(1.0, f32::from(u16::MAX)) as u16,
            temperature,
            humidity,
        }
    }
}
