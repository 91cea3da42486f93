//! Hardware-independent core library for co2mon
//!
//! This crate contains the platform-agnostic logic of the CO2 monitoring
//! appliance: the multi-resolution history engine that downsamples raw
//! readings into minute and hour tiers, the sensor driver state machine with
//! its Sensirion backends, and the interactive calibration workflow.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod calibration;
pub mod config;
#[cfg(any(test, feature = "emulator"))]
pub mod emulator;
pub mod driver;
pub mod error;
pub mod history;
pub mod monitor;
pub mod sensors;
pub mod sim;
