//! Clock domains driving control-port timing.
//!
//! A clock is shared between the endpoint using it and whoever controls the
//! hardware clock, so frequency and running state are atomics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::units::{Frequency, as_hz, hz};

/// Named clock with an adjustable frequency and a running flag.
#[derive(Debug)]
pub struct ClockIface {
    name: String,
    freq_bits: AtomicU64,
    running: AtomicBool,
}

impl ClockIface {
    /// Create a stopped clock with frequency 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_freq(name, hz(0.0), false)
    }

    pub fn with_freq(name: impl Into<String>, freq: Frequency, running: bool) -> Self {
        Self {
            name: name.into(),
            freq_bits: AtomicU64::new(as_hz(freq).to_bits()),
            running: AtomicBool::new(running),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn freq(&self) -> Frequency {
        hz(f64::from_bits(self.freq_bits.load(Ordering::Acquire)))
    }

    pub fn set_freq(&self, freq: Frequency) {
        self.freq_bits
            .store(as_hz(freq).to_bits(), Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }
}
