//! ISP clock calibration against the rates the bit-bang engine supports.

use crate::constants::{FRAGMENT_SIZE_HIGH_SPEED, FRAGMENT_SIZE_STANDARD};
use crate::error::{Error, Result};

/// FT245R, FT232R, FT2232D.
const STANDARD_RATES: [u32; 13] = [
    600, 1200, 2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

/// FT2232H, FT232H.
const HIGH_SPEED_RATES: [u32; 22] = [
    600, 1200, 2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
    1000000, 1200000, 1500000, 2000000, 2400000, 3000000, 4000000, 6000000, 12000000,
];

/// Target used when no period is requested.
const DEFAULT_TARGET: f64 = 235000.0 / 2.0;
/// Periods below this are clamped.
const MIN_PERIOD: f64 = 0.0015;
const MIN_PERIOD_TARGET: f64 = 1500.0 / 2.0;

/// The rate table picked once at session open from the chip capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTable {
    Standard,
    HighSpeed,
}

impl ClockTable {
    pub fn detect(high_speed: bool) -> Self {
        if high_speed {
            ClockTable::HighSpeed
        } else {
            ClockTable::Standard
        }
    }

    pub fn rates(self) -> &'static [u32] {
        match self {
            ClockTable::Standard => &STANDARD_RATES,
            ClockTable::HighSpeed => &HIGH_SPEED_RATES,
        }
    }

    /// Largest single write the chip queue accepts.
    pub fn fragment_size(self) -> usize {
        match self {
            ClockTable::Standard => FRAGMENT_SIZE_STANDARD,
            ClockTable::HighSpeed => FRAGMENT_SIZE_HIGH_SPEED,
        }
    }

    /// Picks the rate for a bit clock `period` in seconds: the greatest
    /// table entry not above the target, or the slowest entry.
    pub fn select(self, period: f64) -> Result<u32> {
        let target = target_rate(period)?;
        let rates = self.rates();
        Ok(rates
            .iter()
            .rev()
            .find(|&&rate| f64::from(rate) <= target)
            .copied()
            .unwrap_or(rates[0]))
    }
}

/// Raw baud target for a bit clock period in seconds, 0 meaning default.
pub fn target_rate(period: f64) -> Result<f64> {
    if !period.is_finite() || period < 0.0 {
        return Err(Error::Config(format!("invalid bit clock period {}", period)));
    }
    Ok(if period == 0.0 {
        DEFAULT_TARGET
    } else if period < MIN_PERIOD {
        MIN_PERIOD_TARGET
    } else {
        (period * 1_000_000.0 / 2.0).round()
    })
}
