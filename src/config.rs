//! Session settings.
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::pins::PinAssignment;

/// What happens to RESET when the session closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitSpec {
    /// Release RESET (and the indicators) so the target starts running.
    /// Otherwise the pin directions are left as they were.
    pub release_reset: bool,
}

/// Parses the comma separated exit specification: `reset` or `noreset`,
/// the last one winning.
impl FromStr for ExitSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut exit = ExitSpec::default();
        for token in s.split(',').filter(|t| !t.is_empty()) {
            match token {
                "reset" => exit.release_reset = true,
                "noreset" => exit.release_reset = false,
                other => {
                    return Err(Error::Config(format!("invalid exit specification \"{}\"", other)));
                }
            }
        }
        Ok(exit)
    }
}

/// USB latency timer used when none, or an unusable one, is given.
pub const DEFAULT_LATENCY_MS: u8 = 2;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pins: PinAssignment,
    /// Bit clock period in seconds, 0 for the default rate.
    pub bitclock: f64,
    /// USB latency timer in milliseconds.
    pub latency: u8,
    pub exit: ExitSpec,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            pins: PinAssignment::default(),
            bitclock: 0.0,
            latency: DEFAULT_LATENCY_MS,
            exit: ExitSpec::default(),
        }
    }
}

impl SessionConfig {
    /// Latency timer to program; 0 and 1 ms stall the chip, so they fall back to the default.
    pub fn latency_ms(&self) -> u8 {
        if self.latency <= 1 {
            DEFAULT_LATENCY_MS
        } else {
            self.latency
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exit_specs() {
        assert!(!"".parse::<ExitSpec>().unwrap().release_reset);
        assert!("reset".parse::<ExitSpec>().unwrap().release_reset);
        assert!(!"noreset".parse::<ExitSpec>().unwrap().release_reset);
        assert!(!"reset,noreset".parse::<ExitSpec>().unwrap().release_reset);
        assert!("noreset,,reset".parse::<ExitSpec>().unwrap().release_reset);
        assert!(matches!("vcc".parse::<ExitSpec>(), Err(Error::Config(_))));
        assert!("reset, noreset".parse::<ExitSpec>().is_err());
    }

    #[test]
    fn test_latency_fallback() {
        let mut config = SessionConfig::default();
        assert_eq!(config.latency_ms(), 2);
        config.latency = 1;
        assert_eq!(config.latency_ms(), 2);
        config.latency = 16;
        assert_eq!(config.latency_ms(), 16);
    }
}
