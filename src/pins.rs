//! Pin assignment and the live output/direction state of the IO port.

use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// Highest pin on the primary data port.
const MAX_DATA_PIN: u8 = 7;
/// Pins 8..=11 map to the 4-bit auxiliary (CBUS) port.
const MAX_AUX_PIN: u8 = 11;

/// Logical pin numbers as given by the user.
///
/// Defaults follow the common FT232R wiring: MOSI on TXD, MISO on RxD,
/// SCK on RTS and RESET on DTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinAssignment {
    pub sck: u8,
    pub mosi: u8,
    pub miso: u8,
    pub reset: u8,
    pub rdy_led: Option<u8>,
    pub pgm_led: Option<u8>,
}

impl Default for PinAssignment {
    fn default() -> Self {
        PinAssignment {
            sck: 2,
            mosi: 0,
            miso: 1,
            reset: 4,
            rdy_led: None,
            pgm_led: None,
        }
    }
}

impl fmt::Display for PinAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "miso {} sck {} mosi {} reset {}",
            self.miso, self.sck, self.mosi, self.reset
        )?;
        if let Some(pin) = self.rdy_led {
            write!(f, " rdy {}", pin)?;
        }
        if let Some(pin) = self.pgm_led {
            write!(f, " pgm {}", pin)?;
        }
        Ok(())
    }
}

/// Parses `name=pin` pairs separated by commas, e.g. `sck=2,mosi=0,rdy=9`.
/// Pins not mentioned keep their default.
impl FromStr for PinAssignment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut pins = PinAssignment::default();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (name, value) = token
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("expected name=pin, got \"{}\"", token)))?;
            let pin: u8 = value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid pin number \"{}\"", value)))?;
            match name.trim() {
                "sck" => pins.sck = pin,
                "mosi" => pins.mosi = pin,
                "miso" => pins.miso = pin,
                "reset" => pins.reset = pin,
                "rdy" | "rdyled" => pins.rdy_led = Some(pin),
                "pgm" | "pgmled" => pins.pgm_led = Some(pin),
                other => return Err(Error::Config(format!("unknown pin \"{}\"", other))),
            }
        }
        Ok(pins)
    }
}

/// Bit masks derived from a validated [`PinAssignment`].
///
/// Indicator masks are split between the primary port and the auxiliary
/// nibble; an unassigned indicator leaves both masks zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalMap {
    pub sck: u8,
    pub mosi: u8,
    pub miso: u8,
    pub reset: u8,
    pub rdy_led: u8,
    pub pgm_led: u8,
    pub rdy_led_aux: u8,
    pub pgm_led_aux: u8,
}

impl SignalMap {
    pub fn configure(pins: &PinAssignment) -> Result<Self> {
        for (name, pin) in [
            ("sck", pins.sck),
            ("mosi", pins.mosi),
            ("miso", pins.miso),
            ("reset", pins.reset),
        ] {
            if pin > MAX_DATA_PIN {
                return Err(Error::Config(format!(
                    "{} pin {} out of range 0-{}",
                    name, pin, MAX_DATA_PIN
                )));
            }
        }
        if pins.sck == pins.mosi || pins.sck == pins.reset || pins.mosi == pins.reset {
            return Err(Error::Config(format!(
                "sck, mosi and reset must use distinct pins ({})",
                pins
            )));
        }
        if [pins.sck, pins.mosi, pins.reset].contains(&pins.miso) {
            return Err(Error::Config(format!(
                "miso pin {} is already driven as an output",
                pins.miso
            )));
        }

        let mut map = SignalMap {
            sck: 1 << pins.sck,
            mosi: 1 << pins.mosi,
            miso: 1 << pins.miso,
            reset: 1 << pins.reset,
            ..Default::default()
        };
        (map.rdy_led, map.rdy_led_aux) = indicator_masks("rdy", pins.rdy_led)?;
        (map.pgm_led, map.pgm_led_aux) = indicator_masks("pgm", pins.pgm_led)?;

        log::debug!("pin assign {}", pins);
        Ok(map)
    }

    /// Whether any indicator lives on the auxiliary nibble.
    pub fn has_aux_indicators(&self) -> bool {
        self.rdy_led_aux != 0 || self.pgm_led_aux != 0
    }
}

fn indicator_masks(name: &str, pin: Option<u8>) -> Result<(u8, u8)> {
    match pin {
        None => Ok((0, 0)),
        Some(pin) if pin <= MAX_DATA_PIN => Ok((1 << pin, 0)),
        Some(pin) if pin <= MAX_AUX_PIN => Ok((0, 1 << (pin - MAX_DATA_PIN - 1))),
        Some(pin) => Err(Error::Config(format!(
            "{} indicator pin {} out of range 0-{}",
            name, pin, MAX_AUX_PIN
        ))),
    }
}

/// Current pin levels and directions, owned by one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputState {
    /// Output levels of the primary port.
    pub data: u8,
    /// Direction of the primary port, 1 = output.
    pub direction: u8,
    /// Direction of the auxiliary nibble.
    pub aux_direction: u8,
}

impl OutputState {
    /// Drives the busy indicator and returns the resulting frame.
    ///
    /// The indicators are active low: busy pulls PGM low and lifts RDY.
    pub fn indicate(&mut self, map: &SignalMap, busy: bool) -> u8 {
        if busy {
            self.data &= !map.pgm_led;
            self.data |= map.rdy_led;
        } else {
            self.data |= map.pgm_led;
            self.data &= !map.rdy_led;
        }
        self.data
    }

    pub fn set_reset(&mut self, map: &SignalMap, level: bool) -> u8 {
        if level {
            self.data |= map.reset;
        } else {
            self.data &= !map.reset;
        }
        self.data
    }

    /// Payload for the auxiliary bit mode: direction in the high nibble,
    /// levels in the low nibble. Auxiliary levels are always driven low.
    pub fn aux_mode(&self) -> u8 {
        self.aux_direction << 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_assignment() {
        let map = SignalMap::configure(&PinAssignment::default()).unwrap();
        assert_eq!(map.mosi, 0x01);
        assert_eq!(map.miso, 0x02);
        assert_eq!(map.sck, 0x04);
        assert_eq!(map.reset, 0x10);
        assert_eq!(map.rdy_led | map.pgm_led, 0);
        assert!(!map.has_aux_indicators());
    }

    #[test]
    fn test_parse_assignment() {
        let pins: PinAssignment = "sck=5, mosi=6,miso=7,reset=3,rdy=9,pgm=1".parse().unwrap();
        assert_eq!(pins.sck, 5);
        assert_eq!(pins.rdy_led, Some(9));
        let map = SignalMap::configure(&pins).unwrap();
        assert_eq!(map.rdy_led, 0);
        assert_eq!(map.rdy_led_aux, 0x02);
        assert_eq!(map.pgm_led, 0x02);
        assert!(map.has_aux_indicators());

        assert!("sck".parse::<PinAssignment>().is_err());
        assert!("clk=3".parse::<PinAssignment>().is_err());
        assert!("sck=x".parse::<PinAssignment>().is_err());
    }

    #[test]
    fn test_rejects_shared_pins() {
        let pins = PinAssignment {
            reset: 2,
            ..Default::default()
        };
        assert!(matches!(SignalMap::configure(&pins), Err(Error::Config(_))));

        let pins = PinAssignment {
            miso: 0,
            ..Default::default()
        };
        assert!(SignalMap::configure(&pins).is_err());

        let pins = PinAssignment {
            sck: 8,
            ..Default::default()
        };
        assert!(SignalMap::configure(&pins).is_err());

        let pins = PinAssignment {
            pgm_led: Some(12),
            ..Default::default()
        };
        assert!(SignalMap::configure(&pins).is_err());
    }

    #[test]
    fn test_indicate() {
        let pins = PinAssignment {
            rdy_led: Some(6),
            pgm_led: Some(7),
            ..Default::default()
        };
        let map = SignalMap::configure(&pins).unwrap();
        let mut state = OutputState::default();
        assert_eq!(state.indicate(&map, true), 0x40);
        assert_eq!(state.indicate(&map, false), 0x80);
        assert_eq!(state.set_reset(&map, true), 0x90);
        assert_eq!(state.set_reset(&map, false), 0x80);
    }
}
