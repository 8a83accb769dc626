//! Programming enable handshake and the instructions that depend on it.

use crate::constants::commands::{
    PROGRAM_ENABLE, PROGRAM_ENABLE_ECHO, READ_SIGNATURE, SIGNATURE_VENDOR,
};
use crate::constants::timing::{PRE_RESET_US, SETTLE_US};
use crate::constants::{ATTEMPTS_PER_MODE, HANDSHAKE_RESET_PULSE, PROBES_PER_ATTEMPT};
use crate::device::Part;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::Transport;

/// Where the session stands in the programming enable sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandshakeState {
    #[default]
    Idle,
    AttemptingNoReset,
    AttemptingWithReset,
    Enabled,
    Failed,
}

impl<T: Transport> Session<T> {
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake
    }

    /// Puts the target into serial programming mode and latches its signature.
    ///
    /// Without-reset attempts come first when `try_without_reset` is set, so
    /// a target already in programming mode is not restarted.
    pub fn program_enable(&mut self, part: &Part, try_without_reset: bool) -> Result<()> {
        let mut probes = 0;
        self.ext_addr = None;
        let modes: &[bool] = if try_without_reset {
            &[false, true]
        } else {
            &[true]
        };

        for &with_reset in modes {
            self.handshake = if with_reset {
                HandshakeState::AttemptingWithReset
            } else {
                HandshakeState::AttemptingNoReset
            };
            if self.enable_mode(part, with_reset, &mut probes)? {
                self.handshake = HandshakeState::Enabled;
                log::debug!(
                    "program enable after {} probes, signature {}",
                    probes,
                    hex::encode(self.signature)
                );
                return Ok(());
            }
        }

        self.handshake = HandshakeState::Failed;
        log::debug!("program enable failed after {} probes", probes);
        Err(Error::Handshake { probes })
    }

    /// Same as [`Session::program_enable`] with the without-reset attempts first.
    pub fn initialize(&mut self, part: &Part) -> Result<()> {
        self.program_enable(part, true)
    }

    fn enable_mode(&mut self, part: &Part, with_reset: bool, probes: &mut usize) -> Result<bool> {
        self.set_bit_clock(self.bit_clock_period(part))?;

        for attempt in 0..ATTEMPTS_PER_MODE {
            log::debug!(
                "program enable attempt {}{}",
                attempt + 1,
                if with_reset { " with reset" } else { "" }
            );
            self.state.direction |= self.map.rdy_led;
            self.state.aux_direction |= self.map.rdy_led_aux;
            self.apply_directions()?;

            if with_reset {
                self.delay(PRE_RESET_US)?;
                self.pulse_reset(HANDSHAKE_RESET_PULSE)?;
                self.delay(SETTLE_US)?;
            }
            if self.probe(probes)? && self.read_signature()? {
                return Ok(true);
            }
        }

        self.state.direction &= !self.map.rdy_led;
        self.state.aux_direction &= !self.map.rdy_led_aux;
        self.apply_directions()?;
        Ok(false)
    }

    /// A period given for the session wins over the part's own.
    fn bit_clock_period(&self, part: &Part) -> f64 {
        if self.config.bitclock > 0.0 {
            self.config.bitclock
        } else {
            part.bitclock.unwrap_or(0.0)
        }
    }

    /// Sends program enable until the target echoes it back in sync.
    fn probe(&mut self, probes: &mut usize) -> Result<bool> {
        for _ in 0..PROBES_PER_ATTEMPT {
            *probes += 1;
            let res = self.cmd(PROGRAM_ENABLE)?;
            self.delay(SETTLE_US)?;
            if res[2] == PROGRAM_ENABLE_ECHO {
                return Ok(true);
            }
            // one extra clock slips the target's bit framing
            self.pulse_sck()?;
            self.delay(SETTLE_US)?;
        }
        Ok(false)
    }

    fn read_signature(&mut self) -> Result<bool> {
        for index in 0..3u8 {
            let res = self.cmd([READ_SIGNATURE, 0x00, index, 0x00])?;
            self.delay(SETTLE_US)?;
            self.signature[usize::from(index)] = res[3];
        }
        if self.signature[0] != SIGNATURE_VENDOR {
            log::debug!("implausible signature {}", hex::encode(self.signature));
            return Ok(false);
        }
        Ok(true)
    }

    /// Erases flash and eeprom, then enables programming again.
    pub fn chip_erase(&mut self, part: &Part) -> Result<()> {
        let op = part.chip_erase.as_ref().ok_or_else(|| Error::MissingOpcode {
            op: "chip erase",
            part: part.name.clone(),
        })?;
        self.cmd(op.encode(0, 0))?;
        self.delay(part.chip_erase_delay)?;
        self.initialize(part)
    }
}
