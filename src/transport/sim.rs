//! In-memory transport playing an AVR target on the other end of the wire.
use std::collections::VecDeque;

use anyhow::Result;

use super::Transport;
use crate::codec::decode_sent_byte;
use crate::constants::FRAMES_PER_COMMAND;
use crate::pins::SignalMap;

/// When the target acknowledges programming enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accept {
    Never,
    Always,
    /// Only once RESET has been pulsed.
    AfterReset,
}

/// SPI side of an AVR in serial programming mode.
///
/// Bytes are echoed one position late, the fourth byte carries read data,
/// and instructions execute when their 32nd bit arrives.
pub(crate) struct AvrTarget {
    pub(crate) signature: [u8; 3],
    pub(crate) flash: Vec<u8>,
    pub(crate) eeprom: Vec<u8>,
    flash_page: usize,
    eeprom_page: usize,
    flash_buffer: Vec<u8>,
    eeprom_buffer: Vec<u8>,
    ext: usize,
    pub(crate) accept: Accept,
    pub(crate) enabled: bool,
    reset_seen: bool,
    bits: usize,
    rx: [u8; 4],
    tx: u8,
    pub(crate) commits: Vec<usize>,
    pub(crate) eeprom_commits: Vec<usize>,
    pub(crate) eeprom_writes: usize,
    pub(crate) ext_loads: Vec<u8>,
    pub(crate) erases: usize,
    pub(crate) enables: usize,
}

impl AvrTarget {
    pub(crate) fn new(signature: [u8; 3], flash: (usize, usize), eeprom: (usize, usize)) -> Self {
        AvrTarget {
            signature,
            flash: vec![0xff; flash.0],
            eeprom: vec![0xff; eeprom.0],
            flash_page: flash.1,
            eeprom_page: eeprom.1,
            flash_buffer: vec![0xff; flash.1],
            eeprom_buffer: vec![0xff; eeprom.1],
            ext: 0,
            accept: Accept::Always,
            enabled: false,
            reset_seen: false,
            bits: 0,
            rx: [0; 4],
            tx: 0,
            commits: Vec::new(),
            eeprom_commits: Vec::new(),
            eeprom_writes: 0,
            ext_loads: Vec::new(),
            erases: 0,
            enables: 0,
        }
    }

    /// ATtiny85 geometry.
    pub(crate) fn tiny85() -> Self {
        AvrTarget::new([0x1e, 0x93, 0x0b], (8192, 64), (512, 4))
    }

    pub(crate) fn accept(mut self, accept: Accept) -> Self {
        self.accept = accept;
        self
    }

    /// Start `bits` into an instruction, as if clock edges had been missed.
    pub(crate) fn skew(mut self, bits: usize) -> Self {
        self.bits = bits % 32;
        self
    }

    fn reset(&mut self) {
        self.bits = 0;
        self.rx = [0; 4];
        self.tx = 0;
        self.enabled = false;
        self.reset_seen = true;
    }

    fn miso(&self) -> bool {
        self.tx & 0x80 != 0
    }

    fn accepts(&self) -> bool {
        match self.accept {
            Accept::Never => false,
            Accept::Always => true,
            Accept::AfterReset => self.reset_seen,
        }
    }

    fn clock(&mut self, mosi: bool) {
        let byte = self.bits / 8;
        self.rx[byte] = self.rx[byte] << 1 | u8::from(mosi);
        self.tx <<= 1;
        self.bits += 1;
        if self.bits % 8 != 0 {
            return;
        }
        match self.bits / 8 {
            1 => self.tx = if self.enabled { self.rx[0] } else { 0 },
            2 => {
                if self.rx[0] == 0xac && self.rx[1] == 0x53 && self.accepts() {
                    self.enabled = true;
                    self.enables += 1;
                }
                self.tx = if self.enabled { self.rx[1] } else { 0 };
            }
            3 => self.tx = if self.enabled { self.output() } else { 0 },
            _ => {
                if self.enabled {
                    self.execute();
                }
                self.bits = 0;
                self.rx = [0; 4];
                self.tx = 0;
            }
        }
    }

    fn address(&self) -> usize {
        usize::from(self.rx[1]) << 8 | usize::from(self.rx[2])
    }

    fn output(&self) -> u8 {
        let rx = self.rx;
        match rx[0] {
            0x30 => self.signature.get(usize::from(rx[2])).copied().unwrap_or(0),
            0x20 | 0x28 => {
                let addr = ((self.ext << 16) | self.address()) * 2 + usize::from(rx[0] == 0x28);
                self.flash.get(addr).copied().unwrap_or(0xff)
            }
            0xa0 => self.eeprom.get(self.address()).copied().unwrap_or(0xff),
            _ => 0,
        }
    }

    fn execute(&mut self) {
        let rx = self.rx;
        let addr = self.address();
        match rx[0] {
            0xac if rx[1] & 0xe0 == 0x80 => {
                self.flash.fill(0xff);
                self.eeprom.fill(0xff);
                self.erases += 1;
            }
            0x4d => {
                self.ext = usize::from(rx[2]);
                self.ext_loads.push(rx[2]);
            }
            0x40 | 0x48 => {
                let offset = (addr * 2 + usize::from(rx[0] == 0x48)) % self.flash_page;
                self.flash_buffer[offset] = rx[3];
            }
            0x4c => {
                let base = ((self.ext << 16) | addr) * 2;
                let base = base - base % self.flash_page;
                if let Some(page) = self.flash.get_mut(base..base + self.flash_page) {
                    page.copy_from_slice(&self.flash_buffer);
                }
                self.flash_buffer.fill(0xff);
                self.commits.push(base);
            }
            0xc0 => {
                if let Some(cell) = self.eeprom.get_mut(addr) {
                    *cell = rx[3];
                }
                self.eeprom_writes += 1;
            }
            0xc1 => self.eeprom_buffer[addr % self.eeprom_page] = rx[3],
            0xc2 => {
                let base = addr - addr % self.eeprom_page;
                if let Some(page) = self.eeprom.get_mut(base..base + self.eeprom_page) {
                    page.copy_from_slice(&self.eeprom_buffer);
                }
                self.eeprom_buffer.fill(0xff);
                self.eeprom_commits.push(base);
            }
            _ => {}
        }
    }
}

pub(crate) struct SimTransport {
    map: SignalMap,
    high_speed: bool,
    pub(crate) target: Option<AvrTarget>,
    level: u8,
    replies: VecDeque<u8>,
    /// Largest read handed out at once, to exercise short reads.
    max_read: usize,
    pub(crate) sent: Vec<Vec<u8>>,
    pub(crate) rates: Vec<u32>,
    pub(crate) directions: Vec<u8>,
    pub(crate) aux_modes: Vec<u8>,
    pub(crate) purges: usize,
    pub(crate) mode_resets: usize,
    pub(crate) fail_send: bool,
}

impl SimTransport {
    pub(crate) fn new(map: SignalMap, target: Option<AvrTarget>) -> Self {
        SimTransport {
            map,
            high_speed: false,
            target,
            level: 0,
            replies: VecDeque::new(),
            max_read: 509,
            sent: Vec::new(),
            rates: Vec::new(),
            directions: Vec::new(),
            aux_modes: Vec::new(),
            purges: 0,
            mode_resets: 0,
            fail_send: false,
        }
    }

    pub(crate) fn high_speed(mut self) -> Self {
        self.high_speed = true;
        self
    }

    pub(crate) fn target(&self) -> &AvrTarget {
        self.target.as_ref().expect("no target attached")
    }

    pub(crate) fn unread(&self) -> usize {
        self.replies.len()
    }

    /// Program enable instructions put on the wire.
    pub(crate) fn probes(&self) -> usize {
        self.sent
            .iter()
            .filter(|frames| frames.len() == FRAMES_PER_COMMAND + 2)
            .filter(|frames| {
                decode_sent_byte(&self.map, &frames[1..], 0) == 0xac
                    && decode_sent_byte(&self.map, &frames[1..], 1) == 0x53
            })
            .count()
    }

    fn apply(&mut self, frame: u8) {
        if let Some(target) = self.target.as_mut() {
            if frame & self.map.reset != 0 {
                target.reset();
            } else if self.level & self.map.sck == 0 && frame & self.map.sck != 0 {
                target.clock(frame & self.map.mosi != 0);
            }
        }
        self.level = frame;
    }
}

impl Transport for SimTransport {
    fn send(&mut self, frames: &[u8]) -> Result<()> {
        anyhow::ensure!(!self.fail_send, "USB write failed");
        for &frame in frames {
            let miso = self.target.as_ref().is_some_and(AvrTarget::miso);
            let sampled = (self.level & !self.map.miso) | if miso { self.map.miso } else { 0 };
            self.replies.push_back(sampled);
            self.apply(frame);
        }
        self.sent.push(frames.to_vec());
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.replies.len()).min(self.max_read);
        for (dst, src) in buf.iter_mut().zip(self.replies.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn purge(&mut self) -> Result<()> {
        self.replies.clear();
        self.purges += 1;
        Ok(())
    }

    fn set_rate(&mut self, rate: u32) -> Result<()> {
        self.rates.push(rate);
        Ok(())
    }

    fn set_output_mode(&mut self, direction: u8) -> Result<()> {
        self.directions.push(direction);
        Ok(())
    }

    fn set_aux_mode(&mut self, bits: u8) -> Result<()> {
        self.aux_modes.push(bits);
        Ok(())
    }

    fn reset_mode(&mut self) -> Result<()> {
        self.mode_resets += 1;
        Ok(())
    }

    fn is_high_speed(&self) -> bool {
        self.high_speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pins::PinAssignment;

    #[test]
    fn test_recv_exact_retries_short_reads() {
        let map = SignalMap::configure(&PinAssignment::default()).unwrap();
        let mut sim = SimTransport::new(map, None);
        let mut frames = vec![0x01u8; 2000];
        sim.exchange(&mut frames).unwrap();
        assert_eq!(sim.unread(), 0);
        assert_eq!(frames[0], 0x00);
        assert!(frames[1..].iter().all(|&f| f == 0x01));
    }

    #[test]
    fn test_recv_exact_gives_up() {
        let map = SignalMap::configure(&PinAssignment::default()).unwrap();
        let mut sim = SimTransport::new(map, None);
        let mut buf = [0u8; 4];
        assert!(sim.recv_exact(&mut buf).is_err());
    }
}
