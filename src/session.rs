//! One programming session on a bit-bang transport.
//!
//! The session owns the transport, the live pin state and the queue of
//! outstanding bulk requests from open to close. All timing is expressed in
//! frames at the active rate: the chip clocks frames out at a fixed pace, so
//! a run of filler frames is a delay that stays in step with the bus.

use std::collections::VecDeque;

use indicatif::ProgressBar;

use crate::clock::ClockTable;
use crate::codec;
use crate::config::SessionConfig;
use crate::constants::{
    DELAY_SCALE_DEN, DELAY_SCALE_NUM, FRAMES_PER_COMMAND, MAX_OUTSTANDING, MAX_RESET_PULSE,
    MIN_RESET_PULSE, RESET_PULSE_RATE,
};
use crate::error::{Error, Result};
use crate::flashing::PendingRequest;
use crate::handshake::HandshakeState;
use crate::pins::{OutputState, SignalMap};
use crate::transport::Transport;

pub struct Session<T: Transport> {
    pub(crate) transport: T,
    pub(crate) map: SignalMap,
    pub(crate) state: OutputState,
    pub(crate) table: ClockTable,
    /// Rate set by the last clock calibration, also the base of delay arithmetic.
    pub(crate) rate: u32,
    /// Phase of the busy indicator for the next batch.
    pub(crate) blink: bool,
    pub(crate) pending: VecDeque<PendingRequest>,
    /// Bank last selected with an extended address load, unknown after a reset.
    pub(crate) ext_addr: Option<u32>,
    pub(crate) signature: [u8; 3],
    pub(crate) handshake: HandshakeState,
    pub(crate) config: SessionConfig,
    pub(crate) progress: Option<ProgressBar>,
}

impl<T: Transport> Session<T> {
    /// Takes over `transport`: validates the pins, drives SCK, MOSI, RESET
    /// and the indicators as outputs and holds RESET low.
    pub fn open(transport: T, config: SessionConfig) -> Result<Self> {
        let map = SignalMap::configure(&config.pins)?;
        let indicators = map.rdy_led | map.pgm_led;
        let state = OutputState {
            data: indicators,
            direction: map.sck | map.mosi | map.reset | indicators,
            aux_direction: 0,
        };
        let table = ClockTable::detect(transport.is_high_speed());
        log::debug!("{:?} rate table, {} byte fragments", table, table.fragment_size());

        let mut session = Session {
            transport,
            map,
            state,
            table,
            rate: 0,
            blink: true,
            pending: VecDeque::new(),
            ext_addr: None,
            signature: [0; 3],
            handshake: HandshakeState::Idle,
            config,
            progress: None,
        };
        session
            .transport
            .purge()
            .map_err(Error::transport("purge"))?;
        session.set_reset(false)?;
        session.set_output_mode()?;
        session.set_bit_clock(session.config.bitclock)?;
        Ok(session)
    }

    /// Releases the bus according to the exit specification and hands the
    /// transport back.
    pub fn close(mut self) -> Result<T> {
        let map = self.map;
        self.state.direction &= !(map.sck | map.mosi);
        if self.config.exit.release_reset {
            self.state.direction &= !(map.reset | map.rdy_led | map.pgm_led);
            self.state.aux_direction &= !(map.rdy_led_aux | map.pgm_led_aux);
        }
        self.apply_directions()?;
        if self.config.exit.release_reset {
            self.transport
                .reset_mode()
                .map_err(Error::transport("close"))?;
        }
        log::debug!("session closed, direction {:#04x}", self.state.direction);
        Ok(self.transport)
    }

    pub fn signature(&self) -> [u8; 3] {
        self.signature
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn clock_table(&self) -> ClockTable {
        self.table
    }

    pub fn output_state(&self) -> OutputState {
        self.state
    }

    pub fn signal_map(&self) -> &SignalMap {
        &self.map
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Progress bar advanced by bulk transfers.
    pub fn set_progress(&mut self, progress: Option<ProgressBar>) {
        self.progress = progress;
    }

    /// Frames one write may carry.
    pub fn fragment_size(&self) -> usize {
        self.table.fragment_size()
    }

    pub(crate) fn send(&mut self, op: &'static str, frames: &[u8]) -> Result<()> {
        self.transport.send(frames).map_err(Error::transport(op))
    }

    pub(crate) fn recv(&mut self, op: &'static str, buf: &mut [u8]) -> Result<()> {
        self.transport.recv_exact(buf).map_err(Error::transport(op))
    }

    fn exchange(&mut self, op: &'static str, frames: &mut [u8]) -> Result<()> {
        self.transport.exchange(frames).map_err(Error::transport(op))
    }

    /// Flips the busy indicator phase, returning the phase to use now.
    pub(crate) fn next_blink(&mut self) -> bool {
        let on = self.blink;
        self.blink = !on;
        on
    }

    fn set_output_mode(&mut self) -> Result<()> {
        self.transport
            .set_output_mode(self.state.direction)
            .map_err(Error::transport("set_output_mode"))
    }

    /// Pushes the direction bytes to the chip and drives RESET low.
    pub(crate) fn apply_directions(&mut self) -> Result<()> {
        if self.map.has_aux_indicators() {
            let bits = self.state.aux_mode();
            self.transport
                .set_aux_mode(bits)
                .map_err(Error::transport("set_aux_mode"))?;
            log::debug!("set aux port {:#04x}", bits);
        }
        self.set_output_mode()?;
        self.set_reset(false)
    }

    pub fn set_reset(&mut self, level: bool) -> Result<()> {
        let mut frame = [self.state.set_reset(&self.map, level)];
        self.exchange("set_reset", &mut frame)
    }

    /// Calibrates the bus to a bit clock `period` in seconds and applies it.
    pub fn set_bit_clock(&mut self, period: f64) -> Result<u32> {
        let rate = self.table.select(period)?;
        self.transport
            .set_rate(rate)
            .map_err(Error::transport("set_rate"))?;
        log::debug!("bitclk {} -> baud {}", rate * 2, rate);
        self.rate = rate;
        Ok(rate)
    }

    /// Reapplies the calibrated rate after a temporary override.
    pub fn restore_bit_clock(&mut self) -> Result<()> {
        self.transport
            .set_rate(self.rate)
            .map_err(Error::transport("set_rate"))
    }

    /// One extra SCK cycle, shifting the target's bit framing by one.
    pub fn pulse_sck(&mut self) -> Result<()> {
        let mut frames = [self.state.data, self.state.data | self.map.sck];
        self.exchange("pulse_sck", &mut frames)
    }

    /// Holds RESET high for `width` frames at the fixed pulse rate.
    pub fn pulse_reset(&mut self, width: usize) -> Result<()> {
        let clamped = width.clamp(MIN_RESET_PULSE, MAX_RESET_PULSE);
        if clamped != width {
            log::warn!("reset pulse width {} clamped to {}", width, clamped);
        }
        self.transport
            .set_rate(RESET_PULSE_RATE)
            .map_err(Error::transport("set_rate"))?;

        let mut frames = vec![self.state.data | self.map.reset; clamped];
        frames.push(self.state.data);
        self.exchange("pulse_reset", &mut frames)?;
        self.restore_bit_clock()
    }

    /// Waits `us` microseconds by clocking out filler frames.
    ///
    /// Fragments are sent without waiting for their echo; once more than
    /// [`MAX_OUTSTANDING`] are in flight the oldest echo is consumed.
    pub fn delay(&mut self, us: u32) -> Result<()> {
        let mut remaining = delay_frames(us, self.rate);
        let capacity = self.fragment_size();
        let mut outstanding = VecDeque::new();
        let mut frames = Vec::with_capacity(capacity);
        let mut scratch = vec![0u8; capacity];

        while remaining > 0 {
            let len = remaining.min(capacity);
            remaining -= len;

            let busy = self.next_blink();
            frames.clear();
            frames.push(self.state.indicate(&self.map, busy));
            frames.resize(len, self.state.data);
            frames[len - 1] = self.state.indicate(&self.map, false);

            self.send("delay", &frames)?;
            outstanding.push_back(len);
            if outstanding.len() > MAX_OUTSTANDING {
                if let Some(n) = outstanding.pop_front() {
                    self.recv("delay", &mut scratch[..n])?;
                }
            }
        }
        while let Some(n) = outstanding.pop_front() {
            self.recv("delay", &mut scratch[..n])?;
        }
        Ok(())
    }

    /// Runs one 4-byte ISP instruction and returns the target's 4 bytes.
    pub fn cmd(&mut self, command: [u8; 4]) -> Result<[u8; 4]> {
        let mut frames = Vec::with_capacity(FRAMES_PER_COMMAND + 2);
        frames.push(self.state.indicate(&self.map, true));
        codec::encode_command(&self.map, &mut self.state, &command, &mut frames);
        frames.push(self.state.indicate(&self.map, false));

        self.exchange("cmd", &mut frames)?;
        let res = codec::decode_command(&self.map, &frames[1..], 0);
        log::trace!("cmd {} -> {}", hex::encode(command), hex::encode(res));
        Ok(res)
    }
}

/// Filler frames needed for `us` microseconds at `rate`, at least one.
pub fn delay_frames(us: u32, rate: u32) -> usize {
    let frames = f64::from(us) * f64::from(rate) * DELAY_SCALE_NUM / DELAY_SCALE_DEN / 1_000_000.0;
    (frames.ceil() as usize).max(1)
}
