//! Timing and framing constants of the bit-bang ISP bus.
//!
//! The fragment sizes and the delay scaling are tuned against real FT232R /
//! FT2232H hardware and must not be recomputed.

use std::time::Duration;

/// Transport cycles spent on every SPI bit: data setup, then clock high.
pub const CYCLES_PER_BIT: usize = 2;
/// Frames carrying one byte on the wire.
pub const FRAMES_PER_BYTE: usize = 8 * CYCLES_PER_BIT;
/// Frames carrying one 4-byte ISP instruction.
pub const FRAMES_PER_COMMAND: usize = 4 * FRAMES_PER_BYTE;

/// Largest single write on FT2232H class chips.
pub const FRAGMENT_SIZE_HIGH_SPEED: usize = 62 * 64;
/// Largest single write on FT232R / FT245R class chips.
pub const FRAGMENT_SIZE_STANDARD: usize = 62 * 4;

/// Sent-but-unreceived batches allowed before one response is drained.
pub const MAX_OUTSTANDING: usize = 10;

/// Numerator/denominator of the frames-per-microsecond delay scaling.
pub const DELAY_SCALE_NUM: f64 = 16.0;
pub const DELAY_SCALE_DEN: f64 = 3.0;

/// Rate used while pulsing RESET, 2400Hz, about 0.156ms per frame.
pub const RESET_PULSE_RATE: u32 = 1200;
pub const MIN_RESET_PULSE: usize = 1;
pub const MAX_RESET_PULSE: usize = 55;
/// Width used by the handshake, 8 * 0.156ms.
pub const HANDSHAKE_RESET_PULSE: usize = 8;

pub const PROBES_PER_ATTEMPT: usize = 32;
pub const ATTEMPTS_PER_MODE: usize = 5;

/// Time without a single sampled byte before the programmer is declared dead.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub mod timing {
    /// Wait before pulsing RESET.
    pub const PRE_RESET_US: u32 = 5_000;
    /// Settle time after RESET, after every probe and every signature read.
    pub const SETTLE_US: u32 = 20_000;
}

pub mod commands {
    pub const PROGRAM_ENABLE: [u8; 4] = [0xac, 0x53, 0x00, 0x00];
    /// Echoed in the third response byte once the target is in sync.
    pub const PROGRAM_ENABLE_ECHO: u8 = 0x53;
    pub const READ_SIGNATURE: u8 = 0x30;
    /// First signature byte of every Atmel/Microchip AVR.
    pub const SIGNATURE_VENDOR: u8 = 0x1e;
}
