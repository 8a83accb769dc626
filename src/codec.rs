//! Bit-level encoding of SPI bytes into bit-bang frames.
//!
//! Every bit takes two frames (SPI mode 0): the first presents MOSI with SCK
//! low, the second raises SCK. In synchronous bit-bang mode the chip answers
//! each written frame with the pin levels sampled just before it was
//! applied, so the reply to the second frame of a pair holds the MISO level
//! the target presented for that bit.

use crate::constants::{CYCLES_PER_BIT, FRAMES_PER_BYTE};
use crate::pins::{OutputState, SignalMap};

/// Appends the 16 frames of `value`, MSB first.
///
/// The MOSI level of the last bit stays in `state`, SCK is never latched.
pub fn encode_byte(map: &SignalMap, state: &mut OutputState, value: u8, frames: &mut Vec<u8>) {
    for bit in (0..8).rev() {
        if value & (1 << bit) != 0 {
            state.data |= map.mosi;
        } else {
            state.data &= !map.mosi;
        }
        frames.push(state.data);
        frames.push(state.data | map.sck);
    }
}

/// Appends the 64 frames of one 4-byte ISP instruction.
pub fn encode_command(
    map: &SignalMap,
    state: &mut OutputState,
    command: &[u8; 4],
    frames: &mut Vec<u8>,
) {
    for &byte in command {
        encode_byte(map, state, byte, frames);
    }
}

/// Reconstructs the byte the target shifted out at byte position `offset`.
pub fn decode_byte(map: &SignalMap, frames: &[u8], offset: usize) -> u8 {
    sample(frames, offset, map.miso)
}

/// Reconstructs the byte this side shifted out at byte position `offset`.
///
/// Works on both the sent frames and their echo; used to check what was
/// actually put on the wire.
pub fn decode_sent_byte(map: &SignalMap, frames: &[u8], offset: usize) -> u8 {
    sample(frames, offset, map.mosi)
}

/// Decodes the 4 response bytes of the instruction at position `index`.
pub fn decode_command(map: &SignalMap, frames: &[u8], index: usize) -> [u8; 4] {
    let mut res = [0u8; 4];
    for (i, byte) in res.iter_mut().enumerate() {
        *byte = decode_byte(map, frames, index * 4 + i);
    }
    res
}

fn sample(frames: &[u8], offset: usize, mask: u8) -> u8 {
    let frames = &frames[offset * FRAMES_PER_BYTE..][..FRAMES_PER_BYTE];
    frames
        .iter()
        .skip(1)
        .step_by(CYCLES_PER_BIT)
        .fold(0u8, |acc, &frame| (acc << 1) | u8::from(frame & mask != 0))
}
