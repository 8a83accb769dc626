//! AVR serial programming instruction templates.
//!
//! An instruction is 32 bits, written MSB first as whitespace separated
//! tokens: `1`/`0` fixed bits, `x` don't care, `aN` address bit N, `i` data
//! input bit and `o` data output bit. Input and output bits take their
//! number from the position inside their byte.

use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Bit {
    Ignore,
    Value(bool),
    Address(u8),
    Input,
    Output,
}

/// A parsed instruction template
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Opcode {
    /// Index 0 is the LSB of the last instruction byte.
    bits: [Bit; 32],
}

impl Opcode {
    /// Builds the instruction for `address` and `input`.
    pub fn encode(&self, address: u32, input: u8) -> [u8; 4] {
        let mut cmd = [0u8; 4];
        for (i, bit) in self.bits.iter().enumerate() {
            let level = match *bit {
                Bit::Ignore | Bit::Output => false,
                Bit::Value(level) => level,
                Bit::Address(n) => (address >> n) & 1 != 0,
                Bit::Input => (input >> (i % 8)) & 1 != 0,
            };
            if level {
                cmd[3 - i / 8] |= 1 << (i % 8);
            }
        }
        cmd
    }

    /// Collects the output bits of a response.
    pub fn output(&self, res: &[u8; 4]) -> u8 {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, bit)| **bit == Bit::Output)
            .filter(|(i, _)| res[3 - i / 8] & (1 << (i % 8)) != 0)
            .fold(0u8, |acc, (i, _)| acc | 1 << (i % 8))
    }
}

impl FromStr for Opcode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        if tokens.len() != 32 {
            return Err(Error::Part(format!(
                "instruction template needs 32 bits, got {}: \"{}\"",
                tokens.len(),
                s
            )));
        }
        let mut bits = [Bit::Ignore; 32];
        for (token, bit) in tokens.iter().zip(bits.iter_mut().rev()) {
            *bit = match *token {
                "0" => Bit::Value(false),
                "1" => Bit::Value(true),
                "x" => Bit::Ignore,
                "i" => Bit::Input,
                "o" => Bit::Output,
                a if a.starts_with('a') => match a[1..].parse::<u8>() {
                    Ok(n) if n < 32 => Bit::Address(n),
                    _ => return Err(Error::Part(format!("bad address bit \"{}\"", a))),
                },
                other => return Err(Error::Part(format!("bad template bit \"{}\"", other))),
            };
        }
        Ok(Opcode { bits })
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<String> = self
            .bits
            .iter()
            .rev()
            .map(|bit| match bit {
                Bit::Ignore => "x".to_string(),
                Bit::Value(level) => u8::from(*level).to_string(),
                Bit::Address(n) => format!("a{}", n),
                Bit::Input => "i".to_string(),
                Bit::Output => "o".to_string(),
            })
            .collect();
        write!(f, "Opcode[{}]", tokens.join(" "))
    }
}
