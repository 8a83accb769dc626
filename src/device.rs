//! AVR part definitions: memories, instruction templates and timing.
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::Opcode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Flash,
    Eeprom,
    #[serde(other)]
    Other,
}

/// One addressable memory of a part
#[derive(Debug, Clone, Deserialize)]
pub struct Memory {
    pub name: String,
    pub kind: MemoryKind,
    #[serde(default)]
    pub paged: bool,
    #[serde(deserialize_with = "parse_size")]
    pub size: usize,
    #[serde(default = "default_page_size", deserialize_with = "parse_page_size")]
    pub page_size: usize,
    /// Settle time after a write or page commit, in microseconds.
    #[serde(default)]
    pub max_write_delay: u32,

    #[serde(default, deserialize_with = "parse_opcode")]
    pub read: Option<Opcode>,
    #[serde(default, deserialize_with = "parse_opcode")]
    pub read_lo: Option<Opcode>,
    #[serde(default, deserialize_with = "parse_opcode")]
    pub read_hi: Option<Opcode>,
    #[serde(default, deserialize_with = "parse_opcode")]
    pub write: Option<Opcode>,
    #[serde(default, deserialize_with = "parse_opcode")]
    pub loadpage: Option<Opcode>,
    #[serde(default, deserialize_with = "parse_opcode")]
    pub loadpage_lo: Option<Opcode>,
    #[serde(default, deserialize_with = "parse_opcode")]
    pub loadpage_hi: Option<Opcode>,
    #[serde(default, deserialize_with = "parse_opcode")]
    pub writepage: Option<Opcode>,
    #[serde(default, deserialize_with = "parse_opcode")]
    pub load_ext_addr: Option<Opcode>,
}

fn default_page_size() -> usize {
    1
}

impl Memory {
    /// Word addressed memories split every word into low and high byte instructions.
    pub fn is_word_addressed(&self) -> bool {
        self.read_lo.is_some() || self.loadpage_lo.is_some()
    }

    /// Address as encoded into the instruction templates.
    pub fn template_address(&self, addr: usize) -> u32 {
        if self.is_word_addressed() {
            (addr / 2) as u32
        } else {
            addr as u32
        }
    }

    /// Start of the page holding `addr`.
    pub fn page_base(&self, addr: usize) -> usize {
        addr - addr % self.page_size
    }

    pub fn read_op(&self, addr: usize) -> Option<&Opcode> {
        select(&self.read, &self.read_lo, &self.read_hi, addr)
    }

    pub fn loadpage_op(&self, addr: usize) -> Option<&Opcode> {
        select(&self.loadpage, &self.loadpage_lo, &self.loadpage_hi, addr)
    }

    /// Whether writes can be streamed a page at a time.
    pub fn supports_page_stream(&self) -> bool {
        self.paged && self.writepage.is_some() && self.loadpage_op(0).is_some()
    }
}

fn select<'a>(
    single: &'a Option<Opcode>,
    lo: &'a Option<Opcode>,
    hi: &'a Option<Opcode>,
    addr: usize,
) -> Option<&'a Opcode> {
    if lo.is_some() || hi.is_some() {
        if addr & 1 == 1 { hi.as_ref() } else { lo.as_ref() }
    } else {
        single.as_ref()
    }
}

/// Represents an AVR part
#[derive(Debug, Clone, Deserialize)]
pub struct Part {
    /// Short id used on the command line, e.g. `m328p`
    pub id: String,
    pub name: String,
    #[serde(deserialize_with = "parse_signature")]
    pub signature: [u8; 3],
    /// Bit clock period in seconds the part is programmed at, if it needs one.
    #[serde(default)]
    pub bitclock: Option<f64>,
    #[serde(default, deserialize_with = "parse_opcode")]
    pub chip_erase: Option<Opcode>,
    /// Microseconds.
    #[serde(default)]
    pub chip_erase_delay: u32,
    pub memories: Vec<Memory>,
}

impl ::std::fmt::Display for Part {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}({})", self.name, hex::encode(self.signature))
    }
}

impl Part {
    pub fn memory(&self, name: &str) -> Result<&Memory> {
        self.memories
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Part(format!("{} has no memory named \"{}\"", self.name, name)))
    }
}

pub struct PartDB {
    parts: Vec<Part>,
}

impl PartDB {
    pub fn load() -> Result<Self> {
        Self::from_sources(&[
            include_str!("../parts/attiny85.yaml"),
            include_str!("../parts/atmega328p.yaml"),
            include_str!("../parts/atmega2560.yaml"),
        ])
    }

    /// Builds the database from YAML part descriptions, one part each.
    pub fn from_sources(sources: &[&str]) -> Result<Self> {
        let parts = sources
            .iter()
            .map(|src| serde_yaml::from_str(src).map_err(|e| Error::Part(e.to_string())))
            .collect::<Result<Vec<Part>>>()?;
        Ok(PartDB { parts })
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn find(&self, id: &str) -> Result<Part> {
        self.parts
            .iter()
            .find(|p| p.id.eq_ignore_ascii_case(id) || p.name.eq_ignore_ascii_case(id))
            .cloned()
            .ok_or_else(|| Error::Part(format!("unknown part \"{}\"", id)))
    }

    pub fn find_by_signature(&self, signature: [u8; 3]) -> Option<&Part> {
        self.parts.iter().find(|p| p.signature == signature)
    }
}

fn parse_opcode<'de, D>(deserializer: D) -> std::result::Result<Option<Opcode>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let template: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    template
        .map(|s| s.parse().map_err(serde::de::Error::custom))
        .transpose()
}

fn parse_signature<'de, D>(deserializer: D) -> std::result::Result<[u8; 3], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let raw = hex::decode(s.trim_start_matches("0x").replace(' ', ""))
        .map_err(serde::de::Error::custom)?;
    raw.try_into()
        .map_err(|_| serde::de::Error::custom(format!("signature must be 3 bytes: {:?}", s)))
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let invalid = |_| serde::de::Error::custom(format!("error while parsing {:?}", s));
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).map_err(invalid)
    } else if let Some(kib) = s.strip_suffix("KiB").or_else(|| s.strip_suffix('K')) {
        kib.parse::<usize>().map(|n| n * 1024).map_err(invalid)
    } else {
        s.parse().map_err(invalid)
    }
}

fn parse_page_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let n: usize = serde::Deserialize::deserialize(deserializer)?;
    if n == 0 {
        return Err(serde::de::Error::custom("page size must be at least 1"));
    }
    Ok(n)
}
