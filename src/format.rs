//! Memory image file formats
use std::path::Path;
use std::str;

use anyhow::Result;

/// Erased flash/eeprom content, used to fill gaps in sparse images.
const ERASED: u8 = 0xff;
/// Data bytes per Intel HEX record written.
const IHEX_RECORD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    Binary,
}

/// Reads an image file into a buffer starting at address 0.
pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::PlainHex => read_hex(str::from_utf8(&raw)?),
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::Binary => Ok(raw),
    }
}

/// Writes `data` as an image file, in the format implied by the extension.
pub fn write_firmware_to_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let p = path.as_ref();
    let format = guess_format(p, &[]);
    log::info!("Write {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::IntelHex => std::fs::write(p, write_ihex(data)?)?,
        FirmwareFormat::PlainHex => std::fs::write(p, hex::encode(data) + "\n")?,
        FirmwareFormat::Binary => std::fs::write(p, data)?,
    }
    Ok(())
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90", "eep"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }
    if ext == "txt" {
        return FirmwareFormat::PlainHex;
    }
    if raw.is_empty() {
        return FirmwareFormat::Binary;
    }

    if raw[0] == b':'
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else if raw.iter().all(|&c| c.is_ascii_hexdigit() || c.is_ascii_whitespace()) {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_hex(data: &str) -> Result<Vec<u8>> {
    let digits: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(hex::decode(digits)?)
}

/// Reads Intel HEX into an image from address 0, gaps left erased.
pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0;
    let mut image = Vec::new();
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let start = (base_address + u32::from(offset)) as usize;
                let end = start + value.len();
                if image.len() < end {
                    image.resize(end, ERASED);
                }
                image[start..end].copy_from_slice(&value);
            }
            EndOfFile => break,
            ExtendedSegmentAddress(address) => {
                base_address = u32::from(address) * 16;
            }
            ExtendedLinearAddress(address) => {
                base_address = u32::from(address) << 16;
            }
            StartSegmentAddress { .. } | StartLinearAddress(_) => (),
        };
    }
    anyhow::ensure!(!image.is_empty(), "no data records in Intel HEX file");
    Ok(image)
}

pub fn write_ihex(data: &[u8]) -> Result<String> {
    use ihex::Record;

    let mut records = vec![];
    let mut segment = 0;
    for (i, chunk) in data.chunks(IHEX_RECORD_LEN).enumerate() {
        let address = i * IHEX_RECORD_LEN;
        let upper = (address >> 16) as u16;
        if upper != segment {
            records.push(Record::ExtendedLinearAddress(upper));
            segment = upper;
        }
        records.push(Record::Data {
            offset: address as u16,
            value: chunk.to_vec(),
        });
    }
    records.push(Record::EndOfFile);
    Ok(ihex::create_object_file_representation(&records)?)
}

/// Drops trailing erased bytes, nothing to program there.
pub fn trim_erased(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != ERASED).map_or(0, |i| i + 1);
    &data[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_format() {
        assert_eq!(guess_format(Path::new("a.hex"), b"xx"), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(Path::new("a.bin"), b":0000"), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(Path::new("a"), b"0c94\n3400\n"), FirmwareFormat::PlainHex);
        assert_eq!(guess_format(Path::new("a.bin"), &[0x0c, 0x94]), FirmwareFormat::Binary);
        assert_eq!(guess_format(Path::new("a.bin"), &[]), FirmwareFormat::Binary);
    }

    #[test]
    fn test_read_hex() {
        assert_eq!(read_hex("0c94 3400\r\n").unwrap(), vec![0x0c, 0x94, 0x34, 0x00]);
        assert!(read_hex("0c9").is_err());
    }

    #[test]
    fn test_read_ihex_fills_gaps() {
        let text = ":020000000C945E\n:02000400FFCF2C\n:00000001FF\n";
        let image = read_ihex(text).unwrap();
        assert_eq!(image, vec![0x0c, 0x94, 0xff, 0xff, 0xff, 0xcf]);
    }

    #[test]
    fn test_ihex_extended_address() {
        let data: Vec<u8> = (0..0x10010).map(|i| i as u8).collect();
        let text = write_ihex(&data).unwrap();
        assert!(text.contains(":020000040001F9"));
        assert!(text.ends_with(":00000001FF\n") || text.ends_with(":00000001FF"));
        assert_eq!(read_ihex(&text).unwrap(), data);
    }

    #[test]
    fn test_trim_erased() {
        assert_eq!(trim_erased(&[1, 0xff, 2, 0xff, 0xff]), &[1, 0xff, 2]);
        assert!(trim_erased(&[0xff; 4]).is_empty());
    }
}
