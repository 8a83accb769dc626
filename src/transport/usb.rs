//! FTDI chips over USB through libftdi.
//!
//! Devices are enumerated with libusb so they can be picked by position,
//! description or serial number; the chip itself is driven by the `ftdi`
//! crate, which owns the divisor encoding and the modem status bytes.
use std::{
    fmt,
    io::{Read, Write},
    str::FromStr,
};

use anyhow::Result;
use ftdi::{BitMode, Interface};
use rusb::{Context, Device, DeviceDescriptor, UsbContext};

use super::Transport;

const FTDI_VID: u16 = 0x0403;
/// FT232R/FT245R, FT2232, FT4232H, FT232H, FT-X.
const FTDI_PIDS: [u16; 5] = [0x6001, 0x6010, 0x6011, 0x6014, 0x6015];

/// bcdDevice major of the FT2232H; later chips count up from it.
const HIGH_SPEED_MAJOR: u8 = 7;
/// Latency restored when the chip is handed back.
const DEFAULT_LATENCY_MS: u8 = 16;

/// Which FTDI device to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelector {
    /// `ft0` .. `ft9`: the Nth FTDI device on the bus.
    Index(usize),
    /// USB product description, or else serial number.
    Name(String),
}

impl FromStr for PortSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() == 3 && s[..2].eq_ignore_ascii_case("ft") && bytes[2].is_ascii_digit() {
            Ok(PortSelector::Index(usize::from(bytes[2] - b'0')))
        } else {
            Ok(PortSelector::Name(s.to_string()))
        }
    }
}

impl fmt::Display for PortSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSelector::Index(n) => write!(f, "ft{}", n),
            PortSelector::Name(name) => write!(f, "{}", name),
        }
    }
}

pub struct FtdiTransport {
    device: ftdi::Device,
    high_speed: bool,
}

impl FtdiTransport {
    pub fn scan_devices() -> Result<usize> {
        let context = Context::new()?;
        let n = ftdi_devices(&context)?
            .into_iter()
            .enumerate()
            .map(|(i, device)| {
                log::debug!("Found FTDI USB device #{}: [{:?}]", i, device);
            })
            .count();
        Ok(n)
    }

    pub fn open(port: &PortSelector, latency_ms: u8) -> Result<FtdiTransport> {
        let context = Context::new()?;
        let devices = ftdi_devices(&context)?;

        let position = match port {
            PortSelector::Index(nth) => {
                anyhow::ensure!(
                    *nth < devices.len(),
                    "No FTDI device found at index #{} (use ft0 - ft9)",
                    nth
                );
                *nth
            }
            PortSelector::Name(name) => find_by_name(&devices, name)?,
        };
        let usb_device = &devices[position];
        let descriptor = usb_device.device_descriptor()?;
        let ids = (descriptor.vendor_id(), descriptor.product_id());
        log::debug!("Found USB Device {:?}", usb_device);

        // libftdi opens the first chip with matching ids
        let shadowed = devices[..position]
            .iter()
            .filter_map(|device| device.device_descriptor().ok())
            .any(|desc| (desc.vendor_id(), desc.product_id()) == ids);
        anyhow::ensure!(
            !shadowed,
            "{} shares USB id {:04x}:{:04x} with an earlier device, unplug that one first",
            port,
            ids.0,
            ids.1
        );

        // bcdDevice 0x0700 FT2232H, 0x0800 FT4232H, 0x0900 FT232H, 0x1000 FT-X
        let high_speed = descriptor.device_version().major() >= HIGH_SPEED_MAJOR;

        let mut device = ftdi::find_by_vid_pid(ids.0, ids.1)
            .interface(Interface::A)
            .open()?;
        device.usb_reset()?;
        let latency = if latency_ms > 1 { latency_ms } else { 2 };
        device.set_latency_timer(latency)?;
        device
            .set_bitmode(0, BitMode::SyncBB)
            .map_err(|e| anyhow::format_err!("synchronous bit-bang mode is not supported: {}", e))?;
        log::debug!(
            "bit-bang OK ({} speed, latency {}ms)",
            if high_speed { "high" } else { "full" },
            latency
        );
        Ok(FtdiTransport { device, high_speed })
    }
}

impl Drop for FtdiTransport {
    fn drop(&mut self) {
        if let Err(e) = self.device.set_latency_timer(DEFAULT_LATENCY_MS) {
            log::debug!("latency not restored: {}", e);
        }
    }
}

impl Transport for FtdiTransport {
    fn send(&mut self, frames: &[u8]) -> Result<()> {
        self.device.write_all(frames)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.device.read(buf)?)
    }

    fn purge(&mut self) -> Result<()> {
        self.device.usb_purge_buffers()?;
        Ok(())
    }

    /// libftdi scales the rate for bit-bang and picks the chip's clock base.
    fn set_rate(&mut self, rate: u32) -> Result<()> {
        anyhow::ensure!(rate > 0, "baud rate must not be zero");
        self.device.set_baud_rate(rate)?;
        Ok(())
    }

    fn set_output_mode(&mut self, direction: u8) -> Result<()> {
        self.device.set_bitmode(direction, BitMode::SyncBB)?;
        Ok(())
    }

    fn set_aux_mode(&mut self, bits: u8) -> Result<()> {
        self.device.set_bitmode(bits, BitMode::CBus)?;
        Ok(())
    }

    fn reset_mode(&mut self) -> Result<()> {
        self.device.set_bitmode(0, BitMode::Reset)?;
        Ok(())
    }

    fn is_high_speed(&self) -> bool {
        self.high_speed
    }
}

fn ftdi_devices(context: &Context) -> Result<Vec<Device<Context>>> {
    Ok(context
        .devices()?
        .iter()
        .filter(|device| device.device_descriptor().is_ok_and(|desc| is_ftdi(&desc)))
        .collect())
}

fn is_ftdi(desc: &DeviceDescriptor) -> bool {
    desc.vendor_id() == FTDI_VID && FTDI_PIDS.contains(&desc.product_id())
}

/// Position of the device whose description, or else serial number, is `name`.
fn find_by_name(devices: &[Device<Context>], name: &str) -> Result<usize> {
    let mut strings = Vec::new();
    for device in devices {
        let desc = device.device_descriptor()?;
        match device.open() {
            Ok(handle) => strings.push((
                handle.read_product_string_ascii(&desc).ok(),
                handle.read_serial_number_string_ascii(&desc).ok(),
            )),
            Err(e) => {
                log::debug!("skipping {:?}: {}", device, e);
                strings.push((None, None));
            }
        }
    }
    strings
        .iter()
        .position(|(product, _)| product.as_deref() == Some(name))
        .or_else(|| {
            strings
                .iter()
                .position(|(_, serial)| serial.as_deref() == Some(name))
        })
        .ok_or_else(|| anyhow::format_err!("invalid port name {}: use ft0 - ft9", name))
}
