//! Abstract bit-bang transport interface.
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::constants::RECV_TIMEOUT;

pub use self::usb::{FtdiTransport, PortSelector};

#[cfg(test)]
pub(crate) mod sim;
mod usb;

/// A byte-stream chip in synchronous bit-bang mode: every byte written is
/// put on the IO port as one frame, and one sampled byte is queued for
/// reading in return.
pub trait Transport {
    /// Queue all `frames` for output.
    fn send(&mut self, frames: &[u8]) -> Result<()>;
    /// Read whatever sampled bytes are available, up to `buf.len()`.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Discard anything buffered in either direction.
    fn purge(&mut self) -> Result<()>;
    /// Set the frame rate, as a baud rate.
    fn set_rate(&mut self, rate: u32) -> Result<()>;
    /// Enter synchronous bit-bang with the given direction byte.
    fn set_output_mode(&mut self, direction: u8) -> Result<()>;
    /// Drive the auxiliary nibble: direction in the high nibble, levels in the low one.
    fn set_aux_mode(&mut self, bits: u8) -> Result<()>;
    /// Leave bit-bang mode, all pins float.
    fn reset_mode(&mut self) -> Result<()>;
    /// Whether the chip supports the high-speed rate table.
    fn is_high_speed(&self) -> bool;

    /// How long [`Transport::recv_exact`] waits without progress.
    fn recv_timeout(&self) -> Duration {
        RECV_TIMEOUT
    }

    /// Fill `buf` completely, retrying short reads.
    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        let mut progress = Instant::now();
        while filled < buf.len() {
            let n = self.recv(&mut buf[filled..])?;
            if n > 0 {
                filled += n;
                progress = Instant::now();
                continue;
            }
            anyhow::ensure!(
                progress.elapsed() < self.recv_timeout(),
                "no data for {:?} ({} of {} bytes)",
                self.recv_timeout(),
                filled,
                buf.len()
            );
        }
        Ok(())
    }

    /// Send `frames` and replace them with the sampled echo.
    fn exchange(&mut self, frames: &mut [u8]) -> Result<()> {
        self.send(frames)?;
        self.recv_exact(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out `available` bytes one at a time, then nothing.
    struct Trickle {
        available: usize,
    }

    impl Transport for Trickle {
        fn send(&mut self, _frames: &[u8]) -> Result<()> {
            Ok(())
        }
        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.available == 0 || buf.is_empty() {
                return Ok(0);
            }
            self.available -= 1;
            buf[0] = 0xa5;
            Ok(1)
        }
        fn purge(&mut self) -> Result<()> {
            Ok(())
        }
        fn set_rate(&mut self, _rate: u32) -> Result<()> {
            Ok(())
        }
        fn set_output_mode(&mut self, _direction: u8) -> Result<()> {
            Ok(())
        }
        fn set_aux_mode(&mut self, _bits: u8) -> Result<()> {
            Ok(())
        }
        fn reset_mode(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_high_speed(&self) -> bool {
            false
        }
        fn recv_timeout(&self) -> Duration {
            Duration::from_millis(50)
        }
    }

    #[test]
    fn test_recv_exact_short_reads() {
        let mut transport = Trickle { available: 8 };
        let mut buf = [0u8; 8];
        transport.recv_exact(&mut buf).unwrap();
        assert_eq!(buf, [0xa5; 8]);
    }

    #[test]
    fn test_recv_exact_gives_up_on_stall() {
        let mut transport = Trickle { available: 3 };
        let mut buf = [0u8; 8];
        let started = Instant::now();
        let err = transport.recv_exact(&mut buf).unwrap_err();
        assert!(err.to_string().contains("3 of 8 bytes"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
