//! Paged memory transfers.
//!
//! Flash and eeprom are streamed in fragments sized to the chip queue. Each
//! fragment is sent without waiting for its echo and remembered as a
//! [`PendingRequest`]; echoes are consumed strictly in send order, either
//! when too many are in flight, at a page commit, or at the end.

use crate::codec;
use crate::constants::{FRAMES_PER_COMMAND, MAX_OUTSTANDING};
use crate::device::{Memory, MemoryKind, Part};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::Transport;

/// A fragment on the wire whose echo has not been read yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRequest {
    /// Byte address of the first instruction in the fragment.
    pub(crate) address: usize,
    /// Frames sent, and so echo bytes to read.
    pub(crate) frames: usize,
    /// Instructions ahead of the reads, such as an extended address load.
    pub(crate) skip: usize,
    /// Read instructions to decode from the echo, 0 for writes.
    pub(crate) items: usize,
}

/// Where drained echoes go.
enum Sink<'a> {
    Discard,
    Load(&'a Memory, &'a mut [u8]),
}

fn missing(op: &'static str, part: &Part) -> Error {
    Error::MissingOpcode {
        op,
        part: part.name.clone(),
    }
}

/// Fails before anything is sent if `memory` lacks a template a write of
/// `len` bytes from address 0 would use.
fn check_write_templates(part: &Part, memory: &Memory, len: usize) -> Result<()> {
    if memory.paged {
        let odd = len > 1 && memory.loadpage_op(1).is_none();
        if memory.loadpage_op(0).is_none() || odd {
            return Err(missing("loadpage", part));
        }
        if memory.writepage.is_none() {
            return Err(missing("writepage", part));
        }
    } else if memory.write.is_none() {
        return Err(missing("write", part));
    }
    Ok(())
}

/// 64K-word bank of a template address, as selected by the extended address load.
fn bank(address: u32) -> u32 {
    address >> 16
}

impl<T: Transport> Session<T> {
    /// Writes `data` to `memory` from address 0 and returns the bytes written.
    pub fn paged_write(&mut self, part: &Part, memory: &Memory, data: &[u8]) -> Result<usize> {
        if !matches!(memory.kind, MemoryKind::Flash | MemoryKind::Eeprom) {
            return Err(Error::UnsupportedMemory(memory.name.clone()));
        }
        if data.len() > memory.size {
            return Err(Error::Config(format!(
                "{} bytes do not fit {} of {} bytes",
                data.len(),
                memory.name,
                memory.size
            )));
        }
        check_write_templates(part, memory, data.len())?;

        // programming indicator on, ready off for the duration
        self.state.direction = (self.state.direction | self.map.pgm_led) & !self.map.rdy_led;
        self.state.aux_direction =
            (self.state.aux_direction | self.map.pgm_led_aux) & !self.map.rdy_led_aux;
        self.apply_directions()?;

        if memory.supports_page_stream() {
            self.write_pipelined(part, memory, data)?;
        } else {
            log::debug!("{} not streamable, writing byte by byte", memory.name);
            self.write_generic(part, memory, data)?;
        }

        self.state.direction = (self.state.direction | self.map.rdy_led) & !self.map.pgm_led;
        self.state.aux_direction =
            (self.state.aux_direction | self.map.rdy_led_aux) & !self.map.pgm_led_aux;
        self.apply_directions()?;
        Ok(data.len())
    }

    /// Reads `buf.len()` bytes of `memory` from address 0.
    pub fn paged_load(&mut self, part: &Part, memory: &Memory, buf: &mut [u8]) -> Result<usize> {
        if !matches!(memory.kind, MemoryKind::Flash | MemoryKind::Eeprom) {
            return Err(Error::UnsupportedMemory(memory.name.clone()));
        }
        if memory.read_op(0).is_none() {
            return Err(missing("read", part));
        }
        let n_bytes = buf.len().min(memory.size);
        self.read_pipelined(part, memory, &mut buf[..n_bytes])?;
        Ok(n_bytes)
    }

    fn write_pipelined(&mut self, part: &Part, memory: &Memory, data: &[u8]) -> Result<()> {
        let writepage = memory.writepage.as_ref().ok_or_else(|| missing("writepage", part))?;
        let per_fragment = self.fragment_size() / FRAMES_PER_COMMAND;
        let mut frames = Vec::with_capacity(self.fragment_size() + 2 * FRAMES_PER_COMMAND + 2);
        let n_bytes = data.len();
        let mut addr = 0;

        while addr < n_bytes {
            let start = addr;
            let mut commit = false;
            frames.clear();
            let busy = self.next_blink();
            frames.push(self.state.indicate(&self.map, busy));

            for _ in 0..per_fragment {
                let op = memory.loadpage_op(addr).ok_or_else(|| missing("loadpage", part))?;
                let cmd = op.encode(memory.template_address(addr), data[addr]);
                codec::encode_command(&self.map, &mut self.state, &cmd, &mut frames);
                addr += 1;
                if addr % memory.page_size == 0 || addr == n_bytes {
                    commit = true;
                    break;
                }
            }
            if commit {
                let page = memory.template_address(memory.page_base(start));
                if let Some(ext) = &memory.load_ext_addr {
                    codec::encode_command(&self.map, &mut self.state, &ext.encode(page, 0), &mut frames);
                    self.ext_addr = Some(bank(page));
                }
                let cmd = writepage.encode(page, 0);
                codec::encode_command(&self.map, &mut self.state, &cmd, &mut frames);
            }
            if addr >= n_bytes {
                frames.push(self.state.indicate(&self.map, false));
            }

            log::trace!(
                "send addr {:#06x} {} frames, first {:02x}{}",
                start,
                frames.len(),
                codec::decode_sent_byte(&self.map, &frames[1..], 3),
                if commit { ", page write" } else { "" }
            );
            self.send("paged_write", &frames)?;
            self.pending.push_back(PendingRequest {
                address: start,
                frames: frames.len(),
                skip: 0,
                items: 0,
            });
            if self.pending.len() > MAX_OUTSTANDING {
                self.drain_one("paged_write", &mut Sink::Discard)?;
            }
            if commit {
                self.drain_all("paged_write", &mut Sink::Discard)?;
                self.delay(memory.max_write_delay)?;
            }
            self.report_progress(addr);
        }
        self.drain_all("paged_write", &mut Sink::Discard)
    }

    fn read_pipelined(&mut self, part: &Part, memory: &Memory, buf: &mut [u8]) -> Result<()> {
        let per_fragment = self.fragment_size() / FRAMES_PER_COMMAND;
        let mut frames = Vec::with_capacity(self.fragment_size() + 2);
        let n_bytes = buf.len();
        let mut sink = Sink::Load(memory, buf);
        let mut addr = 0;

        while addr < n_bytes {
            let start = addr;
            frames.clear();
            let busy = self.next_blink();
            frames.push(self.state.indicate(&self.map, busy));

            // a fragment never spans two banks, the load goes first
            let current = bank(memory.template_address(start));
            let mut skip = 0;
            if let Some(ext) = &memory.load_ext_addr {
                if self.ext_addr != Some(current) {
                    let cmd = ext.encode(memory.template_address(start), 0);
                    codec::encode_command(&self.map, &mut self.state, &cmd, &mut frames);
                    self.ext_addr = Some(current);
                    skip = 1;
                }
            }

            while addr < n_bytes
                && skip + addr - start < per_fragment
                && bank(memory.template_address(addr)) == current
            {
                let op = memory.read_op(addr).ok_or_else(|| missing("read", part))?;
                let cmd = op.encode(memory.template_address(addr), 0);
                codec::encode_command(&self.map, &mut self.state, &cmd, &mut frames);
                addr += 1;
            }
            if addr >= n_bytes {
                frames.push(self.state.indicate(&self.map, false));
            }

            log::trace!(
                "send addr {:#06x} {} frames{}",
                start,
                frames.len(),
                if skip > 0 { ", bank load" } else { "" }
            );
            self.send("paged_load", &frames)?;
            self.pending.push_back(PendingRequest {
                address: start,
                frames: frames.len(),
                skip,
                items: addr - start,
            });
            if self.pending.len() > MAX_OUTSTANDING {
                self.drain_one("paged_load", &mut sink)?;
            }
            self.report_progress(addr);
        }
        self.drain_all("paged_load", &mut sink)
    }

    /// Reads the echo of the oldest pending fragment. Returns false when
    /// nothing was pending.
    fn drain_one(&mut self, op: &'static str, sink: &mut Sink<'_>) -> Result<bool> {
        let Some(request) = self.pending.pop_front() else {
            return Ok(false);
        };
        let mut frames = vec![0u8; request.frames];
        self.recv(op, &mut frames)?;
        log::trace!("recv addr {:#06x} {} frames", request.address, request.frames);

        if let Sink::Load(memory, buf) = sink {
            for j in 0..request.items {
                let addr = request.address + j;
                let res = codec::decode_command(&self.map, &frames[1..], request.skip + j);
                if let (Some(read), Some(cell)) = (memory.read_op(addr), buf.get_mut(addr)) {
                    *cell = read.output(&res);
                }
            }
        }
        Ok(true)
    }

    fn drain_all(&mut self, op: &'static str, sink: &mut Sink<'_>) -> Result<()> {
        while self.drain_one(op, sink)? {}
        Ok(())
    }

    fn write_generic(&mut self, part: &Part, memory: &Memory, data: &[u8]) -> Result<()> {
        let n_bytes = data.len();
        for (addr, &value) in data.iter().enumerate() {
            self.write_byte(part, memory, addr, value)?;
            if memory.paged && (addr % memory.page_size == memory.page_size - 1 || addr == n_bytes - 1) {
                self.write_page(part, memory, addr)?;
            }
            self.report_progress(addr + 1);
        }
        Ok(())
    }

    /// Loads the extended address byte if `addr` lies outside the bank the
    /// target has selected.
    fn select_bank(&mut self, memory: &Memory, addr: usize) -> Result<()> {
        let Some(ext) = &memory.load_ext_addr else {
            return Ok(());
        };
        let address = memory.template_address(addr);
        if self.ext_addr != Some(bank(address)) {
            self.cmd(ext.encode(address, 0))?;
            self.ext_addr = Some(bank(address));
        }
        Ok(())
    }

    /// Reads one location with its own instruction.
    pub fn read_byte(&mut self, part: &Part, memory: &Memory, addr: usize) -> Result<u8> {
        let op = memory.read_op(addr).ok_or_else(|| missing("read", part))?;
        self.select_bank(memory, addr)?;
        let res = self.cmd(op.encode(memory.template_address(addr), 0))?;
        Ok(op.output(&res))
    }

    /// Writes one location. Paged memories only get the byte loaded into the
    /// page buffer; [`Session::write_page`] commits it.
    pub fn write_byte(&mut self, part: &Part, memory: &Memory, addr: usize, value: u8) -> Result<()> {
        let address = memory.template_address(addr);
        self.select_bank(memory, addr)?;
        if memory.paged {
            let op = memory.loadpage_op(addr).ok_or_else(|| missing("loadpage", part))?;
            self.cmd(op.encode(address, value))?;
        } else {
            let op = memory.write.as_ref().ok_or_else(|| missing("write", part))?;
            self.cmd(op.encode(address, value))?;
            self.delay(memory.max_write_delay)?;
        }
        Ok(())
    }

    /// Commits the page buffer to the page holding `addr`.
    pub fn write_page(&mut self, part: &Part, memory: &Memory, addr: usize) -> Result<()> {
        let op = memory.writepage.as_ref().ok_or_else(|| missing("writepage", part))?;
        let page = memory.template_address(memory.page_base(addr));
        if let Some(ext) = &memory.load_ext_addr {
            self.cmd(ext.encode(page, 0))?;
            self.ext_addr = Some(bank(page));
        }
        self.cmd(op.encode(page, 0))?;
        self.delay(memory.max_write_delay)
    }

    fn report_progress(&self, done: usize) {
        if let Some(progress) = &self.progress {
            progress.set_position(done as u64);
        }
    }
}
