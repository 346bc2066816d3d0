//! Register-access tunneling.
//!
//! A 32-bit address / 32-bit value register map carried over service
//! messages. Bulk transfers are split into independent fragments:
//!
//! ```text
//!  write_bulk(0x1000, 2000 bytes), fragment 960
//!    WRITE_BULK @0x1000  [   0.. 960)
//!    WRITE_BULK @0x13C0  [ 960..1920)
//!    WRITE_BULK @0x1780  [1920..2000)
//! ```
//!
//! The wire carries little-endian words; callers see big-endian bytes.
//! A failed fragment aborts the transfer with an I/O error. Fragments
//! that already completed stay written.

use log::{debug, info, warn};

use super::{Disposition, Service, SlotInfo};
use crate::device::DeviceLink;
use crate::error::{Error, Result};
use crate::msg::Message;

// ── Opcodes ──────────────────────────────────────────────────

/// [addr, 0] → arg0 = value
pub const READ_REG: u8 = 0x01;
/// [addr, value]
pub const WRITE_REG: u8 = 0x02;
/// [addr, len] → bulk response of `len` bytes
pub const READ_BULK: u8 = 0x03;
/// bulk, arg = addr
pub const WRITE_BULK: u8 = 0x04;

/// Largest fragment payload the device accepts.
pub const DEFAULT_FRAGMENT: usize = 960;

const WORD: usize = 4;

/// Something that can carry one request and wait for its reply.
pub trait Requester {
    fn request(&self, message: Message) -> Result<Message>;
}

impl Requester for DeviceLink {
    fn request(&self, message: Message) -> Result<Message> {
        self.send_sync(message)
    }
}

/// 32-bit register map.
pub trait RegisterMap {
    fn read_reg(&self, addr: u32) -> Result<u32>;
    fn write_reg(&self, addr: u32, value: u32) -> Result<()>;
    /// Fill `buf` from `addr`; `buf.len()` must be a multiple of 4.
    fn read_bulk(&self, addr: u32, buf: &mut [u8]) -> Result<()>;
    /// Write `data` at `addr`; `data.len()` must be a multiple of 4.
    fn write_bulk(&self, addr: u32, data: &[u8]) -> Result<()>;
}

/// `(address, byte range)` of each fragment.
pub fn fragments(
    base: u32,
    len: usize,
    fragment: usize,
) -> impl Iterator<Item = (u32, core::ops::Range<usize>)> {
    let step = fragment.max(WORD);
    (0..len).step_by(step).map(move |start| {
        let end = (start + step).min(len);
        (base.wrapping_add(start as u32), start..end)
    })
}

/// Reverse the bytes of every 32-bit word.
fn swap_words(src: &[u8], dst: &mut [u8]) {
    for (s, d) in src.chunks_exact(WORD).zip(dst.chunks_exact_mut(WORD)) {
        d.copy_from_slice(&[s[3], s[2], s[1], s[0]]);
    }
}

fn check_len(len: usize) -> Result<()> {
    if len % WORD == 0 {
        Ok(())
    } else {
        Err(Error::InvalidArgument("length must be a multiple of 4"))
    }
}

fn io(op: &str, addr: u32, e: Error) -> Error {
    warn!("RAS: {} @{:#010x} failed: {}", op, addr, e);
    Error::Io
}

// ── Client ───────────────────────────────────────────────────

pub struct RasClient<R> {
    requester: R,
    instance: u8,
    fragment: usize,
}

impl<R: Requester> RasClient<R> {
    /// `fragment` is rounded down to whole words.
    pub fn new(requester: R, instance: u8, fragment: usize) -> Self {
        Self {
            requester,
            instance,
            fragment: (fragment / WORD * WORD).max(WORD),
        }
    }

    pub fn instance(&self) -> u8 {
        self.instance
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment
    }
}

impl<R: Requester> RegisterMap for RasClient<R> {
    fn read_reg(&self, addr: u32) -> Result<u32> {
        let reply = self
            .requester
            .request(Message::command(self.instance, READ_REG, [addr, 0]))
            .map_err(|e| io("read", addr, e))?;
        Ok(reply.header.arg0())
    }

    fn write_reg(&self, addr: u32, value: u32) -> Result<()> {
        self.requester
            .request(Message::command(self.instance, WRITE_REG, [addr, value]))
            .map_err(|e| io("write", addr, e))?;
        Ok(())
    }

    fn read_bulk(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len())?;
        for (at, range) in fragments(addr, buf.len(), self.fragment) {
            let len = range.len();
            let reply = self
                .requester
                .request(Message::command(self.instance, READ_BULK, [at, len as u32]))
                .map_err(|e| io("bulk read", at, e))?;
            if reply.payload.len() != len {
                warn!(
                    "RAS: bulk read @{:#010x} returned {} of {} bytes",
                    at,
                    reply.payload.len(),
                    len
                );
                return Err(Error::Io);
            }
            swap_words(&reply.payload, &mut buf[range]);
            debug!("RAS: read {} bytes @{:#010x}", len, at);
        }
        Ok(())
    }

    fn write_bulk(&self, addr: u32, data: &[u8]) -> Result<()> {
        check_len(data.len())?;
        for (at, range) in fragments(addr, data.len(), self.fragment) {
            let mut wire = vec![0u8; range.len()];
            swap_words(&data[range], &mut wire);
            let len = wire.len();
            self.requester
                .request(Message::bulk_command(self.instance, WRITE_BULK, at, wire))
                .map_err(|e| io("bulk write", at, e))?;
            debug!("RAS: wrote {} bytes @{:#010x}", len, at);
        }
        Ok(())
    }
}

// ── Service ──────────────────────────────────────────────────

/// Slot occupant for RAS instances; the protocol has no notifications.
pub struct RasService;

impl RasService {
    pub fn construct(_slot: SlotInfo) -> Box<dyn Service> {
        Box::new(Self)
    }
}

impl Service for RasService {
    fn name(&self) -> &'static str {
        "ras"
    }

    fn start(&mut self, _link: &DeviceLink, slot: SlotInfo) -> anyhow::Result<()> {
        info!("RAS: register access at instance {} (v{})", slot.instance, slot.version);
        Ok(())
    }

    fn handle(&mut self, _link: &DeviceLink, slot: SlotInfo, message: &Message) -> Disposition {
        debug!(
            "RAS: unexpected {:?} {:#04x} at {}",
            message.cran(),
            message.message_id(),
            slot.instance
        );
        Disposition::Unhandled
    }
}
