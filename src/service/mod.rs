//! Services hosted in the 32-slot table.
//!
//! Every device-side service instance is mirrored by one host object
//! implementing [`Service`]. The core preregisters the system service at
//! instance 0 and the bootloader at instance 1; enumeration fills in the
//! rest from the family constructors registered on the device builder.

pub mod bootloader;
pub mod ras;
pub mod registry;
pub mod system;

use serde::Serialize;

use crate::device::DeviceLink;
use crate::msg::Message;

pub use registry::{Deferred, ServiceHandle, ServiceRegistry, SLOT_COUNT};

/// Instance of the system service.
pub const SYSTEM_INSTANCE: u8 = 0;
/// Instance of the bootloader service.
pub const BOOTLOADER_INSTANCE: u8 = 1;

/// 16-bit family tag reported by SERVICE_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceType(pub u16);

impl ServiceType {
    pub const SYSTEM: Self = Self(0x0001);
    pub const BOOTLOADER: Self = Self(0x0002);
    pub const RAS: Self = Self(0x0003);
}

impl core::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Self::SYSTEM => f.write_str("system"),
            Self::BOOTLOADER => f.write_str("bootloader"),
            Self::RAS => f.write_str("ras"),
            Self(raw) => write!(f, "type {raw:#06x}"),
        }
    }
}

/// Packed `major.minor.patch` (8.8.16 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn pack(self) -> u32 {
        (u32::from(self.major) << 24) | (u32::from(self.minor) << 16) | u32::from(self.patch)
    }

    pub fn unpack(raw: u32) -> Self {
        Self {
            major: (raw >> 24) as u8,
            minor: (raw >> 16) as u8,
            patch: raw as u16,
        }
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What a slot holds, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub instance: u8,
    pub kind: ServiceType,
    pub version: Version,
}

/// Result of offering an inbound message to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    Unhandled,
}

/// Host side of one device service instance.
///
/// `handle` runs on the protocol worker with the registry lock held: it may
/// queue commands with `send_async` and `defer` registry changes, but it
/// must not call `send_sync` or touch the registry directly.
pub trait Service: Send {
    fn name(&self) -> &'static str;

    /// Called once when the service takes its slot. An error leaves the
    /// slot empty.
    fn start(&mut self, link: &DeviceLink, slot: SlotInfo) -> anyhow::Result<()> {
        let _ = (link, slot);
        Ok(())
    }

    /// Called when the slot is vacated or taken over by another family.
    fn stop(&mut self, link: &DeviceLink, slot: SlotInfo) {
        let _ = (link, slot);
    }

    fn handle(&mut self, link: &DeviceLink, slot: SlotInfo, message: &Message) -> Disposition;
}

/// Builds the host object for a discovered family.
pub type Constructor = fn(SlotInfo) -> Box<dyn Service>;

/// Occupies a slot whose family nobody registered a constructor for.
pub struct Unrecognized;

impl Service for Unrecognized {
    fn name(&self) -> &'static str {
        "unrecognized"
    }

    fn handle(&mut self, _link: &DeviceLink, slot: SlotInfo, message: &Message) -> Disposition {
        log::debug!(
            "SVC: {} at {} ignored {:?} {:#04x}",
            slot.kind,
            slot.instance,
            message.cran(),
            message.message_id()
        );
        Disposition::Unhandled
    }
}
