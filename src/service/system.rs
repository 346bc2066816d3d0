//! System service (instance 0).
//!
//! Commands: SYS_INFO, SERVICE_INFO, SHUTDOWN.
//! Notifications: APP_READY after a normal boot, PANIC with the device's
//! crash record as bulk payload.

use log::{debug, info};

use super::{Disposition, SYSTEM_INSTANCE, Service, ServiceType, SlotInfo, Version};
use crate::device::DeviceLink;
use crate::error::Result;
use crate::fsm::DeviceState;
use crate::msg::{Cran, Message};

// ── Opcodes ──────────────────────────────────────────────────

/// Response arg0: number of service instances.
pub const SYS_INFO: u8 = 0x01;
/// arg0: instance. Response: arg0 = type, arg1 = packed version.
pub const SERVICE_INFO: u8 = 0x02;
pub const SHUTDOWN: u8 = 0x03;

pub const NOTIFY_APP_READY: u8 = 0x01;
pub const NOTIFY_PANIC: u8 = 0x02;

// ── Requests ─────────────────────────────────────────────────

/// Number of service instances the device reports.
pub fn service_count(link: &DeviceLink) -> Result<u32> {
    let reply = link.send_sync(Message::command(SYSTEM_INSTANCE, SYS_INFO, [0, 0]))?;
    Ok(reply.header.arg0())
}

/// Family and version of one instance.
pub fn service_info(link: &DeviceLink, instance: u8) -> Result<(ServiceType, Version)> {
    let reply = link.send_sync(Message::command(
        SYSTEM_INSTANCE,
        SERVICE_INFO,
        [u32::from(instance), 0],
    ))?;
    Ok((
        ServiceType(reply.header.arg0() as u16),
        Version::unpack(reply.header.arg1()),
    ))
}

/// Ask the device to quiesce before the host lets go of it.
pub fn shutdown(link: &DeviceLink) -> Result<()> {
    link.send_sync(Message::command(SYSTEM_INSTANCE, SHUTDOWN, [0, 0]))
        .map(|_| ())
}

// ── Service ──────────────────────────────────────────────────

pub struct SystemService;

impl Service for SystemService {
    fn name(&self) -> &'static str {
        "system"
    }

    fn handle(&mut self, link: &DeviceLink, _slot: SlotInfo, message: &Message) -> Disposition {
        if message.cran() != Cran::Notification {
            return Disposition::Unhandled;
        }
        match message.message_id() {
            NOTIFY_APP_READY => {
                let state = link.state();
                if state == DeviceState::Inactive {
                    info!("SYS: application ready");
                    link.signal_boot(DeviceState::Enumerating);
                } else {
                    debug!("SYS: app-ready ignored in {}", state);
                }
                Disposition::Handled
            }
            NOTIFY_PANIC => {
                link.enter_panic(message.header.arg0(), &message.payload);
                Disposition::Handled
            }
            _ => Disposition::Unhandled,
        }
    }
}
