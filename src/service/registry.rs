//! Fixed 32-slot service table.
//!
//! ```text
//!   slot  0: system       (preregistered)
//!   slot  1: bootloader   (preregistered)
//!   slot  n: <family>     (enumeration / application)
//!   empty : inbound traffic goes to the unhandled sink
//! ```
//!
//! [`ServiceRegistry`] is plain data behind the registry lock. The
//! `register`/`deregister`/`clear` functions below run the start and stop
//! hooks with that lock released, so a hook may talk to the device.

use log::{debug, info, warn};
use serde::Serialize;

use crate::device::{DeviceLink, locked};
use crate::error::{Error, ProtocolError, Result};
use crate::msg::Message;

use super::{Disposition, Service, ServiceType, SlotInfo, Version};

pub const SLOT_COUNT: usize = 32;

struct ServiceSlot {
    info: SlotInfo,
    generation: u32,
    service: Box<dyn Service>,
}

/// Proof of registration; stale handles cannot remove a newer occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceHandle {
    pub instance: u8,
    generation: u32,
}

/// Registry change requested from a context that must not take the lock.
pub enum Deferred {
    Register {
        instance: u8,
        kind: ServiceType,
        version: Version,
        service: Box<dyn Service>,
    },
    Deregister(ServiceHandle),
}

impl core::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Register { instance, kind, .. } => {
                write!(f, "Register({instance}, {kind})")
            }
            Self::Deregister(h) => write!(f, "Deregister({})", h.instance),
        }
    }
}

pub struct ServiceRegistry {
    slots: [Option<ServiceSlot>; SLOT_COUNT],
    generation: u32,
    unhandled: u32,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            generation: 0,
            unhandled: 0,
        }
    }

    pub fn get(&self, instance: u8) -> Option<SlotInfo> {
        self.slot(instance).map(|s| s.info)
    }

    /// Lowest instance of a family.
    pub fn find(&self, kind: ServiceType) -> Option<SlotInfo> {
        self.slots
            .iter()
            .flatten()
            .map(|s| s.info)
            .find(|info| info.kind == kind)
    }

    /// Occupied slots in instance order.
    pub fn summaries(&self) -> Vec<SlotInfo> {
        self.slots.iter().flatten().map(|s| s.info).collect()
    }

    /// Inbound messages nobody handled.
    pub fn unhandled(&self) -> u32 {
        self.unhandled
    }

    /// Offer an inbound message to the occupant of its instance.
    pub fn dispatch(&mut self, link: &DeviceLink, message: &Message) -> Disposition {
        let instance = message.instance();
        let disposition = match self.slots.get_mut(instance as usize) {
            Some(Some(slot)) => slot.service.handle(link, slot.info, message),
            _ => {
                warn!("SVC: {}", ProtocolError::UnregisteredInstance(instance));
                Disposition::Unhandled
            }
        };
        if disposition == Disposition::Unhandled {
            self.unhandled += 1;
            debug!(
                "SVC: unhandled {:?} {}:{:#04x}",
                message.cran(),
                instance,
                message.message_id()
            );
        }
        disposition
    }

    // ── Slot primitives ──────────────────────────────────────

    fn slot(&self, instance: u8) -> Option<&ServiceSlot> {
        self.slots.get(instance as usize).and_then(Option::as_ref)
    }

    fn set_version(&mut self, instance: u8, version: Version) -> Option<ServiceHandle> {
        let slot = self.slots.get_mut(instance as usize)?.as_mut()?;
        if slot.info.version != version {
            info!(
                "SVC: {} at {} version {} -> {}",
                slot.info.kind, instance, slot.info.version, version
            );
            slot.info.version = version;
        }
        Some(ServiceHandle {
            instance,
            generation: slot.generation,
        })
    }

    fn take(&mut self, instance: u8) -> Option<ServiceSlot> {
        self.slots.get_mut(instance as usize)?.take()
    }

    fn install(
        &mut self,
        info: SlotInfo,
        service: Box<dyn Service>,
    ) -> (ServiceHandle, Option<ServiceSlot>) {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let displaced = self.slots[info.instance as usize].replace(ServiceSlot {
            info,
            generation,
            service,
        });
        (
            ServiceHandle {
                instance: info.instance,
                generation,
            },
            displaced,
        )
    }

    fn remove(&mut self, handle: ServiceHandle) -> Option<ServiceSlot> {
        let current = self
            .slot(handle.instance)
            .is_some_and(|s| s.generation == handle.generation);
        if current {
            self.take(handle.instance)
        } else {
            None
        }
    }

    fn drain(&mut self) -> Vec<ServiceSlot> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

// ── Locked operations ────────────────────────────────────────

/// Place `service` at `instance`.
///
/// Same family: only the version changes and the running service stays.
/// Different family: the occupant is stopped before the newcomer starts.
pub(crate) fn register(
    link: &DeviceLink,
    instance: u8,
    kind: ServiceType,
    version: Version,
    mut service: Box<dyn Service>,
) -> Result<ServiceHandle> {
    if instance as usize >= SLOT_COUNT {
        return Err(ProtocolError::InvalidInstance(instance).into());
    }
    let info = SlotInfo {
        instance,
        kind,
        version,
    };

    let displaced = {
        let mut registry = locked(&link.shared().registry);
        match registry.get(instance) {
            Some(current) if current.kind == kind => {
                return registry
                    .set_version(instance, version)
                    .ok_or(Error::NotRegistered);
            }
            Some(_) => registry.take(instance),
            None => None,
        }
    };
    if let Some(old) = displaced {
        stop(link, old);
    }

    if let Err(e) = service.start(link, info) {
        warn!("SVC: {} at {} failed to start: {:#}", kind, instance, e);
        return Err(Error::ServiceStart(instance));
    }

    let (handle, raced) = locked(&link.shared().registry).install(info, service);
    if let Some(old) = raced {
        stop(link, old);
    }
    info!("SVC: {} v{} registered at {}", kind, version, instance);
    Ok(handle)
}

/// Remove the occupant named by `handle` and run its stop hook.
pub(crate) fn deregister(link: &DeviceLink, handle: ServiceHandle) -> Result<()> {
    let removed = locked(&link.shared().registry).remove(handle);
    let slot = removed.ok_or(Error::NotRegistered)?;
    stop(link, slot);
    Ok(())
}

/// Stop and remove every occupant.
pub(crate) fn clear(link: &DeviceLink) -> usize {
    let drained = locked(&link.shared().registry).drain();
    let count = drained.len();
    for slot in drained {
        stop(link, slot);
    }
    count
}

pub(crate) fn apply(link: &DeviceLink, op: Deferred) {
    let result = match op {
        Deferred::Register {
            instance,
            kind,
            version,
            service,
        } => register(link, instance, kind, version, service).map(|_| ()),
        Deferred::Deregister(handle) => deregister(link, handle),
    };
    if let Err(e) = result {
        warn!("SVC: deferred registry change failed: {}", e);
    }
}

fn stop(link: &DeviceLink, mut slot: ServiceSlot) {
    info!("SVC: stopping {} at {}", slot.info.kind, slot.info.instance);
    slot.service.stop(link, slot.info);
}
