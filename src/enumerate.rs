//! Service enumeration.
//!
//! Walks the sparse instance space reported by SYS_INFO and gives every
//! populated instance a host-side occupant:
//!
//! 1. same family as the preregistered occupant: version update only
//! 2. a family with a registered constructor: that service
//! 3. anything else: an [`Unrecognized`] placeholder

use log::{error, info, warn};

use crate::device::DeviceLink;
use crate::error::{Error, ErrorCode};
use crate::fsm::DeviceState;
use crate::reset::ResetKind;
use crate::service::{SLOT_COUNT, Service, ServiceType, SlotInfo, Unrecognized, Version, system};

/// ENUMERATING action.
pub fn run(link: &DeviceLink) -> Option<DeviceState> {
    let reported = match system::service_count(link) {
        Ok(n) => n,
        Err(Error::Timeout) => {
            warn!("ENUM: device unresponsive, forcing firmware update");
            link.arm_reset(ResetKind::FirmwareUpdate);
            return Some(DeviceState::Inactive);
        }
        Err(Error::Cancelled) => return None,
        Err(e) => {
            error!("ENUM: SYS_INFO failed: {}", e);
            link.record_error(e);
            return Some(DeviceState::Lost);
        }
    };

    let count = reported.min(SLOT_COUNT as u32) as u8;
    if reported > SLOT_COUNT as u32 {
        warn!("ENUM: device reports {} instances, clamped to {}", reported, SLOT_COUNT);
    }

    let mut found = 0;
    for instance in 0..count {
        match system::service_info(link, instance) {
            Ok((kind, version)) => {
                attach(link, instance, kind, version);
                found += 1;
            }
            Err(Error::Device(ErrorCode::INVALID_SERVICE_INSTANCE)) => {}
            Err(Error::Cancelled) => return None,
            Err(e) => {
                error!("ENUM: SERVICE_INFO({}) failed: {}", instance, e);
                link.record_error(e);
                return Some(DeviceState::Lost);
            }
        }
    }

    info!("ENUM: {} service(s) in {} instance(s)", found, count);
    Some(DeviceState::Active)
}

fn attach(link: &DeviceLink, instance: u8, kind: ServiceType, version: Version) {
    let slot = SlotInfo {
        instance,
        kind,
        version,
    };
    let service: Box<dyn Service> = match link.constructor(kind) {
        Some(construct) => construct(slot),
        None => {
            if link.service(instance).is_none_or(|s| s.kind != kind) {
                info!("ENUM: no driver for {} at {}", kind, instance);
            }
            Box::new(Unrecognized)
        }
    };
    // A same-family occupant keeps running and `service` is dropped.
    if let Err(e) = link.register_service(instance, kind, version, service) {
        warn!("ENUM: {} at {} not attached: {}", kind, instance, e);
    }
}
