//! Bootloader service (instance 1) and the artifact download handshake.
//!
//! ```text
//!  device                                   host
//!    │── REQUEST_FWU ──────────────────────▶│ BOOTLOADER_FWU
//!    │◀───────────── DOWNLOAD(FWU, bulk) ───│ BOOTLOADER_WFR
//!    │── ACK / RESPONSE ───────────────────▶│
//!    │── REQUEST_CPK ──────────────────────▶│ BOOTLOADER_CPK ...
//!    │── REQUEST_MAB ──────────────────────▶│ BOOTLOADER_MAB ...
//!    │── RESPONSE(reset required?) ────────▶│ INACTIVE | ENUMERATING
//! ```
//!
//! Notifications only move the state; the download itself runs on the
//! maintenance thread, which may block on the reply.

use log::{error, info, warn};

use super::{BOOTLOADER_INSTANCE, Disposition, Service, SlotInfo};
use crate::device::DeviceLink;
use crate::error::{BootloaderError, Error};
use crate::firmware::{Artifact, ArtifactKind};
use crate::fsm::DeviceState;
use crate::msg::{Cran, Message};
use crate::reset::ResetKind;

// ── Opcodes ──────────────────────────────────────────────────

/// Bulk command; arg = artifact code, payload = the artifact body.
pub const DOWNLOAD: u8 = 0x01;

pub const NOTIFY_REQUEST_FWU: u8 = 0x01;
pub const NOTIFY_REQUEST_CPK: u8 = 0x02;
pub const NOTIFY_REQUEST_MAB: u8 = 0x03;
pub const NOTIFY_NO_BOOTABLE_COMPONENT: u8 = 0x10;
pub const NOTIFY_FLASH_AUTH_FAILED: u8 = 0x11;
pub const NOTIFY_FLASH_CORRUPTED: u8 = 0x12;

/// MAB response arg0 bit: the device needs a fresh reset cycle.
pub const RESET_REQUIRED: u32 = 1 << 0;

/// State a bootloader notification asks for.
pub fn target_state(message_id: u8) -> Option<DeviceState> {
    match message_id {
        NOTIFY_REQUEST_FWU => Some(DeviceState::BootloaderFwu),
        NOTIFY_REQUEST_CPK => Some(DeviceState::BootloaderCpk),
        NOTIFY_REQUEST_MAB => Some(DeviceState::BootloaderMab),
        NOTIFY_NO_BOOTABLE_COMPONENT | NOTIFY_FLASH_AUTH_FAILED | NOTIFY_FLASH_CORRUPTED => {
            Some(DeviceState::BootloaderBegin)
        }
        _ => None,
    }
}

// ── Service ──────────────────────────────────────────────────

pub struct BootloaderService;

impl Service for BootloaderService {
    fn name(&self) -> &'static str {
        "bootloader"
    }

    fn handle(&mut self, link: &DeviceLink, _slot: SlotInfo, message: &Message) -> Disposition {
        if message.cran() != Cran::Notification {
            return Disposition::Unhandled;
        }
        let Some(target) = target_state(message.message_id()) else {
            return Disposition::Unhandled;
        };

        let state = link.state();
        match state {
            DeviceState::Inactive => link.signal_boot(target),
            s if s.is_bootloader() => {
                if let Err(e) = link.transition(target) {
                    warn!("BOOT: {}", e);
                }
                link.wake_maintenance();
            }
            DeviceState::Panic => {}
            other => warn!("BOOT: request for {} ignored in {}", target, other),
        }
        Disposition::Handled
    }
}

// ── Maintenance actions ──────────────────────────────────────

/// BOOTLOADER_BEGIN: nothing bootable; force the update path.
pub fn begin(link: &DeviceLink) -> Option<DeviceState> {
    warn!("BOOT: device has no bootable image, forcing firmware update");
    link.arm_reset(ResetKind::FirmwareUpdate);
    Some(DeviceState::Inactive)
}

/// BOOTLOADER_FWU/CPK/MAB: validate and download the requested artifact.
pub fn handle_request(link: &DeviceLink) -> Option<DeviceState> {
    let state = link.state();
    let Some(kind) = ArtifactKind::requested_by(state) else {
        if state == DeviceState::Panic {
            return None;
        }
        error!("BOOT: unexpected sub-state {} while handling a request", state);
        link.dump_diagnostics();
        return Some(DeviceState::Lost);
    };

    let artifact = match load(link, kind) {
        Ok(a) => a,
        Err(e) => {
            // State stays put; the device keeps waiting for this artifact.
            error!("BOOT: {:?} not sent: {}", kind, e);
            link.record_error(e);
            return None;
        }
    };

    if let Err(e) = link.transition(DeviceState::BootloaderWfr) {
        warn!("BOOT: {}", e);
        return None;
    }

    let fingerprint = artifact.fingerprint();
    info!(
        "BOOT: sending {:?} v{:#010x}, {} bytes, sha256 {}",
        kind,
        artifact.version,
        fingerprint.len,
        fingerprint.hex()
    );
    link.record_fingerprint(fingerprint);

    // The header stays on the host; the device gets the body verbatim.
    let command = Message::bulk_command(
        BOOTLOADER_INSTANCE,
        DOWNLOAD,
        kind.code(),
        artifact.body().to_vec(),
    );
    match link.send_sync(command) {
        Ok(reply) => {
            link.note_transfer();
            if kind != ArtifactKind::Mab {
                return None;
            }
            if reply.header.arg0() & RESET_REQUIRED != 0 {
                info!("BOOT: firmware loaded, reset required");
                Some(DeviceState::Inactive)
            } else {
                info!("BOOT: firmware loaded");
                Some(DeviceState::Enumerating)
            }
        }
        Err(Error::Device(code)) => {
            let failures = link.note_transfer_failure();
            warn!("BOOT: {:?} rejected by device: {}", kind, code);
            link.record_error(BootloaderError::Rejected(code).into());
            if failures >= link.config().boot_retries {
                error!("BOOT: {:?} rejected {} times", kind, failures);
                Some(DeviceState::Lost)
            } else {
                Some(kind.request_state())
            }
        }
        Err(Error::Cancelled) => None,
        Err(Error::Timeout) => {
            warn!("BOOT: {:?} transfer timed out, restarting update", kind);
            link.arm_reset(ResetKind::FirmwareUpdate);
            Some(DeviceState::Inactive)
        }
        Err(e) => {
            error!("BOOT: {:?} transfer failed: {}", kind, e);
            link.record_error(e);
            Some(DeviceState::Lost)
        }
    }
}

fn load(link: &DeviceLink, kind: ArtifactKind) -> Result<Artifact, Error> {
    let image = link.firmware().load(kind).map_err(|e| {
        warn!("BOOT: {:#}", e);
        Error::from(BootloaderError::ArtifactUnavailable(kind))
    })?;
    let artifact = Artifact::parse(kind, image)?;
    let len = artifact.body().len();
    if len > link.config().max_transaction_size as usize {
        return Err(BootloaderError::TooLarge { len }.into());
    }
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_notifications_map_to_states() {
        assert_eq!(
            target_state(NOTIFY_REQUEST_FWU),
            Some(DeviceState::BootloaderFwu)
        );
        assert_eq!(
            target_state(NOTIFY_REQUEST_MAB),
            Some(DeviceState::BootloaderMab)
        );
        for id in [
            NOTIFY_NO_BOOTABLE_COMPONENT,
            NOTIFY_FLASH_AUTH_FAILED,
            NOTIFY_FLASH_CORRUPTED,
        ] {
            assert_eq!(target_state(id), Some(DeviceState::BootloaderBegin));
        }
        assert_eq!(target_state(0x7F), None);
    }

    #[test]
    fn begin_arms_firmware_update_reset() {
        let link = DeviceLink::offline();
        assert_eq!(begin(&link), Some(DeviceState::Inactive));
        assert_eq!(link.snapshot().armed_reset, ResetKind::FirmwareUpdate);
    }

    #[test]
    fn request_outside_bootloader_state_goes_lost() {
        let link = DeviceLink::offline();
        link.force_state(DeviceState::Active);
        assert_eq!(handle_request(&link), Some(DeviceState::Lost));
    }

    #[test]
    fn request_in_panic_is_ignored() {
        let link = DeviceLink::offline();
        link.force_state(DeviceState::Panic);
        assert_eq!(handle_request(&link), None);
    }

    #[test]
    fn bad_artifact_leaves_state_unchanged() {
        use crate::firmware::{MemoryFirmwareSource, build_image};
        let mut image = build_image(ArtifactKind::Fwu, 1, &[0; 16]);
        image[76] = 0;
        let link = DeviceLink::offline_with(MemoryFirmwareSource::new().with(ArtifactKind::Fwu, image));
        link.force_state(DeviceState::BootloaderFwu);

        assert_eq!(handle_request(&link), None);
        assert_eq!(link.state(), DeviceState::BootloaderFwu);
        assert_eq!(link.snapshot().stats.sent, 0);
        assert!(link.snapshot().last_error.unwrap().contains("magic"));
    }

    #[test]
    fn size_limit_applies_to_body() {
        use crate::firmware::{HEADER_LEN, MemoryFirmwareSource, build_image};
        let max = crate::config::DriverConfig::default().max_transaction_size as usize;
        let fits = build_image(ArtifactKind::Cpk, 1, &vec![0xA5; max]);
        let link = DeviceLink::offline_with(MemoryFirmwareSource::new().with(ArtifactKind::Cpk, fits));
        let artifact = load(&link, ArtifactKind::Cpk).unwrap();
        assert_eq!(artifact.body().len(), max);
        assert_eq!(artifact.image.len(), HEADER_LEN + max);

        let over = build_image(ArtifactKind::Cpk, 1, &vec![0; max + 1]);
        let link = DeviceLink::offline_with(MemoryFirmwareSource::new().with(ArtifactKind::Cpk, over));
        assert_eq!(
            load(&link, ArtifactKind::Cpk),
            Err(BootloaderError::TooLarge { len: max + 1 }.into())
        );
    }
}
