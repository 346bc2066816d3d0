//! State action table.
//!
//! Each state owns at most one plain `fn` action. The maintenance thread
//! runs the action for the current state; a returned `Some(next)` asks for
//! a transition, `None` parks the thread until the next wake-up.
//!
//! ```text
//!  INACTIVE          reset pulse, wait for the boot notification
//!  BOOTLOADER_BEGIN  arm a firmware-update reset
//!  BOOTLOADER_FWU    ┐
//!  BOOTLOADER_CPK    ├ load, validate and download the artifact
//!  BOOTLOADER_MAB    ┘
//!  ENUMERATING       walk the service instances
//!  others            no-op
//! ```

use embassy_time::{Duration, with_timeout};
use log::{error, info, warn};

use super::DeviceState;
use crate::device::DeviceLink;
use crate::service::bootloader;

/// Signature of a per-state action.
pub type StateActionFn = fn(&DeviceLink) -> Option<DeviceState>;

/// One row in the action table.
pub struct StateDescriptor {
    pub id: DeviceState,
    pub name: &'static str,
    pub action: Option<StateActionFn>,
}

// ═══════════════════════════════════════════════════════════════════════════
//  Table builder
// ═══════════════════════════════════════════════════════════════════════════

pub fn build_state_table() -> [StateDescriptor; DeviceState::COUNT] {
    core::array::from_fn(|i| {
        let id = DeviceState::from_index(i);
        StateDescriptor {
            id,
            name: id.name(),
            action: action_for(id),
        }
    })
}

fn action_for(state: DeviceState) -> Option<StateActionFn> {
    match state {
        DeviceState::Inactive => Some(reset_and_boot),
        DeviceState::BootloaderBegin => Some(bootloader::begin),
        DeviceState::BootloaderFwu | DeviceState::BootloaderCpk | DeviceState::BootloaderMab => {
            Some(bootloader::handle_request)
        }
        DeviceState::Enumerating => Some(crate::enumerate::run),
        DeviceState::BootloaderWfr
        | DeviceState::Active
        | DeviceState::Stopping
        | DeviceState::Stopped
        | DeviceState::Panic
        | DeviceState::Lost => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  INACTIVE
// ═══════════════════════════════════════════════════════════════════════════

/// Pulse reset and wait for the device to say how it booted.
///
/// The boot notification handlers signal the state the device asked for.
/// A silent boot is retried up to `boot_retries` times before the device
/// is declared lost.
fn reset_and_boot(link: &DeviceLink) -> Option<DeviceState> {
    if !link.is_running() {
        return None;
    }

    let kind = link.take_reset();
    link.flush_link();
    link.shared().boot.reset();

    info!("BOOT: device {} reset ({:?})", link.instance_id(), kind);
    if let Err(e) = link.pulse_reset(kind) {
        error!("BOOT: reset line failed: {}", e);
        link.record_error(e);
        return Some(DeviceState::Lost);
    }

    let timeout = Duration::from_millis(u64::from(link.config().boot_timeout_ms));
    let outcome = futures_lite::future::block_on(with_timeout(timeout, link.shared().boot.wait()));

    if !link.is_running() {
        return None;
    }

    match outcome {
        Ok(next) => {
            link.note_boot();
            info!("BOOT: device {} booted towards {}", link.instance_id(), next);
            Some(next)
        }
        Err(_) => {
            let attempts = link.note_silent_boot();
            let limit = link.config().boot_retries;
            if attempts >= limit {
                error!("BOOT: no boot notification after {} reset(s)", attempts);
                Some(DeviceState::Lost)
            } else {
                warn!("BOOT: silent boot {}/{}, retrying", attempts, limit);
                // Keep whatever reset kind was armed for the retry.
                link.arm_reset(kind);
                Some(DeviceState::Inactive)
            }
        }
    }
}
