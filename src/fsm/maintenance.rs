//! Maintenance thread: advances the device state machine.
//!
//! Sleeps on the wake signal. Each wake-up applies deferred registry
//! mutations, turns a transport timeout seen in ACTIVE into a reset, then
//! runs the current state's action until it parks.

use log::{debug, info, warn};

use super::DeviceState;
use super::states::{StateDescriptor, build_state_table};
use crate::device::DeviceLink;

fn run(link: DeviceLink) {
    let table = build_state_table();
    info!("FSM: maintenance started for device {}", link.instance_id());

    while link.is_running() {
        link.apply_deferred();
        link.recover_from_timeout();
        step(&link, &table);
        if !link.is_running() {
            break;
        }
        futures_lite::future::block_on(link.shared().wake.wait());
    }

    info!("FSM: maintenance for device {} stopped", link.instance_id());
}

/// Spawn the maintenance thread.
pub(crate) fn spawn(link: DeviceLink) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("scp{}-fsm", link.instance_id()))
        .spawn(move || run(link))
}

/// Run actions until the current state has none or asks to stay parked.
pub(crate) fn step(link: &DeviceLink, table: &[StateDescriptor; DeviceState::COUNT]) {
    loop {
        let state = link.state();
        let row = &table[state as usize];
        let Some(action) = row.action else {
            debug!("FSM: {} parked", row.name);
            return;
        };
        let Some(next) = action(link) else {
            return;
        };
        if !link.is_running() || !apply(link, next) {
            return;
        }
    }
}

/// Returns `false` when the request was refused; the caller parks.
fn apply(link: &DeviceLink, next: DeviceState) -> bool {
    match link.advance(next) {
        Ok(()) => true,
        Err(e) if link.state() == DeviceState::Panic => {
            warn!("FSM: device in PANIC, dropping request ({})", e);
            false
        }
        Err(e) => {
            warn!("FSM: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_request_does_not_override_panic() {
        let link = DeviceLink::offline();
        link.transition(DeviceState::Enumerating).unwrap();
        // Panic lands after the action decided on LOST.
        link.force_state(DeviceState::Panic);
        assert!(!apply(&link, DeviceState::Lost));
        assert_eq!(link.state(), DeviceState::Panic);
    }

    #[test]
    fn lost_request_is_applied_elsewhere() {
        let link = DeviceLink::offline();
        link.transition(DeviceState::Enumerating).unwrap();
        assert!(apply(&link, DeviceState::Lost));
        assert_eq!(link.state(), DeviceState::Lost);
    }
}
