//! Unsolicited device panic while commands are outstanding.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use scphost::diagnostics::PANIC_CAPTURE;
use scphost::firmware::MemoryFirmwareSource;
use scphost::msg::Message;
use scphost::service::system;
use scphost::sim::SimDevice;
use scphost::{DeviceState, DriverConfig, Error, ResetKind};

use super::harness::{FIRMWARE_VERSION, SETTLE, attach_with, eventually, fast_config};

const QUEUED: usize = 4;

fn patient_config() -> DriverConfig {
    // Keep the watchdog out of the way while commands sit on a stalled bus.
    DriverConfig {
        watchdog_threshold: 500,
        ..fast_config()
    }
}

#[test]
fn panic_cancels_everything_and_sticks() {
    let sim = SimDevice::new();
    let device = attach_with(
        &sim,
        patient_config(),
        MemoryFirmwareSource::complete(FIRMWARE_VERSION),
    );
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    sim.set_stalled(true);
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..QUEUED {
        let o = outcomes.clone();
        link.send_async(Message::command(0, system::SYS_INFO, [0, 0]), move |r| {
            o.lock().unwrap().push(r.map(|_| ()));
        })
        .unwrap();
    }
    assert!(eventually(SETTLE, || device.snapshot().in_flight.is_some()));

    sim.inject_panic(0xDEAD, &[0x5A; PANIC_CAPTURE + 44]);

    link.wait_for_state(DeviceState::Panic, SETTLE).unwrap();
    assert!(eventually(SETTLE, || outcomes.lock().unwrap().len() == QUEUED));
    assert!(
        outcomes
            .lock()
            .unwrap()
            .iter()
            .all(|r| *r == Err(Error::Cancelled))
    );

    let snap = device.snapshot();
    let record = snap.panic.expect("panic record");
    assert_eq!(record.reason, 0xDEAD);
    assert_eq!(record.state, DeviceState::Active);
    assert_eq!(record.payload.len(), PANIC_CAPTURE);
    assert_eq!(record.dropped, 44);
    assert_eq!(snap.queued, 0);
    assert!(snap.in_flight.is_none());

    assert_eq!(
        link.send_sync(Message::command(0, system::SYS_INFO, [0, 0])),
        Err(Error::InvalidState(DeviceState::Panic))
    );
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(link.state(), DeviceState::Panic);
}

#[test]
fn operator_reset_recovers_from_panic() {
    let sim = SimDevice::new();
    let device = attach_with(
        &sim,
        fast_config(),
        MemoryFirmwareSource::complete(FIRMWARE_VERSION),
    );
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    sim.inject_panic(1, b"oops");
    link.wait_for_state(DeviceState::Panic, SETTLE).unwrap();

    link.request_reset(ResetKind::Normal).unwrap();
    assert!(eventually(SETTLE, || {
        sim.resets().len() == 2 && link.state() == DeviceState::Active
    }));
    // The crash record survives recovery for post-mortem.
    assert_eq!(device.snapshot().panic.unwrap().reason, 1);
}
