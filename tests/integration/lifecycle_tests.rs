//! Attach → boot → enumerate → shutdown, plus the reset and watchdog paths.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use scphost::firmware::MemoryFirmwareSource;
use scphost::error::TransportError;
use scphost::msg::Message;
use scphost::service::{ServiceType, system};
use scphost::sim::SimDevice;
use scphost::{DeviceState, Error, ResetKind};

use super::harness::{FIRMWARE_VERSION, SETTLE, attach, attach_with, eventually, fast_config};

#[test]
fn normal_boot_reaches_active() {
    let sim = SimDevice::new();
    let device = attach(&sim);

    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();

    let kinds: Vec<_> = device.link().services().iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![ServiceType::SYSTEM, ServiceType::BOOTLOADER, ServiceType::RAS]
    );
    assert_eq!(sim.resets(), vec![ResetKind::Normal]);
    assert!(sim.downloads().is_empty());
}

#[test]
fn shutdown_handshakes_from_active() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    let link = device.link().clone();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    device.shutdown().unwrap();

    assert!(sim.commands().contains(&(0, system::SHUTDOWN)));
    assert_eq!(link.state(), DeviceState::Stopped);
    assert!(link.services().is_empty());
    assert_eq!(
        link.send_sync(Message::command(0, system::SYS_INFO, [0, 0])),
        Err(Error::InvalidState(DeviceState::Stopped))
    );
}

#[test]
fn shutdown_before_active_skips_handshake() {
    let sim = SimDevice::new();
    sim.set_silent_boots(10);
    let device = attach(&sim);
    let link = device.link().clone();

    device.shutdown().unwrap();

    assert!(!sim.commands().contains(&(0, system::SHUTDOWN)));
    assert_eq!(link.state(), DeviceState::Stopped);
}

#[test]
fn silent_boots_are_retried() {
    let sim = SimDevice::new();
    sim.set_silent_boots(2);
    let device = attach(&sim);

    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();
    assert_eq!(sim.resets().len(), 3);
}

#[test]
fn device_is_lost_after_retry_budget() {
    let sim = SimDevice::new();
    sim.set_silent_boots(10);
    let device = attach(&sim);

    device
        .link()
        .wait_for_state(DeviceState::Lost, SETTLE)
        .unwrap();
    assert_eq!(sim.resets().len(), 3);
}

#[test]
fn command_timeout_in_active_resets_the_device() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    sim.drop_next_commands(1);
    assert_eq!(
        link.send_sync(Message::command(0, system::SYS_INFO, [0, 0])),
        Err(Error::Timeout)
    );
    assert_eq!(device.snapshot().stats.timeouts, 1);

    assert!(eventually(SETTLE, || {
        sim.resets() == vec![ResetKind::Normal, ResetKind::Normal]
            && link.state() == DeviceState::Active
    }));
    let snap = device.snapshot();
    assert_eq!(snap.timeout_resets, 1);
    assert!(snap.transitions.iter().any(|t| {
        t.from == DeviceState::Active && t.to == DeviceState::Inactive && t.forced
    }));

    // The bus is free again after the reset cycle.
    let reply = link
        .send_sync(Message::command(0, system::SYS_INFO, [0, 0]))
        .unwrap();
    assert_eq!(reply.header.arg0(), 3);
}

#[test]
fn unplugged_bus_fails_commands_without_reset() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    sim.set_disconnected(true);
    assert_eq!(
        link.send_sync(Message::command(0, system::SYS_INFO, [0, 0])),
        Err(Error::Transport(TransportError::Disconnected))
    );
    let read_failed = Error::Transport(TransportError::ReadFailed).to_string();
    assert!(eventually(SETTLE, || {
        device.snapshot().last_error.as_deref() == Some(read_failed.as_str())
    }));

    sim.set_disconnected(false);
    let reply = link
        .send_sync(Message::command(0, system::SYS_INFO, [0, 0]))
        .unwrap();
    assert_eq!(reply.header.arg0(), 3);
    assert_eq!(sim.resets(), vec![ResetKind::Normal]);
    assert_eq!(link.state(), DeviceState::Active);
}

#[test]
fn async_callback_sees_reply() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    link.send_async(
        Message::command(0, system::SERVICE_INFO, [2, 0]),
        move |r| *s.lock().unwrap() = Some(r),
    )
    .unwrap();

    assert!(eventually(SETTLE, || seen.lock().unwrap().is_some()));
    let reply = seen.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(reply.header.arg0(), u32::from(ServiceType::RAS.0));
}

#[test]
fn device_error_is_reported_to_caller() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    let result = link.send_sync(Message::command(0, 0x7E, [0, 0]));
    assert_eq!(
        result,
        Err(Error::Device(scphost::ErrorCode::INVALID_MESSAGE_ID))
    );
}

#[test]
fn operator_reset_reboots_the_device() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    link.request_reset(ResetKind::Normal).unwrap();

    assert!(eventually(SETTLE, || {
        sim.resets().len() == 2 && link.state() == DeviceState::Active
    }));
    assert!(device.snapshot().resets >= 2);
}

#[test]
fn invalid_config_is_rejected() {
    let sim = SimDevice::new();
    let config = scphost::DriverConfig {
        ras_fragment_size: 10,
        ..fast_config()
    };
    let result = scphost::Device::builder(sim.transport())
        .config(config)
        .reset_control(sim.reset_line())
        .firmware(MemoryFirmwareSource::complete(FIRMWARE_VERSION))
        .attach();
    assert!(matches!(result, Err(Error::Config(_))));
    assert!(sim.resets().is_empty());
}

#[test]
fn snapshot_records_transitions() {
    let sim = SimDevice::new();
    let device = attach_with(
        &sim,
        fast_config(),
        MemoryFirmwareSource::complete(FIRMWARE_VERSION),
    );
    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();

    let snap = device.snapshot();
    let path: Vec<_> = snap.transitions.iter().map(|t| t.to).collect();
    assert_eq!(path, vec![DeviceState::Enumerating, DeviceState::Active]);
    assert!(snap.to_json().unwrap().contains("\"Active\""));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(device.state(), DeviceState::Active);
}
