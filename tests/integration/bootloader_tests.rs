//! Firmware download: FWU → CPK → MAB, artifact validation and rejection.

use std::time::Duration;

use scphost::firmware::{ArtifactKind, MemoryFirmwareSource, build_image};
use scphost::sim::SimDevice;
use scphost::{DeviceState, ErrorCode, ResetKind};

use super::harness::{
    BODY_LEN, FIRMWARE_VERSION, SETTLE, attach, attach_with, eventually, fast_config,
};

fn fresh_sim() -> SimDevice {
    let sim = SimDevice::new();
    sim.set_needs_firmware(true);
    sim
}

#[test]
fn fresh_device_downloads_all_artifacts() {
    let sim = fresh_sim();
    let device = attach(&sim);

    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();

    let kinds: Vec<_> = sim.downloads().iter().map(|&(k, _)| k).collect();
    assert_eq!(
        kinds,
        vec![ArtifactKind::Fwu, ArtifactKind::Cpk, ArtifactKind::Mab]
    );
    // Only the body crosses the bus; the 100-byte header stays on the host.
    assert!(sim.downloads().iter().all(|&(_, len)| len == BODY_LEN));
    assert_eq!(
        sim.resets(),
        vec![ResetKind::Normal, ResetKind::FirmwareUpdate]
    );

    let snap = device.snapshot();
    assert_eq!(snap.fingerprints.len(), 3);
    assert!(snap.fingerprints.iter().all(|f| f.version == FIRMWARE_VERSION));
}

#[test]
fn mab_reset_flag_triggers_another_boot() {
    let sim = fresh_sim();
    sim.set_mab_reset_required(true);
    let device = attach(&sim);

    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();
    assert_eq!(
        sim.resets(),
        vec![
            ResetKind::Normal,
            ResetKind::FirmwareUpdate,
            ResetKind::Normal
        ]
    );
}

#[test]
fn bad_magic_is_never_sent() {
    let sim = fresh_sim();
    let mut image = build_image(ArtifactKind::Fwu, FIRMWARE_VERSION, &[0; 64]);
    image[76..80].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    let firmware = MemoryFirmwareSource::complete(FIRMWARE_VERSION).with(ArtifactKind::Fwu, image);
    let device = attach_with(&sim, fast_config(), firmware);
    let link = device.link();

    link.wait_for_state(DeviceState::BootloaderFwu, SETTLE)
        .unwrap();
    assert!(eventually(SETTLE, || device.snapshot().last_error.is_some()));
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(link.state(), DeviceState::BootloaderFwu);
    assert!(sim.downloads().is_empty());
    assert!(device.snapshot().last_error.unwrap().contains("magic"));
}

#[test]
fn missing_artifact_leaves_device_waiting() {
    let sim = fresh_sim();
    let firmware = MemoryFirmwareSource::new();
    let device = attach_with(&sim, fast_config(), firmware);

    device
        .link()
        .wait_for_state(DeviceState::BootloaderFwu, SETTLE)
        .unwrap();
    assert!(eventually(SETTLE, || device.snapshot().error_count > 0));
    assert!(sim.downloads().is_empty());
}

#[test]
fn rejected_download_is_retried() {
    let sim = fresh_sim();
    sim.reject_next_download(ErrorCode::IO);
    let device = attach(&sim);

    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();
    assert_eq!(sim.downloads().len(), 3);
    assert!(device.snapshot().error_count >= 1);
}
