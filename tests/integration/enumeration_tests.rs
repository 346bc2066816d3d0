//! Enumeration over sparse instance maps and registry behaviour.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use scphost::msg::Message;
use scphost::service::{Disposition, Service, ServiceType, SlotInfo, Version, system};
use scphost::sim::SimDevice;
use scphost::{DeviceLink, DeviceState, Error};

use super::harness::{FIRMWARE_VERSION, SETTLE, attach, eventually, fast_config};

const VENDOR: ServiceType = ServiceType(0x42);

fn sparse_sim() -> SimDevice {
    let sim = SimDevice::new();
    sim.set_services(&[
        (0, ServiceType::SYSTEM, Version::new(1, 0, 0)),
        (5, ServiceType::RAS, Version::new(1, 1, 0)),
        (9, VENDOR, Version::new(0, 3, 7)),
    ]);
    sim
}

#[test]
fn sparse_instances_are_attached() {
    let sim = sparse_sim();
    let device = attach(&sim);
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    let info_queries = sim
        .commands()
        .iter()
        .filter(|&&c| c == (0, system::SERVICE_INFO))
        .count();
    assert_eq!(info_queries, 10);

    assert_eq!(link.service(5).unwrap().kind, ServiceType::RAS);
    assert_eq!(link.service(9).unwrap().kind, VENDOR);
    assert_eq!(link.service(9).unwrap().version, Version::new(0, 3, 7));
    assert!(link.service(3).is_none());
    assert_eq!(link.ras().unwrap().instance(), 5);

    // Instance 1 holds the preregistered bootloader; nothing else appears.
    let occupied: Vec<_> = link.services().iter().map(|s| s.instance).collect();
    assert_eq!(occupied, vec![0, 1, 5, 9]);
}

fn service_info_queries(sim: &SimDevice) -> usize {
    sim.commands()
        .iter()
        .filter(|&&c| c == (0, system::SERVICE_INFO))
        .count()
}

#[test]
fn full_instance_space_finds_only_responders() {
    let sim = sparse_sim();
    sim.set_reported_count(Some(32));
    let device = attach(&sim);
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    assert_eq!(service_info_queries(&sim), 32);

    let occupied: Vec<_> = link.services().iter().map(|s| s.instance).collect();
    assert_eq!(occupied, vec![0, 1, 5, 9]);
    for instance in (2..32u8).filter(|i| ![5, 9].contains(i)) {
        assert!(link.service(instance).is_none(), "slot {instance}");
    }
    // The preregistered bootloader was not reported and is left as it was.
    assert_eq!(link.service(1).unwrap().kind, ServiceType::BOOTLOADER);
    assert_eq!(link.service(1).unwrap().version, Version::new(0, 0, 0));
}

#[test]
fn oversized_service_count_is_clamped() {
    let sim = sparse_sim();
    sim.set_reported_count(Some(200));
    let device = attach(&sim);
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    assert_eq!(service_info_queries(&sim), 32);
    let occupied: Vec<_> = link.services().iter().map(|s| s.instance).collect();
    assert_eq!(occupied, vec![0, 1, 5, 9]);
}

#[test]
fn reported_version_replaces_placeholder() {
    let sim = SimDevice::new();
    sim.set_services(&[
        (0, ServiceType::SYSTEM, Version::new(2, 3, 4)),
        (1, ServiceType::BOOTLOADER, Version::new(1, 0, 9)),
    ]);
    let device = attach(&sim);
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    assert_eq!(link.service(0).unwrap().version, Version::new(2, 3, 4));
    assert_eq!(link.service(1).unwrap().version, Version::new(1, 0, 9));
    assert!(matches!(link.ras(), Err(Error::NoSuchService)));
}

#[test]
fn unrecognized_notifications_are_counted() {
    let sim = sparse_sim();
    let device = attach(&sim);
    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();

    sim.notify(&Message::notification(9, 0x01, [0, 0]));
    assert!(eventually(SETTLE, || device.snapshot().unhandled == 1));
}

// ── Registered families ───────────────────────────────────────

static VENDOR_EVENTS: AtomicU32 = AtomicU32::new(0);

struct VendorService;

impl VendorService {
    fn construct(_slot: SlotInfo) -> Box<dyn Service> {
        Box::new(Self)
    }
}

impl Service for VendorService {
    fn name(&self) -> &'static str {
        "vendor"
    }

    fn handle(&mut self, _link: &DeviceLink, _slot: SlotInfo, _m: &Message) -> Disposition {
        VENDOR_EVENTS.fetch_add(1, Ordering::SeqCst);
        Disposition::Handled
    }
}

#[test]
fn registered_family_receives_notifications() {
    let sim = sparse_sim();
    let device = scphost::Device::builder(sim.transport())
        .config(fast_config())
        .reset_control(sim.reset_line())
        .firmware(scphost::firmware::MemoryFirmwareSource::complete(FIRMWARE_VERSION))
        .family(VENDOR, VendorService::construct)
        .attach()
        .unwrap();
    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();

    sim.notify(&Message::notification(9, 0x01, [0, 0]));
    assert!(eventually(SETTLE, || VENDOR_EVENTS.load(Ordering::SeqCst) == 1));
    assert_eq!(device.snapshot().unhandled, 0);
}

// ── Registry ──────────────────────────────────────────────────

struct Counted(Arc<AtomicU32>);

impl Service for Counted {
    fn name(&self) -> &'static str {
        "counted"
    }

    fn start(&mut self, _link: &DeviceLink, _slot: SlotInfo) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handle(&mut self, _link: &DeviceLink, _slot: SlotInfo, _m: &Message) -> Disposition {
        Disposition::Unhandled
    }
}

#[test]
fn same_family_registration_is_idempotent() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    let link = device.link();
    link.wait_for_state(DeviceState::Active, SETTLE).unwrap();

    let starts = Arc::new(AtomicU32::new(0));
    let kind = ServiceType(0x77);
    let first = link
        .register_service(20, kind, Version::new(1, 0, 0), Box::new(Counted(starts.clone())))
        .unwrap();
    let second = link
        .register_service(20, kind, Version::new(1, 1, 0), Box::new(Counted(starts.clone())))
        .unwrap();

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
    assert_eq!(link.service(20).unwrap().version, Version::new(1, 1, 0));

    link.deregister_service(first).unwrap();
    assert!(link.service(20).is_none());
    assert_eq!(link.deregister_service(second), Err(Error::NotRegistered));
}
