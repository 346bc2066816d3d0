//! Register access through an attached device.

use scphost::service::ras::{WRITE_BULK, WRITE_REG};
use scphost::sim::SimDevice;
use scphost::{DeviceState, Error, RegisterMap};

use super::harness::{SETTLE, attach};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

#[test]
fn bulk_write_is_fragmented_and_reads_back() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();
    let ras = device.link().ras().unwrap();

    let data = pattern(2000);
    ras.write_bulk(0x1000, &data).unwrap();

    let writes: Vec<_> = sim
        .ras_log()
        .into_iter()
        .filter(|&(op, _, _)| op == WRITE_BULK)
        .map(|(_, addr, len)| (addr, len))
        .collect();
    assert_eq!(writes, vec![(0x1000, 960), (0x13C0, 960), (0x1780, 80)]);

    // The device stores words in its own byte order.
    assert_eq!(
        sim.word(0x1000),
        u32::from_be_bytes([data[0], data[1], data[2], data[3]])
    );

    let mut back = vec![0u8; 2000];
    ras.read_bulk(0x1000, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn register_roundtrip() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();
    let ras = device.link().ras().unwrap();

    ras.write_reg(0x40, 0x1234_5678).unwrap();
    assert_eq!(ras.read_reg(0x40).unwrap(), 0x1234_5678);
    assert_eq!(sim.word(0x40), 0x1234_5678);
    assert!(sim.ras_log().iter().any(|&(op, a, _)| op == WRITE_REG && a == 0x40));
}

#[test]
fn failed_fragment_surfaces_io_error() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();
    let ras = device.link().ras().unwrap();
    sim.fail_ras_at(Some(0x13C0));

    assert_eq!(ras.write_bulk(0x1000, &pattern(2000)), Err(Error::Io));

    let attempted: Vec<_> = sim.ras_log().iter().map(|&(_, a, _)| a).collect();
    assert_eq!(attempted, vec![0x1000, 0x13C0]);
    assert_ne!(sim.word(0x1000), 0);
    assert_eq!(sim.word(0x1780), 0);
}

#[test]
fn unaligned_length_is_rejected_locally() {
    let sim = SimDevice::new();
    let device = attach(&sim);
    device
        .link()
        .wait_for_state(DeviceState::Active, SETTLE)
        .unwrap();
    let ras = device.link().ras().unwrap();

    assert!(matches!(
        ras.write_bulk(0, &[1, 2, 3]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(sim.ras_log().is_empty());
}
