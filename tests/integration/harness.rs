//! Shared setup: a fast configuration and an attached simulated device.

use std::time::{Duration, Instant};

use scphost::firmware::{FirmwareSource, MemoryFirmwareSource};
use scphost::sim::SimDevice;
use scphost::{Device, DriverConfig};

pub const SETTLE: Duration = Duration::from_secs(5);
pub const FIRMWARE_VERSION: u32 = 0x0002_0001;
/// Body length of every image served by `MemoryFirmwareSource::complete`.
pub const BODY_LEN: usize = 64;

/// Short timers so failure paths resolve quickly.
pub fn fast_config() -> DriverConfig {
    DriverConfig {
        watchdog_interval_ms: 10,
        watchdog_threshold: 10,
        reset_pulse_ms: 0,
        boot_settle_ms: 0,
        boot_timeout_ms: 200,
        boot_retries: 3,
        ..DriverConfig::default()
    }
}

pub fn attach_with(
    sim: &SimDevice,
    config: DriverConfig,
    firmware: impl FirmwareSource + 'static,
) -> Device {
    Device::builder(sim.transport())
        .config(config)
        .reset_control(sim.reset_line())
        .firmware(firmware)
        .attach()
        .expect("attach")
}

pub fn attach(sim: &SimDevice) -> Device {
    attach_with(sim, fast_config(), MemoryFirmwareSource::complete(FIRMWARE_VERSION))
}

/// Poll `pred` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}
