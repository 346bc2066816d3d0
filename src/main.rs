//! scphost demo: attach to a simulated device and print its snapshot.
//!
//! ```text
//! scphost [config.json] [--fresh]
//!
//!   config.json   DriverConfig overrides (missing keys keep defaults)
//!   --fresh       start with no bootable firmware; runs FWU → CPK → MAB
//! ```
//!
//! Log level comes from `RUST_LOG` (default `info`).

use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use scphost::firmware::MemoryFirmwareSource;
use scphost::service::ras::RegisterMap;
use scphost::sim::SimDevice;
use scphost::{Device, DeviceState, DriverConfig};

const DEMO_FIRMWARE_VERSION: u32 = 0x0001_0400;

fn load_config(path: Option<&str>) -> Result<DriverConfig> {
    let Some(path) = path else {
        return Ok(DriverConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let config: DriverConfig =
        serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
    Ok(config)
}

fn main() -> Result<()> {
    // ── 1. Logging ────────────────────────────────────────────
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("╔══════════════════════════════════════╗");
    info!("║  scphost v{}                      ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 2. Configuration ──────────────────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    let fresh = args.iter().any(|a| a == "--fresh");
    let path = args.iter().find(|a| !a.starts_with("--")).map(String::as_str);
    let config = load_config(path)?;
    config.validate().context("invalid configuration")?;

    // ── 3. Simulated device ───────────────────────────────────
    let sim = SimDevice::new();
    sim.set_needs_firmware(fresh);

    let device = Device::builder(sim.transport())
        .config(config)
        .reset_control(sim.reset_line())
        .firmware(MemoryFirmwareSource::complete(DEMO_FIRMWARE_VERSION))
        .attach()
        .context("attach failed")?;

    // ── 4. Bring-up ───────────────────────────────────────────
    let state = device
        .link()
        .wait_until(
            |s| matches!(s, DeviceState::Active | DeviceState::Lost | DeviceState::Panic),
            Duration::from_secs(10),
        )
        .context("device did not come up")?;
    info!("Device settled in {}", state);

    // ── 5. Register access ────────────────────────────────────
    if state == DeviceState::Active {
        let ras = device.link().ras()?;
        ras.write_reg(0x100, 0xC0FF_EE00)?;
        info!("RAS readback: {:#010x}", ras.read_reg(0x100)?);
    }

    // ── 6. Report and detach ──────────────────────────────────
    println!("{}", device.snapshot().to_json()?);
    device.shutdown()?;
    Ok(())
}
