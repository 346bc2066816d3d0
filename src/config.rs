//! Driver configuration parameters
//!
//! All tunable parameters for one attached device. Values can be loaded
//! from a JSON file by the host binary; everything else uses the defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::firmware::ArtifactKind;
use crate::msg::queue::SEND_QUEUE_CAPACITY;

/// Core driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    // --- Link ---
    /// Largest bulk payload the device accepts in one transaction (bytes)
    pub max_transaction_size: u32,
    /// Commands allowed to wait behind the one on the bus
    pub send_queue_depth: usize,

    // --- Watchdog ---
    /// Watchdog tick period (milliseconds)
    pub watchdog_interval_ms: u32,
    /// Idle ticks with no RX activity before the bus owner times out
    pub watchdog_threshold: u32,

    // --- Reset / boot ---
    /// Reset line assertion time (milliseconds)
    pub reset_pulse_ms: u32,
    /// Delay after releasing reset before the boot-select line drops (milliseconds)
    pub boot_settle_ms: u32,
    /// How long to wait for a boot notification after reset (milliseconds)
    pub boot_timeout_ms: u32,
    /// Consecutive silent boots before the device is declared lost
    pub boot_retries: u8,

    // --- Register access ---
    /// Maximum RAS fragment payload (bytes)
    pub ras_fragment_size: usize,

    // --- Firmware ---
    /// Directory holding the bootloader artifacts
    pub firmware_dir: String,
    pub fwu_file: String,
    pub cpk_file: String,
    pub mab_file: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            // Link
            max_transaction_size: 4096,
            send_queue_depth: 16,

            // Watchdog
            watchdog_interval_ms: 100, // 10 Hz
            watchdog_threshold: 20,    // 2 s without RX

            // Reset / boot
            reset_pulse_ms: 10,
            boot_settle_ms: 20,
            boot_timeout_ms: 2000,
            boot_retries: 3,

            // Register access
            ras_fragment_size: 960,

            // Firmware
            firmware_dir: String::from("/lib/firmware/scp"),
            fwu_file: String::from("scp_fwu.bin"),
            cpk_file: String::from("scp_cpk.bin"),
            mab_file: String::from("scp_mab.bin"),
        }
    }
}

impl DriverConfig {
    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.send_queue_depth == 0 || self.send_queue_depth > SEND_QUEUE_CAPACITY {
            return Err(Error::Config("send_queue_depth must be 1..=32"));
        }
        if self.watchdog_interval_ms == 0 || self.watchdog_threshold == 0 {
            return Err(Error::Config("watchdog interval and threshold must be non-zero"));
        }
        if self.ras_fragment_size == 0 || self.ras_fragment_size % 4 != 0 {
            return Err(Error::Config("ras_fragment_size must be a non-zero multiple of 4"));
        }
        if self.ras_fragment_size > self.max_transaction_size as usize {
            return Err(Error::Config("ras_fragment_size exceeds max_transaction_size"));
        }
        if self.boot_timeout_ms == 0 {
            return Err(Error::Config("boot_timeout_ms must be non-zero"));
        }
        Ok(())
    }

    /// File name configured for an artifact.
    pub fn artifact_file(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Fwu => &self.fwu_file,
            ArtifactKind::Cpk => &self.cpk_file,
            ArtifactKind::Mab => &self.mab_file,
        }
    }
}
