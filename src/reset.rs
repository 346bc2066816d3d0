//! Reset and boot-select line control.
//!
//! The device samples its boot-select line on the rising edge of reset:
//! held high it enters the bootloader for a firmware update, low it boots
//! whatever is in flash.
//!
//! ## Dual-target design
//!
//! On a board: [`GpioReset`] drives real pins through `embedded-hal` 1.0.
//! On host/test: the simulated device implements [`ResetControl`] itself,
//! and [`NoopReset`] stands in where no line is wired.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResetKind {
    /// Boot from flash.
    Normal,
    /// Boot into the bootloader and expect artifact requests.
    FirmwareUpdate,
}

/// Something that can pulse the device's reset line.
pub trait ResetControl: Send {
    fn reset(&mut self, kind: ResetKind) -> Result<()>;
}

/// Reset line not wired; the device is reset out of band.
pub struct NoopReset;

impl ResetControl for NoopReset {
    fn reset(&mut self, _kind: ResetKind) -> Result<()> {
        Ok(())
    }
}

/// Active-low reset plus an active-high boot-select line.
pub struct GpioReset<R, B, D> {
    reset: R,
    boot_select: B,
    delay: D,
    pulse_ms: u32,
    settle_ms: u32,
}

impl<R: OutputPin, B: OutputPin, D: DelayNs> GpioReset<R, B, D> {
    pub fn new(reset: R, boot_select: B, delay: D, pulse_ms: u32, settle_ms: u32) -> Self {
        Self {
            reset,
            boot_select,
            delay,
            pulse_ms,
            settle_ms,
        }
    }

    /// Release both lines and hand the pins back.
    pub fn release(self) -> (R, B, D) {
        (self.reset, self.boot_select, self.delay)
    }
}

impl<R, B, D> ResetControl for GpioReset<R, B, D>
where
    R: OutputPin + Send,
    B: OutputPin + Send,
    D: DelayNs + Send,
{
    fn reset(&mut self, kind: ResetKind) -> Result<()> {
        let select = match kind {
            ResetKind::FirmwareUpdate => self.boot_select.set_high(),
            ResetKind::Normal => self.boot_select.set_low(),
        };
        select.map_err(|_| Error::Reset)?;

        self.reset.set_low().map_err(|_| Error::Reset)?;
        self.delay.delay_ms(self.pulse_ms);
        self.reset.set_high().map_err(|_| Error::Reset)?;
        self.delay.delay_ms(self.settle_ms);

        // Boot-select is only sampled at the edge.
        self.boot_select.set_low().map_err(|_| Error::Reset)
    }
}
