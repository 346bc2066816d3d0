//! Transport abstraction: the device's TX/RX FIFO pair.
//!
//! Concrete implementations live outside this crate:
//! - SPI control port
//! - I2C control port
//! - USB bridge
//!
//! The engine only needs FIFO writes, FIFO reads and an edge-triggered
//! "data available" signal, so a new bus needs zero changes to the
//! protocol logic.

use std::sync::Arc;

use crate::error::TransportError;

/// Callback the adapter invokes when the device raises its data-ready line.
/// Runs in the adapter's interrupt/callback context; it only posts an event.
pub type DataReadyHook = Arc<dyn Fn() + Send + Sync>;

/// Byte-oriented FIFO channel to the device.
pub trait Transport: Send {
    /// Write a complete frame to the TX FIFO.
    fn transmit(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes from the RX FIFO.
    /// Returns the number of bytes read; 0 if the FIFO is empty.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Install the data-ready callback. Adapters without an interrupt line
    /// may ignore it; the worker also drains RX after every transmit.
    fn set_data_ready_hook(&mut self, hook: DataReadyHook) {
        let _ = hook;
    }
}

/// A null transport that discards all writes and never reads.
/// Useful as a placeholder before a bus adapter is bound.
pub struct NullTransport;

impl Transport for NullTransport {
    fn transmit(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn receive(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(0)
    }
}
