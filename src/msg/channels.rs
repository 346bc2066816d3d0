//! Inter-task communication primitives.
//!
//! Uses `embassy-sync` bounded channels and signals to bridge the adapter's
//! data-ready callback, application callers and the maintenance task with
//! the single protocol worker.
//!
//! ```text
//! ┌──────────────┐ WorkerEvent ┌──────────────┐ CompletionSignal ┌────────────┐
//! │ data-ready / │────────────▶│   Worker     │─────────────────▶│ send_sync  │
//! │ send / timer │             │ (protocol)   │  Callback        │ send_async │
//! └──────────────┘             └──────────────┘─────────────────▶└────────────┘
//! ```

use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use crate::error::Result;
use crate::fsm::DeviceState;

use super::message::Message;

/// Work items for the protocol worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The adapter raised data-ready; drain the RX FIFO.
    DataReady,
    /// A command was queued; try to put it on the bus.
    Pump,
    /// Watchdog period elapsed.
    WatchdogTick,
    /// Leave the event loop.
    Shutdown,
}

/// Channel depth for worker events. Events coalesce: every event drains RX
/// and pumps, so a dropped event on a full channel loses no work.
pub const EVENT_DEPTH: usize = 32;

/// Inbound work for the protocol worker.
pub type EventChannel = Channel<CriticalSectionRawMutex, WorkerEvent, EVENT_DEPTH>;

/// One-shot completion handle a blocked `send_sync` caller waits on.
pub type CompletionSignal = Signal<CriticalSectionRawMutex, Result<Message>>;

/// Wake-up for the maintenance task.
pub type WakeSignal = Signal<CriticalSectionRawMutex, ()>;

/// Boot outcome reported by notification handlers while the maintenance
/// task waits after a reset.
pub type BootSignal = Signal<CriticalSectionRawMutex, DeviceState>;

/// Asynchronous completion callback.
pub type Callback = Box<dyn FnOnce(Result<Message>) + Send>;

/// How a finished command reports back to its originator.
pub enum Completion {
    /// Wake a caller blocked in `send_sync`.
    Blocking(Arc<CompletionSignal>),
    /// Invoke a `send_async` callback.
    Callback(Callback),
    /// Fire-and-forget; the outcome is only logged.
    Detached,
}

impl Completion {
    /// Hand the outcome to the originator. Must run without the queue lock
    /// held: callbacks may queue follow-up commands.
    pub fn deliver(self, outcome: Result<Message>) {
        match self {
            Self::Blocking(signal) => signal.signal(outcome),
            Self::Callback(cb) => cb(outcome),
            Self::Detached => {
                if let Err(e) = outcome {
                    log::debug!("MSG: detached command finished with {}", e);
                }
            }
        }
    }
}

impl core::fmt::Debug for Completion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("Blocking"),
            Self::Callback(_) => f.write_str("Callback"),
            Self::Detached => f.write_str("Detached"),
        }
    }
}
