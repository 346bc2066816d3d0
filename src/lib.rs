//! Host driver for a companion secure-processor.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Device / DeviceLink                       │
//! │                                                                  │
//! │   send_sync / send_async        register_service   ras()         │
//! │            │                           │             │           │
//! │  ┌─────────▼─────────┐     ┌───────────▼──────────┐  │           │
//! │  │  msg worker       │────▶│  service registry    │◀─┘           │
//! │  │  queue · codec    │     │  system · bootloader │              │
//! │  │  watchdog         │     │  ras · (families)    │              │
//! │  └─────────┬─────────┘     └───────────┬──────────┘              │
//! │            │                           │ boot / panic signals    │
//! │  ┌─────────▼─────────┐     ┌───────────▼──────────┐              │
//! │  │  Transport (FIFO) │     │  maintenance (fsm)   │── reset ──▶  │
//! │  └───────────────────┘     └──────────────────────┘              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The bus adapter and the reset lines are supplied by the integrator;
//! [`sim`] provides both for tests and the demo binary.

#![deny(unused_must_use)]

pub mod config;
pub mod device;
pub mod diagnostics;
pub mod enumerate;
pub mod error;
pub mod firmware;
pub mod fsm;
pub mod msg;
pub mod reset;
pub mod service;
pub mod sim;

pub use config::DriverConfig;
pub use device::{Device, DeviceBuilder, DeviceLink};
pub use diagnostics::DeviceSnapshot;
pub use error::{Error, ErrorCode, Result};
pub use fsm::DeviceState;
pub use msg::{Message, MessageId, MessageState, Transport};
pub use reset::{ResetControl, ResetKind};
pub use service::ras::RegisterMap;
pub use service::{Service, ServiceHandle, ServiceType, SlotInfo, Version};
