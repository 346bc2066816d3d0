//! Message protocol engine.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     Message Stack                          │
//! │                                                            │
//! │  ┌───────────┐   ┌──────────┐   ┌────────────────────────┐ │
//! │  │ Transport │──▶│  Codec   │──▶│ Queue (on_reply)       │ │
//! │  │ (trait)   │   │ (framing)│   │ Registry (dispatch)    │ │
//! │  └───────────┘   └──────────┘   └────────────────────────┘ │
//! │       ▲                                    │               │
//! │       │              ┌─────────────────────┘               │
//! │       │              ▼                                     │
//! │  ┌───────────┐   ┌──────────┐                              │
//! │  │ Transport │◀──│  Queue   │   (one command on the bus)   │
//! │  │ (write)   │   │  (pump)  │                              │
//! │  └───────────┘   └──────────┘                              │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod channels;
pub mod codec;
pub mod message;
pub mod queue;
pub mod transport;
pub(crate) mod worker;

pub use message::{Body, Cran, Header, Message, MessageId, MessageState};
pub use transport::{DataReadyHook, NullTransport, Transport};
