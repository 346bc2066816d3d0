//! Message model shared by the codec, the queue and the services.

use serde::Serialize;

use crate::error::ErrorCode;

/// Highest addressable service instance.
pub const MAX_INSTANCE: u8 = 31;

/// Two-bit classification of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Cran {
    Command = 0,
    Response = 1,
    Ack = 2,
    Notification = 3,
}

impl Cran {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Command,
            1 => Self::Response,
            2 => Self::Ack,
            _ => Self::Notification,
        }
    }
}

/// What follows the first four header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// Two inline argument words; nothing follows the header.
    Inline([u32; 2]),
    /// `size` payload bytes follow the header; one inline word remains.
    Bulk { size: u32, arg: u32 },
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub instance: u8,
    pub cran: Cran,
    pub message_id: u8,
    /// Only carried on the wire for [`Cran::Response`].
    pub error: ErrorCode,
    pub body: Body,
}

impl Header {
    pub fn is_bulk(&self) -> bool {
        matches!(self.body, Body::Bulk { .. })
    }

    pub fn bulk_size(&self) -> u32 {
        match self.body {
            Body::Bulk { size, .. } => size,
            Body::Inline(_) => 0,
        }
    }

    /// First inline word, or the bulk variant's remaining argument.
    pub fn arg0(&self) -> u32 {
        match self.body {
            Body::Inline([a, _]) => a,
            Body::Bulk { arg, .. } => arg,
        }
    }

    /// Second inline word (zero for bulk variants).
    pub fn arg1(&self) -> u32 {
        match self.body {
            Body::Inline([_, b]) => b,
            Body::Bulk { .. } => 0,
        }
    }
}

/// A header plus its bulk payload, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Inline command with two argument words.
    pub fn command(instance: u8, message_id: u8, args: [u32; 2]) -> Self {
        Self {
            header: Header {
                instance,
                cran: Cran::Command,
                message_id,
                error: ErrorCode::NONE,
                body: Body::Inline(args),
            },
            payload: Vec::new(),
        }
    }

    /// Bulk command; `arg` travels in the header next to the bulk size.
    pub fn bulk_command(instance: u8, message_id: u8, arg: u32, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                instance,
                cran: Cran::Command,
                message_id,
                error: ErrorCode::NONE,
                body: Body::Bulk {
                    size: payload.len() as u32,
                    arg,
                },
            },
            payload,
        }
    }

    /// Inline response, as the device would produce it.
    pub fn response(instance: u8, message_id: u8, error: ErrorCode, args: [u32; 2]) -> Self {
        Self {
            header: Header {
                instance,
                cran: Cran::Response,
                message_id,
                error,
                body: Body::Inline(args),
            },
            payload: Vec::new(),
        }
    }

    /// Bulk response carrying `payload`.
    pub fn bulk_response(instance: u8, message_id: u8, arg: u32, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                instance,
                cran: Cran::Response,
                message_id,
                error: ErrorCode::NONE,
                body: Body::Bulk {
                    size: payload.len() as u32,
                    arg,
                },
            },
            payload,
        }
    }

    pub fn ack(instance: u8, message_id: u8) -> Self {
        Self {
            header: Header {
                instance,
                cran: Cran::Ack,
                message_id,
                error: ErrorCode::NONE,
                body: Body::Inline([0, 0]),
            },
            payload: Vec::new(),
        }
    }

    pub fn notification(instance: u8, message_id: u8, args: [u32; 2]) -> Self {
        Self {
            header: Header {
                instance,
                cran: Cran::Notification,
                message_id,
                error: ErrorCode::NONE,
                body: Body::Inline(args),
            },
            payload: Vec::new(),
        }
    }

    pub fn bulk_notification(instance: u8, message_id: u8, arg: u32, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                instance,
                cran: Cran::Notification,
                message_id,
                error: ErrorCode::NONE,
                body: Body::Bulk {
                    size: payload.len() as u32,
                    arg,
                },
            },
            payload,
        }
    }

    pub fn instance(&self) -> u8 {
        self.header.instance
    }

    pub fn message_id(&self) -> u8 {
        self.header.message_id
    }

    pub fn cran(&self) -> Cran {
        self.header.cran
    }
}

/// Lifecycle of a host-originated command once it has been queued.
///
/// A freshly built [`Message`] is the created state: it has no
/// [`MessageId`] until `enqueue` accepts it.
///
/// ```text
/// Message ─[enqueue]─▶ Queued ─▶ Sent ─────────────────▶ Completed ─▶ Released
///                                 └▶ AwaitingBulkAck ─[ACK]─▶ Sent
///   any non-terminal ──[purge]──▶ Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageState {
    Queued,
    Sent,
    AwaitingBulkAck,
    Completed,
    Released,
    Cancelled,
}

impl MessageState {
    /// Whether the message currently owns the physical link.
    pub fn on_bus(self) -> bool {
        matches!(self, Self::Sent | Self::AwaitingBulkAck)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Cancelled)
    }
}

/// Monotonic identifier handed back by `send_async`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MessageId(pub u64);
