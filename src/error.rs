//! Unified error types for the host link.
//!
//! A single `Error` enum that every subsystem converts into, so callers of
//! `send_sync`, the register map and the lifecycle controller all handle one
//! type. All variants are `Copy` so they can be handed to completion
//! callbacks and stored in diagnostics without allocation.

use core::fmt;

use crate::firmware::ArtifactKind;
use crate::fsm::DeviceState;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Framing desync or a message that violates the wire protocol.
    Protocol(ProtocolError),
    /// The transport adapter reported a failure.
    Transport(TransportError),
    /// A firmware artifact could not be validated or delivered.
    Bootloader(BootloaderError),
    /// The device answered with a non-`NONE` error code.
    Device(ErrorCode),
    /// The send queue is at capacity.
    Busy,
    /// No response arrived before the watchdog threshold.
    Timeout,
    /// The message was purged before completion.
    Cancelled,
    /// Generic I/O failure surfaced to register-map callers.
    Io,
    /// The handle does not match the current slot occupant.
    NotRegistered,
    /// No service of the requested family is registered.
    NoSuchService,
    /// A service's start hook failed; the slot was left empty.
    ServiceStart(u8),
    /// The operation is not permitted in the current device state.
    InvalidState(DeviceState),
    /// The state machine refused a transition.
    InvalidTransition { from: DeviceState, to: DeviceState },
    /// A caller-supplied argument is out of range.
    InvalidArgument(&'static str),
    /// Configuration is inconsistent.
    Config(&'static str),
    /// The reset or boot-select line could not be driven.
    Reset,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Bootloader(e) => write!(f, "bootloader: {e}"),
            Self::Device(code) => write!(f, "device error: {code}"),
            Self::Busy => write!(f, "send queue full"),
            Self::Timeout => write!(f, "timed out waiting for device"),
            Self::Cancelled => write!(f, "message cancelled"),
            Self::Io => write!(f, "I/O error"),
            Self::NotRegistered => write!(f, "service handle not registered"),
            Self::NoSuchService => write!(f, "no such service"),
            Self::ServiceStart(instance) => write!(f, "service {instance} failed to start"),
            Self::InvalidState(state) => write!(f, "not permitted in state {state:?}"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid transition {from:?} -> {to:?}")
            }
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Reset => write!(f, "reset line failure"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Protocol violations
// ---------------------------------------------------------------------------

/// Wire-level violations. These indicate framing desync: the offending
/// message is logged and dropped, the link stays up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than the fixed header.
    MalformedHeader,
    /// Service instance outside 0..=31.
    InvalidInstance(u8),
    /// Bulk size exceeds the negotiated maximum transaction size.
    OversizedBulk(u32),
    /// Bulk payload length disagrees with the header's bulk size.
    BulkLengthMismatch { declared: u32, actual: usize },
    /// RESPONSE or ACK that correlates with nothing on the bus.
    UnexpectedReply { instance: u8, message_id: u8 },
    /// Message addressed to an instance with no registered service.
    UnregisteredInstance(u8),
    /// The host only originates commands.
    NotACommand,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedHeader => write!(f, "malformed header"),
            Self::InvalidInstance(i) => write!(f, "invalid service instance {i}"),
            Self::OversizedBulk(size) => write!(f, "bulk size {size} exceeds maximum"),
            Self::BulkLengthMismatch { declared, actual } => {
                write!(f, "bulk size {declared} but {actual} payload bytes")
            }
            Self::UnexpectedReply {
                instance,
                message_id,
            } => write!(f, "unexpected reply {instance}:{message_id:#04x}"),
            Self::UnregisteredInstance(i) => write!(f, "no service at instance {i}"),
            Self::NotACommand => write!(f, "host may only send commands"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// FIFO write failed.
    WriteFailed,
    /// FIFO read failed.
    ReadFailed,
    /// The adapter is not attached to a bus.
    Disconnected,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteFailed => write!(f, "FIFO write failed"),
            Self::ReadFailed => write!(f, "FIFO read failed"),
            Self::Disconnected => write!(f, "adapter disconnected"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Bootloader errors
// ---------------------------------------------------------------------------

/// Bootloader failures abort the current artifact transfer only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderError {
    /// The firmware source has no file for this artifact.
    ArtifactUnavailable(ArtifactKind),
    /// The file is shorter than the artifact header.
    Truncated { len: usize },
    /// The header magic is not `0x42554c43`.
    BadMagic(u32),
    /// The header's type tag does not match the requested artifact.
    TypeMismatch { expected: ArtifactKind, found: [u8; 4] },
    /// The artifact body is larger than one bulk transaction.
    TooLarge { len: usize },
    /// The device rejected the transfer.
    Rejected(ErrorCode),
}

impl fmt::Display for BootloaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArtifactUnavailable(kind) => write!(f, "{kind:?} artifact unavailable"),
            Self::Truncated { len } => write!(f, "artifact truncated ({len} bytes)"),
            Self::BadMagic(magic) => write!(f, "bad artifact magic {magic:#010x}"),
            Self::TypeMismatch { expected, found } => write!(
                f,
                "artifact type {:?} does not match request {expected:?}",
                String::from_utf8_lossy(found)
            ),
            Self::TooLarge { len } => write!(f, "artifact body too large ({len} bytes)"),
            Self::Rejected(code) => write!(f, "device rejected transfer: {code}"),
        }
    }
}

impl From<BootloaderError> for Error {
    fn from(e: BootloaderError) -> Self {
        Self::Bootloader(e)
    }
}

// ---------------------------------------------------------------------------
// Device error codes
// ---------------------------------------------------------------------------

/// Raw error code carried in byte 2 of a RESPONSE header.
///
/// The device defines a large enum; the host only names the codes it acts on
/// and classifies the rest by range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ErrorCode(pub u8);

impl ErrorCode {
    pub const NONE: Self = Self(0x00);

    // Protocol (0x01..=0x1f)
    pub const INVALID_SERVICE_INSTANCE: Self = Self(0x01);
    pub const INVALID_MESSAGE_ID: Self = Self(0x02);
    pub const INVALID_CRAN: Self = Self(0x03);
    pub const INVALID_BULK: Self = Self(0x04);
    pub const INVALID_PARAMETER: Self = Self(0x05);

    // Resource (0x20..=0x3f)
    pub const NO_MEMORY: Self = Self(0x20);
    pub const BUFFER_TOO_SMALL: Self = Self(0x21);
    pub const BUSY: Self = Self(0x22);

    // Transport (0x40..=0x5f)
    pub const IO: Self = Self(0x40);
    pub const TIMEOUT: Self = Self(0x41);

    // Bootloader (0x60..=0x7f)
    pub const AUTH_FAILED: Self = Self(0x60);
    pub const FLASH_ERROR: Self = Self(0x61);
    pub const VERSION_MISMATCH: Self = Self(0x62);
    pub const BAD_ARTIFACT: Self = Self(0x63);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Coarse classification used to pick a recovery policy.
    pub fn class(self) -> ErrorClass {
        match self.0 {
            0x00 => ErrorClass::None,
            0x01..=0x1f => ErrorClass::Protocol,
            0x20..=0x3f => ErrorClass::Resource,
            0x40..=0x5f => ErrorClass::Transport,
            0x60..=0x7f => ErrorClass::Bootloader,
            _ => ErrorClass::Service,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NONE => "none",
            Self::INVALID_SERVICE_INSTANCE => "invalid service instance",
            Self::INVALID_MESSAGE_ID => "invalid message id",
            Self::INVALID_CRAN => "invalid CRAN",
            Self::INVALID_BULK => "invalid bulk flag",
            Self::INVALID_PARAMETER => "invalid parameter",
            Self::NO_MEMORY => "out of memory",
            Self::BUFFER_TOO_SMALL => "buffer too small",
            Self::BUSY => "busy",
            Self::IO => "I/O error",
            Self::TIMEOUT => "timeout",
            Self::AUTH_FAILED => "authentication failed",
            Self::FLASH_ERROR => "flash error",
            Self::VERSION_MISMATCH => "version mismatch",
            Self::BAD_ARTIFACT => "bad artifact",
            _ => return write!(f, "{:?} error {:#04x}", self.class(), self.0),
        };
        write!(f, "{name} ({:#04x})", self.0)
    }
}

/// Error taxonomy the recovery policy is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    None,
    Protocol,
    Resource,
    Transport,
    Bootloader,
    Service,
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
