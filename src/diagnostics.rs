//! Panic capture and runtime diagnostics.
//!
//! The device's crash record arrives as the bulk payload of a PANIC
//! notification; the first `PANIC_CAPTURE` bytes are kept for post-mortem.
//! Everything else in the snapshot is collected on demand from the queue,
//! registry and state machine.

use log::error;
use serde::Serialize;

use crate::error::Error;
use crate::firmware::ArtifactFingerprint;
use crate::fsm::{DeviceState, Transition};
use crate::msg::MessageState;
use crate::msg::queue::{HistoryEntry, QueueStats};
use crate::reset::ResetKind;
use crate::service::SlotInfo;

pub const PANIC_CAPTURE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanicRecord {
    /// State the device was in when the panic arrived.
    pub state: DeviceState,
    /// Device-defined reason word.
    pub reason: u32,
    pub payload: heapless::Vec<u8, PANIC_CAPTURE>,
    /// Payload bytes beyond the capture window.
    pub dropped: usize,
}

impl PanicRecord {
    pub fn new(state: DeviceState, reason: u32, payload: &[u8]) -> Self {
        let kept = payload.len().min(PANIC_CAPTURE);
        let mut buf = heapless::Vec::new();
        let _ = buf.extend_from_slice(&payload[..kept]);
        Self {
            state,
            reason,
            payload: buf,
            dropped: payload.len() - kept,
        }
    }
}

/// Mutable diagnostics behind their own lock.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    pub panic: Option<PanicRecord>,
    pub last_error: Option<Error>,
    pub error_count: u32,
    pub resets: u32,
    /// Resets caused by a command timing out in ACTIVE.
    pub timeout_resets: u32,
    pub fingerprints: heapless::Vec<ArtifactFingerprint, 3>,
}

impl Diagnostics {
    pub fn record_error(&mut self, e: Error) {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(e);
    }

    /// Keep the latest fingerprint per artifact kind.
    pub fn record_fingerprint(&mut self, fp: ArtifactFingerprint) {
        if let Some(slot) = self.fingerprints.iter_mut().find(|f| f.kind == fp.kind) {
            *slot = fp;
        } else {
            let _ = self.fingerprints.push(fp);
        }
    }
}

/// Read-only view of one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub instance_id: u32,
    pub state: DeviceState,
    pub services: Vec<SlotInfo>,
    pub unhandled: u32,
    pub queued: usize,
    pub in_flight: Option<MessageState>,
    pub stats: QueueStats,
    pub recent: Vec<HistoryEntry>,
    pub transitions: Vec<Transition>,
    pub armed_reset: ResetKind,
    pub resets: u32,
    pub timeout_resets: u32,
    pub panic: Option<PanicRecord>,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub fingerprints: Vec<ArtifactFingerprint>,
}

impl DeviceSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Compact form for shipping off-host.
    pub fn to_postcard(&self) -> postcard::Result<Vec<u8>> {
        postcard::to_allocvec(self)
    }

    /// Log the snapshot at error level.
    pub fn dump(&self) {
        match self.to_json() {
            Ok(json) => error!("DIAG: device {} snapshot:\n{}", self.instance_id, json),
            Err(e) => error!("DIAG: snapshot encoding failed: {}", e),
        }
    }
}
