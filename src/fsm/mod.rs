//! Device lifecycle state machine.
//!
//! ```text
//!  INACTIVE ──[reset + boot]──▶ BOOTLOADER_{BEGIN,FWU,CPK,MAB} ──▶ BOOTLOADER_WFR
//!     ▲  │                                   ▲                          │
//!     │  │                                   └──────[next request]──────┤
//!     │  │                                                              │
//!     │  └──[app ready]──▶ ENUMERATING ◀──────────[MAB, no reset]───────┤
//!     │                       │                                         │
//!     └───────────────────────┼──────────────[MAB, reset required]──────┘
//!                             ▼
//!                          ACTIVE ──▶ STOPPING ──▶ STOPPED
//!
//!  any ──[panic notification]──▶ PANIC        any ──[fatal]──▶ LOST
//! ```
//!
//! [`StateMachine`] only validates and records transitions. The actions
//! bound to each state live in [`states`] and are driven by the
//! [`maintenance`] thread.

pub mod maintenance;
pub mod states;

use heapless::Deque;
use log::{info, warn};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::reset::ResetKind;

/// Transitions kept for diagnostics.
pub const HISTORY_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum DeviceState {
    Inactive = 0,
    BootloaderBegin = 1,
    BootloaderFwu = 2,
    BootloaderCpk = 3,
    BootloaderMab = 4,
    BootloaderWfr = 5,
    Enumerating = 6,
    Active = 7,
    Stopping = 8,
    Stopped = 9,
    Panic = 10,
    Lost = 11,
}

impl DeviceState {
    /// Total number of states; sizes the action table.
    pub const COUNT: usize = 12;

    /// Convert an index back to a state. Out-of-range maps to `Lost`.
    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => Self::Inactive,
            1 => Self::BootloaderBegin,
            2 => Self::BootloaderFwu,
            3 => Self::BootloaderCpk,
            4 => Self::BootloaderMab,
            5 => Self::BootloaderWfr,
            6 => Self::Enumerating,
            7 => Self::Active,
            8 => Self::Stopping,
            9 => Self::Stopped,
            10 => Self::Panic,
            11 => Self::Lost,
            _ => {
                debug_assert!(false, "invalid state index: {idx}");
                Self::Lost
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Inactive => "INACTIVE",
            Self::BootloaderBegin => "BOOTLOADER_BEGIN",
            Self::BootloaderFwu => "BOOTLOADER_FWU",
            Self::BootloaderCpk => "BOOTLOADER_CPK",
            Self::BootloaderMab => "BOOTLOADER_MAB",
            Self::BootloaderWfr => "BOOTLOADER_WFR",
            Self::Enumerating => "ENUMERATING",
            Self::Active => "ACTIVE",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Panic => "PANIC",
            Self::Lost => "LOST",
        }
    }

    pub fn is_bootloader(self) -> bool {
        matches!(
            self,
            Self::BootloaderBegin
                | Self::BootloaderFwu
                | Self::BootloaderCpk
                | Self::BootloaderMab
                | Self::BootloaderWfr
        )
    }

    /// Whether host commands may be queued in this state.
    pub fn accepts_commands(self) -> bool {
        !matches!(self, Self::Stopped | Self::Panic | Self::Lost)
    }
}

impl core::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `from → to` is a normal (non-forced) transition.
pub fn is_allowed(from: DeviceState, to: DeviceState) -> bool {
    use DeviceState::{
        Active, BootloaderBegin, BootloaderCpk, BootloaderFwu, BootloaderMab, BootloaderWfr,
        Enumerating, Inactive, Lost, Panic, Stopped, Stopping,
    };
    match (from, to) {
        (Inactive, BootloaderBegin | BootloaderFwu | BootloaderCpk | BootloaderMab) => true,
        (Inactive, Enumerating) => true,
        (BootloaderBegin, Inactive) => true,
        (BootloaderFwu | BootloaderCpk | BootloaderMab, BootloaderWfr) => true,
        (
            BootloaderWfr,
            BootloaderBegin | BootloaderFwu | BootloaderCpk | BootloaderMab | Enumerating
            | Inactive,
        ) => true,
        (Enumerating, Active | Inactive) => true,
        (Active, Stopping) => true,
        (Stopping, Stopped) => true,
        (s, Lost) => !matches!(s, Lost | Stopped | Panic),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// One recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub seq: u32,
    pub from: DeviceState,
    pub to: DeviceState,
    pub forced: bool,
}

pub struct StateMachine {
    current: DeviceState,
    history: Deque<Transition, HISTORY_DEPTH>,
    seq: u32,
    next_reset: ResetKind,
    boot_attempts: u8,
    transfer_failures: u8,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: DeviceState::Inactive,
            history: Deque::new(),
            seq: 0,
            next_reset: ResetKind::Normal,
            boot_attempts: 0,
            transfer_failures: 0,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.current
    }

    /// Validated transition. Staying in the current state is a no-op.
    pub fn transition(&mut self, to: DeviceState) -> Result<()> {
        if to == self.current {
            return Ok(());
        }
        if !is_allowed(self.current, to) {
            return Err(Error::InvalidTransition {
                from: self.current,
                to,
            });
        }
        info!("FSM transition: {} -> {}", self.current, to);
        self.record(to, false);
        Ok(())
    }

    /// Transition requested by a state action.
    ///
    /// Nothing leaves PANIC this way. LOST is forced from any state that is
    /// not already terminal; the check and the change share one lock.
    pub fn advance(&mut self, to: DeviceState) -> Result<()> {
        let from = self.current;
        if from == DeviceState::Panic && to != DeviceState::Panic {
            return Err(Error::InvalidTransition { from, to });
        }
        if to == DeviceState::Lost && from != DeviceState::Lost {
            if !is_allowed(from, to) {
                return Err(Error::InvalidTransition { from, to });
            }
            self.force(to);
            return Ok(());
        }
        self.transition(to)
    }

    /// Unconditional transition (panic, lost, operator reset).
    pub fn force(&mut self, to: DeviceState) {
        if to == self.current {
            return;
        }
        warn!("FSM forced: {} -> {}", self.current, to);
        self.record(to, true);
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Select the kind of the next reset pulse.
    pub fn arm_reset(&mut self, kind: ResetKind) {
        self.next_reset = kind;
    }

    /// Consume the armed reset kind; later resets default to normal.
    pub fn take_reset(&mut self) -> ResetKind {
        core::mem::replace(&mut self.next_reset, ResetKind::Normal)
    }

    pub fn armed_reset(&self) -> ResetKind {
        self.next_reset
    }

    /// Count a boot wait that ended without a boot notification.
    pub fn note_silent_boot(&mut self) -> u8 {
        self.boot_attempts = self.boot_attempts.saturating_add(1);
        self.boot_attempts
    }

    pub fn note_boot(&mut self) {
        self.boot_attempts = 0;
    }

    /// Count a rejected artifact transfer.
    pub fn note_transfer_failure(&mut self) -> u8 {
        self.transfer_failures = self.transfer_failures.saturating_add(1);
        self.transfer_failures
    }

    pub fn note_transfer(&mut self) {
        self.transfer_failures = 0;
    }

    fn record(&mut self, to: DeviceState, forced: bool) {
        if self.history.is_full() {
            self.history.pop_front();
        }
        self.seq = self.seq.wrapping_add(1);
        let _ = self.history.push_back(Transition {
            seq: self.seq,
            from: self.current,
            to,
            forced,
        });
        self.current = to;
    }
}
