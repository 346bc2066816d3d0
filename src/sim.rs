//! In-process device model.
//!
//! Answers host frames the way the real chip does, closely enough to run
//! the whole lifecycle without hardware: boot notifications after reset,
//! the three-stage firmware download, enumeration and register access.
//!
//! ```text
//!  SimDevice ──┬── SimTransport (Transport)     host frames in, RX FIFO out
//!              └── SimReset     (ResetControl)  reset pulse → boot notification
//! ```
//!
//! Failure knobs: silent boots, a stalled command path or dropped
//! commands, an unplugged bus, a rejected download, a failing RAS address, an inflated
//! service count and injected panics.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::device::locked;
use crate::error::{ErrorCode, TransportError};
use crate::firmware::ArtifactKind;
use crate::msg::codec;
use crate::msg::{Cran, DataReadyHook, Message, Transport};
use crate::reset::{ResetControl, ResetKind};
use crate::service::{
    BOOTLOADER_INSTANCE, SYSTEM_INSTANCE, ServiceType, Version, bootloader, ras, system,
};

/// One RAS operation as the device saw it: opcode, address, payload bytes.
pub type RasAccess = (u8, u32, usize);

struct SimState {
    services: BTreeMap<u8, (ServiceType, Version)>,
    needs_firmware: bool,
    mab_reset_required: bool,
    silent_boots: u32,
    stalled: bool,
    drop_next: u32,
    disconnected: bool,
    reported_count: Option<u32>,
    reject_download: Option<ErrorCode>,
    ras_fail_at: Option<u32>,
    memory: BTreeMap<u32, u32>,
    ras_log: Vec<RasAccess>,
    commands: Vec<(u8, u8)>,
    downloads: Vec<(ArtifactKind, usize)>,
    resets: Vec<ResetKind>,
    rx: VecDeque<u8>,
    hook: Option<DataReadyHook>,
}

impl SimState {
    fn new() -> Self {
        let mut services = BTreeMap::new();
        services.insert(SYSTEM_INSTANCE, (ServiceType::SYSTEM, Version::new(1, 0, 0)));
        services.insert(
            BOOTLOADER_INSTANCE,
            (ServiceType::BOOTLOADER, Version::new(1, 0, 0)),
        );
        services.insert(2, (ServiceType::RAS, Version::new(1, 2, 0)));
        Self {
            services,
            needs_firmware: false,
            mab_reset_required: false,
            silent_boots: 0,
            stalled: false,
            drop_next: 0,
            disconnected: false,
            reported_count: None,
            reject_download: None,
            ras_fail_at: None,
            memory: BTreeMap::new(),
            ras_log: Vec::new(),
            commands: Vec::new(),
            downloads: Vec::new(),
            resets: Vec::new(),
            rx: VecDeque::new(),
            hook: None,
        }
    }

    fn push(&mut self, message: &Message) {
        match codec::encode_frame(message) {
            Ok(frame) => self.rx.extend(frame),
            Err(e) => debug!("SIM: cannot encode reply: {}", e),
        }
    }

    fn reply(&mut self, to: &Message, error: ErrorCode, args: [u32; 2]) {
        self.push(&Message::response(to.instance(), to.message_id(), error, args));
    }

    // ── Boot ─────────────────────────────────────────────────

    fn boot(&mut self, kind: ResetKind) {
        self.resets.push(kind);
        self.rx.clear();
        if self.silent_boots > 0 {
            self.silent_boots -= 1;
            debug!("SIM: silent boot");
            return;
        }
        let note = match kind {
            ResetKind::FirmwareUpdate => Message::notification(
                BOOTLOADER_INSTANCE,
                bootloader::NOTIFY_REQUEST_FWU,
                [0, 0],
            ),
            ResetKind::Normal if self.needs_firmware => Message::notification(
                BOOTLOADER_INSTANCE,
                bootloader::NOTIFY_NO_BOOTABLE_COMPONENT,
                [0, 0],
            ),
            ResetKind::Normal => {
                Message::notification(SYSTEM_INSTANCE, system::NOTIFY_APP_READY, [0, 0])
            }
        };
        self.push(&note);
    }

    // ── Commands ─────────────────────────────────────────────

    fn command(&mut self, message: &Message) {
        self.commands
            .push((message.instance(), message.message_id()));
        if self.stalled {
            trace!("SIM: stalled, dropping {}:{:#04x}", message.instance(), message.message_id());
            return;
        }
        if self.drop_next > 0 {
            self.drop_next -= 1;
            trace!("SIM: dropping {}:{:#04x}", message.instance(), message.message_id());
            return;
        }
        match self.services.get(&message.instance()).map(|(k, _)| *k) {
            Some(ServiceType::SYSTEM) => self.system(message),
            Some(ServiceType::BOOTLOADER) => self.bootloader(message),
            Some(ServiceType::RAS) => self.ras(message),
            Some(_) => self.reply(message, ErrorCode::INVALID_MESSAGE_ID, [0, 0]),
            None => self.reply(message, ErrorCode::INVALID_SERVICE_INSTANCE, [0, 0]),
        }
    }

    fn system(&mut self, m: &Message) {
        match m.message_id() {
            system::SYS_INFO => {
                let highest = self.services.keys().next_back().map_or(0, |&i| u32::from(i) + 1);
                let count = self.reported_count.unwrap_or(highest);
                self.reply(m, ErrorCode::NONE, [count, 0]);
            }
            system::SERVICE_INFO => {
                let instance = m.header.arg0();
                let found = u8::try_from(instance)
                    .ok()
                    .and_then(|i| self.services.get(&i).copied());
                match found {
                    Some((kind, version)) => {
                        self.reply(m, ErrorCode::NONE, [u32::from(kind.0), version.pack()]);
                    }
                    None => self.reply(m, ErrorCode::INVALID_SERVICE_INSTANCE, [0, 0]),
                }
            }
            system::SHUTDOWN => self.reply(m, ErrorCode::NONE, [0, 0]),
            _ => self.reply(m, ErrorCode::INVALID_MESSAGE_ID, [0, 0]),
        }
    }

    fn bootloader(&mut self, m: &Message) {
        if m.message_id() != bootloader::DOWNLOAD || !m.header.is_bulk() {
            self.reply(m, ErrorCode::INVALID_MESSAGE_ID, [0, 0]);
            return;
        }
        self.push(&Message::ack(m.instance(), m.message_id()));

        let Some(kind) = ArtifactKind::from_code(m.header.arg0()) else {
            self.reply(m, ErrorCode::INVALID_PARAMETER, [0, 0]);
            return;
        };
        if let Some(code) = self.reject_download.take() {
            self.reply(m, code, [0, 0]);
            return;
        }
        self.downloads.push((kind, m.payload.len()));

        let next = match kind {
            ArtifactKind::Fwu => Some(bootloader::NOTIFY_REQUEST_CPK),
            ArtifactKind::Cpk => Some(bootloader::NOTIFY_REQUEST_MAB),
            ArtifactKind::Mab => None,
        };
        match next {
            Some(id) => {
                self.reply(m, ErrorCode::NONE, [0, 0]);
                self.push(&Message::notification(BOOTLOADER_INSTANCE, id, [0, 0]));
            }
            None => {
                self.needs_firmware = false;
                let flags = if self.mab_reset_required {
                    bootloader::RESET_REQUIRED
                } else {
                    0
                };
                self.reply(m, ErrorCode::NONE, [flags, 0]);
            }
        }
    }

    fn ras(&mut self, m: &Message) {
        let addr = m.header.arg0();
        self.ras_log.push((m.message_id(), addr, m.payload.len()));
        if self.ras_fail_at == Some(addr) {
            self.reply(m, ErrorCode::IO, [0, 0]);
            return;
        }
        match m.message_id() {
            ras::READ_REG => {
                let value = self.memory.get(&addr).copied().unwrap_or(0);
                self.reply(m, ErrorCode::NONE, [value, 0]);
            }
            ras::WRITE_REG => {
                self.memory.insert(addr, m.header.arg1());
                self.reply(m, ErrorCode::NONE, [0, 0]);
            }
            ras::READ_BULK => {
                let words = m.header.arg1() / 4;
                let payload = (0..words)
                    .flat_map(|i| {
                        let at = addr.wrapping_add(4 * i);
                        self.memory.get(&at).copied().unwrap_or(0).to_le_bytes()
                    })
                    .collect();
                self.push(&Message::bulk_response(m.instance(), m.message_id(), 0, payload));
            }
            ras::WRITE_BULK => {
                self.push(&Message::ack(m.instance(), m.message_id()));
                for (i, w) in m.payload.chunks_exact(4).enumerate() {
                    let at = addr.wrapping_add(4 * i as u32);
                    self.memory
                        .insert(at, u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
                }
                self.reply(m, ErrorCode::NONE, [0, 0]);
            }
            _ => self.reply(m, ErrorCode::INVALID_MESSAGE_ID, [0, 0]),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Public handle
// ═══════════════════════════════════════════════════════════════════════════

/// Control and inspection handle for one simulated device.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// SYSTEM at 0, BOOTLOADER at 1 and RAS at 2, firmware already present.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    pub fn transport(&self) -> SimTransport {
        SimTransport {
            state: self.state.clone(),
        }
    }

    pub fn reset_line(&self) -> SimReset {
        SimReset {
            state: self.state.clone(),
        }
    }

    /// Replace the service table. SYS_INFO reports the highest instance + 1
    /// unless [`set_reported_count`](Self::set_reported_count) overrides it.
    pub fn set_services(&self, services: &[(u8, ServiceType, Version)]) {
        let mut s = locked(&self.state);
        s.services = services.iter().map(|&(i, k, v)| (i, (k, v))).collect();
    }

    /// Boot into the bootloader with nothing bootable until MAB arrives.
    pub fn set_needs_firmware(&self, yes: bool) {
        locked(&self.state).needs_firmware = yes;
    }

    pub fn set_mab_reset_required(&self, yes: bool) {
        locked(&self.state).mab_reset_required = yes;
    }

    /// The next `count` resets produce no boot notification.
    pub fn set_silent_boots(&self, count: u32) {
        locked(&self.state).silent_boots = count;
    }

    /// Swallow every command without replying.
    pub fn set_stalled(&self, yes: bool) {
        locked(&self.state).stalled = yes;
    }

    /// Swallow only the next `count` commands.
    pub fn drop_next_commands(&self, count: u32) {
        locked(&self.state).drop_next = count;
    }

    /// Unplug the bus: writes fail with `Disconnected`, reads with
    /// `ReadFailed`.
    pub fn set_disconnected(&self, yes: bool) {
        locked(&self.state).disconnected = yes;
    }

    /// Fixed SYS_INFO answer, independent of the service table.
    pub fn set_reported_count(&self, count: Option<u32>) {
        locked(&self.state).reported_count = count;
    }

    pub fn reject_next_download(&self, code: ErrorCode) {
        locked(&self.state).reject_download = Some(code);
    }

    /// Fail any RAS access whose address equals `addr`.
    pub fn fail_ras_at(&self, addr: Option<u32>) {
        locked(&self.state).ras_fail_at = addr;
    }

    /// Push an unsolicited frame into the RX FIFO and raise data-ready.
    pub fn notify(&self, message: &Message) {
        let hook = {
            let mut s = locked(&self.state);
            s.push(message);
            s.hook.clone()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Raise a PANIC carrying `record` as bulk payload.
    pub fn inject_panic(&self, reason: u32, record: &[u8]) {
        self.notify(&Message::bulk_notification(
            SYSTEM_INSTANCE,
            system::NOTIFY_PANIC,
            reason,
            record.to_vec(),
        ));
    }

    pub fn commands(&self) -> Vec<(u8, u8)> {
        locked(&self.state).commands.clone()
    }

    pub fn ras_log(&self) -> Vec<RasAccess> {
        locked(&self.state).ras_log.clone()
    }

    pub fn downloads(&self) -> Vec<(ArtifactKind, usize)> {
        locked(&self.state).downloads.clone()
    }

    pub fn resets(&self) -> Vec<ResetKind> {
        locked(&self.state).resets.clone()
    }

    pub fn word(&self, addr: u32) -> u32 {
        locked(&self.state).memory.get(&addr).copied().unwrap_or(0)
    }
}

// ── Transport ────────────────────────────────────────────────

pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl Transport for SimTransport {
    fn transmit(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let hook = {
            let mut s = locked(&self.state);
            if s.disconnected {
                return Err(TransportError::Disconnected);
            }
            match codec::decode_frame(data, u32::MAX) {
                Ok(m) if m.cran() == Cran::Command => s.command(&m),
                Ok(m) => debug!("SIM: ignoring host {:?}", m.cran()),
                Err(e) => debug!("SIM: undecodable host frame: {}", e),
            }
            if s.rx.is_empty() { None } else { s.hook.clone() }
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut s = locked(&self.state);
        if s.disconnected {
            return Err(TransportError::ReadFailed);
        }
        let n = buf.len().min(s.rx.len());
        for (slot, byte) in buf.iter_mut().zip(s.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn set_data_ready_hook(&mut self, hook: DataReadyHook) {
        locked(&self.state).hook = Some(hook);
    }
}

// ── Reset line ───────────────────────────────────────────────

pub struct SimReset {
    state: Arc<Mutex<SimState>>,
}

impl ResetControl for SimReset {
    fn reset(&mut self, kind: ResetKind) -> crate::error::Result<()> {
        let hook = {
            let mut s = locked(&self.state);
            s.boot(kind);
            s.hook.clone()
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(t: &mut SimTransport, m: &Message) -> Vec<Message> {
        t.transmit(&codec::encode_frame(m).unwrap()).unwrap();
        let mut bytes = vec![0u8; 8192];
        let n = t.receive(&mut bytes).unwrap();
        let mut out = Vec::new();
        let mut decoder = codec::FrameDecoder::new(u32::MAX);
        decoder.feed(&bytes[..n], |f| out.push(f.unwrap()));
        out
    }

    #[test]
    fn sys_info_counts_highest_instance() {
        let sim = SimDevice::new();
        sim.set_services(&[
            (0, ServiceType::SYSTEM, Version::new(1, 0, 0)),
            (9, ServiceType::RAS, Version::new(1, 0, 0)),
        ]);
        let mut t = sim.transport();
        let replies = exchange(&mut t, &Message::command(0, system::SYS_INFO, [0, 0]));
        assert_eq!(replies[0].header.arg0(), 10);

        let replies = exchange(&mut t, &Message::command(0, system::SERVICE_INFO, [4, 0]));
        assert_eq!(replies[0].header.error, ErrorCode::INVALID_SERVICE_INSTANCE);
    }

    #[test]
    fn firmware_reset_requests_fwu() {
        let sim = SimDevice::new();
        sim.reset_line().reset(ResetKind::FirmwareUpdate).unwrap();
        let mut buf = [0u8; 64];
        let n = sim.transport().receive(&mut buf).unwrap();
        let note = codec::decode_frame(&buf[..n], 0).unwrap();
        assert_eq!(note.cran(), Cran::Notification);
        assert_eq!(note.message_id(), bootloader::NOTIFY_REQUEST_FWU);
    }

    #[test]
    fn download_is_acked_then_answered() {
        let sim = SimDevice::new();
        let mut t = sim.transport();
        let cmd = Message::bulk_command(
            BOOTLOADER_INSTANCE,
            bootloader::DOWNLOAD,
            ArtifactKind::Fwu.code(),
            vec![0; 100],
        );
        let replies = exchange(&mut t, &cmd);
        let crans: Vec<_> = replies.iter().map(Message::cran).collect();
        assert_eq!(crans, vec![Cran::Ack, Cran::Response, Cran::Notification]);
        assert_eq!(replies[2].message_id(), bootloader::NOTIFY_REQUEST_CPK);
        assert_eq!(sim.downloads(), vec![(ArtifactKind::Fwu, 100)]);
    }

    #[test]
    fn reported_count_overrides_table() {
        let sim = SimDevice::new();
        sim.set_reported_count(Some(32));
        let mut t = sim.transport();
        let replies = exchange(&mut t, &Message::command(0, system::SYS_INFO, [0, 0]));
        assert_eq!(replies[0].header.arg0(), 32);
    }

    #[test]
    fn dropped_commands_are_one_shot() {
        let sim = SimDevice::new();
        sim.drop_next_commands(1);
        let mut t = sim.transport();
        let sys_info = Message::command(0, system::SYS_INFO, [0, 0]);
        assert!(exchange(&mut t, &sys_info).is_empty());
        assert_eq!(exchange(&mut t, &sys_info).len(), 1);
    }

    #[test]
    fn stalled_device_stays_quiet() {
        let sim = SimDevice::new();
        sim.set_stalled(true);
        let mut t = sim.transport();
        assert!(exchange(&mut t, &Message::command(0, system::SYS_INFO, [0, 0])).is_empty());
        assert_eq!(sim.commands(), vec![(0, system::SYS_INFO)]);
    }
}
