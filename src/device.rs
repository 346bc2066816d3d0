//! One attached device: shared state, public handle and attach/detach.
//!
//! ```text
//!  ┌──────────────────────────── Shared ─────────────────────────────┐
//!  │ queue ─ registry ─ io(transport, decoder) ─ fsm ─ diagnostics   │
//!  │ events (Channel) ─ wake (Signal) ─ boot (Signal)                │
//!  └─────────────────────────────────────────────────────────────────┘
//!        ▲                 ▲                      ▲
//!   worker thread   maintenance thread     DeviceLink (callers, services)
//! ```
//!
//! Every lock is taken on its own except queue → io inside the worker's
//! pump. Completions are delivered with no lock held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use embassy_time::{Duration, Timer, with_timeout};
use log::{info, warn};

use crate::config::DriverConfig;
use crate::diagnostics::{DeviceSnapshot, Diagnostics, PanicRecord};
use crate::error::{Error, Result};
use crate::firmware::{ArtifactFingerprint, DirFirmwareSource, FirmwareSource};
use crate::fsm::{DeviceState, StateMachine, maintenance};
use crate::msg::channels::{
    BootSignal, Completion, CompletionSignal, EventChannel, WakeSignal, WorkerEvent,
};
use crate::msg::codec::FrameDecoder;
use crate::msg::queue::MessageQueue;
use crate::msg::worker::{self, LinkIo};
use crate::msg::{Message, MessageId, Transport};
use crate::reset::{NoopReset, ResetControl, ResetKind};
use crate::service::bootloader::BootloaderService;
use crate::service::ras::{RasClient, RasService};
use crate::service::registry::{self, Deferred, ServiceHandle, ServiceRegistry};
use crate::service::system::{self, SystemService};
use crate::service::{
    BOOTLOADER_INSTANCE, Constructor, SYSTEM_INSTANCE, Service, ServiceType, SlotInfo, Version,
};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Shared {
    pub config: DriverConfig,
    pub instance_id: u32,
    pub queue: Mutex<MessageQueue>,
    pub registry: Mutex<ServiceRegistry>,
    pub io: Mutex<LinkIo>,
    pub fsm: Mutex<StateMachine>,
    pub diagnostics: Mutex<Diagnostics>,
    pub deferred: Mutex<Vec<Deferred>>,
    pub reset: Mutex<Box<dyn ResetControl>>,
    pub firmware: Box<dyn FirmwareSource>,
    pub families: Vec<(ServiceType, Constructor)>,
    pub events: Arc<EventChannel>,
    pub wake: WakeSignal,
    pub boot: BootSignal,
    pub running: AtomicBool,
    /// Set by the worker when a command timed out in ACTIVE.
    pub timeout_recovery: AtomicBool,
}

impl Shared {
    fn new(
        config: DriverConfig,
        instance_id: u32,
        mut transport: Box<dyn Transport>,
        reset: Box<dyn ResetControl>,
        firmware: Box<dyn FirmwareSource>,
        families: Vec<(ServiceType, Constructor)>,
    ) -> Self {
        let events = Arc::new(EventChannel::new());
        let hook_events = events.clone();
        transport.set_data_ready_hook(Arc::new(move || {
            let _ = hook_events.try_send(WorkerEvent::DataReady);
        }));

        Self {
            queue: Mutex::new(MessageQueue::new(&config)),
            registry: Mutex::new(ServiceRegistry::new()),
            io: Mutex::new(LinkIo {
                transport,
                decoder: FrameDecoder::new(config.max_transaction_size),
            }),
            fsm: Mutex::new(StateMachine::new()),
            diagnostics: Mutex::new(Diagnostics::default()),
            deferred: Mutex::new(Vec::new()),
            reset: Mutex::new(reset),
            firmware,
            families,
            events,
            wake: WakeSignal::new(),
            boot: BootSignal::new(),
            running: AtomicBool::new(false),
            timeout_recovery: AtomicBool::new(false),
            config,
            instance_id,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  DeviceLink
// ═══════════════════════════════════════════════════════════════════════════

/// Cloneable handle to one device, handed to services and callers.
#[derive(Clone)]
pub struct DeviceLink(Arc<Shared>);

impl DeviceLink {
    pub(crate) fn shared(&self) -> &Shared {
        &self.0
    }

    pub fn config(&self) -> &DriverConfig {
        &self.0.config
    }

    pub fn instance_id(&self) -> u32 {
        self.0.instance_id
    }

    pub fn state(&self) -> DeviceState {
        locked(&self.0.fsm).state()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.0.running.load(Ordering::Acquire)
    }

    // ── Messaging ────────────────────────────────────────────

    /// Queue `message` and block until it completes.
    ///
    /// Must not be called from the protocol worker (service `handle`
    /// or `send_async` callbacks).
    pub fn send_sync(&self, message: Message) -> Result<Message> {
        let signal = Arc::new(CompletionSignal::new());
        self.enqueue(message, Completion::Blocking(signal.clone()))?;
        futures_lite::future::block_on(signal.wait())
    }

    /// Queue `message`; `callback` runs on the protocol worker with the
    /// outcome. Not invoked when queueing itself fails.
    pub fn send_async<F>(&self, message: Message, callback: F) -> Result<MessageId>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        self.enqueue(message, Completion::Callback(Box::new(callback)))
    }

    fn enqueue(&self, message: Message, completion: Completion) -> Result<MessageId> {
        let state = self.state();
        if !state.accepts_commands() {
            return Err(Error::InvalidState(state));
        }
        let id = locked(&self.0.queue).enqueue(message, completion)?;
        let _ = self.0.events.try_send(WorkerEvent::Pump);
        Ok(id)
    }

    /// Lifecycle state of a queued or recently finished command.
    pub fn message_state(&self, id: MessageId) -> Option<crate::msg::MessageState> {
        locked(&self.0.queue).state_of(id)
    }

    // ── Registry ─────────────────────────────────────────────

    pub fn register_service(
        &self,
        instance: u8,
        kind: ServiceType,
        version: Version,
        service: Box<dyn Service>,
    ) -> Result<ServiceHandle> {
        registry::register(self, instance, kind, version, service)
    }

    pub fn deregister_service(&self, handle: ServiceHandle) -> Result<()> {
        registry::deregister(self, handle)
    }

    /// Queue a registry change for the maintenance thread. Use from
    /// service callbacks, which run with the registry locked.
    pub fn defer(&self, op: Deferred) {
        locked(&self.0.deferred).push(op);
        self.wake_maintenance();
    }

    pub(crate) fn apply_deferred(&self) {
        let ops = core::mem::take(&mut *locked(&self.0.deferred));
        for op in ops {
            registry::apply(self, op);
        }
    }

    pub fn service(&self, instance: u8) -> Option<SlotInfo> {
        locked(&self.0.registry).get(instance)
    }

    pub fn find_service(&self, kind: ServiceType) -> Option<SlotInfo> {
        locked(&self.0.registry).find(kind)
    }

    pub fn services(&self) -> Vec<SlotInfo> {
        locked(&self.0.registry).summaries()
    }

    pub(crate) fn constructor(&self, kind: ServiceType) -> Option<Constructor> {
        self.0
            .families
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, c)| *c)
    }

    pub(crate) fn dispatch(&self, message: &Message) {
        locked(&self.0.registry).dispatch(self, message);
    }

    /// Register-access client for the lowest RAS instance.
    pub fn ras(&self) -> Result<RasClient<DeviceLink>> {
        let slot = self
            .find_service(ServiceType::RAS)
            .ok_or(Error::NoSuchService)?;
        Ok(RasClient::new(
            self.clone(),
            slot.instance,
            self.config().ras_fragment_size,
        ))
    }

    // ── State machine ────────────────────────────────────────

    pub(crate) fn transition(&self, to: DeviceState) -> Result<()> {
        locked(&self.0.fsm).transition(to)
    }

    /// Apply an action's requested state under a single FSM lock.
    pub(crate) fn advance(&self, to: DeviceState) -> Result<()> {
        locked(&self.0.fsm).advance(to)
    }

    pub(crate) fn force_state(&self, to: DeviceState) {
        locked(&self.0.fsm).force(to);
    }

    pub(crate) fn wake_maintenance(&self) {
        self.0.wake.signal(());
    }

    pub(crate) fn signal_boot(&self, next: DeviceState) {
        self.0.boot.signal(next);
    }

    pub(crate) fn arm_reset(&self, kind: ResetKind) {
        locked(&self.0.fsm).arm_reset(kind);
    }

    pub(crate) fn take_reset(&self) -> ResetKind {
        locked(&self.0.fsm).take_reset()
    }

    pub(crate) fn note_boot(&self) {
        locked(&self.0.fsm).note_boot();
    }

    pub(crate) fn note_silent_boot(&self) -> u8 {
        locked(&self.0.fsm).note_silent_boot()
    }

    pub(crate) fn note_transfer(&self) {
        locked(&self.0.fsm).note_transfer();
    }

    pub(crate) fn note_transfer_failure(&self) -> u8 {
        locked(&self.0.fsm).note_transfer_failure()
    }

    /// Operator reset: drop everything in flight and start a fresh boot.
    /// Leaves PANIC and LOST too.
    pub fn request_reset(&self, kind: ResetKind) -> Result<()> {
        if !self.is_running() {
            return Err(Error::InvalidState(self.state()));
        }
        {
            let mut fsm = locked(&self.0.fsm);
            fsm.arm_reset(kind);
            fsm.force(DeviceState::Inactive);
        }
        info!("DEV: device {} reset requested ({:?})", self.instance_id(), kind);
        self.purge();
        self.wake_maintenance();
        Ok(())
    }

    /// Watchdog expired the command on the bus. In ACTIVE the device is
    /// reset; the maintenance thread does the work.
    pub(crate) fn note_transport_timeout(&self) {
        self.record_error(Error::Timeout);
        if self.state() == DeviceState::Active {
            self.0.timeout_recovery.store(true, Ordering::Release);
            self.wake_maintenance();
        }
    }

    /// Turn a pending transport timeout into a fresh reset cycle. Returns
    /// `true` when the device was sent back to INACTIVE.
    pub(crate) fn recover_from_timeout(&self) -> bool {
        if !self.0.timeout_recovery.swap(false, Ordering::AcqRel) {
            return false;
        }
        {
            let mut fsm = locked(&self.0.fsm);
            if fsm.state() != DeviceState::Active {
                return false;
            }
            fsm.arm_reset(ResetKind::Normal);
            fsm.force(DeviceState::Inactive);
        }
        warn!("DEV: device {} stopped answering, resetting", self.instance_id());
        locked(&self.0.diagnostics).timeout_resets += 1;
        true
    }

    pub(crate) fn pulse_reset(&self, kind: ResetKind) -> Result<()> {
        locked(&self.0.diagnostics).resets += 1;
        locked(&self.0.reset).reset(kind)
    }

    /// Cancel everything queued and resynchronise the decoder.
    pub(crate) fn flush_link(&self) {
        self.purge();
        locked(&self.0.io).decoder.reset();
    }

    fn purge(&self) {
        let finished = {
            let mut queue = locked(&self.0.queue);
            queue.purge();
            queue.take_completed()
        };
        for f in finished {
            f.deliver();
        }
    }

    /// Unsolicited panic: park the device and cancel all traffic.
    ///
    /// Runs on the worker; cancelled completions are delivered by the
    /// worker's next pass.
    pub(crate) fn enter_panic(&self, reason: u32, payload: &[u8]) {
        let previous = {
            let mut fsm = locked(&self.0.fsm);
            let previous = fsm.state();
            fsm.force(DeviceState::Panic);
            previous
        };
        let cancelled = locked(&self.0.queue).purge();
        log::error!(
            "DEV: device {} panicked in {} (reason {:#x}, {} byte record, {} command(s) cancelled)",
            self.instance_id(),
            previous,
            reason,
            payload.len(),
            cancelled
        );
        locked(&self.0.diagnostics).panic = Some(PanicRecord::new(previous, reason, payload));
        let _ = self.0.events.try_send(WorkerEvent::Pump);
    }

    // ── Diagnostics ──────────────────────────────────────────

    pub(crate) fn firmware(&self) -> &dyn FirmwareSource {
        self.0.firmware.as_ref()
    }

    pub(crate) fn record_error(&self, e: Error) {
        locked(&self.0.diagnostics).record_error(e);
    }

    pub(crate) fn record_fingerprint(&self, fp: ArtifactFingerprint) {
        locked(&self.0.diagnostics).record_fingerprint(fp);
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let (queued, in_flight, stats, recent) = {
            let q = locked(&self.0.queue);
            (
                q.queued(),
                q.in_flight().map(|(_, s)| s),
                q.stats(),
                q.history().copied().collect(),
            )
        };
        let (services, unhandled) = {
            let r = locked(&self.0.registry);
            (r.summaries(), r.unhandled())
        };
        let (state, transitions, armed_reset) = {
            let f = locked(&self.0.fsm);
            (f.state(), f.history().copied().collect(), f.armed_reset())
        };
        let d = locked(&self.0.diagnostics);
        DeviceSnapshot {
            instance_id: self.0.instance_id,
            state,
            services,
            unhandled,
            queued,
            in_flight,
            stats,
            recent,
            transitions,
            armed_reset,
            resets: d.resets,
            timeout_resets: d.timeout_resets,
            panic: d.panic.clone(),
            last_error: d.last_error.map(|e| e.to_string()),
            error_count: d.error_count,
            fingerprints: d.fingerprints.iter().copied().collect(),
        }
    }

    pub(crate) fn dump_diagnostics(&self) {
        self.snapshot().dump();
    }

    /// Block until `pred` holds for the device state.
    pub fn wait_until(
        &self,
        pred: impl Fn(DeviceState) -> bool,
        timeout: core::time::Duration,
    ) -> Result<DeviceState> {
        let poll = async {
            loop {
                let state = self.state();
                if pred(state) {
                    return state;
                }
                Timer::after(Duration::from_millis(5)).await;
            }
        };
        let limit = Duration::from_micros(timeout.as_micros() as u64);
        futures_lite::future::block_on(with_timeout(limit, poll)).map_err(|_| Error::Timeout)
    }

    pub fn wait_for_state(&self, target: DeviceState, timeout: core::time::Duration) -> Result<()> {
        self.wait_until(|s| s == target, timeout).map(|_| ())
    }

    /// A link with no threads behind it.
    #[cfg(test)]
    pub(crate) fn offline() -> Self {
        Self::offline_with(crate::firmware::MemoryFirmwareSource::new())
    }

    #[cfg(test)]
    pub(crate) fn offline_with(firmware: impl FirmwareSource + 'static) -> Self {
        Self(Arc::new(Shared::new(
            DriverConfig::default(),
            0,
            Box::new(crate::msg::NullTransport),
            Box::new(NoopReset),
            Box::new(firmware),
            Vec::new(),
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Builder
// ═══════════════════════════════════════════════════════════════════════════

pub struct DeviceBuilder {
    transport: Box<dyn Transport>,
    config: DriverConfig,
    reset: Box<dyn ResetControl>,
    firmware: Option<Box<dyn FirmwareSource>>,
    instance_id: u32,
    families: Vec<(ServiceType, Constructor)>,
}

impl DeviceBuilder {
    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reset_control(mut self, reset: impl ResetControl + 'static) -> Self {
        self.reset = Box::new(reset);
        self
    }

    pub fn firmware(mut self, source: impl FirmwareSource + 'static) -> Self {
        self.firmware = Some(Box::new(source));
        self
    }

    pub fn instance_id(mut self, id: u32) -> Self {
        self.instance_id = id;
        self
    }

    /// Constructor for a service family found during enumeration.
    /// A later registration for the same family wins.
    pub fn family(mut self, kind: ServiceType, construct: Constructor) -> Self {
        self.families.retain(|(k, _)| *k != kind);
        self.families.push((kind, construct));
        self
    }

    /// Bring the device up: preregister the core services, start both
    /// threads and begin the first reset cycle.
    pub fn attach(self) -> Result<Device> {
        self.config.validate()?;
        let firmware = self
            .firmware
            .unwrap_or_else(|| Box::new(DirFirmwareSource::from_config(&self.config)));
        let id = self.instance_id;
        let link = DeviceLink(Arc::new(Shared::new(
            self.config,
            id,
            self.transport,
            self.reset,
            firmware,
            self.families,
        )));

        link.register_service(
            SYSTEM_INSTANCE,
            ServiceType::SYSTEM,
            Version::new(0, 0, 0),
            Box::new(SystemService),
        )?;
        link.register_service(
            BOOTLOADER_INSTANCE,
            ServiceType::BOOTLOADER,
            Version::new(0, 0, 0),
            Box::new(BootloaderService),
        )?;

        link.0.running.store(true, Ordering::Release);
        let mut device = Device {
            link: link.clone(),
            worker: None,
            maintenance: None,
        };
        device.worker = Some(worker::spawn(link.clone()).map_err(|e| spawn_failed(&e))?);
        device.maintenance = Some(maintenance::spawn(link.clone()).map_err(|e| spawn_failed(&e))?);

        info!("DEV: device {} attached", id);
        link.wake_maintenance();
        Ok(device)
    }
}

fn spawn_failed(e: &std::io::Error) -> Error {
    log::error!("DEV: thread spawn failed: {}", e);
    Error::Io
}

// ═══════════════════════════════════════════════════════════════════════════
//  Device
// ═══════════════════════════════════════════════════════════════════════════

/// Owner of one attached device and its two threads.
pub struct Device {
    link: DeviceLink,
    worker: Option<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
}

impl Device {
    pub fn builder(transport: impl Transport + 'static) -> DeviceBuilder {
        DeviceBuilder {
            transport: Box::new(transport),
            config: DriverConfig::default(),
            reset: Box::new(NoopReset),
            firmware: None,
            instance_id: 0,
            families: vec![(ServiceType::RAS, RasService::construct as Constructor)],
        }
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    pub fn state(&self) -> DeviceState {
        self.link.state()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.link.snapshot()
    }

    /// Orderly detach. From ACTIVE the device is asked to shut down first;
    /// the handshake result is returned after teardown completes.
    pub fn shutdown(mut self) -> Result<()> {
        self.detach()
    }

    fn detach(&mut self) -> Result<()> {
        if self.worker.is_none() && self.maintenance.is_none() {
            return Ok(());
        }
        let link = &self.link;

        let handshake = if link.transition(DeviceState::Stopping).is_ok() {
            let result = system::shutdown(link);
            if let Err(e) = &result {
                warn!("DEV: shutdown handshake failed: {}", e);
            }
            if let Err(e) = link.transition(DeviceState::Stopped) {
                warn!("DEV: {}", e);
                link.force_state(DeviceState::Stopped);
            }
            result
        } else {
            link.force_state(DeviceState::Stopped);
            Ok(())
        };

        link.0.running.store(false, Ordering::Release);
        link.signal_boot(DeviceState::Stopped);
        link.wake_maintenance();

        let finished = {
            let mut queue = locked(&link.0.queue);
            queue.close();
            queue.take_completed()
        };
        for f in finished {
            f.deliver();
        }

        let stopped = registry::clear(link);
        futures_lite::future::block_on(link.0.events.send(WorkerEvent::Shutdown));

        for handle in [self.maintenance.take(), self.worker.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                warn!("DEV: device {} thread panicked", link.instance_id());
            }
        }

        info!(
            "DEV: device {} detached ({} service(s) stopped)",
            link.instance_id(),
            stopped
        );
        handshake
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!("DEV: detach on drop: {}", e);
        }
    }
}
