//! Protocol worker: the single thread that talks to the FIFOs.
//!
//! Runs an `edge-executor` with two cooperative tasks:
//!
//! 1. **Watchdog** posts a tick every `watchdog_interval_ms` on an
//!    `embassy-time` timer (no busy-spinning)
//! 2. **Events** wakes on the event channel; every event drains RX,
//!    delivers completions and pumps the send queue
//!
//! ```text
//!  ┌───────────────────────────────────────────────────────┐
//!  │  Worker Thread                                        │
//!  │  ┌─────────────────────────────────────────────────┐  │
//!  │  │  futures_lite::block_on                         │  │
//!  │  │  ┌───────────────────────────────────────────┐  │  │
//!  │  │  │  edge_executor::LocalExecutor             │  │  │
//!  │  │  │   ┌────────────┐    ┌──────────────────┐  │  │  │
//!  │  │  │   │ Watchdog   │───▶│ Event loop       │  │  │  │
//!  │  │  │   │ timer ⏱    │    │ wake-on-event    │  │  │  │
//!  │  │  │   └────────────┘    └──────────────────┘  │  │  │
//!  │  │  └───────────────────────────────────────────┘  │  │
//!  │  └─────────────────────────────────────────────────┘  │
//!  └───────────────────────────────────────────────────────┘
//! ```
//!
//! Lock order is queue before link I/O. Notification handlers run here
//! with the registry lock held and must not block on a reply.

use embassy_time::{Duration, Timer};
use log::{debug, info, warn};

use crate::device::{DeviceLink, locked};

use super::channels::WorkerEvent;
use super::codec::FrameDecoder;
use super::message::{Cran, Message};
use super::transport::Transport;

const RX_CHUNK: usize = 256;

/// Bus-side state guarded by the link I/O lock.
pub(crate) struct LinkIo {
    pub transport: Box<dyn Transport>,
    pub decoder: FrameDecoder,
}

// ── Tasks ────────────────────────────────────────────────────

/// Periodic tick. The tick also drains RX, which covers adapters that
/// never raise data-ready.
async fn watchdog_loop(link: DeviceLink) {
    let period = Duration::from_millis(u64::from(link.config().watchdog_interval_ms));
    loop {
        Timer::after(period).await;
        let _ = link.shared().events.try_send(WorkerEvent::WatchdogTick);
    }
}

async fn event_loop(link: DeviceLink) {
    loop {
        match link.shared().events.receive().await {
            WorkerEvent::Shutdown => break,
            WorkerEvent::WatchdogTick => {
                if locked(&link.shared().queue).watchdog_tick() {
                    link.note_transport_timeout();
                }
            }
            WorkerEvent::DataReady | WorkerEvent::Pump => {}
        }
        service(&link);
    }
}

fn run(link: DeviceLink) {
    let executor: edge_executor::LocalExecutor<'_, 4> = edge_executor::LocalExecutor::new();

    executor.spawn(watchdog_loop(link.clone())).detach();

    info!(
        "MSG: worker started for device {} (watchdog {} ms x {})",
        link.instance_id(),
        link.config().watchdog_interval_ms,
        link.config().watchdog_threshold
    );

    futures_lite::future::block_on(executor.run(event_loop(link.clone())));

    info!("MSG: worker for device {} stopped", link.instance_id());
}

/// Spawn the protocol worker thread.
pub(crate) fn spawn(link: DeviceLink) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("scp{}-msg", link.instance_id()))
        .spawn(move || run(link))
}

// ── One pass ─────────────────────────────────────────────────

/// Drain RX, deliver, pump. Idempotent; extra passes are harmless.
pub(crate) fn service(link: &DeviceLink) {
    drain_rx(link);
    deliver(link);
    pump(link);
    deliver(link);
}

fn drain_rx(link: &DeviceLink) {
    let mut frames = Vec::new();
    {
        let mut io = locked(&link.shared().io);
        let LinkIo { transport, decoder } = &mut *io;
        let mut buf = [0u8; RX_CHUNK];
        loop {
            match transport.receive(&mut buf) {
                Ok(0) => break,
                Ok(n) => decoder.feed(&buf[..n], |frame| frames.push(frame)),
                Err(e) => {
                    warn!("MSG: RX failed: {}", e);
                    link.record_error(e.into());
                    break;
                }
            }
        }
    }

    for frame in frames {
        match frame {
            Ok(message) => route(link, message),
            Err(e) => {
                warn!("MSG: dropped inbound frame: {}", e);
                link.record_error(e.into());
            }
        }
    }
}

fn route(link: &DeviceLink, message: Message) {
    match message.cran() {
        Cran::Response | Cran::Ack => {
            let result = locked(&link.shared().queue).on_reply(message);
            if let Err(e) = result {
                warn!("MSG: protocol violation: {}", e);
                link.record_error(e.into());
            }
        }
        Cran::Notification | Cran::Command => {
            locked(&link.shared().queue).note_rx_activity();
            debug!(
                "MSG: inbound {:?} {}:{:#04x}",
                message.cran(),
                message.instance(),
                message.message_id()
            );
            link.dispatch(&message);
        }
    }
}

fn deliver(link: &DeviceLink) {
    let done = locked(&link.shared().queue).take_completed();
    for finished in done {
        finished.deliver();
    }
}

fn pump(link: &DeviceLink) {
    let shared = link.shared();
    let mut queue = locked(&shared.queue);
    let mut io = locked(&shared.io);
    queue.pump(io.transport.as_mut());
}
