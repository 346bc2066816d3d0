//! Message lifecycle manager.
//!
//! Owns the send queue and the single bus slot. The physical link carries
//! one frame exchange at a time, so every host command passes through
//! `current: Option<InFlight>`: while it is `Some`, nothing else is
//! transmitted.
//!
//! ```text
//!  enqueue ─▶ waiting_to_send ─[pump]─▶ current ─[RESPONSE / timeout]─▶ completed
//!                   │                      │                               │
//!                   └──────[purge]─────────┴───────────▶ Cancelled ────────┤
//!                                                                          ▼
//!                                                     deliver() (lock released)
//! ```
//!
//! The queue performs no locking of its own; the device wraps it in the
//! message-queue mutex and delivers [`Finished`] entries after unlocking.

use heapless::Deque;
use log::{debug, warn};
use serde::Serialize;

use crate::config::DriverConfig;
use crate::error::{Error, ProtocolError, Result};

use super::channels::Completion;
use super::codec;
use super::message::{Cran, MAX_INSTANCE, Message, MessageId, MessageState};
use super::transport::Transport;

/// Hard upper bound on queued commands.
pub const SEND_QUEUE_CAPACITY: usize = 32;

/// Terminal records kept for diagnostics.
const HISTORY_DEPTH: usize = 16;

struct Pending {
    id: MessageId,
    message: Message,
    completion: Completion,
}

/// The command that currently owns the bus.
struct InFlight {
    id: MessageId,
    message: Message,
    state: MessageState,
    idle_ticks: u32,
    completion: Completion,
}

/// A command that left the bus or the queue and awaits delivery.
#[derive(Debug)]
pub struct Finished {
    pub id: MessageId,
    pub state: MessageState,
    outcome: Result<Message>,
    completion: Completion,
}

impl Finished {
    pub fn outcome(&self) -> &Result<Message> {
        &self.outcome
    }

    /// Hand the outcome to the originator.
    pub fn deliver(self) {
        self.completion.deliver(self.outcome);
    }
}

/// Terminal record of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub id: MessageId,
    pub instance: u8,
    pub message_id: u8,
    pub state: MessageState,
}

/// Running counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub sent: u32,
    pub completed: u32,
    pub failed: u32,
    pub timeouts: u32,
    pub cancelled: u32,
    pub protocol_errors: u32,
}

pub struct MessageQueue {
    waiting_to_send: Deque<Pending, SEND_QUEUE_CAPACITY>,
    current: Option<InFlight>,
    completed: Vec<Finished>,
    history: Deque<HistoryEntry, HISTORY_DEPTH>,
    depth_limit: usize,
    max_bulk: u32,
    watchdog_threshold: u32,
    next_id: u64,
    stats: QueueStats,
    closed: bool,
}

impl MessageQueue {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            waiting_to_send: Deque::new(),
            current: None,
            completed: Vec::new(),
            history: Deque::new(),
            depth_limit: config.send_queue_depth.min(SEND_QUEUE_CAPACITY),
            max_bulk: config.max_transaction_size,
            watchdog_threshold: config.watchdog_threshold,
            next_id: 1,
            stats: QueueStats::default(),
            closed: false,
        }
    }

    /// Append a command to the send queue.
    pub fn enqueue(&mut self, message: Message, completion: Completion) -> Result<MessageId> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        if message.cran() != Cran::Command {
            return Err(ProtocolError::NotACommand.into());
        }
        if message.instance() > MAX_INSTANCE {
            return Err(ProtocolError::InvalidInstance(message.instance()).into());
        }
        let size = message.header.bulk_size();
        if size > self.max_bulk {
            return Err(ProtocolError::OversizedBulk(size).into());
        }
        if size as usize != message.payload.len() {
            return Err(ProtocolError::BulkLengthMismatch {
                declared: size,
                actual: message.payload.len(),
            }
            .into());
        }
        if self.waiting_to_send.len() >= self.depth_limit {
            return Err(Error::Busy);
        }

        let id = MessageId(self.next_id);
        self.next_id += 1;
        debug!(
            "MSG: queued #{} for {}:{:#04x}",
            id.0,
            message.instance(),
            message.message_id()
        );
        // Capacity was checked against depth_limit <= SEND_QUEUE_CAPACITY.
        let _ = self.waiting_to_send.push_back(Pending {
            id,
            message,
            completion,
        });
        Ok(id)
    }

    /// Put the next command on the bus if the bus is free.
    ///
    /// Returns `true` when a command owns the bus afterwards. A command whose
    /// transmission fails is completed with the transport error and the next
    /// one is tried.
    pub fn pump(&mut self, transport: &mut dyn Transport) -> bool {
        while self.current.is_none() {
            let Some(pending) = self.waiting_to_send.pop_front() else {
                return false;
            };

            let frame = match codec::encode_frame(&pending.message) {
                Ok(f) => f,
                Err(e) => {
                    warn!("MSG: #{} unencodable: {}", pending.id.0, e);
                    self.finish(pending.id, &pending.message, pending.completion, Err(e.into()));
                    continue;
                }
            };

            match transport.transmit(&frame) {
                Ok(()) => {
                    let state = if pending.message.header.is_bulk() {
                        MessageState::AwaitingBulkAck
                    } else {
                        MessageState::Sent
                    };
                    self.stats.sent += 1;
                    self.current = Some(InFlight {
                        id: pending.id,
                        message: pending.message,
                        state,
                        idle_ticks: 0,
                        completion: pending.completion,
                    });
                }
                Err(e) => {
                    warn!("MSG: #{} transmit failed: {}", pending.id.0, e);
                    self.finish(pending.id, &pending.message, pending.completion, Err(e.into()));
                }
            }
        }
        true
    }

    /// Correlate a RESPONSE or ACK with the command on the bus.
    pub fn on_reply(&mut self, reply: Message) -> core::result::Result<(), ProtocolError> {
        let unexpected = ProtocolError::UnexpectedReply {
            instance: reply.instance(),
            message_id: reply.message_id(),
        };

        let Some(current) = self.current.as_mut() else {
            self.stats.protocol_errors += 1;
            return Err(unexpected);
        };
        current.idle_ticks = 0;

        if current.message.instance() != reply.instance()
            || current.message.message_id() != reply.message_id()
        {
            self.stats.protocol_errors += 1;
            return Err(unexpected);
        }

        match reply.cran() {
            Cran::Ack if current.state == MessageState::AwaitingBulkAck => {
                debug!("MSG: #{} bulk accepted", current.id.0);
                current.state = MessageState::Sent;
                Ok(())
            }
            Cran::Response => {
                let Some(done) = self.current.take() else {
                    return Err(unexpected);
                };
                let outcome = if reply.header.error.is_none() {
                    Ok(reply)
                } else {
                    Err(Error::Device(reply.header.error))
                };
                self.finish(done.id, &done.message, done.completion, outcome);
                Ok(())
            }
            _ => {
                self.stats.protocol_errors += 1;
                Err(unexpected)
            }
        }
    }

    /// Any RX activity counts as liveness for the command on the bus.
    pub fn note_rx_activity(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.idle_ticks = 0;
        }
    }

    /// Advance the idle counter of the bus owner.
    ///
    /// Returns `true` when the owner timed out and the bus was released.
    pub fn watchdog_tick(&mut self) -> bool {
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        current.idle_ticks += 1;
        if current.idle_ticks < self.watchdog_threshold {
            return false;
        }

        let Some(done) = self.current.take() else {
            return false;
        };
        warn!(
            "MSG: #{} ({}:{:#04x}) timed out after {} ticks",
            done.id.0,
            done.message.instance(),
            done.message.message_id(),
            done.idle_ticks
        );
        self.stats.timeouts += 1;
        self.finish(done.id, &done.message, done.completion, Err(Error::Timeout));
        true
    }

    /// Cancel every command that has not been released.
    /// Returns how many were cancelled.
    pub fn purge(&mut self) -> usize {
        let mut count = 0;
        if let Some(done) = self.current.take() {
            self.cancel(done.id, &done.message, done.completion);
            count += 1;
        }
        while let Some(p) = self.waiting_to_send.pop_front() {
            self.cancel(p.id, &p.message, p.completion);
            count += 1;
        }
        if count > 0 {
            warn!("MSG: purged {} command(s)", count);
        }
        count
    }

    /// Purge and refuse every later command.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        self.purge()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drain finished commands for delivery outside the lock.
    pub fn take_completed(&mut self) -> Vec<Finished> {
        core::mem::take(&mut self.completed)
    }

    /// Lifecycle state of a command still owned by the queue.
    pub fn state_of(&self, id: MessageId) -> Option<MessageState> {
        if let Some(c) = self.current.as_ref().filter(|c| c.id == id) {
            return Some(c.state);
        }
        if self.waiting_to_send.iter().any(|p| p.id == id) {
            return Some(MessageState::Queued);
        }
        self.completed
            .iter()
            .find(|f| f.id == id)
            .map(|f| f.state)
            .or_else(|| self.history.iter().find(|h| h.id == id).map(|h| h.state))
    }

    /// The bus owner, if any.
    pub fn in_flight(&self) -> Option<(MessageId, MessageState)> {
        self.current.as_ref().map(|c| (c.id, c.state))
    }

    pub fn queued(&self) -> usize {
        self.waiting_to_send.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    // ── Internal ──────────────────────────────────────────────

    fn finish(
        &mut self,
        id: MessageId,
        message: &Message,
        completion: Completion,
        outcome: Result<Message>,
    ) {
        if outcome.is_ok() {
            self.stats.completed += 1;
        } else {
            self.stats.failed += 1;
        }
        // Delivery releases the message.
        self.record(id, message, MessageState::Released);
        self.completed.push(Finished {
            id,
            state: MessageState::Completed,
            outcome,
            completion,
        });
    }

    fn cancel(&mut self, id: MessageId, message: &Message, completion: Completion) {
        self.stats.cancelled += 1;
        self.record(id, message, MessageState::Cancelled);
        self.completed.push(Finished {
            id,
            state: MessageState::Cancelled,
            outcome: Err(Error::Cancelled),
            completion,
        });
    }

    fn record(&mut self, id: MessageId, message: &Message, state: MessageState) {
        if self.history.is_full() {
            self.history.pop_front();
        }
        let _ = self.history.push_back(HistoryEntry {
            id,
            instance: message.instance(),
            message_id: message.message_id(),
            state,
        });
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, TransportError};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        frames: Vec<Vec<u8>>,
        fail: bool,
    }

    impl Transport for Recorder {
        fn transmit(&mut self, data: &[u8]) -> core::result::Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::WriteFailed);
            }
            self.frames.push(data.to_vec());
            Ok(())
        }
        fn receive(&mut self, _buf: &mut [u8]) -> core::result::Result<usize, TransportError> {
            Ok(0)
        }
    }

    fn queue() -> MessageQueue {
        MessageQueue::new(&DriverConfig::default())
    }

    fn recording() -> (Arc<Mutex<Vec<Result<Message>>>>, impl Fn() -> Completion) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move || {
            let l = l.clone();
            Completion::Callback(Box::new(move |r| l.lock().unwrap().push(r)))
        };
        (log, make)
    }

    fn deliver_all(q: &mut MessageQueue) {
        for f in q.take_completed() {
            f.deliver();
        }
    }

    #[test]
    fn only_one_command_on_bus() {
        let mut q = queue();
        let mut t = Recorder::default();
        q.enqueue(Message::command(0, 1, [0, 0]), Completion::Detached).unwrap();
        q.enqueue(Message::command(0, 2, [0, 0]), Completion::Detached).unwrap();

        assert!(q.pump(&mut t));
        assert!(q.pump(&mut t));
        assert_eq!(t.frames.len(), 1, "second command must wait for the bus");
        assert_eq!(q.queued(), 1);

        q.on_reply(Message::response(0, 1, ErrorCode::NONE, [0, 0])).unwrap();
        assert!(q.pump(&mut t));
        assert_eq!(t.frames.len(), 2);
    }

    #[test]
    fn response_completes_callback() {
        let (log, make) = recording();
        let mut q = queue();
        let mut t = Recorder::default();
        let id = q.enqueue(Message::command(3, 7, [1, 2]), make()).unwrap();
        assert_eq!(q.state_of(id), Some(MessageState::Queued));
        q.pump(&mut t);
        assert_eq!(q.state_of(id), Some(MessageState::Sent));

        q.on_reply(Message::response(3, 7, ErrorCode::NONE, [42, 0])).unwrap();
        assert_eq!(q.in_flight(), None);
        deliver_all(&mut q);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].as_ref().unwrap().header.arg0(), 42);
        assert_eq!(q.state_of(id), Some(MessageState::Released));
    }

    #[test]
    fn error_response_surfaces_device_code() {
        let (log, make) = recording();
        let mut q = queue();
        let mut t = Recorder::default();
        q.enqueue(Message::command(0, 2, [9, 0]), make()).unwrap();
        q.pump(&mut t);
        q.on_reply(Message::response(0, 2, ErrorCode::INVALID_SERVICE_INSTANCE, [0, 0]))
            .unwrap();
        deliver_all(&mut q);
        assert_eq!(
            log.lock().unwrap()[0],
            Err(Error::Device(ErrorCode::INVALID_SERVICE_INSTANCE))
        );
    }

    #[test]
    fn bulk_command_waits_for_ack_then_response() {
        let mut q = queue();
        let mut t = Recorder::default();
        let id = q
            .enqueue(Message::bulk_command(4, 4, 0x1000, vec![0; 8]), Completion::Detached)
            .unwrap();
        q.pump(&mut t);
        assert_eq!(q.state_of(id), Some(MessageState::AwaitingBulkAck));
        assert_eq!(t.frames[0].len(), codec::HEADER_LEN + 8);

        q.on_reply(Message::ack(4, 4)).unwrap();
        assert_eq!(q.state_of(id), Some(MessageState::Sent));

        q.on_reply(Message::response(4, 4, ErrorCode::NONE, [0, 0])).unwrap();
        assert_eq!(q.in_flight(), None);
    }

    #[test]
    fn ack_for_inline_command_is_unexpected() {
        let mut q = queue();
        let mut t = Recorder::default();
        q.enqueue(Message::command(4, 1, [0, 0]), Completion::Detached).unwrap();
        q.pump(&mut t);
        assert!(q.on_reply(Message::ack(4, 1)).is_err());
        assert!(q.in_flight().is_some());
    }

    #[test]
    fn uncorrelated_reply_is_dropped() {
        let mut q = queue();
        let mut t = Recorder::default();
        assert!(q.on_reply(Message::response(0, 1, ErrorCode::NONE, [0, 0])).is_err());

        q.enqueue(Message::command(0, 1, [0, 0]), Completion::Detached).unwrap();
        q.pump(&mut t);
        assert_eq!(
            q.on_reply(Message::response(0, 9, ErrorCode::NONE, [0, 0])),
            Err(ProtocolError::UnexpectedReply {
                instance: 0,
                message_id: 9
            })
        );
        assert!(q.in_flight().is_some(), "bus owner must survive a stray reply");
        assert_eq!(q.stats().protocol_errors, 2);
    }

    #[test]
    fn enqueue_is_bounded() {
        let mut cfg = DriverConfig::default();
        cfg.send_queue_depth = 2;
        let mut q = MessageQueue::new(&cfg);
        q.enqueue(Message::command(0, 1, [0, 0]), Completion::Detached).unwrap();
        q.enqueue(Message::command(0, 1, [0, 0]), Completion::Detached).unwrap();
        assert_eq!(
            q.enqueue(Message::command(0, 1, [0, 0]), Completion::Detached),
            Err(Error::Busy)
        );
    }

    #[test]
    fn enqueue_validates_message() {
        let mut q = queue();
        assert_eq!(
            q.enqueue(Message::notification(0, 1, [0, 0]), Completion::Detached),
            Err(Error::Protocol(ProtocolError::NotACommand))
        );
        assert_eq!(
            q.enqueue(Message::command(40, 1, [0, 0]), Completion::Detached),
            Err(Error::Protocol(ProtocolError::InvalidInstance(40)))
        );
        assert_eq!(
            q.enqueue(Message::bulk_command(1, 1, 0, vec![0; 5000]), Completion::Detached),
            Err(Error::Protocol(ProtocolError::OversizedBulk(5000)))
        );
    }

    #[test]
    fn watchdog_times_out_and_frees_bus() {
        let (log, make) = recording();
        let mut q = queue();
        let mut t = Recorder::default();
        q.enqueue(Message::command(0, 1, [0, 0]), make()).unwrap();
        q.enqueue(Message::command(0, 2, [0, 0]), Completion::Detached).unwrap();
        q.pump(&mut t);

        let threshold = DriverConfig::default().watchdog_threshold;
        for _ in 0..threshold - 1 {
            assert!(!q.watchdog_tick());
        }
        q.note_rx_activity();
        for _ in 0..threshold - 1 {
            assert!(!q.watchdog_tick());
        }
        assert!(q.watchdog_tick());
        assert_eq!(q.in_flight(), None);
        deliver_all(&mut q);
        assert_eq!(log.lock().unwrap()[0], Err(Error::Timeout));
        assert_eq!(q.stats().timeouts, 1);

        q.pump(&mut t);
        assert_eq!(t.frames.len(), 2, "next command goes out after the timeout");
    }

    #[test]
    fn transmit_failure_completes_with_transport_error() {
        let (log, make) = recording();
        let mut q = queue();
        let mut t = Recorder {
            fail: true,
            ..Default::default()
        };
        q.enqueue(Message::command(0, 1, [0, 0]), make()).unwrap();
        assert!(!q.pump(&mut t));
        deliver_all(&mut q);
        assert_eq!(
            log.lock().unwrap()[0],
            Err(Error::Transport(TransportError::WriteFailed))
        );
    }

    #[test]
    fn purge_cancels_everything() {
        let (log, make) = recording();
        let mut q = queue();
        let mut t = Recorder::default();
        let ids: Vec<_> = (0..4)
            .map(|i| q.enqueue(Message::command(2, i, [0, 0]), make()).unwrap())
            .collect();
        q.pump(&mut t);

        assert_eq!(q.purge(), 4);
        assert_eq!(q.in_flight(), None);
        assert_eq!(q.queued(), 0);
        for id in &ids {
            assert_eq!(q.state_of(*id), Some(MessageState::Cancelled));
        }
        deliver_all(&mut q);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert!(log.iter().all(|r| *r == Err(Error::Cancelled)));
    }

    #[test]
    fn closed_queue_refuses_commands() {
        let mut q = queue();
        q.enqueue(Message::command(0, 1, [0, 0]), Completion::Detached).unwrap();
        assert_eq!(q.close(), 1);
        assert!(q.is_closed());
        assert_eq!(
            q.enqueue(Message::command(0, 1, [0, 0]), Completion::Detached),
            Err(Error::Cancelled)
        );
    }
}
