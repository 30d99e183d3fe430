use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{error, trace, warn};

use super::Action;
use crate::error::VerdictError;
use crate::packet::Info;
use crate::queue::{Queue, RawPacket};

/// Verdict handle for one queued packet.
///
/// Exactly one verdict may be issued. The first call claims the packet and
/// submits its mark; every later call fails with
/// [`VerdictError::AlreadyResolved`] without touching the kernel.
pub struct VerdictGate {
    packet_id: u32,
    queue: Arc<Queue>,
    info: Info,
    received_at: Instant,
    received_wall: DateTime<Local>,
    resolved: AtomicBool,
    action: OnceLock<Action>,
    // never sends; dropping it wakes every receiver at once
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl VerdictGate {
    /// Gate for a packet received just now.
    pub fn new(queue: Arc<Queue>, packet_id: u32, info: Info) -> Self {
        Self::with_times(queue, packet_id, info, Instant::now(), Local::now())
    }

    /// Gate for a dequeued packet, keeping its receive timestamps.
    pub fn for_packet(queue: Arc<Queue>, raw: &RawPacket, info: Info) -> Self {
        Self::with_times(queue, raw.id, info, raw.received_at, raw.received_wall)
    }

    fn with_times(
        queue: Arc<Queue>,
        packet_id: u32,
        info: Info,
        received_at: Instant,
        received_wall: DateTime<Local>,
    ) -> Self {
        let (done_tx, done_rx) = bounded(0);
        Self {
            packet_id,
            queue,
            info,
            received_at,
            received_wall,
            resolved: AtomicBool::new(false),
            action: OnceLock::new(),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
        }
    }

    pub fn packet_id(&self) -> u32 {
        self.packet_id
    }

    pub fn queue_id(&self) -> u16 {
        self.queue.id()
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Wall clock time the packet was dequeued.
    pub fn received_wall(&self) -> DateTime<Local> {
        self.received_wall
    }

    /// `pkt:<id> qid:<queue>`
    pub fn id(&self) -> String {
        format!("pkt:{} qid:{}", self.packet_id, self.queue.id())
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Action that was submitted, after any ICMP rewrite.
    pub fn resolved_action(&self) -> Option<Action> {
        self.action.get().copied()
    }

    /// Receiver that disconnects once the verdict attempt has finished.
    pub fn completion(&self) -> Receiver<()> {
        self.done_rx.clone()
    }

    pub fn wait_resolved(&self) {
        let _ = self.done_rx.recv();
    }

    /// Returns false if the verdict was still pending after `timeout`.
    pub fn wait_resolved_timeout(&self, timeout: Duration) -> bool {
        !matches!(
            self.done_rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }

    pub fn accept(&self) -> Result<(), VerdictError> {
        self.resolve(Action::Accept)
    }

    pub fn block(&self) -> Result<(), VerdictError> {
        self.resolve(Action::Block)
    }

    pub fn drop(&self) -> Result<(), VerdictError> {
        self.resolve(Action::Drop)
    }

    pub fn permanent_accept(&self) -> Result<(), VerdictError> {
        self.resolve(Action::PermanentAccept)
    }

    pub fn permanent_block(&self) -> Result<(), VerdictError> {
        self.resolve(Action::PermanentBlock)
    }

    pub fn permanent_drop(&self) -> Result<(), VerdictError> {
        self.resolve(Action::PermanentDrop)
    }

    pub fn reroute_to_nameserver(&self) -> Result<(), VerdictError> {
        self.resolve(Action::RerouteToNameserver)
    }

    pub fn reroute_to_tunnel(&self) -> Result<(), VerdictError> {
        self.resolve(Action::RerouteToTunnel)
    }

    /// Issue `action` for this packet. See the type docs for the
    /// exactly-once rule.
    pub fn resolve(&self, action: Action) -> Result<(), VerdictError> {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(VerdictError::AlreadyResolved);
        }
        // fires when this returns, whatever the kernel said
        let _completion = self.done_tx.lock().take();

        let action = if self.info.protocol.is_icmp() {
            action.for_icmp()
        } else {
            action
        };
        let _ = self.action.set(action);
        let mark = self.queue.marks().mark(action);

        match self.queue.submit_mark(self.packet_id, mark) {
            Ok(()) => {
                self.queue.stats().record_verdict(action);
                trace!(
                    event = "verdict_set",
                    packet_id = self.packet_id,
                    queue_id = self.queue.id(),
                    action = %action,
                    mark,
                    latency = ?self.received_at.elapsed(),
                    src = %self.info.src,
                    dst = %self.info.dst,
                    "nfqueue: marking packet {} with {}",
                    self.id(),
                    action
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    event = "verdict_fatal_error",
                    packet_id = self.packet_id,
                    queue_id = self.queue.id(),
                    action = %action,
                    mark,
                    protocol = %self.info.protocol,
                    src = %self.info.src,
                    dst = %self.info.dst,
                    error = %err,
                    "nfqueue: failed to set verdict {} for {}",
                    action,
                    self.id()
                );
                Err(err.into())
            }
        }
    }
}

impl Drop for VerdictGate {
    fn drop(&mut self) {
        if !self.is_resolved() {
            warn!(
                packet_id = self.packet_id,
                queue_id = self.queue.id(),
                "nfqueue: packet {} released without a verdict, kernel default applies",
                self.id()
            );
            self.queue.release(self.packet_id);
        }
    }
}

impl fmt::Debug for VerdictGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerdictGate")
            .field("packet_id", &self.packet_id)
            .field("queue_id", &self.queue.id())
            .field("info", &self.info)
            .field("received_wall", &self.received_wall)
            .field("resolved", &self.is_resolved())
            .field("action", &self.resolved_action())
            .finish()
    }
}
