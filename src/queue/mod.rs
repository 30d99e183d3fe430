use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{KernelError, QueueError};
use crate::verdict::{Action, MarkTable};

#[cfg(test)]
pub(crate) mod mock;
pub mod nfqueue;

/// Retries below this count stay quiet.
const RETRY_WARN_THRESHOLD: u64 = 16;

/// Datagram handed out by a kernel queue.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// Kernel-assigned identifier, unique within the queue's backlog.
    pub id: u32,
    pub payload: Vec<u8>,
    /// When the packet came off the queue.
    pub received_at: Instant,
    pub received_wall: DateTime<Local>,
}

impl RawPacket {
    /// Stamps the packet with the current time.
    pub fn new(id: u32, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload,
            received_at: Instant::now(),
            received_wall: Local::now(),
        }
    }
}

/// Kernel side of a packet queue.
///
/// Implementations classify their own failures: anything worth retrying
/// right away comes back as [`KernelError::Transient`].
pub trait KernelQueue: Send {
    /// Next queued packet, `None` if nothing is ready.
    fn dequeue(&mut self) -> io::Result<Option<RawPacket>>;

    /// Accept the packet with `mark` attached.
    fn set_verdict_with_mark(&mut self, packet_id: u32, mark: u32) -> Result<(), KernelError>;

    /// Forget `packet_id` without a verdict. The kernel's own default
    /// disposition applies to it.
    fn release(&mut self, packet_id: u32);

    fn close(&mut self) -> io::Result<()>;
}

/// Map an OS error to the retry classes of [`KernelError`].
pub fn classify_io_error(err: &io::Error) -> KernelError {
    let transient = match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => true,
        _ => matches!(
            err.raw_os_error(),
            Some(libc::EINTR | libc::EAGAIN | libc::ENOBUFS | libc::ETIMEDOUT)
        ),
    };

    if transient {
        KernelError::Transient(err.to_string())
    } else {
        KernelError::Fatal(err.to_string())
    }
}

/// Per-queue counters read by the monitor.
#[derive(Debug, Default)]
pub struct QueueStats {
    received: AtomicU64,
    verdicts: [AtomicU64; 8],
    decode_failed: AtomicU64,
    kernel_errors: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub verdicts: [u64; 8],
    pub decode_failed: u64,
    pub kernel_errors: u64,
}

impl QueueStats {
    pub fn record_verdict(&self, action: Action) {
        self.verdicts[action.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kernel_error(&self) {
        self.kernel_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut verdicts = [0; 8];
        for (slot, counter) in verdicts.iter_mut().zip(&self.verdicts) {
            *slot = counter.load(Ordering::Relaxed);
        }
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            verdicts,
            decode_failed: self.decode_failed.load(Ordering::Relaxed),
            kernel_errors: self.kernel_errors.load(Ordering::Relaxed),
        }
    }
}

/// One kernel packet queue plus the bookkeeping needed to shut it down
/// without losing in-flight verdicts.
pub struct Queue {
    id: u16,
    transport: Mutex<Box<dyn KernelQueue>>,
    marks: Arc<MarkTable>,
    pending_verdicts: AtomicUsize,
    // single slot; a full slot already guarantees the waiter wakes up
    drain_tx: Sender<()>,
    drain_rx: Receiver<()>,
    closing: AtomicBool,
    closed: AtomicBool,
    stats: QueueStats,
}

/// Keeps `pending_verdicts` balanced even if the transport panics.
struct PendingGuard<'a>(&'a Queue);

impl<'a> PendingGuard<'a> {
    fn enter(queue: &'a Queue) -> Self {
        queue.pending_verdicts.fetch_add(1, Ordering::SeqCst);
        PendingGuard(queue)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.pending_verdicts.fetch_sub(1, Ordering::SeqCst);
        let _ = self.0.drain_tx.try_send(());
    }
}

impl Queue {
    pub fn open(id: u16, transport: Box<dyn KernelQueue>, marks: Arc<MarkTable>) -> Arc<Self> {
        let (drain_tx, drain_rx) = bounded(1);
        Arc::new(Self {
            id,
            transport: Mutex::new(transport),
            marks,
            pending_verdicts: AtomicUsize::new(0),
            drain_tx,
            drain_rx,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats: QueueStats::default(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn marks(&self) -> &MarkTable {
        &self.marks
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn pending_verdicts(&self) -> usize {
        self.pending_verdicts.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Pull the next packet. `Ok(None)` when the kernel has nothing ready.
    pub fn dequeue(&self) -> Result<Option<RawPacket>, QueueError> {
        if self.is_closing() {
            return Err(QueueError::Closed(self.id));
        }

        let packet = self
            .transport
            .lock()
            .dequeue()
            .map_err(|source| QueueError::Recv {
                queue_id: self.id,
                source,
            })?;

        if packet.is_some() {
            self.stats.received.fetch_add(1, Ordering::Relaxed);
        }
        Ok(packet)
    }

    /// Hand `mark` to the kernel for `packet_id`.
    ///
    /// Transient errors are retried immediately until the call succeeds or
    /// fails for good. The call counts as pending for its whole duration.
    pub fn submit_mark(&self, packet_id: u32, mark: u32) -> Result<(), KernelError> {
        let _pending = PendingGuard::enter(self);

        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            let result = self
                .transport
                .lock()
                .set_verdict_with_mark(packet_id, mark);

            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    if attempts >= RETRY_WARN_THRESHOLD && attempts.is_power_of_two() {
                        warn!(
                            event = "verdict_retry_warning",
                            packet_id,
                            queue_id = self.id,
                            attempt_count = attempts,
                            error = %err,
                            "nfqueue: still retrying verdict"
                        );
                    }
                }
                Err(err) => {
                    debug!(
                        packet_id,
                        queue_id = self.id,
                        mark,
                        attempt_count = attempts,
                        error = %err,
                        "nfqueue: verdict failed"
                    );
                    self.stats.record_kernel_error();
                    return Err(err);
                }
            }
        }
    }

    /// Drop the transport's state for a packet that will never get a verdict.
    pub fn release(&self, packet_id: u32) {
        self.transport.lock().release(packet_id);
    }

    /// Block until no verdict submission is in flight.
    pub fn wait_drained(&self) {
        while self.pending_verdicts() > 0 {
            let _ = self.drain_rx.recv();
        }
    }

    /// Like [`wait_drained`](Self::wait_drained) but gives up after
    /// `timeout`. Returns whether the queue drained.
    pub fn wait_drained_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending_verdicts() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self.drain_rx.recv_timeout(deadline - now);
        }
        true
    }

    /// Stop dequeuing, wait for in-flight verdicts, release the kernel handle.
    pub fn close(&self) -> Result<(), QueueError> {
        self.closing.store(true, Ordering::SeqCst);

        loop {
            let pending = self.pending_verdicts();
            if pending == 0 {
                break;
            }
            match self.drain_rx.recv_timeout(Duration::from_secs(1)) {
                Err(RecvTimeoutError::Timeout) => {
                    info!(
                        queue_id = self.id,
                        pending, "nfqueue: waiting for pending verdicts"
                    );
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }

        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.transport
            .lock()
            .close()
            .map_err(|source| QueueError::Close {
                queue_id: self.id,
                source,
            })?;
        info!(queue_id = self.id, "nfqueue: queue closed");
        Ok(())
    }
}
