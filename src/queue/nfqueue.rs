use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use nfq::{Message, Verdict};
use tracing::{debug, info, warn};

use super::{KernelQueue, Queue, RawPacket, classify_io_error};
use crate::error::{KernelError, QueueError};
use crate::verdict::MarkTable;

#[derive(Debug, Clone, Copy)]
pub struct NfqOptions {
    /// Kernel-side backlog limit for the queue.
    pub max_len: u32,
    /// Bytes of each packet copied to user space.
    pub copy_range: u16,
}

impl Default for NfqOptions {
    fn default() -> Self {
        Self {
            max_len: 10000,
            copy_range: 0xFFFF,
        }
    }
}

/// Messages waiting for their verdict, keyed by kernel packet id.
struct Parked<M> {
    queue_num: u16,
    messages: HashMap<u32, M>,
}

impl<M> Parked<M> {
    fn new(queue_num: u16) -> Self {
        Self {
            queue_num,
            messages: HashMap::new(),
        }
    }

    fn park(&mut self, packet_id: u32, msg: M) {
        if self.messages.insert(packet_id, msg).is_some() {
            warn!(
                queue_id = self.queue_num,
                packet_id, "nfqueue: packet id reused while still parked, older packet lost"
            );
        }
    }

    fn take(&mut self, packet_id: u32) -> Option<M> {
        self.messages.remove(&packet_id)
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn clear(&mut self) {
        self.messages.clear();
    }
}

/// NFQUEUE transport backed by the `nfq` crate.
///
/// Received messages stay parked here until their verdict is sent.
pub struct NfqTransport {
    queue_num: u16,
    inner: Option<nfq::Queue>,
    parked: Parked<Message>,
}

fn make_queue(queue_num: u16, options: NfqOptions) -> io::Result<nfq::Queue> {
    let mut q = nfq::Queue::open()?;
    q.bind(queue_num)?;
    q.set_copy_range(queue_num, options.copy_range)?;
    q.set_queue_max_len(queue_num, options.max_len)?;
    // dequeue must not sleep while holding the queue lock
    q.set_nonblocking(true);
    Ok(q)
}

impl NfqTransport {
    pub fn open(queue_num: u16, options: NfqOptions) -> Result<Self, QueueError> {
        let inner = make_queue(queue_num, options).map_err(|source| QueueError::Open {
            queue_id: queue_num,
            source,
        })?;
        info!(
            queue_id = queue_num,
            max_len = options.max_len,
            copy_range = options.copy_range,
            "nfqueue: bound queue"
        );

        Ok(Self {
            queue_num,
            inner: Some(inner),
            parked: Parked::new(queue_num),
        })
    }
}

/// Open NFQUEUE `queue_num` and wrap it in a [`Queue`].
pub fn open_queue(
    queue_num: u16,
    options: NfqOptions,
    marks: Arc<MarkTable>,
) -> Result<Arc<Queue>, QueueError> {
    let transport = NfqTransport::open(queue_num, options)?;
    Ok(Queue::open(queue_num, Box::new(transport), marks))
}

impl KernelQueue for NfqTransport {
    fn dequeue(&mut self) -> io::Result<Option<RawPacket>> {
        let Some(queue) = self.inner.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "queue already closed",
            ));
        };

        match queue.recv() {
            Ok(msg) => {
                let packet = RawPacket::new(msg.get_packet_id(), msg.get_payload().to_vec());
                self.parked.park(packet.id, msg);
                Ok(Some(packet))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // ENOBUFS here means the kernel dropped messages for us; keep reading
            Err(e) if classify_io_error(&e).is_transient() => {
                debug!(queue_id = self.queue_num, error = %e, "nfqueue: transient receive error");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn set_verdict_with_mark(&mut self, packet_id: u32, mark: u32) -> Result<(), KernelError> {
        let queue_num = self.queue_num;
        let queue = self
            .inner
            .as_mut()
            .ok_or_else(|| KernelError::Fatal(format!("queue {queue_num} already closed")))?;
        let mut msg = self
            .parked
            .take(packet_id)
            .ok_or_else(|| KernelError::Fatal(format!("unknown packet id {packet_id}")))?;

        msg.set_nfmark(mark);
        msg.set_verdict(Verdict::Accept);

        // nfq consumes the message, so a failed send cannot be replayed
        queue
            .verdict(msg)
            .map_err(|e| KernelError::Fatal(e.to_string()))
    }

    fn release(&mut self, packet_id: u32) {
        self.parked.take(packet_id);
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.parked.is_empty() {
            warn!(
                queue_id = self.queue_num,
                unresolved = self.parked.len(),
                "nfqueue: closing with packets still waiting for a verdict"
            );
            self.parked.clear();
        }

        if let Some(mut queue) = self.inner.take() {
            queue.unbind(self.queue_num)?;
        }
        Ok(())
    }
}
