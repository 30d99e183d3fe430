use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, error, info};

use crate::error::QueueError;
use crate::packet;
use crate::queue::{Queue, RawPacket};
use crate::verdict::{Action, VerdictGate};

const BATCH_LIMIT: usize = 10000;
const IDLE_SLEEP: Duration = Duration::from_micros(100);
const PREFIX_LEN: usize = 16;

/// Reader side of one queue: dequeue, decode, hand off to the workers.
pub struct Interceptor {
    queue: Arc<Queue>,
    dispatch: Sender<VerdictGate>,
    /// Used when a packet cannot be decoded or no worker will take it.
    fallback: Action,
}

fn byte_prefix(data: &[u8]) -> String {
    data.iter()
        .take(PREFIX_LEN)
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl Interceptor {
    pub fn new(queue: Arc<Queue>, dispatch: Sender<VerdictGate>, fallback: Action) -> Self {
        Self {
            queue,
            dispatch,
            fallback,
        }
    }

    /// Pump packets until `shutdown` is set or the queue closes.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<(), QueueError> {
        info!(queue_id = self.queue.id(), "nfqueue: interception started");

        while !shutdown.load(Ordering::Relaxed) {
            match self.poll() {
                Ok(0) => thread::sleep(IDLE_SLEEP),
                Ok(_) => {}
                Err(QueueError::Closed(_)) => break,
                Err(e) => return Err(e),
            }
        }

        info!(queue_id = self.queue.id(), "nfqueue: interception stopped");
        Ok(())
    }

    /// Drain up to one batch of ready packets. Returns how many were handled.
    pub fn poll(&self) -> Result<usize, QueueError> {
        let mut handled = 0;
        while handled < BATCH_LIMIT {
            match self.queue.dequeue()? {
                Some(raw) => {
                    self.handle(raw);
                    handled += 1;
                }
                None => break,
            }
        }
        Ok(handled)
    }

    fn handle(&self, raw: RawPacket) {
        let info = match packet::parse(&raw.payload) {
            Ok(info) => info,
            Err(err) => {
                self.queue.stats().record_decode_failure();
                debug!(
                    event = "decode_failed",
                    packet_id = raw.id,
                    queue_id = self.queue.id(),
                    reason = %err,
                    byte_prefix = %byte_prefix(&raw.payload),
                    "nfqueue: failed to decode packet"
                );
                self.fallback_verdict(raw.id);
                return;
            }
        };

        let gate = VerdictGate::for_packet(self.queue.clone(), &raw, info);
        if let Err(returned) = self.dispatch.send(gate) {
            let gate = returned.into_inner();
            debug!(packet = %gate.id(), "nfqueue: no worker available, applying fallback");
            let _ = gate.resolve(self.fallback);
        }
    }

    fn fallback_verdict(&self, packet_id: u32) {
        let mark = self.queue.marks().mark(self.fallback);
        match self.queue.submit_mark(packet_id, mark) {
            Ok(()) => self.queue.stats().record_verdict(self.fallback),
            Err(err) => error!(
                event = "verdict_fatal_error",
                packet_id,
                queue_id = self.queue.id(),
                mark,
                error = %err,
                "nfqueue: failed to set fallback verdict {}",
                self.fallback
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{StaticDecider, WorkerPool};
    use crate::packet::fixtures::{ipv4, ipv6, tcp};
    use crate::queue::mock::MockKernel;
    use crate::testing::EventRecorder;
    use crate::verdict::DEFAULT_MARKS;
    use tracing_subscriber::layer::SubscriberExt;

    fn raw(id: u32, payload: Vec<u8>) -> RawPacket {
        RawPacket::new(id, payload)
    }

    #[test]
    fn prefix_is_hex() {
        assert_eq!(byte_prefix(&[0x45, 0x00, 0xff]), "4500ff");
        assert_eq!(byte_prefix(&[0u8; 40]).len(), PREFIX_LEN * 2);
    }

    #[test]
    fn decoded_packets_reach_workers_and_bad_ones_fall_back() {
        let (kernel, state) = MockKernel::new();
        state.push_packet(raw(1, ipv4([10, 0, 0, 1], [10, 0, 0, 2], 6, &tcp(1234, 80))));
        state.push_packet(raw(2, vec![]));
        state.push_packet(raw(3, vec![0x70, 0, 0, 0]));
        state.push_packet(raw(4, ipv6(6, &tcp(5353, 443))));
        // ICMP over the worker's block decision becomes a drop
        state.push_packet(raw(5, ipv4([10, 0, 0, 1], [10, 0, 0, 2], 1, &[8, 0, 0, 0])));

        let queue = Queue::open(5, Box::new(kernel), DEFAULT_MARKS.clone());
        let pool = WorkerPool::spawn(2, 8, Arc::new(StaticDecider::new(Action::Block)));
        let sender = pool.sender().unwrap();
        let interceptor = Interceptor::new(queue.clone(), sender, Action::Drop);

        let recorder = EventRecorder::default();
        let subscriber = tracing_subscriber::registry().with(recorder.clone());
        let handled =
            tracing::subscriber::with_default(subscriber, || interceptor.poll().unwrap());
        assert_eq!(handled, 5);
        assert_eq!(state.inbox_len(), 0);

        let failures = recorder.events("decode_failed");
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0]["packet_id"], "2");
        assert_eq!(failures[0]["reason"], "empty packet");
        assert_eq!(failures[0]["byte_prefix"], "");
        assert_eq!(failures[1]["packet_id"], "3");
        assert_eq!(failures[1]["byte_prefix"], "70000000");

        drop(interceptor);
        pool.shutdown();

        let mut verdicts = state.verdicts();
        verdicts.sort_unstable();
        assert_eq!(
            verdicts,
            vec![(1, 1701), (2, 1702), (3, 1702), (4, 1701), (5, 1702)]
        );

        let stats = queue.stats().snapshot();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.decode_failed, 2);
        assert_eq!(queue.pending_verdicts(), 0);
    }

    #[test]
    fn run_stops_on_shutdown_flag_and_close() {
        let (kernel, _state) = MockKernel::new();
        let queue = Queue::open(6, Box::new(kernel), DEFAULT_MARKS.clone());
        let pool = WorkerPool::spawn(1, 1, Arc::new(StaticDecider::new(Action::Accept)));
        let interceptor = Interceptor::new(queue.clone(), pool.sender().unwrap(), Action::Accept);

        let shutdown = AtomicBool::new(true);
        interceptor.run(&shutdown).unwrap();

        queue.close().unwrap();
        let shutdown = AtomicBool::new(false);
        interceptor.run(&shutdown).unwrap();

        drop(interceptor);
        pool.shutdown();
    }

    #[test]
    fn gates_fall_back_when_pool_is_gone() {
        let (kernel, state) = MockKernel::new();
        state.push_packet(raw(9, ipv4([10, 0, 0, 1], [10, 0, 0, 2], 6, &tcp(1, 2))));
        let queue = Queue::open(7, Box::new(kernel), DEFAULT_MARKS.clone());

        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        let interceptor = Interceptor::new(queue, tx, Action::PermanentDrop);

        interceptor.poll().unwrap();
        assert_eq!(state.verdicts(), vec![(9, 1712)]);
    }
}
