//! Scripted in-memory kernel queue for tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use super::{KernelQueue, RawPacket};
use crate::error::KernelError;

#[derive(Default)]
pub(crate) struct MockState {
    inbox: Mutex<VecDeque<RawPacket>>,
    results: Mutex<VecDeque<Result<(), KernelError>>>,
    verdicts: Mutex<Vec<(u32, u32)>>,
    released: Mutex<Vec<u32>>,
    attempts: AtomicUsize,
    closed: AtomicBool,
    hold: Mutex<Option<Receiver<()>>>,
}

impl MockState {
    pub(crate) fn push_packet(&self, packet: RawPacket) {
        self.inbox.lock().push_back(packet);
    }

    /// Outcome of the next verdict attempt. Attempts beyond the script succeed.
    pub(crate) fn push_result(&self, result: Result<(), KernelError>) {
        self.results.lock().push_back(result);
    }

    /// Make every verdict attempt wait for one message on the returned sender.
    pub(crate) fn hold_verdicts(&self) -> Sender<()> {
        let (tx, rx) = unbounded();
        *self.hold.lock() = Some(rx);
        tx
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful verdicts as `(packet_id, mark)`.
    pub(crate) fn verdicts(&self) -> Vec<(u32, u32)> {
        self.verdicts.lock().clone()
    }

    /// Packet ids let go without a verdict.
    pub(crate) fn released(&self) -> Vec<u32> {
        self.released.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn inbox_len(&self) -> usize {
        self.inbox.lock().len()
    }
}

pub(crate) struct MockKernel {
    state: Arc<MockState>,
}

impl MockKernel {
    pub(crate) fn new() -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl KernelQueue for MockKernel {
    fn dequeue(&mut self) -> io::Result<Option<RawPacket>> {
        Ok(self.state.inbox.lock().pop_front())
    }

    fn set_verdict_with_mark(&mut self, packet_id: u32, mark: u32) -> Result<(), KernelError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        let hold = self.state.hold.lock().clone();
        if let Some(rx) = hold {
            let _ = rx.recv();
        }

        let result = self.state.results.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.state.verdicts.lock().push((packet_id, mark));
        }
        result
    }

    fn release(&mut self, packet_id: u32) {
        self.state.released.lock().push(packet_id);
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
