use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error, info};

use crate::packet::Info;
use crate::verdict::{Action, VerdictGate};

/// Decides what happens to a packet. Policy lives behind this seam.
pub trait Decider: Send + Sync {
    fn decide(&self, info: &Info) -> Action;
}

impl<F> Decider for F
where
    F: Fn(&Info) -> Action + Send + Sync,
{
    fn decide(&self, info: &Info) -> Action {
        self(info)
    }
}

/// Applies the same action to every packet.
#[derive(Debug, Clone, Copy)]
pub struct StaticDecider {
    action: Action,
}

impl StaticDecider {
    pub fn new(action: Action) -> Self {
        Self { action }
    }
}

impl Decider for StaticDecider {
    fn decide(&self, _info: &Info) -> Action {
        self.action
    }
}

/// Threads that take gates off a bounded channel and resolve each one.
///
/// Gates still queued when the pool shuts down are resolved before the
/// workers exit.
pub struct WorkerPool {
    tx: Option<Sender<VerdictGate>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, backlog: usize, decider: Arc<dyn Decider>) -> Self {
        let (tx, rx) = bounded(backlog);

        let handles = (0..workers)
            .map(|n| {
                let rx = rx.clone();
                let decider = decider.clone();
                thread::Builder::new()
                    .name(format!("verdict-worker-{n}"))
                    .spawn(move || worker_loop(rx, decider))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!(error = %e, "failed to spawn verdict worker");
                    None
                }
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), backlog, "verdict workers started");
        Self {
            tx: Some(tx),
            handles,
        }
    }

    /// Sender side for the interception loops.
    pub fn sender(&self) -> Option<Sender<VerdictGate>> {
        self.tx.clone()
    }

    /// Stop accepting gates and wait until every queued one is resolved.
    /// Senders handed out through [`sender`](Self::sender) must be dropped
    /// first.
    pub fn shutdown(mut self) {
        self.tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("verdict workers stopped");
    }
}

fn worker_loop(rx: Receiver<VerdictGate>, decider: Arc<dyn Decider>) {
    for gate in rx.iter() {
        let action = decider.decide(gate.info());
        if let Err(e) = gate.resolve(action) {
            // already logged with full context by the gate
            debug!(packet = %gate.id(), error = %e, "verdict not applied");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IpProtocol, IpVersion};
    use crate::queue::Queue;
    use crate::queue::mock::MockKernel;
    use crate::verdict::DEFAULT_MARKS;

    fn info(dst_port: u16) -> Info {
        Info {
            ip_version: IpVersion::V4,
            src: "192.168.0.2".parse().unwrap(),
            dst: "192.168.0.1".parse().unwrap(),
            protocol: IpProtocol::Udp,
            src_port: Some(50000),
            dst_port: Some(dst_port),
        }
    }

    #[test]
    fn closures_are_deciders() {
        let decider = |info: &Info| {
            if info.dst_port == Some(53) {
                Action::RerouteToNameserver
            } else {
                Action::Accept
            }
        };
        assert_eq!(decider.decide(&info(53)), Action::RerouteToNameserver);
        assert_eq!(decider.decide(&info(443)), Action::Accept);
        assert_eq!(
            StaticDecider::new(Action::Block).decide(&info(53)),
            Action::Block
        );
    }

    #[test]
    fn pool_resolves_everything_before_shutdown() {
        let (kernel, state) = MockKernel::new();
        let queue = Queue::open(2, Box::new(kernel), DEFAULT_MARKS.clone());
        let pool = WorkerPool::spawn(3, 4, Arc::new(StaticDecider::new(Action::PermanentAccept)));

        let sender = pool.sender().unwrap();
        for id in 0..32 {
            sender
                .send(VerdictGate::new(queue.clone(), id, info(443)))
                .unwrap();
        }
        drop(sender);
        pool.shutdown();

        let mut verdicts = state.verdicts();
        verdicts.sort_unstable();
        let expected: Vec<_> = (0..32).map(|id| (id, 1710)).collect();
        assert_eq!(verdicts, expected);
        assert_eq!(queue.pending_verdicts(), 0);
        assert_eq!(
            queue.stats().snapshot().verdicts[Action::PermanentAccept.index()],
            32
        );
    }
}
