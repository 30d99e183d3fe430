use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::info;

use crate::queue::{Queue, StatsSnapshot};
use crate::verdict::Action;

/// Per-queue activity over one report window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueReport {
    pub queue_id: u16,
    pub received: u64,
    pub verdicts: [u64; 8],
    pub decode_failed: u64,
    pub kernel_errors: u64,
    /// In-flight verdict submissions at report time, not a rate.
    pub pending: usize,
}

impl QueueReport {
    pub fn total_verdicts(&self) -> u64 {
        self.verdicts.iter().sum()
    }
}

/// Periodic verdict summary over a set of queues.
pub struct Monitor {
    name: String,
    queues: Vec<Arc<Queue>>,
    interval: Duration,
    last: HashMap<u16, StatsSnapshot>,
    last_report: Instant,
}

impl Monitor {
    pub fn new(name: &str, queues: Vec<Arc<Queue>>, interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            queues,
            interval,
            last: HashMap::new(),
            last_report: Instant::now(),
        }
    }

    /// Report if the interval has passed since the last one.
    pub fn check_and_report(&mut self) -> Option<Vec<QueueReport>> {
        if self.last_report.elapsed() >= self.interval {
            Some(self.report())
        } else {
            None
        }
    }

    pub fn report(&mut self) -> Vec<QueueReport> {
        let elapsed = self.last_report.elapsed();
        let now_str = Local::now().format("%H:%M:%S").to_string();

        let mut reports: Vec<QueueReport> = self
            .queues
            .iter()
            .map(|queue| {
                let current = queue.stats().snapshot();
                let previous = self.last.insert(queue.id(), current).unwrap_or_default();

                let mut verdicts = [0; 8];
                for (i, slot) in verdicts.iter_mut().enumerate() {
                    *slot = current.verdicts[i] - previous.verdicts[i];
                }

                QueueReport {
                    queue_id: queue.id(),
                    received: current.received - previous.received,
                    verdicts,
                    decode_failed: current.decode_failed - previous.decode_failed,
                    kernel_errors: current.kernel_errors - previous.kernel_errors,
                    pending: queue.pending_verdicts(),
                }
            })
            .collect();
        reports.sort_unstable_by_key(|r| r.queue_id);

        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        for r in &reports {
            let by_action = Action::ALL
                .iter()
                .zip(r.verdicts)
                .filter(|(_, n)| *n > 0)
                .map(|(a, n)| format!("{a}={n}"))
                .collect::<Vec<_>>()
                .join(" ");

            info!(
                monitor = %self.name,
                at = %now_str,
                queue_id = r.queue_id,
                received_per_sec = format_args!("{:.1}", r.received as f64 / secs),
                verdicts = r.total_verdicts(),
                decode_failed = r.decode_failed,
                kernel_errors = r.kernel_errors,
                pending = r.pending,
                "verdicts: {}",
                if by_action.is_empty() { "-" } else { by_action.as_str() }
            );
        }

        self.last_report = Instant::now();
        reports
    }
}
