//! Data path of an NFQUEUE host firewall.
//!
//! Packets come off a kernel queue, get decoded into [`packet::Info`], and
//! are handed to a decision engine together with a [`verdict::VerdictGate`].
//! The gate turns the decision into a packet mark exactly once and tells the
//! kernel through the owning [`queue::Queue`].

pub mod config;
pub mod engine;
pub mod error;
pub mod interception;
pub mod monitor;
pub mod packet;
pub mod queue;
pub mod verdict;

#[cfg(test)]
mod testing;

pub use error::{ConfigError, DecodeError, KernelError, QueueError, VerdictError};
pub use packet::{Info, IpProtocol, IpVersion, parse};
pub use queue::{KernelQueue, Queue, RawPacket};
pub use verdict::{Action, MarkTable, VerdictGate};
