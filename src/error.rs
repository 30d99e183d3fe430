use std::io;

use thiserror::Error;

/// Failure to turn raw bytes into an [`Info`](crate::packet::Info).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty packet")]
    EmptyInput,

    #[error("unknown IP version or network protocol: {0:02x}")]
    UnsupportedIpVersion(u8),

    #[error("malformed layer: {0}")]
    MalformedLayer(String),
}

/// Error reported by a kernel queue transport when setting a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Timeout or temporary resource shortage, expected to pass on retry.
    #[error("transient kernel error: {0}")]
    Transient(String),

    #[error("kernel error: {0}")]
    Fatal(String),
}

impl KernelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, KernelError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerdictError {
    /// A verdict was already issued for this packet. Caller bug.
    #[error("verdict already set")]
    AlreadyResolved,

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open queue {queue_id}: {source}")]
    Open { queue_id: u16, source: io::Error },

    #[error("failed to receive from queue {queue_id}: {source}")]
    Recv { queue_id: u16, source: io::Error },

    #[error("queue {0} is closed")]
    Closed(u16),

    #[error("failed to close queue {queue_id}: {source}")]
    Close { queue_id: u16, source: io::Error },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
