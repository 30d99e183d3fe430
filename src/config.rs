//! Daemon configuration, read from a TOML file.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::nfqueue::NfqOptions;
use crate::verdict::{Action, DEFAULT_MARKS, MarkTable};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// NFQUEUE numbers to bind, one reader thread each.
    pub queues: Vec<u16>,
    pub queue_max_len: u32,
    pub copy_range: u16,
    /// Threads resolving verdicts.
    pub workers: usize,
    /// Decoded packets waiting for a worker before the readers block.
    pub worker_backlog: usize,
    pub default_action: Action,
    /// Applied to packets that fail to decode.
    pub decode_failure_action: Action,
    /// Replaces the default mark of individual actions.
    pub marks: BTreeMap<Action, u32>,
    /// 0 disables the periodic report.
    pub report_interval_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let nfq = NfqOptions::default();
        Self {
            queues: vec![17040],
            queue_max_len: nfq.max_len,
            copy_range: nfq.copy_range,
            workers: 4,
            worker_backlog: 1024,
            default_action: Action::Accept,
            decode_failure_action: Action::Drop,
            marks: BTreeMap::new(),
            report_interval_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::Invalid("at least one queue is required".into()));
        }
        let mut seen = HashSet::new();
        for q in &self.queues {
            if !seen.insert(q) {
                return Err(ConfigError::Invalid(format!("queue {q} listed twice")));
            }
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.worker_backlog == 0 {
            return Err(ConfigError::Invalid(
                "worker_backlog must be at least 1".into(),
            ));
        }
        if self.copy_range < 40 {
            return Err(ConfigError::Invalid(format!(
                "copy_range {} cannot hold an IPv6 header",
                self.copy_range
            )));
        }
        self.mark_table().map(|_| ())
    }

    /// The shared default table unless marks are overridden.
    pub fn mark_table(&self) -> Result<Arc<MarkTable>, ConfigError> {
        if self.marks.is_empty() {
            return Ok(DEFAULT_MARKS.clone());
        }
        MarkTable::with_overrides(&self.marks).map(Arc::new)
    }

    pub fn nfq_options(&self) -> NfqOptions {
        NfqOptions {
            max_len: self.queue_max_len,
            copy_range: self.copy_range,
        }
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }
}
