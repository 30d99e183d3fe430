use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use lazy_static::lazy_static;

use super::Action;
use crate::error::ConfigError;

// Must match the marks used by the installed netfilter rules.
const MARK_ACCEPT: u32 = 1700;
const MARK_BLOCK: u32 = 1701;
const MARK_DROP: u32 = 1702;
const MARK_ACCEPT_ALWAYS: u32 = 1710;
const MARK_BLOCK_ALWAYS: u32 = 1711;
const MARK_DROP_ALWAYS: u32 = 1712;
const MARK_REROUTE_NS: u32 = 1799;
const MARK_REROUTE_SPN: u32 = 1717;

lazy_static! {
    pub static ref DEFAULT_MARKS: Arc<MarkTable> = Arc::new(MarkTable::default());
}

/// Action to packet mark lookup. Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkTable {
    marks: [u32; 8],
}

impl Default for MarkTable {
    fn default() -> Self {
        Self {
            marks: [
                MARK_ACCEPT,
                MARK_BLOCK,
                MARK_DROP,
                MARK_ACCEPT_ALWAYS,
                MARK_BLOCK_ALWAYS,
                MARK_DROP_ALWAYS,
                MARK_REROUTE_NS,
                MARK_REROUTE_SPN,
            ],
        }
    }
}

impl MarkTable {
    /// Default table with some marks replaced.
    ///
    /// Marks must stay non-zero (zero is "unmarked" to the kernel) and
    /// distinct, otherwise two actions would hit the same rule.
    pub fn with_overrides(overrides: &BTreeMap<Action, u32>) -> Result<Self, ConfigError> {
        let mut table = Self::default();
        for (action, mark) in overrides {
            table.marks[action.index()] = *mark;
        }

        let mut seen = HashSet::new();
        for action in Action::ALL {
            let mark = table.mark(action);
            if mark == 0 {
                return Err(ConfigError::Invalid(format!(
                    "mark for {action} must not be 0"
                )));
            }
            if !seen.insert(mark) {
                return Err(ConfigError::Invalid(format!(
                    "mark {mark} for {action} is used by another action"
                )));
            }
        }

        Ok(table)
    }

    pub fn mark(&self, action: Action) -> u32 {
        self.marks[action.index()]
    }

    pub fn action_for(&self, mark: u32) -> Option<Action> {
        Action::ALL.into_iter().find(|a| self.mark(*a) == mark)
    }

    /// Name of the action behind `mark`, "unknown" for foreign marks.
    pub fn mark_name(&self, mark: u32) -> &'static str {
        self.action_for(mark).map_or("unknown", Action::name)
    }
}
