//! Bounded execution history

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::Payload;
use crate::sandbox::PluginResult;

/// Default number of executions retained
pub const DEFAULT_LEDGER_CAPACITY: usize = 1000;

/// One completed invocation. Never mutated after recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginExecution {
    pub id: Uuid,
    pub plugin_id: Uuid,
    pub input: Payload,
    pub result: PluginResult,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
}

/// Append-only ledger that evicts its oldest entries past capacity.
///
/// Insertion order is completion order.
#[derive(Debug, Clone)]
pub struct ExecutionLedger {
    entries: VecDeque<PluginExecution>,
    capacity: usize,
}

impl ExecutionLedger {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }

    /// A capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_LEDGER_CAPACITY)),
            capacity,
        }
    }

    pub fn record(&mut self, execution: PluginExecution) {
        self.entries.push_back(execution);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &PluginExecution> {
        self.entries.iter()
    }

    /// Entries for one plugin, oldest first
    pub fn for_plugin(&self, plugin_id: Uuid) -> impl Iterator<Item = &PluginExecution> {
        self.entries.iter().filter(move |e| e.plugin_id == plugin_id)
    }

    /// The `limit` most recent entries, oldest first
    pub fn recent(&self, limit: usize) -> impl Iterator<Item = &PluginExecution> {
        self.entries.iter().skip(self.entries.len().saturating_sub(limit))
    }
}

impl Default for ExecutionLedger {
    fn default() -> Self {
        Self::new()
    }
}
