//! Sandboxed execution of a single plugin invocation
//!
//! The executor wraps a pluggable [`CodeRunner`] with budget enforcement and
//! a chronological log trail:
//! - The duration budget is enforced with a timer. An overrun drops the
//!   runner future and reports [`PluginError::ExecutionTimeout`].
//! - The memory budget is handed to the runner. The executor itself does not
//!   meter memory; [`crate::wasm::WasmRunner`] enforces it through store
//!   limits, other runners treat it as advisory.
//!
//! Failures are reported in the [`SandboxReport`] and never escape as panics;
//! the registry converts them into failed [`PluginResult`]s.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::manifest::Permission;
use crate::payload::Payload;
use crate::{PluginError, Result};

/// Default memory budget per invocation (100 MB)
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 100 * 1024 * 1024;

/// Default wall-clock budget per invocation
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(30);

/// Deployment environment a plugin runs in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!(
                "Unknown environment '{other}'. Expected development, staging or production."
            )),
        }
    }
}

/// Per-invocation context. Built fresh for every call, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContext {
    pub plugin_id: Uuid,
    pub permissions: BTreeSet<Permission>,
    pub environment: Environment,
}

impl PluginContext {
    pub fn new(
        plugin_id: Uuid,
        permissions: BTreeSet<Permission>,
        environment: Environment,
    ) -> Self {
        Self {
            plugin_id,
            permissions,
            environment,
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Outcome of one invocation as seen by callers and the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResult {
    pub success: bool,
    pub output: Option<Payload>,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub duration_ms: u64,
}

impl PluginResult {
    pub fn success(output: Payload, logs: Vec<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            logs,
            duration_ms,
        }
    }

    pub fn failure(error: impl Into<String>, logs: Vec<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            logs,
            duration_ms,
        }
    }
}

/// Declared resource budgets for one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub max_memory_bytes: u64,
    pub max_duration: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_duration: DEFAULT_MAX_DURATION,
        }
    }
}

/// Everything a runner needs for one invocation. Owned so it can cross tasks.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub plugin_id: Uuid,
    pub plugin_name: String,
    pub entry_point: String,
    pub input: Payload,
    pub context: PluginContext,
    pub limits: SandboxLimits,
}

/// The code-running collaborator: interpreter, VM or in-process handler.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, request: RunRequest) -> Result<Payload>;
}

/// What the executor observed for one run
#[derive(Debug)]
pub struct SandboxReport {
    pub result: Result<Payload>,
    pub logs: Vec<String>,
    pub elapsed: Duration,
}

impl SandboxReport {
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

impl From<SandboxReport> for PluginResult {
    fn from(report: SandboxReport) -> Self {
        let duration_ms = report.elapsed_ms();
        match report.result {
            Ok(output) => Self::success(output, report.logs, duration_ms),
            Err(e) => Self::failure(e.to_string(), report.logs, duration_ms),
        }
    }
}

#[derive(Clone)]
pub struct SandboxExecutor {
    runner: Arc<dyn CodeRunner>,
}

impl SandboxExecutor {
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self { runner }
    }

    /// Run one invocation under its declared budgets.
    pub async fn execute(&self, request: RunRequest) -> SandboxReport {
        let limits = request.limits;
        let mut logs = vec![format!(
            "Starting plugin '{}' ({}) entry '{}' with budget {} bytes / {}ms",
            request.plugin_name,
            request.plugin_id,
            request.entry_point,
            limits.max_memory_bytes,
            limits.max_duration.as_millis()
        )];

        debug!(
            plugin_id = %request.plugin_id,
            entry_point = %request.entry_point,
            "Dispatching sandboxed run"
        );

        let start = Instant::now();
        let result = match tokio::time::timeout(limits.max_duration, self.runner.run(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(PluginError::ExecutionTimeout(limits.max_duration)),
        };
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => logs.push(format!("Completed in {}ms", elapsed.as_millis())),
            Err(e) => logs.push(format!("Failed after {}ms: {}", elapsed.as_millis(), e)),
        }

        SandboxReport {
            result,
            logs,
            elapsed,
        }
    }
}

/// Split `scheme:target` entry points. Entry points without a scheme return `None`.
pub fn split_entry_point(entry_point: &str) -> (Option<&str>, &str) {
    match entry_point.split_once(':') {
        Some((scheme, target)) if !scheme.is_empty() => (Some(scheme), target),
        _ => (None, entry_point),
    }
}

/// Dispatches to a runner chosen by the entry point's scheme.
#[derive(Clone, Default)]
pub struct RouterRunner {
    runners: HashMap<String, Arc<dyn CodeRunner>>,
}

impl RouterRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, scheme: impl Into<String>, runner: Arc<dyn CodeRunner>) -> Self {
        self.runners.insert(scheme.into(), runner);
        self
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

#[async_trait]
impl CodeRunner for RouterRunner {
    async fn run(&self, request: RunRequest) -> Result<Payload> {
        let runner = match split_entry_point(&request.entry_point) {
            (Some(scheme), _) => self.runners.get(scheme).cloned().ok_or_else(|| {
                PluginError::ExecutionFailed(format!(
                    "No runner registered for entry point scheme '{scheme}'"
                ))
            })?,
            (None, _) => {
                return Err(PluginError::ExecutionFailed(format!(
                    "Entry point '{}' has no scheme (expected one of: {})",
                    request.entry_point,
                    self.schemes().join(", ")
                )));
            }
        };

        runner.run(request).await
    }
}
