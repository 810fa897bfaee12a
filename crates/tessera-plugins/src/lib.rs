//! Tessera Plugin Engine
//!
//! Installs third-party capability bundles and runs them behind an explicit
//! permission model:
//! - Manifest validation and permission grants
//! - Sandboxed execution with memory and duration budgets (builtin handlers or WASM via wasmtime)
//! - Inter-plugin messaging routed through the same execution path
//! - Bounded execution ledger for observability
//! - File-backed persistence of installed plugins

pub mod builtin;
pub mod catalog;
pub mod config;
pub mod ledger;
pub mod manifest;
pub mod messaging;
pub mod payload;
pub mod permissions;
pub mod registry;
pub mod sandbox;
pub mod storage;
pub mod wasm;

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub use builtin::BuiltinRunner;
pub use catalog::{DirectoryCatalog, PluginCatalog, StaticCatalog};
pub use config::EngineConfig;
pub use ledger::{ExecutionLedger, PluginExecution};
pub use manifest::{Permission, PluginManifest, PluginType};
pub use messaging::{MessageMediator, PluginMessage};
pub use payload::Payload;
pub use permissions::{PermissionBroker, PolicyTable};
pub use registry::{Plugin, PluginRegistry};
pub use sandbox::{
    CodeRunner, Environment, PluginContext, PluginResult, RouterRunner, SandboxExecutor,
    SandboxLimits,
};
pub use storage::{FileStorage, MemoryStorage, PluginRecord, PluginStorage};
pub use wasm::WasmRunner;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin '{0}' not found. Run `tessera plugins list` to see installed plugins.")]
    NotFound(Uuid),

    #[error("Plugin '{0}' is disabled. Enable it with `tessera plugins enable {0}`.")]
    Disabled(Uuid),

    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    #[error("Permissions denied for plugin '{plugin}': {}", format_permissions(.denied))]
    PermissionsDenied {
        plugin: String,
        denied: Vec<Permission>,
    },

    #[error("Plugin execution timed out after {}ms", .0.as_millis())]
    ExecutionTimeout(Duration),

    #[error("Plugin execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Plugin '{0}' does not accept messages")]
    MessageNotAccepted(Uuid),

    #[error("Message delivery to plugin '{target}' failed: {reason}")]
    MessageDeliveryFailed { target: Uuid, reason: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Plugin storage error: {0}")]
    Storage(String),

    #[error("Plugin IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E500",
            Self::InvalidManifest(_) => "E501",
            Self::PermissionsDenied { .. } => "E502",
            Self::Disabled(_) => "E503",
            Self::ExecutionTimeout(_) => "E510",
            Self::ExecutionFailed(_) => "E511",
            Self::MessageNotAccepted(_) => "E520",
            Self::MessageDeliveryFailed { .. } => "E521",
            Self::InvalidPayload(_) => "E530",
            Self::Storage(_) => "E540",
            Self::Io(_) => "E9999",
        }
    }
}

fn format_permissions(permissions: &[Permission]) -> String {
    permissions
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, PluginError>;
