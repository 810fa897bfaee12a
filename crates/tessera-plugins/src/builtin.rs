//! In-process handlers addressed as `builtin:<name>`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::payload::Payload;
use crate::sandbox::{CodeRunner, PluginContext, RunRequest, split_entry_point};
use crate::{PluginError, Result};

pub type BuiltinHandler =
    Arc<dyn Fn(&Payload, &PluginContext) -> std::result::Result<Payload, String> + Send + Sync>;

/// Entry point scheme handled by [`BuiltinRunner`]
pub const BUILTIN_SCHEME: &str = "builtin";

#[derive(Clone, Default)]
pub struct BuiltinRunner {
    handlers: HashMap<String, BuiltinHandler>,
}

impl BuiltinRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner preloaded with the standard handlers (`echo`)
    pub fn with_defaults() -> Self {
        Self::new().with_handler("echo", |input, context| {
            Ok(Payload::map([
                ("echo", input.clone()),
                ("environment", Payload::from(context.environment.as_str())),
            ]))
        })
    }

    pub fn with_handler<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Payload, &PluginContext) -> std::result::Result<Payload, String>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

#[async_trait]
impl CodeRunner for BuiltinRunner {
    async fn run(&self, request: RunRequest) -> Result<Payload> {
        let name = match split_entry_point(&request.entry_point) {
            (Some(BUILTIN_SCHEME), name) | (None, name) => name,
            (Some(other), _) => {
                return Err(PluginError::ExecutionFailed(format!(
                    "Builtin runner cannot handle '{other}' entry points"
                )));
            }
        };

        let handler = self.handlers.get(name).ok_or_else(|| {
            PluginError::ExecutionFailed(format!("Unknown builtin handler '{name}'"))
        })?;

        handler(&request.input, &request.context).map_err(PluginError::ExecutionFailed)
    }
}
