//! WASM plugin execution via wasmtime
//!
//! Entry points of the form `wasm:<relative path>` resolve to a module under
//! the runner's plugin root. Host ABI (version 1):
//! - the module exports `memory` and `plugin_invoke(ptr: i32, len: i32) -> i32`;
//! - the host writes a JSON envelope `{"input": ..., "context": ...}` at
//!   [`INPUT_PTR`] and calls `plugin_invoke`;
//! - the module reports its JSON output through the single import
//!   `plugin_host.set_output(ptr: i32, len: i32) -> i32`;
//! - a zero status means success.
//!
//! Budgets: memory via store limits, CPU via fuel, wall-clock via epoch
//! interruption from a watchdog thread.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use wasmtime::{
    Caller, Config, Engine, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder,
    UpdateDeadline, WasmBacktraceDetails,
};

use crate::payload::Payload;
use crate::sandbox::{CodeRunner, PluginContext, RunRequest, split_entry_point};
use crate::{PluginError, Result};

/// Entry point scheme handled by [`WasmRunner`]
pub const WASM_SCHEME: &str = "wasm";

/// Host import module name
pub const HOST_MODULE: &str = "plugin_host";

/// Offset the input envelope is written at
pub const INPUT_PTR: usize = 1024;

/// Default module size cap
pub const DEFAULT_MAX_MODULE_BYTES: usize = 16 * 1024 * 1024;

/// Default fuel per invocation
pub const DEFAULT_FUEL: u64 = 10_000_000;

#[derive(Clone)]
pub struct WasmRunner {
    engine: Engine,
    plugin_root: PathBuf,
    fuel_limit: u64,
    max_module_bytes: usize,
    table_elements_limit: usize,
    instance_limit: usize,
}

impl WasmRunner {
    pub fn new(plugin_root: impl Into<PathBuf>) -> Result<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_threads(false);
        config.epoch_interruption(true);
        config.wasm_backtrace_details(WasmBacktraceDetails::Disable);

        let engine = Engine::new(&config).map_err(|e| {
            PluginError::ExecutionFailed(format!("Failed to initialize wasmtime engine: {e}"))
        })?;

        Ok(Self {
            engine,
            plugin_root: plugin_root.into(),
            fuel_limit: DEFAULT_FUEL,
            max_module_bytes: DEFAULT_MAX_MODULE_BYTES,
            table_elements_limit: 1_024,
            instance_limit: 16,
        })
    }

    pub fn with_fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = fuel;
        self
    }

    pub fn with_max_module_bytes(mut self, bytes: usize) -> Self {
        self.max_module_bytes = bytes;
        self
    }

    pub fn plugin_root(&self) -> &Path {
        &self.plugin_root
    }

    /// Compile a module from raw bytes (binary or text format).
    pub fn compile(&self, bytes: &[u8]) -> Result<Module> {
        Module::new(&self.engine, bytes)
            .map_err(|e| PluginError::ExecutionFailed(format!("Invalid module: {e}")))
    }

    /// Run a compiled module synchronously. Blocks the calling thread.
    pub fn invoke(&self, module: &Module, request: &RunRequest) -> Result<Payload> {
        if self.fuel_limit == 0 {
            return Err(PluginError::ExecutionFailed(
                "Fuel limit must be greater than zero".to_string(),
            ));
        }

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        linker
            .func_wrap(HOST_MODULE, "set_output", set_output)
            .map_err(|e| PluginError::ExecutionFailed(format!("Failed to bind set_output: {e}")))?;

        let memory_limit = usize::try_from(request.limits.max_memory_bytes).unwrap_or(usize::MAX);
        let mut store = Store::new(
            &self.engine,
            HostState {
                output: None,
                fault: None,
                limits: StoreLimitsBuilder::new()
                    .memory_size(memory_limit)
                    .table_elements(self.table_elements_limit)
                    .instances(self.instance_limit)
                    .trap_on_grow_failure(true)
                    .build(),
            },
        );
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);
        // The epoch is shared by every store on the engine, so a store only
        // traps once its own watchdog has fired.
        let expired = Arc::new(AtomicBool::new(false));
        let expired_for_store = Arc::clone(&expired);
        store.epoch_deadline_callback(move |_| {
            if expired_for_store.load(Ordering::SeqCst) {
                Err(wasmtime::Error::msg("wall-clock budget exhausted"))
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });

        store
            .set_fuel(self.fuel_limit)
            .map_err(|e| PluginError::ExecutionFailed(format!("Failed to add fuel: {e}")))?;

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| PluginError::ExecutionFailed(format!("Instantiation failed: {e}")))?;

        let memory = instance.get_memory(&mut store, "memory").ok_or_else(|| {
            PluginError::ExecutionFailed("Module must export 'memory'".to_string())
        })?;
        let invoke = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "plugin_invoke")
            .map_err(|e| {
                PluginError::ExecutionFailed(format!("Missing export 'plugin_invoke': {e}"))
            })?;

        request.input.ensure_finite()?;
        let envelope = serde_json::to_vec(&InputEnvelope {
            input: &request.input,
            context: &request.context,
        })
        .map_err(|e| PluginError::InvalidPayload(format!("Failed to encode input: {e}")))?;
        write_into_memory(&memory, &mut store, INPUT_PTR, &envelope)?;

        let ptr = i32::try_from(INPUT_PTR)
            .map_err(|_| PluginError::ExecutionFailed("Input pointer overflow".to_string()))?;
        let len = i32::try_from(envelope.len())
            .map_err(|_| PluginError::ExecutionFailed("Input exceeds ABI limit".to_string()))?;

        // Wall-clock watchdog: bumps the epoch unless cancelled first
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let engine = self.engine.clone();
        let timeout = request.limits.max_duration;
        let expired_for_thread = Arc::clone(&expired);
        let watchdog = thread::spawn(move || {
            if cancel_rx.recv_timeout(timeout).is_err() {
                expired_for_thread.store(true, Ordering::SeqCst);
                engine.increment_epoch();
            }
        });

        let call_result = invoke.call(&mut store, (ptr, len));

        let _ = cancel_tx.send(());
        let _ = watchdog.join();

        let status = match call_result {
            Ok(status) => status,
            Err(_) if expired.load(Ordering::SeqCst) => {
                return Err(PluginError::ExecutionTimeout(timeout));
            }
            Err(e) => {
                return Err(PluginError::ExecutionFailed(format!("Module trapped: {e:#}")));
            }
        };

        if let Some(fault) = store.data().fault.as_deref() {
            return Err(PluginError::ExecutionFailed(format!(
                "Host call failed: {fault}"
            )));
        }

        if status != 0 {
            return Err(PluginError::ExecutionFailed(format!(
                "Module returned non-zero status {status}"
            )));
        }

        let output = store.data_mut().output.take().ok_or_else(|| {
            PluginError::ExecutionFailed("Module returned success without output".to_string())
        })?;
        let text = String::from_utf8(output)
            .map_err(|e| PluginError::InvalidPayload(format!("Output is not UTF-8: {e}")))?;

        Payload::from_json_str(&text)
    }

    fn resolve_module_path(&self, relative: &str) -> Result<PathBuf> {
        let root = self.plugin_root.canonicalize().map_err(PluginError::Io)?;
        let candidate = root.join(relative);

        let metadata = fs::symlink_metadata(&candidate).map_err(PluginError::Io)?;
        if metadata.file_type().is_symlink() {
            return Err(PluginError::ExecutionFailed(
                "Module paths cannot point to symlinks".to_string(),
            ));
        }
        if !metadata.file_type().is_file() {
            return Err(PluginError::ExecutionFailed(
                "Module path must be a regular file".to_string(),
            ));
        }

        let canonical = candidate.canonicalize().map_err(PluginError::Io)?;
        if !canonical.starts_with(&root) {
            return Err(PluginError::ExecutionFailed(format!(
                "Module path {:?} must reside under {:?}",
                canonical, root
            )));
        }

        if metadata.len() > self.max_module_bytes as u64 {
            return Err(PluginError::ExecutionFailed(format!(
                "WASM module too large: {} bytes (limit {})",
                metadata.len(),
                self.max_module_bytes
            )));
        }

        Ok(canonical)
    }

    fn load(&self, entry_point: &str) -> Result<Module> {
        let relative = match split_entry_point(entry_point) {
            (Some(WASM_SCHEME), path) | (None, path) => path,
            (Some(other), _) => {
                return Err(PluginError::ExecutionFailed(format!(
                    "WASM runner cannot handle '{other}' entry points"
                )));
            }
        };

        let path = self.resolve_module_path(relative)?;
        let bytes = fs::read(&path).map_err(PluginError::Io)?;
        self.compile(&bytes)
    }
}

#[async_trait]
impl CodeRunner for WasmRunner {
    async fn run(&self, request: RunRequest) -> Result<Payload> {
        let runner = self.clone();
        debug!(
            plugin_id = %request.plugin_id,
            entry_point = %request.entry_point,
            "Running WASM module"
        );

        tokio::task::spawn_blocking(move || {
            let module = runner.load(&request.entry_point)?;
            runner.invoke(&module, &request)
        })
        .await
        .map_err(|e| PluginError::ExecutionFailed(format!("WASM worker failed: {e}")))?
    }
}

#[derive(Serialize)]
struct InputEnvelope<'a> {
    input: &'a Payload,
    context: &'a PluginContext,
}

struct HostState {
    output: Option<Vec<u8>>,
    fault: Option<String>,
    limits: StoreLimits,
}

fn set_output(mut caller: Caller<'_, HostState>, ptr: i32, len: i32) -> i32 {
    let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory()) else {
        caller.data_mut().fault = Some("module did not export memory".to_string());
        return -1;
    };

    let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        caller.data_mut().fault = Some("negative output pointer or length".to_string());
        return -1;
    };

    let Some(end) = start.checked_add(len) else {
        caller.data_mut().fault = Some("output pointer overflow".to_string());
        return -1;
    };

    let Some(bytes) = memory.data(&caller).get(start..end).map(<[u8]>::to_vec) else {
        caller.data_mut().fault =
            Some(format!("output range [{start}, {end}) exceeds module memory"));
        return -1;
    };

    caller.data_mut().output = Some(bytes);
    0
}

fn write_into_memory(
    memory: &Memory,
    store: &mut Store<HostState>,
    ptr: usize,
    bytes: &[u8],
) -> Result<()> {
    let end = ptr
        .checked_add(bytes.len())
        .ok_or_else(|| PluginError::ExecutionFailed("Memory pointer overflow".to_string()))?;
    let data = memory.data_mut(store);
    let target = data.get_mut(ptr..end).ok_or_else(|| {
        PluginError::ExecutionFailed(format!(
            "Input of {} bytes does not fit in module memory",
            bytes.len()
        ))
    })?;
    target.copy_from_slice(bytes);
    Ok(())
}
