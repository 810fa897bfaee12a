//! Plugin registry
//!
//! The registry is the single owner of plugin state:
//! - an arena of [`Plugin`] records keyed by id (the index)
//! - the installed set, kept in install order
//! - the active set, a subset of the installed ids
//! - the [`ExecutionLedger`]
//!
//! All of it sits behind one `RwLock`, so writes are serialized. Installed and
//! active are id sets over the arena; a plugin record exists exactly once.
//!
//! Sandboxed runs are spawned onto their own tasks and never hold the lock,
//! so a slow plugin cannot stall install, enable or execute requests. Only the
//! pre-flight checks and the final ledger write go back through the lock.
//!
//! The registry is a cheap clonable handle. Construct it once at startup and
//! pass it to the callers that need it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::ledger::{ExecutionLedger, PluginExecution};
use crate::manifest::{Permission, PluginManifest};
use crate::payload::Payload;
use crate::permissions::{self, PermissionBroker, PolicyTable};
use crate::sandbox::{
    CodeRunner, Environment, PluginContext, PluginResult, RunRequest, SandboxExecutor,
    SandboxLimits, SandboxReport,
};
use crate::storage::{MemoryStorage, PluginRecord, PluginStorage};
use crate::{PluginError, Result};

/// Runtime record of an installed plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
    pub id: Uuid,
    pub manifest: PluginManifest,
    pub is_enabled: bool,
    /// Always a subset of `manifest.permissions`
    pub granted_permissions: BTreeSet<Permission>,
    pub installed_at: DateTime<Utc>,
    pub last_executed: Option<DateTime<Utc>>,
}

impl Plugin {
    fn new(manifest: PluginManifest, granted_permissions: BTreeSet<Permission>) -> Self {
        Self {
            id: Uuid::new_v4(),
            manifest,
            is_enabled: true,
            granted_permissions,
            installed_at: Utc::now(),
            last_executed: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.granted_permissions.contains(&permission)
    }

    /// Requested permissions that are not currently granted
    pub fn missing_permissions(&self) -> Vec<Permission> {
        permissions::missing(&self.manifest.permissions, &self.granted_permissions)
    }

    pub fn context(&self, environment: Environment) -> PluginContext {
        PluginContext::new(self.id, self.granted_permissions.clone(), environment)
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    plugins: HashMap<Uuid, Plugin>,
    installed: Vec<Uuid>,
    active: HashSet<Uuid>,
    ledger: ExecutionLedger,
}

impl RegistryState {
    fn with_ledger_capacity(capacity: usize) -> Self {
        Self {
            ledger: ExecutionLedger::with_capacity(capacity),
            ..Self::default()
        }
    }

    fn plugin(&self, plugin_id: Uuid) -> Result<&Plugin> {
        self.plugins
            .get(&plugin_id)
            .ok_or(PluginError::NotFound(plugin_id))
    }

    fn insert(&mut self, plugin: Plugin, active: bool) {
        let id = plugin.id;
        if self.plugins.insert(id, plugin).is_none() {
            self.installed.push(id);
        }
        if active {
            self.active.insert(id);
        } else {
            self.active.remove(&id);
        }
    }

    fn remove(&mut self, plugin_id: Uuid) -> Option<Plugin> {
        self.active.remove(&plugin_id);
        self.installed.retain(|id| *id != plugin_id);
        self.plugins.remove(&plugin_id)
    }

    fn ordered<'a>(&'a self, ids: impl Iterator<Item = &'a Uuid>) -> Vec<Plugin> {
        ids.filter_map(|id| self.plugins.get(id)).cloned().collect()
    }
}

#[derive(Clone)]
pub struct PluginRegistry {
    state: Arc<RwLock<RegistryState>>,
    broker: Arc<dyn PermissionBroker>,
    storage: Arc<dyn PluginStorage>,
    sandbox: SandboxExecutor,
    limits: SandboxLimits,
    environment: Environment,
}

impl PluginRegistry {
    /// Registry with the default policy table, in-memory storage and default budgets
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            broker: Arc::new(PolicyTable::default()),
            storage: Arc::new(MemoryStorage::new()),
            sandbox: SandboxExecutor::new(runner),
            limits: SandboxLimits::default(),
            environment: Environment::default(),
        }
    }

    /// Registry configured from an [`EngineConfig`]
    pub fn from_config(
        config: &EngineConfig,
        runner: Arc<dyn CodeRunner>,
        storage: Arc<dyn PluginStorage>,
    ) -> Self {
        let policy =
            PolicyTable::default().with_approved(config.permissions.approved.iter().copied());

        Self::new(runner)
            .with_broker(Arc::new(policy))
            .with_storage(storage)
            .with_limits(config.sandbox.limits())
            .with_ledger_capacity(config.ledger.capacity)
            .with_environment(config.environment)
    }

    pub fn with_broker(mut self, broker: Arc<dyn PermissionBroker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn PluginStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Replace the ledger with one of the given capacity.
    ///
    /// Resets registry state, so call it while building, before `initialize`.
    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.state = Arc::new(RwLock::new(RegistryState::with_ledger_capacity(capacity)));
        self
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Reload previously installed plugins from storage.
    ///
    /// Manifests are re-validated and grants re-resolved: a grant can shrink
    /// if the policy tightened since install, it can never grow.
    pub async fn initialize(&self) -> Result<usize> {
        let records = self.storage.load_all().await?;

        let mut restored = Vec::with_capacity(records.len());
        for record in records {
            let PluginRecord {
                mut plugin, active, ..
            } = record;

            if let Err(e) = plugin.manifest.validate() {
                warn!(
                    plugin_id = %plugin.id,
                    error = %e,
                    "Skipping stored plugin with invalid manifest"
                );
                continue;
            }

            let allowed = self
                .broker
                .resolve_grants(&plugin.manifest.permissions)
                .await;
            let granted: BTreeSet<Permission> = plugin
                .granted_permissions
                .iter()
                .filter(|p| allowed.contains(p) && plugin.manifest.permissions.contains(p))
                .copied()
                .collect();

            if granted != plugin.granted_permissions {
                warn!(
                    plugin_id = %plugin.id,
                    plugin = %plugin.manifest.name,
                    "Stored grants exceed current policy; restoring with reduced permissions"
                );
                plugin.granted_permissions = granted;
            }

            let active = active && plugin.is_enabled;
            restored.push((plugin, active));
        }

        restored.sort_by_key(|(plugin, _)| plugin.installed_at);

        let mut state = self.state.write().await;
        let mut count = 0;
        for (plugin, active) in restored {
            if state.plugins.contains_key(&plugin.id) {
                continue;
            }
            state.insert(plugin, active);
            count += 1;
        }

        info!(count, "Restored installed plugins");
        Ok(count)
    }

    /// Validate, grant and register a manifest.
    pub async fn install(&self, manifest: PluginManifest) -> Result<Plugin> {
        manifest.validate()?;

        let resolved = self.broker.resolve_grants(&manifest.permissions).await;
        let granted: BTreeSet<Permission> = resolved
            .intersection(&manifest.permissions)
            .copied()
            .collect();

        let denied = permissions::missing(&manifest.permissions, &granted);
        if !denied.is_empty() {
            warn!(
                plugin = %manifest.name,
                denied = ?denied,
                "Install rejected: permissions not granted"
            );
            return Err(PluginError::PermissionsDenied {
                plugin: manifest.name,
                denied,
            });
        }

        let active = manifest.auto_enable;
        let plugin = Plugin::new(manifest, granted);
        let record = PluginRecord::new(plugin.clone(), active)?;

        let mut state = self.state.write().await;
        self.storage.save(&record).await?;
        state.insert(plugin.clone(), active);

        info!(
            plugin_id = %plugin.id,
            plugin = %plugin.manifest.name,
            version = %plugin.manifest.version,
            active,
            "Plugin installed"
        );
        Ok(plugin)
    }

    /// Remove a plugin and request deletion of its data directory.
    pub async fn uninstall(&self, plugin_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        state.plugin(plugin_id)?;

        self.storage.remove(plugin_id).await?;
        let removed = state.remove(plugin_id);
        drop(state);

        // Cleanup happens after the in-memory removal and never fails the uninstall
        if let Err(e) = self.storage.delete_data_dir(plugin_id).await {
            warn!(plugin_id = %plugin_id, error = %e, "Failed to delete plugin data directory");
        }

        info!(
            plugin_id = %plugin_id,
            plugin = removed.as_ref().map(Plugin::name).unwrap_or_default(),
            "Plugin uninstalled"
        );
        Ok(())
    }

    pub async fn enable(&self, plugin_id: Uuid) -> Result<()> {
        self.set_enabled(plugin_id, true).await
    }

    pub async fn disable(&self, plugin_id: Uuid) -> Result<()> {
        self.set_enabled(plugin_id, false).await
    }

    async fn set_enabled(&self, plugin_id: Uuid, enabled: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let current = state.plugin(plugin_id)?;

        if current.is_enabled == enabled && state.active.contains(&plugin_id) == enabled {
            return Ok(());
        }

        let mut updated = current.clone();
        updated.is_enabled = enabled;
        self.storage
            .save(&PluginRecord::new(updated.clone(), enabled)?)
            .await?;
        state.insert(updated, enabled);

        info!(plugin_id = %plugin_id, enabled, "Plugin enablement changed");
        Ok(())
    }

    /// Execute a plugin in the registry's configured environment.
    pub async fn execute(&self, plugin_id: Uuid, input: Payload) -> Result<PluginResult> {
        self.execute_with(plugin_id, input, self.environment).await
    }

    /// Execute a plugin.
    ///
    /// Lookup, enablement and permission failures are returned as errors.
    /// Anything that goes wrong inside the sandbox is reported as a failed
    /// [`PluginResult`] and recorded in the ledger.
    pub async fn execute_with(
        &self,
        plugin_id: Uuid,
        input: Payload,
        environment: Environment,
    ) -> Result<PluginResult> {
        let request = {
            let state = self.state.read().await;
            let plugin = state.plugin(plugin_id)?;

            if !plugin.is_enabled {
                return Err(PluginError::Disabled(plugin_id));
            }

            let missing = plugin.missing_permissions();
            if !missing.is_empty() {
                return Err(PluginError::PermissionsDenied {
                    plugin: plugin.manifest.name.clone(),
                    denied: missing,
                });
            }

            RunRequest {
                plugin_id,
                plugin_name: plugin.manifest.name.clone(),
                entry_point: plugin.manifest.entry_point.clone(),
                input: input.clone(),
                context: plugin.context(environment),
                limits: self.limits,
            }
        };

        let started_at = Utc::now();
        let sandbox = self.sandbox.clone();
        let report = match tokio::spawn(async move { sandbox.execute(request).await }).await {
            Ok(report) => report,
            Err(e) => {
                let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
                SandboxReport {
                    result: Err(PluginError::ExecutionFailed(format!(
                        "Sandbox task aborted: {e}"
                    ))),
                    logs: vec![format!("Sandbox task aborted: {e}")],
                    elapsed,
                }
            }
        };
        let completed_at = Utc::now();
        let result = PluginResult::from(report);

        let execution = PluginExecution {
            id: Uuid::new_v4(),
            plugin_id,
            input,
            result: result.clone(),
            started_at,
            completed_at,
            success: result.success,
        };

        {
            let mut state = self.state.write().await;
            if result.success {
                if let Some(plugin) = state.plugins.get_mut(&plugin_id) {
                    plugin.last_executed = Some(completed_at);
                }
            }
            state.ledger.record(execution);
        }

        debug!(
            plugin_id = %plugin_id,
            success = result.success,
            elapsed_ms = result.duration_ms,
            "Plugin execution recorded"
        );
        Ok(result)
    }

    // ========== Read views ==========

    pub async fn get(&self, plugin_id: Uuid) -> Option<Plugin> {
        self.state.read().await.plugins.get(&plugin_id).cloned()
    }

    /// Installed plugins in install order
    pub async fn installed(&self) -> Vec<Plugin> {
        let state = self.state.read().await;
        state.ordered(state.installed.iter())
    }

    /// Active plugins in install order
    pub async fn active(&self) -> Vec<Plugin> {
        let state = self.state.read().await;
        state.ordered(state.installed.iter().filter(|id| state.active.contains(id)))
    }

    pub async fn is_active(&self, plugin_id: Uuid) -> bool {
        self.state.read().await.active.contains(&plugin_id)
    }

    /// Full ledger, oldest first
    pub async fn executions(&self) -> Vec<PluginExecution> {
        self.state.read().await.ledger.entries().cloned().collect()
    }

    pub async fn executions_for(&self, plugin_id: Uuid) -> Vec<PluginExecution> {
        self.state
            .read()
            .await
            .ledger
            .for_plugin(plugin_id)
            .cloned()
            .collect()
    }

    pub async fn recent_executions(&self, limit: usize) -> Vec<PluginExecution> {
        self.state.read().await.ledger.recent(limit).cloned().collect()
    }
}
