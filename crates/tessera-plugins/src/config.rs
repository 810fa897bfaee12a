//! Engine configuration with file persistence

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use crate::ledger::DEFAULT_LEDGER_CAPACITY;
use crate::manifest::Permission;
use crate::sandbox::{Environment, SandboxLimits};
use crate::wasm::DEFAULT_FUEL;

const CONFIG_DIR_ENV: &str = "TESSERA_CONFIG_DIR";
const DATA_DIR_ENV: &str = "TESSERA_DATA_DIR";

/// Tessera engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub environment: Environment,
    pub sandbox: SandboxConfig,
    pub ledger: LedgerConfig,
    pub permissions: PermissionsConfig,
    pub storage: StorageConfig,
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_memory_mb: u64,
    pub max_duration_secs: u64,
    pub wasm_fuel: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Approved on top of the auto-granted set
    pub approved: Vec<Permission>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Root for plugin sources (manifests and wasm modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            sandbox: SandboxConfig::default(),
            ledger: LedgerConfig::default(),
            permissions: PermissionsConfig::default(),
            storage: StorageConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 100,
            max_duration_secs: 30,
            wasm_fuel: DEFAULT_FUEL,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            max_memory_bytes: self.max_memory_mb.saturating_mul(1024 * 1024),
            max_duration: Duration::from_secs(self.max_duration_secs),
        }
    }
}

impl EngineConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("tessera")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default path, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sandbox.max_memory_mb == 0 {
            return Err(anyhow!("sandbox.max_memory_mb must be greater than zero"));
        }
        if self.sandbox.max_duration_secs == 0 {
            return Err(anyhow!("sandbox.max_duration_secs must be greater than zero"));
        }
        if self.sandbox.wasm_fuel == 0 {
            return Err(anyhow!("sandbox.wasm_fuel must be greater than zero"));
        }
        if self.ledger.capacity == 0 {
            return Err(anyhow!("ledger.capacity must be greater than zero"));
        }
        Ok(())
    }

    /// Directory holding persisted plugin records and plugin data
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?
            .join("tessera"))
    }

    /// Root for plugin sources: catalog manifests and wasm modules
    pub fn plugin_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.plugins.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("plugins-src")),
        }
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "environment" => Ok(self.environment.to_string()),

            "sandbox.max_memory_mb" => Ok(self.sandbox.max_memory_mb.to_string()),
            "sandbox.max_duration_secs" => Ok(self.sandbox.max_duration_secs.to_string()),
            "sandbox.wasm_fuel" => Ok(self.sandbox.wasm_fuel.to_string()),

            "ledger.capacity" => Ok(self.ledger.capacity.to_string()),

            "permissions.approved" => Ok(self
                .permissions
                .approved
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")),

            "storage.data_dir" => Ok(self.data_dir()?.display().to_string()),
            "plugins.dir" => Ok(self.plugin_dir()?.display().to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `tessera config show` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "environment" => {
                self.environment = value.parse().map_err(|e: String| anyhow!(e))?;
            }

            "sandbox.max_memory_mb" => {
                self.sandbox.max_memory_mb = parse_positive(key, value)?;
            }
            "sandbox.max_duration_secs" => {
                self.sandbox.max_duration_secs = parse_positive(key, value)?;
            }
            "sandbox.wasm_fuel" => {
                self.sandbox.wasm_fuel = parse_positive(key, value)?;
            }

            "ledger.capacity" => {
                let capacity: usize = value
                    .parse()
                    .with_context(|| format!("Invalid ledger.capacity value: {}", value))?;
                if capacity == 0 {
                    return Err(anyhow!("ledger.capacity must be greater than zero"));
                }
                self.ledger.capacity = capacity;
            }

            "permissions.approved" => {
                let mut approved = Vec::new();
                for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let permission = Permission::parse(name).ok_or_else(|| {
                        anyhow!(
                            "Unknown permission: {}. Valid options: {}",
                            name,
                            Permission::ALL.map(|p| p.as_str()).join(", ")
                        )
                    })?;
                    if !approved.contains(&permission) {
                        approved.push(permission);
                    }
                }
                self.permissions.approved = approved;
            }

            "storage.data_dir" => {
                self.storage.data_dir = non_empty_path(value);
            }
            "plugins.dir" => {
                self.plugins.dir = non_empty_path(value);
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. \
                     Use `tessera config show` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "environment",
            "sandbox.max_memory_mb",
            "sandbox.max_duration_secs",
            "sandbox.wasm_fuel",
            "ledger.capacity",
            "permissions.approved",
            "storage.data_dir",
            "plugins.dir",
        ];

        keys.into_iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}

fn parse_positive(key: &str, value: &str) -> anyhow::Result<u64> {
    let parsed: u64 = value
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))?;
    if parsed == 0 {
        return Err(anyhow!("{} must be greater than zero", key));
    }
    Ok(parsed)
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());

        let limits = config.sandbox.limits();
        assert_eq!(limits.max_memory_bytes, 100 * 1024 * 1024);
        assert_eq!(limits.max_duration, Duration::from_secs(30));
        assert_eq!(config.ledger.capacity, 1000);
        assert_eq!(config.environment, Environment::Development);
        assert!(config.permissions.approved.is_empty());
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            environment = "production"

            [sandbox]
            max_duration_secs = 5

            [permissions]
            approved = ["fileSystemWrite"]
            "#,
        )
        .expect("parse");

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.sandbox.max_duration_secs, 5);
        assert_eq!(config.sandbox.max_memory_mb, 100);
        assert_eq!(config.permissions.approved, vec![Permission::FileSystemWrite]);
        assert_eq!(config.ledger.capacity, DEFAULT_LEDGER_CAPACITY);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let mut config = EngineConfig::default();
        config.set("ledger.capacity", "50").expect("set");
        config.set("storage.data_dir", "/var/lib/tessera").expect("set");
        config.save_to(&path).expect("save");

        let loaded = EngineConfig::load_from(&path).expect("load");
        assert_eq!(loaded, config);
        assert_eq!(loaded.get("storage.data_dir").expect("get"), "/var/lib/tessera");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::load_from(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = EngineConfig::default();
        assert!(config.set("sandbox.max_duration_secs", "0").is_err());
        assert!(config.set("ledger.capacity", "lots").is_err());
        assert!(config.set("permissions.approved", "rootAccess").is_err());
        assert!(config.set("environment", "qa").is_err());
        assert!(config.set("unknown.key", "1").is_err());

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[ledger]\ncapacity = 0\n").expect("write");
        assert!(EngineConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_set_and_get_permissions() {
        let mut config = EngineConfig::default();
        config
            .set("permissions.approved", "fileSystemWrite, systemCommands, fileSystemWrite")
            .expect("set");
        assert_eq!(
            config.get("permissions.approved").expect("get"),
            "fileSystemWrite, systemCommands"
        );
        assert_eq!(config.list().expect("list").len(), 8);
    }

    #[test]
    fn test_plugin_dir_defaults_under_data_dir() {
        let mut config = EngineConfig::default();
        config.storage.data_dir = Some(PathBuf::from("/srv/tessera"));
        assert_eq!(
            config.plugin_dir().expect("plugin dir"),
            PathBuf::from("/srv/tessera/plugins-src")
        );
    }
}
