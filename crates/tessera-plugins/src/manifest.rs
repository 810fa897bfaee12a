//! Plugin manifests and their validation

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{PluginError, Result};

/// Static descriptor supplied by the plugin author. Never mutated after install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub author: String,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    pub entry_point: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub auto_enable: bool,
    #[serde(default)]
    pub accepts_messages: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    FileSystemRead,
    FileSystemWrite,
    NetworkAccess,
    SystemCommands,
    AiProviderAccess,
    InterPluginCommunication,
    DataStorage,
}

impl Permission {
    pub const ALL: [Permission; 7] = [
        Self::FileSystemRead,
        Self::FileSystemWrite,
        Self::NetworkAccess,
        Self::SystemCommands,
        Self::AiProviderAccess,
        Self::InterPluginCommunication,
        Self::DataStorage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileSystemRead => "fileSystemRead",
            Self::FileSystemWrite => "fileSystemWrite",
            Self::NetworkAccess => "networkAccess",
            Self::SystemCommands => "systemCommands",
            Self::AiProviderAccess => "aiProviderAccess",
            Self::InterPluginCommunication => "interPluginCommunication",
            Self::DataStorage => "dataStorage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginType {
    AiProvider,
    Tool,
    UiComponent,
    DataSource,
    Workflow,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiProvider => "aiProvider",
            Self::Tool => "tool",
            Self::UiComponent => "uiComponent",
            Self::DataSource => "dataSource",
            Self::Workflow => "workflow",
        }
    }
}

/// Permissions that may never be requested together
const FORBIDDEN_COMBINATION: [Permission; 2] =
    [Permission::SystemCommands, Permission::NetworkAccess];

impl PluginManifest {
    /// Validate the manifest, stopping at the first failed check.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PluginError::InvalidManifest(
                "Plugin name cannot be empty".to_string(),
            ));
        }

        if self.version.trim().is_empty() {
            return Err(PluginError::InvalidManifest(
                "Plugin version cannot be empty".to_string(),
            ));
        }

        if !is_semver_triplet(&self.version) {
            return Err(PluginError::InvalidManifest(format!(
                "Version '{}' must be in MAJOR.MINOR.PATCH format",
                self.version
            )));
        }

        if self.author.trim().is_empty() {
            return Err(PluginError::InvalidManifest(
                "Plugin author cannot be empty".to_string(),
            ));
        }

        if FORBIDDEN_COMBINATION
            .iter()
            .all(|p| self.permissions.contains(p))
        {
            return Err(PluginError::InvalidManifest(format!(
                "Permissions '{}' and '{}' cannot be requested together",
                FORBIDDEN_COMBINATION[0], FORBIDDEN_COMBINATION[1]
            )));
        }

        Ok(())
    }

    /// Whether the manifest requests the given permission
    pub fn requests(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

fn is_semver_triplet(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(version: &str, permissions: &[Permission]) -> PluginManifest {
        PluginManifest {
            name: "weather".to_string(),
            version: version.to_string(),
            description: "Weather lookups".to_string(),
            author: "Tessera".to_string(),
            permissions: permissions.iter().copied().collect(),
            entry_point: "builtin:echo".to_string(),
            plugin_type: PluginType::Tool,
            auto_enable: true,
            accepts_messages: false,
        }
    }

    #[test]
    fn test_valid_manifest() {
        assert!(manifest("1.0.0", &[Permission::NetworkAccess]).validate().is_ok());
        assert!(manifest("10.20.30", &[]).validate().is_ok());
    }

    #[test]
    fn test_non_semver_versions_rejected() {
        let rejected = [
            "1", "1.0", "1.0.0.0", "v1.0.0", "1.0.0-beta", "1.0.0+build", "1..0", "a.b.c", " 1.0.0",
        ];
        for version in rejected {
            let err = manifest(version, &[]).validate().unwrap_err();
            assert!(
                matches!(
                    err,
                    PluginError::InvalidManifest(ref reason) if reason.contains("MAJOR.MINOR.PATCH")
                ),
                "version {version:?} should be rejected, got {err}"
            );
        }
    }

    #[test]
    fn test_empty_fields_rejected_in_order() {
        let mut m = manifest("", &[]);
        m.name = "  ".to_string();
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("name"));

        let err = manifest("", &[]).validate().unwrap_err();
        assert!(err.to_string().contains("version cannot be empty"));

        let mut m = manifest("1.0.0", &[]);
        m.author = String::new();
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("author"));
    }

    #[test]
    fn test_forbidden_combination_rejected() {
        let m = manifest(
            "1.0.0",
            &[
                Permission::SystemCommands,
                Permission::NetworkAccess,
                Permission::DataStorage,
            ],
        );
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("cannot be requested together"));

        assert!(manifest("1.0.0", &[Permission::SystemCommands]).validate().is_ok());
    }

    #[test]
    fn test_manifest_json_shape() {
        let json = r#"{
            "name": "notes",
            "version": "0.2.1",
            "description": "Note storage",
            "author": "Ada",
            "permissions": ["dataStorage", "fileSystemRead", "dataStorage"],
            "entryPoint": "builtin:echo",
            "type": "dataSource",
            "autoEnable": true,
            "acceptsMessages": true
        }"#;

        let m: PluginManifest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(m.plugin_type, PluginType::DataSource);
        assert_eq!(m.permissions.len(), 2);
        assert!(m.requests(Permission::DataStorage));
        assert!(m.accepts_messages);
    }

    #[test]
    fn test_permission_parse() {
        for permission in Permission::ALL {
            assert_eq!(Permission::parse(permission.as_str()), Some(permission));
        }
        assert_eq!(Permission::parse("root"), None);
    }
}
