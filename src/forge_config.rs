//! Configuration for a forge project, read from `.forge/forge.toml`.
//!
//! `forge.toml` carries project identity (spec §4.1) and `forge serve`'s
//! bind address and tick cadences (spec §2). Everything else the
//! orchestrator needs — tasks, plans, registry state, recovery counters —
//! is resolved by the components themselves from their own persisted
//! state under `.forge/`, not from this file.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//!
//! [orchestrator]
//! bind = "127.0.0.1:7625"
//!
//! [orchestrator.cadence]
//! execution_secs = 30
//! recovery_secs = 300
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Project-level identity settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name (optional, defaults to directory name).
    #[serde(default)]
    pub name: Option<String>,
}

/// Settings for `forge serve`: where it listens and how often each of
/// the five background loops ticks. A CLI flag, when given, still wins
/// over whatever this section says.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorSection {
    pub bind: Option<String>,
    #[serde(default)]
    pub cadence: crate::service::CadenceConfig,
}

/// The complete forge.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForgeToml {
    /// Project-level settings.
    #[serde(default)]
    pub project: ProjectConfig,
    /// `serve`'s bind address and periodic-loop cadences.
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

impl ForgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse forge.toml")
    }

    /// Load configuration from the default location (.forge/forge.toml).
    /// Returns default configuration if file doesn't exist.
    pub fn load_or_default(forge_dir: &Path) -> Result<Self> {
        let config_path = forge_dir.join("forge.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize forge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_forge_toml_parse_empty() {
        let toml = ForgeToml::parse("").unwrap();
        assert!(toml.project.name.is_none());
        assert_eq!(toml.orchestrator.bind, None);
    }

    #[test]
    fn test_forge_toml_parse_project() {
        let content = r#"
[project]
name = "my-project"
"#;
        let toml = ForgeToml::parse(content).unwrap();
        assert_eq!(toml.project.name.as_deref(), Some("my-project"));
    }

    #[test]
    fn test_forge_toml_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forge.toml");

        let mut toml = ForgeToml::default();
        toml.project.name = Some("test-project".to_string());

        toml.save(&path).unwrap();

        let loaded = ForgeToml::load(&path).unwrap();
        assert_eq!(loaded.project.name.as_deref(), Some("test-project"));
    }

    #[test]
    fn test_forge_toml_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = ForgeToml::load_or_default(dir.path()).unwrap();
        assert!(toml.project.name.is_none());
    }

    #[test]
    fn test_forge_toml_load_or_default_with_file() {
        let dir = tempdir().unwrap();
        let content = r#"
[orchestrator]
bind = "0.0.0.0:9000"
"#;
        std::fs::write(dir.path().join("forge.toml"), content).unwrap();

        let toml = ForgeToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.orchestrator.bind.as_deref(), Some("0.0.0.0:9000"));
    }

    #[test]
    fn default_forge_toml_has_spec_default_cadences() {
        let config = ForgeToml::default();
        assert_eq!(config.orchestrator.bind, None);
        assert_eq!(config.orchestrator.cadence.execution_secs, crate::service::EXECUTION_INTERVAL_SECS);
        assert_eq!(config.orchestrator.cadence.recovery_secs, crate::service::RECOVERY_INTERVAL_SECS);
    }

    #[test]
    fn orchestrator_section_parses_partial_overrides_from_toml() {
        let content = r#"
            [orchestrator]
            bind = "0.0.0.0:9000"

            [orchestrator.cadence]
            execution_secs = 5
        "#;
        let config = ForgeToml::parse(content).unwrap();
        assert_eq!(config.orchestrator.bind.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(config.orchestrator.cadence.execution_secs, 5);
        // fields left unset in the file still take the spec's defaults
        assert_eq!(config.orchestrator.cadence.recovery_secs, crate::service::RECOVERY_INTERVAL_SECS);
    }
}
