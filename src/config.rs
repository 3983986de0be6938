//! Configuration management for the template service
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (templates.toml)
//! - Environment variables (TEMPLATES__*)
//!
//! ## Example config file (templates.toml):
//! ```toml
//! [versions]
//! max_publish_retries = 5
//!
//! [source]
//! fetch_timeout_ms = 2000
//!
//! [transform]
//! common_fields = ["reference_no", "bank_name", "branch_name"]
//! table_keywords = ["table", "list", "items", "rows", "entries"]
//! homogeneity_threshold = 0.7
//! homogeneity_sample = 5
//! ```

use std::path::Path;
use std::time::Duration;

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::table::TableRules;

/// Main configuration for the template service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub versions: VersionsConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub transform: TransformConfig,
}

/// Version store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionsConfig {
    /// Attempts at moving the latest pointer before a publish reports a conflict
    #[serde(default = "default_max_publish_retries")]
    pub max_publish_retries: u32,
}

/// Schema source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Budget for one schema fetch; past it the transform degrades
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

/// Transformer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Fields known to every template, placed under `_common_`
    #[serde(default = "default_common_fields")]
    pub common_fields: Vec<String>,

    #[serde(default = "default_table_keywords")]
    pub table_keywords: Vec<String>,

    #[serde(default = "default_homogeneity_threshold")]
    pub homogeneity_threshold: f64,

    #[serde(default = "default_homogeneity_sample")]
    pub homogeneity_sample: usize,
}

fn default_max_publish_retries() -> u32 {
    5
}

fn default_fetch_timeout_ms() -> u64 {
    2000
}

fn default_common_fields() -> Vec<String> {
    vec![
        "reference_no".to_string(),
        "bank_name".to_string(),
        "branch_name".to_string(),
    ]
}

fn default_table_keywords() -> Vec<String> {
    TableRules::default().keywords
}

fn default_homogeneity_threshold() -> f64 {
    TableRules::default().homogeneity_threshold
}

fn default_homogeneity_sample() -> usize {
    TableRules::default().homogeneity_sample
}

impl Default for VersionsConfig {
    fn default() -> Self {
        Self {
            max_publish_retries: default_max_publish_retries(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl SourceConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            common_fields: default_common_fields(),
            table_keywords: default_table_keywords(),
            homogeneity_threshold: default_homogeneity_threshold(),
            homogeneity_sample: default_homogeneity_sample(),
        }
    }
}

impl TransformConfig {
    /// Table classifier thresholds from this configuration
    pub fn to_rules(&self) -> TableRules {
        TableRules {
            keywords: self.table_keywords.clone(),
            homogeneity_threshold: self.homogeneity_threshold,
            homogeneity_sample: self.homogeneity_sample,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, adding a required file on top of the defaults
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["templates.toml", ".templates.toml", "config/templates.toml"];
        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "reports", "templates") {
            let xdg_config = config_dir.config_dir().join("templates.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // TEMPLATES__SOURCE__FETCH_TIMEOUT_MS=500
        builder = builder.add_source(
            Environment::with_prefix("TEMPLATES")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.versions.max_publish_retries, 5);
        assert_eq!(config.source.fetch_timeout(), Duration::from_secs(2));
        assert_eq!(config.transform.to_rules(), TableRules::default());
    }

    #[test]
    fn test_serialize_config() {
        let config = ServiceConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[versions]"));
        assert!(toml_str.contains("[transform]"));
        assert!(toml_str.contains("homogeneity_threshold"));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[source]\nfetch_timeout_ms = 250\n\n[transform]\nhomogeneity_sample = 3\n",
        )
        .unwrap();

        let config = ServiceConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.source.fetch_timeout_ms, 250);
        assert_eq!(config.transform.homogeneity_sample, 3);
        assert_eq!(config.transform.homogeneity_threshold, 0.70);
        assert_eq!(config.versions.max_publish_retries, 5);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");

        let mut config = ServiceConfig::default();
        config.transform.common_fields = vec!["file_no".to_string()];
        config.save(&path).unwrap();

        let reloaded = ServiceConfig::load_from(Some(&path)).unwrap();
        assert_eq!(reloaded.transform.common_fields, vec!["file_no"]);
    }
}
