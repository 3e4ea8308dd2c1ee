//! 导入程序配置
//!
//! 来源依次为配置文件（可选）与 `PACS_` 前缀的环境变量，
//! 例如 `PACS_IMPORT__MAX_DEPTH=8`、`PACS_LOGGING__LEVEL=debug`。

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use pacs_dicom::QueuePriorities;
use pacs_import::ImportConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或完整的过滤表达式
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 导入程序完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    pub import: ImportConfig,
    pub queue: QueuePriorities,
    pub logging: LoggingConfig,
}

impl ImporterConfig {
    /// 加载配置
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("PACS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("import.allowed_schemes"),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: ImporterConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if let Some(path) = config_path {
            info!("Configuration loaded successfully from: {}", path);
        }
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        self.import
            .validate()
            .context("Invalid import configuration")?;
        if self.queue.thumbnail > self.queue.volume_build {
            bail!(
                "thumbnail priority ({}) must not exceed volume build priority ({})",
                self.queue.thumbnail,
                self.queue.volume_build
            );
        }
        if self.logging.level.trim().is_empty() {
            bail!("logging level must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ImporterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.volume_build, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_inverted_priorities_are_rejected() {
        let mut config = ImporterConfig::default();
        config.queue.thumbnail = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: ImporterConfig =
            serde_json::from_str(r#"{"import": {"max_depth": 4}, "queue": {"thumbnail": -5}}"#).unwrap();
        assert_eq!(config.import.max_depth, 4);
        assert_eq!(config.import.fetch_timeout_secs, 30);
        assert_eq!(config.queue.thumbnail, -5);
        assert_eq!(config.queue.default, 0);
    }
}
