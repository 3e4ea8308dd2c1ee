//! 导入配置

use crate::pipeline::DEFAULT_MAX_DEPTH;
use pacs_core::{PacsError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 导入配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// 最大派生深度（归档嵌套、清单与下载各计一层）
    pub max_depth: usize,
    /// 远程获取超时（秒）
    pub fetch_timeout_secs: u64,
    /// 允许获取的URI协议
    pub allowed_schemes: Vec<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            fetch_timeout_secs: 30,
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
        }
    }
}

impl ImportConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(PacsError::Config("max_depth必须大于0".to_string()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(PacsError::Config("fetch_timeout_secs必须大于0".to_string()));
        }
        if self.allowed_schemes.is_empty() {
            return Err(PacsError::Config("allowed_schemes不能为空".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_validation() {
        let config = ImportConfig::default();
        assert_eq!(config.max_depth, 16);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());

        let partial: ImportConfig = serde_json::from_str(r#"{"max_depth": 0}"#).unwrap();
        assert_eq!(partial.allowed_schemes, vec!["http", "https"]);
        assert!(matches!(partial.validate(), Err(PacsError::Config(_))));
    }
}
