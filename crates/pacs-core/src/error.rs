//! 错误定义模块

use thiserror::Error;

/// PACS系统统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("DICOM处理错误: {0}")]
    Dicom(String),

    #[error("DICOM解析错误: {0}")]
    DicomParseError(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    /// 数据源未被任何处理器消费
    #[error("数据源解析失败: {0}")]
    Resolution(String),

    #[error("归档解压失败: {0}")]
    Archive(String),

    #[error("远程获取失败: {0}")]
    Fetch(String),

    /// worker初始化失败，不会自动重试
    #[error("worker初始化失败: {0}")]
    WorkerInit(String),

    #[error("标签读取失败: {0}")]
    TagRead(String),

    #[error("切片越界: 索引 {index} 不在 1..={count} 范围内")]
    SliceOutOfBounds { index: usize, count: usize },
}

/// PACS系统统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;
