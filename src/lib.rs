//! # PACS
//!
//! 数据导入与DICOM组织引擎的统一入口，重新导出各子模块。

pub use pacs_core;
pub use pacs_dicom;
pub use pacs_import;
