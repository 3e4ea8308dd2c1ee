//! # 数据源导入模块
//!
//! 将本地文件、远程URI、归档条目与远程清单递归解析为可导入的终端结果，
//! 并把其中的DICOM文件交给DICOM存储组织。

pub mod config;
pub mod handlers;
pub mod importer;
pub mod io;
pub mod pipeline;
pub mod source;

pub use config::ImportConfig;
pub use handlers::{CollectedDicom, DicomSink};
pub use importer::{DataImporter, ImportReport, SourceReport};
pub use io::{
    mime_types, read_remote_manifest, sniff_mime_type, ArchiveEntry, ArchiveExtractor, HttpFetcher,
    RemoteFetcher, StandardArchiveExtractor,
};
pub use pipeline::{Flow, Handler, Pipeline, PipelineContext, PipelineOutcome};
pub use source::{ArchiveSource, DataSource, FileSource, ImportKind, ImportResult, UriSource};
