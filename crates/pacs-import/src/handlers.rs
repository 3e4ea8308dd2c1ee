//! 数据源导入处理器
//!
//! 处理器按以下顺序组成流水线：
//! 识别类型 -> 远程清单 -> 下载 -> 解压归档 -> DICOM -> 单个文件 -> 兜底报错。
//! 识别类型必须最先执行，DICOM必须位于通用文件之前。

use crate::io::{mime_types, read_remote_manifest, sniff_mime_type, ArchiveExtractor, RemoteFetcher};
use crate::pipeline::{Flow, Handler, PipelineContext};
use crate::source::{DataSource, FileSource, ImportKind, ImportResult};
use async_trait::async_trait;
use pacs_core::{DatasetFile, PacsError, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

type Ctx = PipelineContext<DataSource>;
type Step = Result<Flow<DataSource, ImportResult>>;

/// 为类型未知的文件识别MIME类型
pub struct RetypeFile;

#[async_trait]
impl Handler<DataSource, ImportResult> for RetypeFile {
    fn name(&self) -> &'static str {
        "retype-file"
    }

    async fn handle(&self, mut source: DataSource, _ctx: &mut Ctx) -> Step {
        if let Some(file_src) = source.file_src.as_mut() {
            if file_src.file_type.is_empty() {
                if let Some(mime) = sniff_mime_type(&file_src.file) {
                    debug!("{} 识别为 {}", file_src.file.name, mime);
                    file_src.file_type = mime;
                }
            }
        }
        Ok(Flow::Next(source))
    }
}

/// 展开远程资源清单，无法解析的JSON文件继续交给后续处理器
pub struct RemoteManifest;

#[async_trait]
impl Handler<DataSource, ImportResult> for RemoteManifest {
    fn name(&self) -> &'static str {
        "remote-manifest"
    }

    async fn handle(&self, source: DataSource, ctx: &mut Ctx) -> Step {
        let Some(file_src) = source.file_src.as_ref().filter(|f| f.file_type == mime_types::JSON) else {
            return Ok(Flow::Next(source));
        };
        let remotes = match read_remote_manifest(&file_src.file) {
            Ok(remotes) => remotes,
            Err(e) => {
                debug!("{} 不是远程清单: {}", file_src.file.name, e);
                return Ok(Flow::Next(source));
            }
        };

        info!("远程清单 {} 包含 {} 个资源", file_src.file.name, remotes.len());
        let parent = Arc::new(source);
        for remote in remotes {
            ctx.execute(DataSource {
                uri_src: Some(remote),
                ..Default::default()
            }
            .with_parent(parent.clone()));
        }
        Ok(ctx.done())
    }
}

/// 下载远程URI并以文件数据源重新注入
pub struct DownloadUrl {
    fetcher: Arc<dyn RemoteFetcher>,
}

impl DownloadUrl {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Handler<DataSource, ImportResult> for DownloadUrl {
    fn name(&self) -> &'static str {
        "download-url"
    }

    async fn handle(&self, source: DataSource, ctx: &mut Ctx) -> Step {
        let Some(uri_src) = source.uri_src.as_ref().filter(|u| self.fetcher.can_fetch(&u.uri)) else {
            return Ok(Flow::Next(source));
        };
        let file = self.fetcher.fetch(&uri_src.uri, &uri_src.name).await?;
        ctx.execute(DataSource::from_file(file).with_parent(Arc::new(source)));
        Ok(ctx.done())
    }
}

/// 解压归档，每个条目作为新数据源重新注入
pub struct ExtractArchive {
    extractor: Arc<dyn ArchiveExtractor>,
}

impl ExtractArchive {
    pub fn new(extractor: Arc<dyn ArchiveExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl Handler<DataSource, ImportResult> for ExtractArchive {
    fn name(&self) -> &'static str {
        "extract-archive"
    }

    async fn handle(&self, source: DataSource, ctx: &mut Ctx) -> Step {
        let Some(FileSource { file, file_type }) = source
            .file_src
            .as_ref()
            .filter(|f| mime_types::is_archive(&f.file_type))
        else {
            return Ok(Flow::Next(source));
        };

        let entries = self.extractor.extract(file, file_type).await?;
        let parent = Arc::new(source);
        for entry in entries {
            ctx.execute(
                DataSource::from_file(entry.file)
                    .with_archive_path(entry.path)
                    .with_parent(parent.clone()),
            );
        }
        Ok(ctx.done())
    }
}

/// 收集到的DICOM文件
#[derive(Debug, Clone)]
pub struct CollectedDicom {
    /// 对应导入结果的ID
    pub data_id: String,
    /// 文件名已替换为完整来源名
    pub file: DatasetFile,
}

pub type DicomSink = Arc<Mutex<Vec<CollectedDicom>>>;

/// 收集DICOM文件，交由DICOM存储统一组织
pub struct ImportDicomFile {
    sink: DicomSink,
}

impl ImportDicomFile {
    pub fn new(sink: DicomSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Handler<DataSource, ImportResult> for ImportDicomFile {
    fn name(&self) -> &'static str {
        "import-dicom-file"
    }

    async fn handle(&self, source: DataSource, ctx: &mut Ctx) -> Step {
        let Some(file_src) = source.file_src.as_ref().filter(|f| f.file_type == mime_types::DICOM) else {
            return Ok(Flow::Next(source));
        };
        let mut file = file_src.file.clone();
        file.name = source.qualified_name();
        let result = ImportResult::new(ImportKind::Dicom, source);
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CollectedDicom {
                data_id: result.data_id.clone(),
                file,
            });
        Ok(ctx.done_with(result))
    }
}

/// 其余文件交由通用读取器
pub struct ImportSingleFile;

#[async_trait]
impl Handler<DataSource, ImportResult> for ImportSingleFile {
    fn name(&self) -> &'static str {
        "import-single-file"
    }

    async fn handle(&self, source: DataSource, ctx: &mut Ctx) -> Step {
        if source.file_src.is_some() {
            debug!("导入单个文件 {}", source.display_name());
            return Ok(ctx.done_with(ImportResult::new(ImportKind::File, source)));
        }
        Ok(Flow::Next(source))
    }
}

/// 兜底：没有处理器能处理的数据源
pub struct UnhandledResource;

#[async_trait]
impl Handler<DataSource, ImportResult> for UnhandledResource {
    fn name(&self) -> &'static str {
        "unhandled-resource"
    }

    async fn handle(&self, source: DataSource, _ctx: &mut Ctx) -> Step {
        Err(PacsError::Resolution(format!(
            "无法处理数据源: {}",
            source.display_name()
        )))
    }
}

/// 按标准顺序组装处理器
pub fn standard_handlers(
    fetcher: Arc<dyn RemoteFetcher>,
    extractor: Arc<dyn ArchiveExtractor>,
    dicom_sink: DicomSink,
) -> Vec<Arc<dyn Handler<DataSource, ImportResult>>> {
    vec![
        Arc::new(RetypeFile),
        Arc::new(RemoteManifest),
        Arc::new(DownloadUrl::new(fetcher)),
        Arc::new(ExtractArchive::new(extractor)),
        Arc::new(ImportDicomFile::new(dicom_sink)),
        Arc::new(ImportSingleFile),
        Arc::new(UnhandledResource),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StandardArchiveExtractor;
    use crate::pipeline::Pipeline;
    use std::collections::HashMap;
    use std::io::{Cursor, Write};

    fn dicom_bytes(tag: &str) -> Vec<u8> {
        let mut data = vec![0u8; 128];
        data.extend_from_slice(b"DICM");
        data.extend_from_slice(tag.as_bytes());
        data
    }

    fn zip_bytes(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// 以URI为键返回预置内容
    #[derive(Default)]
    struct FakeFetcher {
        resources: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl RemoteFetcher for FakeFetcher {
        fn can_fetch(&self, uri: &str) -> bool {
            uri.starts_with("https://")
        }

        async fn fetch(&self, uri: &str, name: &str) -> Result<DatasetFile> {
            self.resources
                .get(uri)
                .map(|data| DatasetFile::new(name, data.clone()))
                .ok_or_else(|| PacsError::Fetch(format!("404 {}", uri)))
        }
    }

    fn pipeline(fetcher: FakeFetcher) -> (Pipeline<DataSource, ImportResult>, DicomSink) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let handlers = standard_handlers(
            Arc::new(fetcher),
            Arc::new(StandardArchiveExtractor),
            sink.clone(),
        );
        (Pipeline::new(handlers), sink)
    }

    #[tokio::test]
    async fn test_archive_entries_point_to_archive() {
        let archive = zip_bytes(&[
            ("a/1.dcm", dicom_bytes("1")),
            ("a/2.dcm", dicom_bytes("2")),
            ("readme.txt", b"notes".to_vec()),
        ]);
        let (pipeline, sink) = pipeline(FakeFetcher::default());
        let outcome = pipeline
            .execute(DataSource::from_file(DatasetFile::new("study.zip", archive)))
            .await;

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.results.len(), 3);
        for result in &outcome.results {
            let parent = result.data_source.parent.as_ref().unwrap();
            assert_eq!(parent.display_name(), "study.zip");
            assert_eq!(parent.file_type(), Some(mime_types::ZIP));
            assert!(result.data_source.archive_src.is_some());
        }
        let dicoms = outcome.results.iter().filter(|r| r.kind == ImportKind::Dicom).count();
        assert_eq!(dicoms, 2);

        let collected = sink.lock().unwrap();
        let mut names: Vec<&str> = collected.iter().map(|c| c.file.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["study.zip/a/1.dcm", "study.zip/a/2.dcm"]);
        assert!(collected
            .iter()
            .all(|c| outcome.results.iter().any(|r| r.data_id == c.data_id)));
    }

    #[tokio::test]
    async fn test_manifest_downloads_are_reinjected() {
        let mut fetcher = FakeFetcher::default();
        fetcher
            .resources
            .insert("https://example.org/ct/1".to_string(), dicom_bytes("ct"));
        fetcher.resources.insert(
            "https://example.org/bundle.zip".to_string(),
            zip_bytes(&[("x.dcm", dicom_bytes("x"))]),
        );
        let manifest = br#"{"resources": [
            {"url": "https://example.org/ct/1", "name": "ct1.dcm"},
            {"url": "https://example.org/bundle.zip"},
            {"url": "https://example.org/missing.dcm"}
        ]}"#;

        let (pipeline, sink) = pipeline(fetcher);
        let outcome = pipeline
            .execute(DataSource::from_file(DatasetFile::new("manifest.json", manifest.to_vec())))
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(outcome.errors[0], PacsError::Fetch(_)));

        let mut names: Vec<String> = sink.lock().unwrap().iter().map(|c| c.file.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["manifest.json/bundle.zip/x.dcm", "manifest.json/ct1.dcm"]);

        let nested = outcome
            .results
            .iter()
            .find(|r| r.data_source.display_name() == "x.dcm")
            .unwrap();
        assert_eq!(nested.data_source.depth(), 3);
        assert_eq!(nested.data_source.root().display_name(), "manifest.json");
    }

    #[tokio::test]
    async fn test_invalid_json_is_imported_as_file() {
        let (pipeline, _) = pipeline(FakeFetcher::default());
        let outcome = pipeline
            .execute(DataSource::from_file(DatasetFile::new("labels.json", b"[1, 2]".to_vec())))
            .await;
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].kind, ImportKind::File);
    }

    #[tokio::test]
    async fn test_unfetchable_uri_is_unhandled() {
        let fetcher = FakeFetcher::default();
        let (pipeline, _) = pipeline(fetcher);
        let outcome = pipeline
            .execute(DataSource::from_uri("ftp://example.org/a.dcm", "a.dcm"))
            .await;
        assert!(outcome.results.is_empty());
        assert!(matches!(outcome.errors[..], [PacsError::Resolution(_)]));
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails_only_its_branch() {
        let (pipeline, _) = pipeline(FakeFetcher::default());
        let outcomes = pipeline
            .execute_all(vec![
                DataSource::from_typed_file(
                    DatasetFile::new("bad.zip", b"PK\x03\x04".to_vec()),
                    mime_types::ZIP,
                ),
                DataSource::from_file(DatasetFile::new("ok.dcm", dicom_bytes("ok"))),
            ])
            .await;

        assert!(matches!(outcomes[0].errors[..], [PacsError::Archive(_)]));
        assert_eq!(outcomes[1].results.len(), 1);
    }
}
