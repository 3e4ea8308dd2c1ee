//! 数据导入入口
//!
//! 全部顶层数据源并发经过解析流水线，收集到的DICOM文件随后作为一个批次交给DICOM存储。

use crate::config::ImportConfig;
use crate::handlers::{standard_handlers, CollectedDicom};
use crate::io::{ArchiveExtractor, HttpFetcher, RemoteFetcher, StandardArchiveExtractor};
use crate::pipeline::Pipeline;
use crate::source::{DataSource, ImportKind, ImportResult};
use pacs_core::utils::make_names_unique;
use pacs_core::{DatasetFile, Result, VolumeKeys};
use pacs_dicom::{DicomStore, ImportedBatch};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// 单个顶层数据源的导入情况
#[derive(Debug, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub results: Vec<ImportResult>,
    pub errors: Vec<String>,
}

/// 一次导入的汇总
#[derive(Debug, Serialize)]
pub struct ImportReport {
    pub sources: Vec<SourceReport>,
    pub dicom_files: usize,
    pub volumes: Vec<VolumeKeys>,
}

impl ImportReport {
    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| !s.errors.is_empty()).count()
    }
}

/// 数据导入器
pub struct DataImporter {
    store: Arc<DicomStore>,
    config: ImportConfig,
    fetcher: Arc<dyn RemoteFetcher>,
    extractor: Arc<dyn ArchiveExtractor>,
}

impl DataImporter {
    /// 使用HTTP获取与标准解压器
    pub fn new(store: Arc<DicomStore>, config: ImportConfig) -> Result<Self> {
        config.validate()?;
        let fetcher = HttpFetcher::new(config.fetch_timeout(), config.allowed_schemes.clone())?;
        Ok(Self::with_collaborators(
            store,
            config,
            Arc::new(fetcher),
            Arc::new(StandardArchiveExtractor),
        ))
    }

    pub fn with_collaborators(
        store: Arc<DicomStore>,
        config: ImportConfig,
        fetcher: Arc<dyn RemoteFetcher>,
        extractor: Arc<dyn ArchiveExtractor>,
    ) -> Self {
        Self {
            store,
            config,
            fetcher,
            extractor,
        }
    }

    pub fn store(&self) -> &Arc<DicomStore> {
        &self.store
    }

    /// 导入数据源
    ///
    /// 解析失败按顶层数据源分别记录；DICOM存储的失败返回给调用方。
    pub async fn import(&self, sources: Vec<DataSource>) -> Result<ImportReport> {
        info!("开始解析 {} 个数据源", sources.len());
        let dicom_sink = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(standard_handlers(
            self.fetcher.clone(),
            self.extractor.clone(),
            dicom_sink.clone(),
        ))
        .with_max_depth(self.config.max_depth);

        let names: Vec<String> = sources.iter().map(DataSource::display_name).collect();
        let outcomes = pipeline.execute_all(sources).await;

        let mut reports: Vec<SourceReport> = names
            .into_iter()
            .zip(outcomes)
            .map(|(source, outcome)| {
                for error in &outcome.errors {
                    warn!("数据源 {} 部分导入失败: {}", source, error);
                }
                SourceReport {
                    source,
                    results: outcome.results,
                    errors: outcome.errors.iter().map(ToString::to_string).collect(),
                }
            })
            .collect();

        let collected: Vec<CollectedDicom> =
            std::mem::take(&mut *dicom_sink.lock().unwrap_or_else(PoisonError::into_inner));
        let dicom_files = collected.len();
        let (data_ids, mut files): (Vec<String>, Vec<DatasetFile>) = collected
            .into_iter()
            .map(|c| (c.data_id, c.file))
            .unzip();
        let renamed = make_names_unique(&mut files);
        if renamed > 0 {
            warn!("{} 个DICOM文件来源名重复，已改名", renamed);
        }
        let name_of: HashMap<String, String> = data_ids
            .into_iter()
            .zip(files.iter().map(|f| f.name.clone()))
            .collect();

        let batch = if files.is_empty() {
            ImportedBatch::default()
        } else {
            self.store.import_batch(files).await?
        };
        for report in &mut reports {
            for result in &mut report.results {
                assign_volume(result, &name_of, &batch);
            }
        }
        let volumes = batch.created;

        info!(
            "导入完成: {} 个数据源, {} 个DICOM文件, 新建 {} 个卷",
            reports.len(),
            dicom_files,
            volumes.len()
        );
        Ok(ImportReport {
            sources: reports,
            dicom_files,
            volumes,
        })
    }
}

/// DICOM结果的 `data_id` 改为文件所属的卷键
fn assign_volume(result: &mut ImportResult, name_of: &HashMap<String, String>, batch: &ImportedBatch) {
    if result.kind != ImportKind::Dicom {
        return;
    }
    match name_of
        .get(&result.data_id)
        .and_then(|name| batch.placements.get(name))
    {
        Some(volume_key) => result.data_id = volume_key.clone(),
        None => debug!("{} 未加入任何卷", result.data_source.display_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use pacs_core::{ImageData, PacsError, PixelType, VolumePipeline};
    use pacs_dicom::{DicomIo, DicomWorker, StaticLauncher, TagSpec, VolumeGroups};
    use std::collections::HashMap;
    use std::io::{Cursor, Write};

    /// DICM标识之后的内容即序列号
    struct SeriesWorker;

    fn series_of(file: &DatasetFile) -> String {
        String::from_utf8_lossy(&file.data[132..]).to_string()
    }

    #[async_trait]
    impl DicomWorker for SeriesWorker {
        async fn categorize(&self, files: &[DatasetFile]) -> pacs_core::Result<VolumeGroups> {
            let mut groups = VolumeGroups::new();
            for file in files {
                groups.entry(series_of(file)).or_default().push(file.name.clone());
            }
            Ok(groups)
        }

        async fn read_tags(&self, file: &DatasetFile, _specs: &[TagSpec]) -> pacs_core::Result<HashMap<String, String>> {
            Ok(HashMap::from([
                ("Modality".to_string(), "CT".to_string()),
                ("StudyInstanceUID".to_string(), "1.2.3".to_string()),
                ("SeriesInstanceUID".to_string(), series_of(file)),
            ]))
        }

        async fn decode_slice(&self, _file: &DatasetFile, _as_thumbnail: bool) -> pacs_core::Result<ImageData> {
            Err(PacsError::Internal("unused".to_string()))
        }

        async fn build_volume(&self, pipeline: &VolumePipeline) -> pacs_core::Result<ImageData> {
            Ok(ImageData {
                dimensions: [1, 1, pipeline.file_count()],
                spacing: [1.0; 3],
                origin: [0.0; 3],
                components: 1,
                pixel_type: PixelType::U8,
                pixels: Bytes::from(vec![0u8; pipeline.file_count()]),
            })
        }
    }

    fn dicom(name: &str, series: &str) -> DatasetFile {
        let mut data = vec![0u8; 128];
        data.extend_from_slice(b"DICM");
        data.extend_from_slice(series.as_bytes());
        DatasetFile::new(name, data)
    }

    fn importer() -> DataImporter {
        let io = DicomIo::new(Arc::new(StaticLauncher::new(Arc::new(SeriesWorker))));
        let store = Arc::new(DicomStore::new(Arc::new(io)));
        DataImporter::new(store, ImportConfig::default()).unwrap()
    }

    fn zip_of(entries: &[(&str, DatasetFile)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, file) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(&file.data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn test_import_hands_dicom_batch_to_store() {
        let archive = zip_of(&[("s1/a.dcm", dicom("a", "s1")), ("s1/b.dcm", dicom("b", "s1"))]);

        let importer = importer();
        let report = importer
            .import(vec![
                DataSource::from_file(DatasetFile::new("series.zip", archive)),
                DataSource::from_file(dicom("c.dcm", "s2")),
                DataSource::default(),
            ])
            .await
            .unwrap();

        assert_eq!(report.sources.len(), 3);
        assert_eq!(report.sources[0].results.len(), 2);
        assert_eq!(report.sources[1].results.len(), 1);
        assert_eq!(report.failed_sources(), 1);
        assert_eq!(report.dicom_files, 3);

        let mut volumes: Vec<&str> = report.volumes.iter().map(|k| k.volume_key.as_str()).collect();
        volumes.sort();
        assert_eq!(volumes, vec!["s1", "s2"]);

        let data_ids: Vec<&str> = report.sources[..2]
            .iter()
            .flat_map(|s| s.results.iter().map(|r| r.data_id.as_str()))
            .collect();
        assert_eq!(data_ids, vec!["s1", "s1", "s2"]);

        let store = importer.store();
        assert_eq!(store.state().hierarchy().volume("s1").unwrap().number_of_slices, 2);
        let built = store.build_volume("s1", false).await.unwrap();
        assert_eq!(built.dimensions, [1, 1, 2]);
    }

    #[tokio::test]
    async fn test_same_entry_name_in_two_archives() {
        let first = zip_of(&[("IMG0001", dicom("IMG0001", "series-a"))]);
        let second = zip_of(&[("IMG0001", dicom("IMG0001", "series-b"))]);

        let importer = importer();
        let report = importer
            .import(vec![
                DataSource::from_file(DatasetFile::new("a.zip", first)),
                DataSource::from_file(DatasetFile::new("b.zip", second)),
            ])
            .await
            .unwrap();

        assert_eq!(report.dicom_files, 2);
        assert_eq!(report.volumes.len(), 2);
        assert_eq!(report.sources[0].results[0].data_id, "series-a");
        assert_eq!(report.sources[1].results[0].data_id, "series-b");

        let state = importer.store().state();
        let a = state.files().get_files("series-a").unwrap();
        let b = state.files().get_files("series-b").unwrap();
        assert_eq!(series_of(&a[0]), "series-a");
        assert_eq!(series_of(&b[0]), "series-b");
        assert_ne!(a[0].name, b[0].name);
    }

    #[tokio::test]
    async fn test_duplicate_top_level_files_are_both_kept() {
        let importer = importer();
        let report = importer
            .import(vec![
                DataSource::from_file(dicom("IMG0001", "series-a")),
                DataSource::from_file(dicom("IMG0001", "series-b")),
            ])
            .await
            .unwrap();

        assert_eq!(report.volumes.len(), 2);
        let state = importer.store().state();
        let mut names: Vec<String> = ["series-a", "series-b"]
            .iter()
            .flat_map(|s| state.files().get_files(s).unwrap().iter().map(|f| f.name.clone()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["IMG0001", "IMG0001 (2)"]);
    }

    #[tokio::test]
    async fn test_import_without_dicom_leaves_store_untouched() {
        let importer = importer();
        let report = importer
            .import(vec![DataSource::from_file(DatasetFile::new("notes", b"text".to_vec()))])
            .await
            .unwrap();
        assert_eq!(report.dicom_files, 0);
        assert!(report.volumes.is_empty());
        assert!(importer.store().state().hierarchy().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let io = DicomIo::new(Arc::new(StaticLauncher::new(Arc::new(SeriesWorker))));
        let store = Arc::new(DicomStore::new(Arc::new(io)));
        let config = ImportConfig {
            allowed_schemes: Vec::new(),
            ..Default::default()
        };
        assert!(DataImporter::new(store, config).is_err());
    }
}
