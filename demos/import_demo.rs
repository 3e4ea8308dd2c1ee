//! 数据导入与DICOM组织演示程序
//!
//! 使用内存中的演示worker展示：
//! - 本地文件经解析流水线导入
//! - PET-CT配对与患者/检查/卷层级
//! - 切片读取、缩略图与卷构建
//! - 重复导入触发重建、级联删除与快照

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use pacs_core::{DatasetFile, ImageData, PixelType, VolumePipeline};
use pacs_dicom::{DicomIo, DicomStore, DicomWorker, StaticLauncher, TagSpec, VolumeGroups};
use pacs_import::{DataImporter, DataSource, ImportConfig};
use std::collections::HashMap;
use std::sync::Arc;

/// 演示worker：文件内容在DICM标识之后是 `key=value` 行
struct DemoWorker;

fn demo_tags(file: &DatasetFile) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(file.data.get(132..).unwrap_or_default()).to_string();
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn demo_image(depth: usize) -> ImageData {
    ImageData {
        dimensions: [2, 2, depth],
        spacing: [1.0, 1.0, 2.5],
        origin: [0.0; 3],
        components: 1,
        pixel_type: PixelType::U8,
        pixels: Bytes::from(vec![128u8; 4 * depth]),
    }
}

#[async_trait]
impl DicomWorker for DemoWorker {
    async fn categorize(&self, files: &[DatasetFile]) -> pacs_core::Result<VolumeGroups> {
        let mut groups = VolumeGroups::new();
        for file in files {
            let series = demo_tags(file)
                .remove("SeriesInstanceUID")
                .unwrap_or_else(|| file.name.clone());
            groups.entry(series).or_default().push(file.name.clone());
        }
        for names in groups.values_mut() {
            names.sort();
        }
        Ok(groups)
    }

    async fn read_tags(
        &self,
        file: &DatasetFile,
        _specs: &[TagSpec],
    ) -> pacs_core::Result<HashMap<String, String>> {
        Ok(demo_tags(file))
    }

    async fn decode_slice(&self, _file: &DatasetFile, _as_thumbnail: bool) -> pacs_core::Result<ImageData> {
        Ok(demo_image(1))
    }

    async fn build_volume(&self, pipeline: &VolumePipeline) -> pacs_core::Result<ImageData> {
        Ok(demo_image(pipeline.structural_slice_count()))
    }
}

fn demo_file(name: &str, modality: &str, series: &str) -> DatasetFile {
    let mut data = vec![0u8; 128];
    data.extend_from_slice(b"DICM");
    data.extend_from_slice(
        format!(
            "PatientID=P001\nPatientName=Demo^Patient\nModality={}\nStudyInstanceUID=1.2.840.1\nSeriesInstanceUID={}\n",
            modality, series
        )
        .as_bytes(),
    );
    DatasetFile::new(name, data)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("🏥 PACS数据导入演示");
    println!("================================");

    let io = Arc::new(DicomIo::new(Arc::new(StaticLauncher::new(Arc::new(DemoWorker)))));
    let store = Arc::new(DicomStore::new(io.clone()));
    let importer = DataImporter::new(store.clone(), ImportConfig::default())?;

    println!("\n📥 导入CT与PET序列...");
    let sources = vec![
        DataSource::from_file(demo_file("ct1.dcm", "CT", "1.2.840.1.1")),
        DataSource::from_file(demo_file("ct2.dcm", "CT", "1.2.840.1.1")),
        DataSource::from_file(demo_file("pt1.dcm", "PT", "1.2.840.1.2")),
        DataSource::from_file(DatasetFile::new("notes.txt", b"not an image".to_vec())),
    ];
    let report = importer.import(sources).await?;
    for source in &report.sources {
        println!("  {} -> {} 个结果", source.source, source.results.len());
    }
    for keys in &report.volumes {
        println!(
            "  新建卷 {} (患者 {}, 检查 {})",
            keys.volume_key, keys.patient_key, keys.study_key
        );
    }

    let (patients, studies, volumes) = store.state().hierarchy().counts();
    println!("\n📊 层级: {} 个患者, {} 个检查, {} 个卷", patients, studies, volumes);

    let Some(keys) = report.volumes.first() else {
        println!("未创建任何卷");
        return Ok(());
    };
    let volume_key = keys.volume_key.clone();
    if let Some(volume) = store.state().hierarchy().volume(&volume_key) {
        println!(
            "  卷 {}: 模态 {}, {} 个切片, 构建类型 {}",
            volume_key,
            volume.modality,
            volume.number_of_slices,
            match volume.pipeline {
                VolumePipeline::Series { .. } => "series",
                VolumePipeline::PtCt { .. } => "pt-ct",
            }
        );
    }

    println!("\n🖼️ 读取切片与缩略图，同时构建卷...");
    let (slice, thumbnail, image) = tokio::join!(
        store.get_volume_slice(&volume_key, 1, false),
        store.get_volume_thumbnail(&volume_key),
        store.build_volume(&volume_key, false),
    );
    println!("  切片1: {:?}", slice?.dimensions);
    println!("  缩略图: {:?}", thumbnail?.dimensions);
    let image = image?;
    println!("  {}: {:?}, 标量范围 {:?}", image.name, image.dimensions, image.scalar_range(0));

    println!("\n♻️ 追加CT切片后重建...");
    store
        .import_files(vec![demo_file("ct3.dcm", "CT", "1.2.840.1.1")])
        .await?;
    println!("  需要重建: {}", store.needs_rebuild(&volume_key));
    let image = store.build_volume(&volume_key, false).await?;
    println!("  重建后: {:?}", image.dimensions);

    println!("\n💾 快照...");
    let snapshot = store.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    println!("\n🗑️ 删除患者...");
    let patient_key = keys.patient_key.clone();
    store.delete_patient(&patient_key)?;
    println!("  存储为空: {}", store.state().hierarchy().is_empty());

    io.shutdown().await;
    println!("\n✅ 演示完成！");
    Ok(())
}
