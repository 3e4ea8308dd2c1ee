//! 共享DICOM worker接口
//!
//! worker不支持并发调用，所有调用都必须经由 [`crate::DicomIo`] 的任务队列。

use async_trait::async_trait;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use pacs_core::{DatasetFile, ImageData, Result, VolumePipeline};
use std::collections::HashMap;
use std::sync::Arc;

/// 待读取的标签及其输出字段名
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagSpec {
    pub name: &'static str,
    pub tag: Tag,
}

impl TagSpec {
    pub const fn new(name: &'static str, tag: Tag) -> Self {
        Self { name, tag }
    }
}

/// 组织患者/检查/卷层级所需的描述性标签
pub const DESCRIPTIVE_TAGS: &[TagSpec] = &[
    TagSpec::new("PatientName", tags::PATIENT_NAME),
    TagSpec::new("PatientID", tags::PATIENT_ID),
    TagSpec::new("PatientBirthDate", tags::PATIENT_BIRTH_DATE),
    TagSpec::new("PatientSex", tags::PATIENT_SEX),
    TagSpec::new("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
    TagSpec::new("StudyDate", tags::STUDY_DATE),
    TagSpec::new("StudyTime", tags::STUDY_TIME),
    TagSpec::new("StudyID", tags::STUDY_ID),
    TagSpec::new("AccessionNumber", tags::ACCESSION_NUMBER),
    TagSpec::new("StudyDescription", tags::STUDY_DESCRIPTION),
    TagSpec::new("Modality", tags::MODALITY),
    TagSpec::new("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
    TagSpec::new("SeriesNumber", tags::SERIES_NUMBER),
    TagSpec::new("SeriesDescription", tags::SERIES_DESCRIPTION),
];

/// 卷分组结果：分组键 -> 文件名列表（已按切片顺序排列）
pub type VolumeGroups = HashMap<String, Vec<String>>;

/// DICOM worker
#[async_trait]
pub trait DicomWorker: Send + Sync {
    /// 将文件按卷分组
    async fn categorize(&self, files: &[DatasetFile]) -> Result<VolumeGroups>;

    /// 读取单个文件的标签
    async fn read_tags(&self, file: &DatasetFile, specs: &[TagSpec]) -> Result<HashMap<String, String>>;

    /// 解码单个切片，缩略图转换为8位
    async fn decode_slice(&self, file: &DatasetFile, as_thumbnail: bool) -> Result<ImageData>;

    /// 按构建描述构建完整卷
    async fn build_volume(&self, pipeline: &VolumePipeline) -> Result<ImageData>;

    /// 释放worker持有的资源
    async fn terminate(&self) {}
}

/// worker启动器，负责获取worker句柄本身
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn DicomWorker>>;
}

/// 直接复用已创建的worker
pub struct StaticLauncher {
    worker: Arc<dyn DicomWorker>,
}

impl StaticLauncher {
    pub fn new(worker: Arc<dyn DicomWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl WorkerLauncher for StaticLauncher {
    async fn launch(&self) -> Result<Arc<dyn DicomWorker>> {
        Ok(self.worker.clone())
    }
}
