//! 核心数据模型定义

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 匿名患者姓名
pub const ANONYMOUS_PATIENT: &str = "Anonymous";
/// 匿名患者ID
pub const ANONYMOUS_PATIENT_ID: &str = "ANONYMOUS";

/// 数据集文件
///
/// 文件内容只在内存中流转，序列化时仅保留文件名，恢复时按文件名重新关联。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetFile {
    pub name: String,
    #[serde(skip)]
    pub data: Bytes,
}

impl DatasetFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 文件扩展名（小写）
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// 患者信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientInfo {
    #[serde(rename = "PatientID")]
    pub patient_id: String,
    #[serde(rename = "PatientName")]
    pub patient_name: String,
    #[serde(rename = "PatientBirthDate")]
    pub patient_birth_date: String,
    #[serde(rename = "PatientSex")]
    pub patient_sex: String,
}

/// 检查信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyInfo {
    #[serde(rename = "StudyID")]
    pub study_id: String,
    #[serde(rename = "StudyInstanceUID")]
    pub study_instance_uid: String,
    #[serde(rename = "StudyDate")]
    pub study_date: String,
    #[serde(rename = "StudyTime")]
    pub study_time: String,
    #[serde(rename = "AccessionNumber")]
    pub accession_number: String,
    #[serde(rename = "StudyDescription")]
    pub study_description: String,
}

/// 卷信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    #[serde(rename = "NumberOfSlices")]
    pub number_of_slices: usize,
    #[serde(rename = "VolumeID")]
    pub volume_id: String,
    #[serde(rename = "Modality")]
    pub modality: String,
    #[serde(rename = "SeriesInstanceUID")]
    pub series_instance_uid: String,
    #[serde(rename = "SeriesNumber")]
    pub series_number: String,
    #[serde(rename = "SeriesDescription")]
    pub series_description: String,
    pub pipeline: VolumePipeline,
}

/// 新建卷在层级结构中的位置
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeKeys {
    pub patient_key: String,
    pub study_key: String,
    pub volume_key: String,
}

/// 卷的构建描述
///
/// 种类固定：普通序列或PET-CT配对。PET-CT中CT文件始终排在PT文件之前。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum VolumePipeline {
    #[serde(rename = "series")]
    Series { files: Vec<DatasetFile> },
    #[serde(rename = "pt-ct")]
    PtCt {
        #[serde(rename = "ctFiles")]
        ct_files: Vec<DatasetFile>,
        #[serde(rename = "ptFiles")]
        pt_files: Vec<DatasetFile>,
    },
}

impl VolumePipeline {
    pub fn series(files: Vec<DatasetFile>) -> Self {
        Self::Series { files }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Series { .. } => "series",
            Self::PtCt { .. } => "pt-ct",
        }
    }

    /// 全部文件，PET-CT按CT在前、PT在后排列
    pub fn files(&self) -> Vec<DatasetFile> {
        match self {
            Self::Series { files } => files.clone(),
            Self::PtCt { ct_files, pt_files } => {
                ct_files.iter().chain(pt_files.iter()).cloned().collect()
            }
        }
    }

    pub fn file_count(&self) -> usize {
        match self {
            Self::Series { files } => files.len(),
            Self::PtCt { ct_files, pt_files } => ct_files.len() + pt_files.len(),
        }
    }

    /// 缩略图所依据的结构切片数，PET-CT只计CT通道
    pub fn structural_slice_count(&self) -> usize {
        match self {
            Self::Series { files } => files.len(),
            Self::PtCt { ct_files, .. } => ct_files.len(),
        }
    }

    /// 合并新导入的文件，返回是否有新文件加入
    ///
    /// 序列遇到PET-CT时升级为PET-CT，原有文件作为CT通道。
    pub fn merge(&mut self, incoming: VolumePipeline) -> bool {
        let current = std::mem::replace(self, Self::Series { files: Vec::new() });
        let (merged, added) = match (current, incoming) {
            (Self::Series { mut files }, Self::Series { files: new_files }) => {
                let added = append_new(&mut files, new_files);
                (Self::Series { files }, added)
            }
            (
                Self::PtCt {
                    mut ct_files,
                    mut pt_files,
                },
                Self::PtCt {
                    ct_files: new_ct,
                    pt_files: new_pt,
                },
            ) => {
                let added_ct = append_new(&mut ct_files, new_ct);
                let added_pt = append_new(&mut pt_files, new_pt);
                (Self::PtCt { ct_files, pt_files }, added_ct || added_pt)
            }
            (
                Self::Series { mut files },
                Self::PtCt {
                    ct_files: new_ct,
                    pt_files: new_pt,
                },
            ) => {
                append_new(&mut files, new_ct);
                let mut pt_files = Vec::new();
                append_new(&mut pt_files, new_pt);
                (
                    Self::PtCt {
                        ct_files: files,
                        pt_files,
                    },
                    true,
                )
            }
            (
                Self::PtCt {
                    mut ct_files,
                    pt_files,
                },
                Self::Series { files: new_files },
            ) => {
                let added = append_new(&mut ct_files, new_files);
                (Self::PtCt { ct_files, pt_files }, added)
            }
        };
        *self = merged;
        added
    }

    /// 按文件名重新关联文件内容
    pub fn attach_data<F>(&mut self, mut lookup: F) -> std::result::Result<(), String>
    where
        F: FnMut(&str) -> Option<bytes::Bytes>,
    {
        let lists: Vec<&mut Vec<DatasetFile>> = match self {
            Self::Series { files } => vec![files],
            Self::PtCt { ct_files, pt_files } => vec![ct_files, pt_files],
        };
        for list in lists {
            for file in list.iter_mut() {
                file.data = lookup(&file.name).ok_or_else(|| file.name.clone())?;
            }
        }
        Ok(())
    }
}

fn append_new(target: &mut Vec<DatasetFile>, incoming: Vec<DatasetFile>) -> bool {
    let mut added = false;
    for file in incoming {
        if !target.iter().any(|existing| existing.name == file.name) {
            target.push(file);
            added = true;
        }
    }
    added
}

/// 像素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelType {
    U8,
    U16,
    I16,
}

impl PixelType {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 | PixelType::I16 => 2,
        }
    }
}

/// 解码后的图像（切片或体数据），像素按小端序存储
#[derive(Debug, Clone)]
pub struct ImageData {
    pub dimensions: [usize; 3],
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    pub components: usize,
    pub pixel_type: PixelType,
    pub pixels: Bytes,
}

impl ImageData {
    /// 像素数据应有的字节数
    pub fn expected_len(&self) -> usize {
        self.dimensions.iter().product::<usize>() * self.components * self.pixel_type.bytes_per_sample()
    }

    /// 将像素读取为浮点数
    pub fn samples(&self) -> Vec<f32> {
        match self.pixel_type {
            PixelType::U8 => self.pixels.iter().map(|&v| v as f32).collect(),
            PixelType::U16 => self
                .pixels
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as f32)
                .collect(),
            PixelType::I16 => self
                .pixels
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> DatasetFile {
        DatasetFile::new(name, name.as_bytes().to_vec())
    }

    #[test]
    fn test_structural_slice_count() {
        let series = VolumePipeline::series(vec![file("a"), file("b"), file("c")]);
        assert_eq!(series.structural_slice_count(), 3);

        let ptct = VolumePipeline::PtCt {
            ct_files: vec![file("ct1"), file("ct2")],
            pt_files: vec![file("pt1"), file("pt2"), file("pt3")],
        };
        assert_eq!(ptct.structural_slice_count(), 2);
        assert_eq!(ptct.file_count(), 5);
        let names: Vec<String> = ptct.files().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["ct1", "ct2", "pt1", "pt2", "pt3"]);
    }

    #[test]
    fn test_merge_skips_known_files() {
        let mut pipeline = VolumePipeline::series(vec![file("a"), file("b")]);
        assert!(!pipeline.merge(VolumePipeline::series(vec![file("a")])));
        assert!(pipeline.merge(VolumePipeline::series(vec![file("b"), file("c")])));
        assert_eq!(pipeline.file_count(), 3);
    }

    #[test]
    fn test_merge_upgrades_series_to_ptct() {
        let mut pipeline = VolumePipeline::series(vec![file("ct1")]);
        let added = pipeline.merge(VolumePipeline::PtCt {
            ct_files: vec![file("ct1"), file("ct2")],
            pt_files: vec![file("pt1")],
        });
        assert!(added);
        assert_eq!(pipeline.kind(), "pt-ct");
        let names: Vec<String> = pipeline.files().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["ct1", "ct2", "pt1"]);
    }

    #[test]
    fn test_pipeline_serialization_keeps_names_only() {
        let pipeline = VolumePipeline::PtCt {
            ct_files: vec![file("ct1")],
            pt_files: vec![file("pt1")],
        };
        let json = serde_json::to_value(&pipeline).unwrap();
        assert_eq!(json["kind"], "pt-ct");
        assert_eq!(json["ctFiles"][0]["name"], "ct1");
        assert!(json["ctFiles"][0].get("data").is_none());

        let mut restored: VolumePipeline = serde_json::from_value(json).unwrap();
        assert!(restored.files()[0].is_empty());
        restored
            .attach_data(|name| Some(bytes::Bytes::from(name.to_string())))
            .unwrap();
        assert_eq!(&restored.files()[1].data[..], b"pt1");
    }

    #[test]
    fn test_image_samples() {
        let image = ImageData {
            dimensions: [2, 1, 1],
            spacing: [1.0; 3],
            origin: [0.0; 3],
            components: 1,
            pixel_type: PixelType::I16,
            pixels: Bytes::from(vec![0xff, 0xff, 0x10, 0x00]),
        };
        assert_eq!(image.expected_len(), 4);
        assert_eq!(image.samples(), vec![-1.0, 16.0]);
    }
}
