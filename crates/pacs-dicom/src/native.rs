//! 基于dicom-rs的本地worker
//!
//! 只处理原生（未压缩）像素数据。PET-CT在两组网格一致时融合为双通道体数据。

use crate::parser::{DicomParser, PixelModule, SliceHeader};
use crate::worker::{DicomWorker, TagSpec, VolumeGroups, WorkerLauncher};
use async_trait::async_trait;
use bytes::Bytes;
use pacs_core::{DatasetFile, ImageData, PacsError, PixelType, Result, VolumePipeline};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 本地DICOM worker
#[derive(Debug, Default, Clone)]
pub struct NativeDicomWorker;

impl NativeDicomWorker {
    pub fn new() -> Self {
        Self
    }
}

/// 本地worker启动器
#[derive(Debug, Default)]
pub struct NativeLauncher;

#[async_trait]
impl WorkerLauncher for NativeLauncher {
    async fn launch(&self) -> Result<Arc<dyn DicomWorker>> {
        Ok(Arc::new(NativeDicomWorker::new()))
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PacsError::Internal(format!("解码线程异常: {}", e)))?
}

#[async_trait]
impl DicomWorker for NativeDicomWorker {
    async fn categorize(&self, files: &[DatasetFile]) -> Result<VolumeGroups> {
        let files = files.to_vec();
        blocking(move || Ok(categorize_files(&files))).await
    }

    async fn read_tags(&self, file: &DatasetFile, specs: &[TagSpec]) -> Result<HashMap<String, String>> {
        let file = file.clone();
        let specs = specs.to_vec();
        blocking(move || {
            let obj = DicomParser::parse_bytes(&file.data)
                .map_err(|e| PacsError::TagRead(format!("{}: {}", file.name, e)))?;
            Ok(DicomParser::read_tags(&obj, &specs))
        })
        .await
    }

    async fn decode_slice(&self, file: &DatasetFile, as_thumbnail: bool) -> Result<ImageData> {
        let file = file.clone();
        blocking(move || {
            let slice = decode_file(&file)?;
            let image = slice.into_image();
            Ok(if as_thumbnail { to_thumbnail(&image) } else { image })
        })
        .await
    }

    async fn build_volume(&self, pipeline: &VolumePipeline) -> Result<ImageData> {
        let pipeline = pipeline.clone();
        blocking(move || match &pipeline {
            VolumePipeline::Series { files } => stack_slices(files),
            VolumePipeline::PtCt { ct_files, pt_files } => {
                let ct = stack_slices(ct_files)?;
                let pt = stack_slices(pt_files)?;
                fuse_channels(&ct, &pt)
            }
        })
        .await
    }
}

/// 按Series Instance UID分组，组内按Instance Number排序
fn categorize_files(files: &[DatasetFile]) -> VolumeGroups {
    let mut groups: HashMap<String, Vec<(Option<i32>, String)>> = HashMap::new();
    for file in files {
        let header = match DicomParser::parse_bytes(&file.data) {
            Ok(obj) => DicomParser::slice_header(&obj),
            Err(e) => {
                warn!("跳过无法解析的文件 {}: {}", file.name, e);
                continue;
            }
        };
        let key = header
            .series_instance_uid
            .filter(|uid| !uid.is_empty())
            .unwrap_or_else(|| file.name.clone());
        groups
            .entry(key)
            .or_default()
            .push((header.instance_number, file.name.clone()));
    }

    groups
        .into_iter()
        .map(|(key, mut members)| {
            members.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            (key, members.into_iter().map(|(_, name)| name).collect())
        })
        .collect()
}

struct DecodedSlice {
    header: SliceHeader,
    pixels: PixelModule,
}

impl DecodedSlice {
    fn spacing(&self) -> [f64; 3] {
        let [row, col] = self.header.pixel_spacing.unwrap_or([1.0, 1.0]);
        [col, row, self.header.slice_thickness.unwrap_or(1.0)]
    }

    fn into_image(self) -> ImageData {
        ImageData {
            dimensions: [self.pixels.columns, self.pixels.rows, 1],
            spacing: self.spacing(),
            origin: self.header.image_position.unwrap_or([0.0; 3]),
            components: 1,
            pixel_type: self.pixels.pixel_type,
            pixels: Bytes::from(self.pixels.pixels),
        }
    }
}

fn decode_file(file: &DatasetFile) -> Result<DecodedSlice> {
    let obj = DicomParser::parse_bytes(&file.data)?;
    Ok(DecodedSlice {
        header: DicomParser::slice_header(&obj),
        pixels: DicomParser::pixel_module(&obj)?,
    })
}

/// 按最小/最大值窗宽转换为8位图像
fn to_thumbnail(image: &ImageData) -> ImageData {
    let samples = image.samples();
    let (min, max) = samples
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = if max > min { max - min } else { 1.0 };
    let pixels: Vec<u8> = samples
        .iter()
        .map(|&v| (((v - min) / range) * 255.0).round() as u8)
        .collect();

    ImageData {
        pixel_type: PixelType::U8,
        pixels: Bytes::from(pixels),
        ..image.clone()
    }
}

/// 将切片堆叠为体数据
fn stack_slices(files: &[DatasetFile]) -> Result<ImageData> {
    let first_file = files
        .first()
        .ok_or_else(|| PacsError::Dicom("卷中没有文件".to_string()))?;
    let first = decode_file(first_file)?;
    let (rows, columns, pixel_type) = (first.pixels.rows, first.pixels.columns, first.pixels.pixel_type);
    let mut spacing = first.spacing();
    let origin = first.header.image_position.unwrap_or([0.0; 3]);

    let mut pixels = Vec::with_capacity(first.pixels.pixels.len() * files.len());
    pixels.extend_from_slice(&first.pixels.pixels);

    for (index, file) in files.iter().enumerate().skip(1) {
        let slice = decode_file(file)?;
        if slice.pixels.rows != rows
            || slice.pixels.columns != columns
            || slice.pixels.pixel_type != pixel_type
        {
            return Err(PacsError::Dicom(format!(
                "切片 {} 与首个切片尺寸或像素类型不一致",
                file.name
            )));
        }
        // 以相邻切片位置差作为层间距
        if index == 1 {
            if let (Some(a), Some(b)) = (first.header.image_position, slice.header.image_position) {
                let distance = ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2) + (b[2] - a[2]).powi(2)).sqrt();
                if distance > f64::EPSILON {
                    spacing[2] = distance;
                }
            }
        }
        pixels.extend_from_slice(&slice.pixels.pixels);
    }

    debug!("已堆叠 {} 个切片 ({}x{})", files.len(), columns, rows);
    Ok(ImageData {
        dimensions: [columns, rows, files.len()],
        spacing,
        origin,
        components: 1,
        pixel_type,
        pixels: Bytes::from(pixels),
    })
}

/// 将CT与PT交织为双通道体数据，第一通道为CT
fn fuse_channels(ct: &ImageData, pt: &ImageData) -> Result<ImageData> {
    if ct.dimensions != pt.dimensions || ct.pixel_type != pt.pixel_type {
        return Err(PacsError::Dicom(format!(
            "PET-CT网格不一致: CT {:?} / PT {:?}，暂不支持重采样",
            ct.dimensions, pt.dimensions
        )));
    }

    let sample = ct.pixel_type.bytes_per_sample();
    let mut pixels = Vec::with_capacity(ct.pixels.len() * 2);
    for (c, p) in ct.pixels.chunks_exact(sample).zip(pt.pixels.chunks_exact(sample)) {
        pixels.extend_from_slice(c);
        pixels.extend_from_slice(p);
    }

    info!("PET-CT融合完成: {:?}", ct.dimensions);
    Ok(ImageData {
        components: 2,
        pixels: Bytes::from(pixels),
        ..ct.clone()
    })
}
