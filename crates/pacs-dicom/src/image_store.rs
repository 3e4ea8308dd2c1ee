//! 可渲染体数据存储
//!
//! 构建完成的体数据转换为浮点标量图像后登记在此，以数据集ID索引。

use pacs_core::{ImageData, PacsError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// 可渲染的体数据
#[derive(Debug, Clone)]
pub struct VolumeImage {
    pub name: String,
    pub dimensions: [usize; 3],
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    pub components: usize,
    /// 按分量交织的标量
    pub scalars: Vec<f32>,
    /// 每个分量的取值范围
    pub ranges: Vec<[f32; 2]>,
}

impl VolumeImage {
    /// 由解码结果转换
    pub fn from_image(name: impl Into<String>, image: &ImageData) -> Result<Self> {
        if image.components == 0 {
            return Err(PacsError::Validation("图像分量数为0".to_string()));
        }
        if image.pixels.len() != image.expected_len() {
            return Err(PacsError::Validation(format!(
                "像素数据长度 {} 与几何信息不符，应为 {}",
                image.pixels.len(),
                image.expected_len()
            )));
        }

        let scalars = image.samples();
        let mut ranges = vec![[f32::MAX, f32::MIN]; image.components];
        for (i, value) in scalars.iter().enumerate() {
            let range = &mut ranges[i % image.components];
            range[0] = range[0].min(*value);
            range[1] = range[1].max(*value);
        }
        if scalars.is_empty() {
            ranges.iter_mut().for_each(|r| *r = [0.0, 0.0]);
        }

        Ok(Self {
            name: name.into(),
            dimensions: image.dimensions,
            spacing: image.spacing,
            origin: image.origin,
            components: image.components,
            scalars,
            ranges,
        })
    }

    pub fn scalar_range(&self, component: usize) -> Option<[f32; 2]> {
        self.ranges.get(component).copied()
    }
}

/// 体数据登记表
#[derive(Debug, Default)]
pub struct ImageStore {
    images: HashMap<String, Arc<VolumeImage>>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新图像，返回生成的数据集ID
    pub fn add(&mut self, image: VolumeImage) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        debug!("登记体数据 {} ({})", id, image.name);
        self.images.insert(id.clone(), Arc::new(image));
        id
    }

    /// 原位替换已登记的图像
    pub fn update(&mut self, id: &str, image: VolumeImage) -> Result<()> {
        match self.images.get_mut(id) {
            Some(slot) => {
                *slot = Arc::new(image);
                Ok(())
            }
            None => Err(PacsError::NotFound(format!("数据集 {}", id))),
        }
    }

    pub fn delete(&mut self, id: &str) -> Option<Arc<VolumeImage>> {
        self.images.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<VolumeImage>> {
        self.images.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
