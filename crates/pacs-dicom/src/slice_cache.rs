//! 切片与体数据缓存
//!
//! 缓存条目以 (卷键, 切片序号, 是否缩略图) 为键。需要重建标记只能由成功的重建清除。
//! 每个卷带有一个修订号，卷的文件变化或被删除时修订号随之改变，
//! 在途的解码或构建结果据此判断是否仍然有效。

use pacs_core::ImageData;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

type SliceKey = (usize, bool);

/// 卷缓存
#[derive(Debug, Default)]
pub struct VolumeCache {
    slices: HashMap<String, HashMap<SliceKey, Arc<ImageData>>>,
    needs_rebuild: HashSet<String>,
    volume_to_image: HashMap<String, String>,
    revisions: HashMap<String, u64>,
    next_revision: u64,
}

impl VolumeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_slice(&self, volume_key: &str, index: usize, as_thumbnail: bool) -> Option<Arc<ImageData>> {
        self.slices
            .get(volume_key)
            .and_then(|slices| slices.get(&(index, as_thumbnail)))
            .cloned()
    }

    pub fn put_slice(&mut self, volume_key: &str, index: usize, as_thumbnail: bool, image: Arc<ImageData>) {
        self.slices
            .entry(volume_key.to_string())
            .or_default()
            .insert((index, as_thumbnail), image);
    }

    /// 丢弃卷的全部切片缓存并推进修订号
    pub fn invalidate_slices(&mut self, volume_key: &str) {
        if let Some(slices) = self.slices.remove(volume_key) {
            debug!("清除卷 {} 的 {} 个切片缓存", volume_key, slices.len());
        }
        self.next_revision += 1;
        self.revisions
            .insert(volume_key.to_string(), self.next_revision);
    }

    /// 卷当前的修订号，未登记的卷为0
    pub fn revision(&self, volume_key: &str) -> u64 {
        self.revisions.get(volume_key).copied().unwrap_or(0)
    }

    pub fn cached_slice_count(&self, volume_key: &str) -> usize {
        self.slices.get(volume_key).map_or(0, HashMap::len)
    }

    pub fn mark_needs_rebuild(&mut self, volume_key: &str) {
        self.needs_rebuild.insert(volume_key.to_string());
    }

    pub fn needs_rebuild(&self, volume_key: &str) -> bool {
        self.needs_rebuild.contains(volume_key)
    }

    pub fn clear_needs_rebuild(&mut self, volume_key: &str) {
        self.needs_rebuild.remove(volume_key);
    }

    /// 记录卷与已登记图像的对应关系，返回被替换的图像ID
    pub fn register_image(&mut self, volume_key: &str, image_id: &str) -> Option<String> {
        self.volume_to_image
            .insert(volume_key.to_string(), image_id.to_string())
    }

    pub fn image_for_volume(&self, volume_key: &str) -> Option<&str> {
        self.volume_to_image.get(volume_key).map(String::as_str)
    }

    /// 移除卷的全部缓存状态，返回其对应的图像ID
    pub fn remove_volume(&mut self, volume_key: &str) -> Option<String> {
        self.slices.remove(volume_key);
        self.needs_rebuild.remove(volume_key);
        self.revisions.remove(volume_key);
        self.volume_to_image.remove(volume_key)
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
            && self.needs_rebuild.is_empty()
            && self.volume_to_image.is_empty()
            && self.revisions.is_empty()
    }
}
