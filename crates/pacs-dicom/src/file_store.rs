//! 卷文件存储

use pacs_core::DatasetFile;
use std::collections::HashMap;

/// 按卷键保存有序的文件列表
#[derive(Debug, Default, Clone)]
pub struct FileStore {
    files: HashMap<String, Vec<DatasetFile>>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 整体替换卷的文件列表
    pub fn set(&mut self, volume_key: &str, files: Vec<DatasetFile>) {
        self.files.insert(volume_key.to_string(), files);
    }

    pub fn get_files(&self, volume_key: &str) -> Option<&[DatasetFile]> {
        self.files.get(volume_key).map(Vec::as_slice)
    }

    pub fn remove(&mut self, volume_key: &str) -> Option<Vec<DatasetFile>> {
        self.files.remove(volume_key)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}
