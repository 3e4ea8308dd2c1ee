//! 数据源来源树

use pacs_core::DatasetFile;
use serde::Serialize;
use std::sync::Arc;

/// 远程资源及其下载后的文件名
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UriSource {
    pub uri: String,
    pub name: String,
}

/// 文件及其MIME类型，类型为空表示尚未识别
#[derive(Debug, Clone, Serialize)]
pub struct FileSource {
    pub file: DatasetFile,
    pub file_type: String,
}

/// 归档内的完整路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSource {
    pub path: String,
}

/// 数据源
///
/// `parent` 指向派生出当前数据源的节点，来源关系构成一棵树。
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataSource {
    pub uri_src: Option<UriSource>,
    pub file_src: Option<FileSource>,
    pub archive_src: Option<ArchiveSource>,
    pub parent: Option<Arc<DataSource>>,
}

impl DataSource {
    /// 类型未知的文件
    pub fn from_file(file: DatasetFile) -> Self {
        Self::from_typed_file(file, "")
    }

    pub fn from_typed_file(file: DatasetFile, file_type: impl Into<String>) -> Self {
        Self {
            file_src: Some(FileSource {
                file,
                file_type: file_type.into(),
            }),
            ..Default::default()
        }
    }

    pub fn from_uri(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri_src: Some(UriSource {
                uri: uri.into(),
                name: name.into(),
            }),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: Arc<DataSource>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_archive_path(mut self, path: impl Into<String>) -> Self {
        self.archive_src = Some(ArchiveSource { path: path.into() });
        self
    }

    pub fn file_type(&self) -> Option<&str> {
        self.file_src.as_ref().map(|f| f.file_type.as_str())
    }

    /// 从父节点到根节点依次遍历
    pub fn ancestors(&self) -> impl Iterator<Item = &DataSource> {
        std::iter::successors(self.parent.as_deref(), |node| node.parent.as_deref())
    }

    /// 派生深度，根节点为0
    pub fn depth(&self) -> usize {
        self.ancestors().count()
    }

    pub fn root(&self) -> &DataSource {
        self.ancestors().last().unwrap_or(self)
    }

    /// 便于日志输出的名称
    pub fn display_name(&self) -> String {
        if let Some(archive) = &self.archive_src {
            return archive.path.clone();
        }
        if let Some(file) = &self.file_src {
            return file.file.name.clone();
        }
        if let Some(uri) = &self.uri_src {
            return uri.uri.clone();
        }
        "<empty>".to_string()
    }

    /// 从根到当前节点的完整来源名，用于区分不同归档中的同名条目
    ///
    /// 每一级取归档路径、文件名或URI名称，与上一级相同的名称（下载得到的文件）只保留一次。
    pub fn qualified_name(&self) -> String {
        let mut chain: Vec<&DataSource> = self.ancestors().collect();
        chain.reverse();
        chain.push(self);

        let mut segments: Vec<&str> = Vec::with_capacity(chain.len());
        for node in chain {
            let segment = if let Some(archive) = &node.archive_src {
                archive.path.as_str()
            } else if let Some(file) = &node.file_src {
                file.file.name.as_str()
            } else if let Some(uri) = &node.uri_src {
                uri.name.as_str()
            } else {
                continue;
            };
            if segments.last() != Some(&segment) {
                segments.push(segment);
            }
        }
        segments.join("/")
    }
}

/// 导入结果种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportKind {
    /// 交由DICOM存储组织
    Dicom,
    /// 交由通用读取器处理
    File,
}

/// 流水线终端结果
///
/// DICOM结果在批次组织完成后，`data_id` 改为文件所属的卷键。
#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub data_id: String,
    pub kind: ImportKind,
    pub data_source: DataSource,
}

impl ImportResult {
    pub fn new(kind: ImportKind, data_source: DataSource) -> Self {
        Self {
            data_id: uuid::Uuid::new_v4().to_string(),
            kind,
            data_source,
        }
    }
}
