//! 导入所需的外部协作者：文件类型识别、归档解压、远程清单与远程获取

use async_trait::async_trait;
use pacs_core::{DatasetFile, PacsError, Result};
use pacs_dicom::DicomParser;
use serde::Deserialize;
use std::io::{Cursor, Read};
use std::time::Duration;
use tracing::{debug, info};

use crate::source::UriSource;

/// MIME类型常量
pub mod mime_types {
    pub const DICOM: &str = "application/dicom";
    pub const JSON: &str = "application/json";
    pub const ZIP: &str = "application/zip";
    pub const GZIP: &str = "application/gzip";

    /// 需要解压的归档类型
    pub const ARCHIVE_TYPES: &[&str] = &[ZIP, GZIP];

    pub fn is_archive(mime: &str) -> bool {
        ARCHIVE_TYPES.contains(&mime)
    }
}

/// 识别文件的MIME类型
///
/// 依次检查DICM标识、文件头魔数和扩展名，都无法识别时返回 `None`。
pub fn sniff_mime_type(file: &DatasetFile) -> Option<String> {
    if DicomParser::looks_like_dicom(&file.data) {
        return Some(mime_types::DICOM.to_string());
    }
    if let Some(kind) = infer::get(&file.data) {
        return Some(kind.mime_type().to_string());
    }
    let mime = match file.extension()?.as_str() {
        "json" => mime_types::JSON,
        "dcm" | "dicom" => mime_types::DICOM,
        "zip" => mime_types::ZIP,
        "gz" => mime_types::GZIP,
        _ => return None,
    };
    Some(mime.to_string())
}

/// 归档中的条目
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub file: DatasetFile,
    /// 归档内的完整路径
    pub path: String,
}

/// 归档解压器
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    async fn extract(&self, file: &DatasetFile, mime: &str) -> Result<Vec<ArchiveEntry>>;
}

/// 支持zip与单文件gzip
#[derive(Debug, Default, Clone)]
pub struct StandardArchiveExtractor;

#[async_trait]
impl ArchiveExtractor for StandardArchiveExtractor {
    async fn extract(&self, file: &DatasetFile, mime: &str) -> Result<Vec<ArchiveEntry>> {
        let file = file.clone();
        let mime = mime.to_string();
        tokio::task::spawn_blocking(move || match mime.as_str() {
            mime_types::ZIP => extract_zip(&file),
            mime_types::GZIP => extract_gzip(&file).map(|entry| vec![entry]),
            other => Err(PacsError::Archive(format!("不支持的归档类型: {}", other))),
        })
        .await
        .map_err(|e| PacsError::Internal(format!("解压线程异常: {}", e)))?
    }
}

fn extract_zip(file: &DatasetFile) -> Result<Vec<ArchiveEntry>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(file.data.clone()))
        .map_err(|e| PacsError::Archive(format!("{}: {}", file.name, e)))?;

    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| PacsError::Archive(format!("{}: {}", file.name, e)))?;
        if entry.is_dir() {
            continue;
        }
        let path = entry.name().to_string();
        let declared = entry.size();
        let data = read_entry(&mut entry, declared)?;
        entries.push(ArchiveEntry {
            file: DatasetFile::new(path.clone(), data),
            path,
        });
    }

    info!("已解压 {}: {} 个条目", file.name, entries.len());
    Ok(entries)
}

/// 预分配上限，条目声明的大小来自归档本身，不可信
const PREALLOC_LIMIT: u64 = 64 * 1024 * 1024;

fn read_entry(reader: &mut impl Read, declared: u64) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(declared.min(PREALLOC_LIMIT) as usize);
    reader.read_to_end(&mut data)?;
    Ok(data)
}

fn extract_gzip(file: &DatasetFile) -> Result<ArchiveEntry> {
    let mut data = Vec::new();
    flate2::read::GzDecoder::new(&file.data[..])
        .read_to_end(&mut data)
        .map_err(|e| PacsError::Archive(format!("{}: {}", file.name, e)))?;

    let path = file
        .name
        .strip_suffix(".gz")
        .filter(|stem| !stem.is_empty())
        .unwrap_or(&file.name)
        .to_string();
    debug!("已解压 {} -> {}", file.name, path);
    Ok(ArchiveEntry {
        file: DatasetFile::new(path.clone(), data),
        path,
    })
}

#[derive(Debug, Deserialize)]
struct RemoteManifest {
    resources: Vec<RemoteResource>,
}

#[derive(Debug, Deserialize)]
struct RemoteResource {
    url: String,
    name: Option<String>,
}

/// 读取远程资源清单 `{"resources": [{"url": ..., "name": ...}]}`
///
/// 未给出名称时取URL路径的最后一段。
pub fn read_remote_manifest(file: &DatasetFile) -> Result<Vec<UriSource>> {
    let manifest: RemoteManifest = serde_json::from_slice(&file.data)?;
    Ok(manifest
        .resources
        .into_iter()
        .map(|resource| {
            let name = resource
                .name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| default_resource_name(&resource.url));
            UriSource {
                uri: resource.url,
                name,
            }
        })
        .collect())
}

fn default_resource_name(uri: &str) -> String {
    url::Url::parse(uri)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| uri.to_string())
}

/// 远程资源获取
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// 是否能够获取该URI
    fn can_fetch(&self, uri: &str) -> bool;

    async fn fetch(&self, uri: &str, name: &str) -> Result<DatasetFile>;
}

/// 基于reqwest的HTTP(S)获取
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    allowed_schemes: Vec<String>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, allowed_schemes: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PacsError::Config(format!("无法创建HTTP客户端: {}", e)))?;
        Ok(Self {
            client,
            allowed_schemes,
        })
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    fn can_fetch(&self, uri: &str) -> bool {
        url::Url::parse(uri)
            .map(|url| self.allowed_schemes.iter().any(|s| s == url.scheme()))
            .unwrap_or(false)
    }

    async fn fetch(&self, uri: &str, name: &str) -> Result<DatasetFile> {
        info!("下载 {}", uri);
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PacsError::Fetch(format!("{}: {}", uri, e)))?;
        let data = response
            .bytes()
            .await
            .map_err(|e| PacsError::Fetch(format!("{}: {}", uri, e)))?;
        debug!("已下载 {} ({} bytes)", name, data.len());
        Ok(DatasetFile::new(name, data))
    }
}
