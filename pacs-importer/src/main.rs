//! 医学影像数据导入程序

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::ImporterConfig;
use futures::future::join_all;
use pacs_core::DatasetFile;
use pacs_dicom::{DicomIo, DicomStore, NativeLauncher};
use pacs_import::{DataImporter, DataSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 导入程序命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-importer")]
#[command(about = "导入本地文件、归档与远程资源，并将DICOM文件组织为患者/检查/卷")]
struct Args {
    /// 本地文件路径或远程URL
    #[arg(required = true)]
    inputs: Vec<String>,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,

    /// 导入后构建所有新建的卷
    #[arg(short, long)]
    build: bool,

    /// 将存储快照写入该文件
    #[arg(short = 'o', long)]
    state_out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ImporterConfig::load(args.config.as_deref())?;

    // 初始化日志
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    config.validate()?;
    info!("启动导入程序，共 {} 个输入", args.inputs.len());

    let mut sources = Vec::with_capacity(args.inputs.len());
    for input in &args.inputs {
        sources.push(to_data_source(input).await?);
    }

    let io = Arc::new(DicomIo::with_priorities(Arc::new(NativeLauncher), config.queue));
    let store = Arc::new(DicomStore::new(io.clone()));
    let importer = DataImporter::new(store.clone(), config.import.clone())?;

    let report = importer.import(sources).await?;
    for source in &report.sources {
        info!(
            "{}: {} 个结果, {} 个错误",
            source.source,
            source.results.len(),
            source.errors.len()
        );
        for err in &source.errors {
            warn!("  {}", err);
        }
    }
    for keys in &report.volumes {
        info!(
            "新建卷 {} (患者 {}, 检查 {})",
            keys.volume_key, keys.patient_key, keys.study_key
        );
    }

    if args.build {
        let builds = report
            .volumes
            .iter()
            .map(|keys| store.build_volume(&keys.volume_key, false));
        for (keys, built) in report.volumes.iter().zip(join_all(builds).await) {
            match built {
                Ok(image) => info!(
                    "卷 {} 构建完成: {:?}, {} 通道",
                    keys.volume_key, image.dimensions, image.components
                ),
                Err(e) => error!("卷 {} 构建失败: {}", keys.volume_key, e),
            }
        }
    }

    if let Some(path) = &args.state_out {
        let snapshot = store.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("无法写入快照 {}", path.display()))?;
        info!("快照已写入 {}", path.display());
    }

    io.shutdown().await;

    if report.failed_sources() > 0 {
        warn!("{} 个输入未能完全导入", report.failed_sources());
    }
    Ok(())
}

/// 将命令行输入转换为数据源
async fn to_data_source(input: &str) -> Result<DataSource> {
    if let Ok(url) = url::Url::parse(input) {
        if url.scheme() != "file" && url.has_host() {
            let name = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|name| !name.is_empty())
                .unwrap_or(input)
                .to_string();
            return Ok(DataSource::from_uri(input, name));
        }
    }

    let path = Path::new(input);
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("无法读取输入文件 {}", input))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| input.to_string());
    Ok(DataSource::from_file(DatasetFile::new(name, data)))
}
