//! # DICOM组织与卷构建模块
//!
//! 提供单worker优先级任务队列、DICOM标签解析、患者/检查/卷层级组织以及切片与体数据缓存。

pub mod deferred;
pub mod dicom_io;
pub mod file_store;
pub mod hierarchy;
pub mod image_store;
pub mod native;
pub mod parser;
pub mod slice_cache;
pub mod store;
pub mod task_queue;
pub mod transfer_syntax;
pub mod worker;

pub use deferred::{deferred, Deferred, Resolver};
pub use dicom_io::DicomIo;
pub use file_store::FileStore;
pub use hierarchy::{DicomHierarchy, Node, RemovedVolume};
pub use image_store::{ImageStore, VolumeImage};
pub use native::{NativeDicomWorker, NativeLauncher};
pub use parser::{DicomParser, PixelModule, SliceHeader};
pub use slice_cache::VolumeCache;
pub use store::{DicomStore, ImportedBatch, StoreSnapshot, StoreState, VolumeRecord};
pub use task_queue::{PriorityTaskQueue, QueuePriorities};
pub use transfer_syntax::TransferSyntaxManager;
pub use worker::{DicomWorker, StaticLauncher, TagSpec, VolumeGroups, WorkerLauncher, DESCRIPTIVE_TAGS};
