//! DICOM IO
//!
//! 持有共享worker与其任务队列。worker在首次使用时惰性启动，启动本身也作为任务经由队列执行；
//! 并发的调用方共享同一个启动过程，启动失败会拒绝所有等待方且不会自动重试。

use crate::task_queue::{PriorityTaskQueue, QueuePriorities};
use crate::worker::{DicomWorker, TagSpec, VolumeGroups, WorkerLauncher};
use futures::future::{BoxFuture, FutureExt, Shared};
use pacs_core::{DatasetFile, ImageData, PacsError, Result, VolumePipeline};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

type InitFuture = Shared<BoxFuture<'static, std::result::Result<(), String>>>;

#[derive(Default)]
struct WorkerSlot {
    worker: Option<Arc<dyn DicomWorker>>,
    init: Option<InitFuture>,
}

/// DICOM IO
pub struct DicomIo {
    launcher: Arc<dyn WorkerLauncher>,
    queue: PriorityTaskQueue,
    priorities: QueuePriorities,
    slot: Arc<Mutex<WorkerSlot>>,
}

impl DicomIo {
    /// 创建新的DICOM IO，worker尚未启动
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self::with_priorities(launcher, QueuePriorities::default())
    }

    pub fn with_priorities(launcher: Arc<dyn WorkerLauncher>, priorities: QueuePriorities) -> Self {
        Self {
            launcher,
            queue: PriorityTaskQueue::new(),
            priorities,
            slot: Arc::new(Mutex::new(WorkerSlot::default())),
        }
    }

    pub fn queue(&self) -> &PriorityTaskQueue {
        &self.queue
    }

    pub fn priorities(&self) -> QueuePriorities {
        self.priorities
    }

    /// worker是否已就绪
    pub fn is_initialized(&self) -> bool {
        self.lock_slot().worker.is_some()
    }

    /// 初始化worker
    ///
    /// 幂等：并发调用共享同一个进行中的启动。失败结果会被保留，
    /// 直到调用方显式调用 [`DicomIo::retry_initialization`]。
    pub async fn initialize(&self) -> Result<Arc<dyn DicomWorker>> {
        let init = {
            let mut slot = self.lock_slot();
            if let Some(worker) = &slot.worker {
                return Ok(worker.clone());
            }
            match &slot.init {
                Some(init) => init.clone(),
                None => {
                    let init = self.start_initialization();
                    slot.init = Some(init.clone());
                    init
                }
            }
        };

        init.await.map_err(PacsError::WorkerInit)?;

        self.lock_slot()
            .worker
            .clone()
            .ok_or_else(|| PacsError::WorkerInit("worker在初始化后已被关闭".to_string()))
    }

    /// 清除失败的初始化结果，下一次使用时重新启动worker
    pub fn retry_initialization(&self) {
        let mut slot = self.lock_slot();
        if slot.worker.is_none() {
            slot.init = None;
            info!("Worker initialization reset, will relaunch on next use");
        }
    }

    /// 关闭worker并释放句柄
    pub async fn shutdown(&self) {
        let worker = {
            let mut slot = self.lock_slot();
            slot.init = None;
            slot.worker.take()
        };
        if let Some(worker) = worker {
            worker.terminate().await;
            info!("DICOM worker terminated");
        }
    }

    fn start_initialization(&self) -> InitFuture {
        let queue = self.queue.clone();
        let launcher = self.launcher.clone();
        let slot = self.slot.clone();
        let priority = self.priorities.default;

        async move {
            info!("Launching DICOM worker");
            let launched = queue
                .submit(priority, async move { launcher.launch().await })
                .await;
            match launched {
                Ok(worker) => {
                    slot.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .worker = Some(worker);
                    info!("DICOM worker ready");
                    Ok(())
                }
                Err(e) => {
                    error!("DICOM worker launch failed: {}", e);
                    Err(e.to_string())
                }
            }
        }
        .boxed()
        .shared()
    }

    /// 在worker上执行一个工作单元
    async fn run<T, F, Fut>(&self, priority: i32, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn DicomWorker>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let worker = self.initialize().await?;
        self.queue.submit(priority, async move { work(worker).await }).await
    }

    /// 将文件按卷分组
    pub async fn categorize(&self, files: Vec<DatasetFile>) -> Result<VolumeGroups> {
        debug!("Categorizing {} files", files.len());
        self.run(self.priorities.default, move |worker| async move {
            worker.categorize(&files).await
        })
        .await
    }

    /// 读取文件标签
    pub async fn read_tags(
        &self,
        file: DatasetFile,
        specs: &'static [TagSpec],
    ) -> Result<HashMap<String, String>> {
        let name = file.name.clone();
        self.run(self.priorities.default, move |worker| async move {
            worker.read_tags(&file, specs).await
        })
        .await
        .map_err(|e| match e {
            PacsError::TagRead(_) | PacsError::WorkerInit(_) => e,
            other => PacsError::TagRead(format!("{}: {}", name, other)),
        })
    }

    /// 解码切片，缩略图使用低优先级
    pub async fn decode_slice(&self, file: DatasetFile, as_thumbnail: bool) -> Result<ImageData> {
        let priority = if as_thumbnail {
            self.priorities.thumbnail
        } else {
            self.priorities.default
        };
        self.run(priority, move |worker| async move {
            worker.decode_slice(&file, as_thumbnail).await
        })
        .await
    }

    /// 构建完整卷，高优先级
    pub async fn build_volume(&self, pipeline: VolumePipeline) -> Result<ImageData> {
        self.run(self.priorities.volume_build, move |worker| async move {
            worker.build_volume(&pipeline).await
        })
        .await
    }

    fn lock_slot(&self) -> MutexGuard<'_, WorkerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
