//! 优先级任务队列
//!
//! 所有针对共享worker的工作都经由此队列串行执行：
//! - 任意时刻最多只有一个工作单元在执行
//! - 按优先级从高到低出队，同优先级按提交顺序（FIFO）
//! - 队列为空时排空循环退出，下一次提交时惰性重启

use crate::deferred::{deferred, Deferred};
use futures::future::{BoxFuture, FutureExt};
use pacs_core::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

/// 缩略图任务优先级，负载高时允许被饿死
pub const THUMBNAIL_PRIORITY: i32 = -10;
/// 元数据/标签读取的默认优先级
pub const DEFAULT_PRIORITY: i32 = 0;
/// 完整卷构建优先级
pub const VOLUME_BUILD_PRIORITY: i32 = 10;

/// 各类工作的优先级配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePriorities {
    pub thumbnail: i32,
    pub default: i32,
    pub volume_build: i32,
}

impl Default for QueuePriorities {
    fn default() -> Self {
        Self {
            thumbnail: THUMBNAIL_PRIORITY,
            default: DEFAULT_PRIORITY,
            volume_build: VOLUME_BUILD_PRIORITY,
        }
    }
}

/// 排队中的任务
struct QueuedTask {
    priority: i32,
    sequence: u64,
    job: BoxFuture<'static, ()>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // 大顶堆：优先级高者在前，序号小者在前
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<QueuedTask>,
    next_sequence: u64,
    draining: bool,
}

/// 优先级任务队列
///
/// 克隆得到的句柄共享同一个队列。
#[derive(Clone, Default)]
pub struct PriorityTaskQueue {
    state: Arc<Mutex<QueueState>>,
}

impl std::fmt::Debug for PriorityTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PriorityTaskQueue")
            .field("pending", &state.pending.len())
            .field("draining", &state.draining)
            .finish()
    }
}

impl PriorityTaskQueue {
    /// 创建新的任务队列
    pub fn new() -> Self {
        Self::default()
    }

    /// 提交工作
    ///
    /// 工作在出队前不会被轮询。返回的延迟结果在工作完成后就绪。
    /// 必须在tokio运行时内调用。
    pub fn submit<T, F>(&self, priority: i32, work: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (resolver, deferred) = deferred();
        let job = async move {
            // 等待方已放弃的任务不再占用worker
            if resolver.is_abandoned() {
                debug!("Task abandoned before start, skipped");
                return;
            }
            resolver.settle(work.await);
        }
        .boxed();

        let start_drain = {
            let mut state = self.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.pending.push(QueuedTask {
                priority,
                sequence,
                job,
            });
            debug!(
                "Task #{} queued with priority {} ({} pending)",
                sequence,
                priority,
                state.pending.len()
            );
            !std::mem::replace(&mut state.draining, true)
        };

        if start_drain {
            tokio::spawn(Self::drain(self.state.clone()));
        }

        deferred
    }

    /// 等待中的任务数（不含正在执行的任务）
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// 排空循环是否在运行
    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    async fn drain(state: Arc<Mutex<QueueState>>) {
        debug!("Task queue drain started");
        loop {
            let task = {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                match guard.pending.pop() {
                    Some(task) => task,
                    None => {
                        guard.draining = false;
                        break;
                    }
                }
            };

            // 工作单元panic时其解决器被丢弃，等待方收到内部错误
            if AssertUnwindSafe(task.job).catch_unwind().await.is_err() {
                error!(
                    "Task #{} (priority {}) panicked",
                    task.sequence, task.priority
                );
            }
        }
        debug!("Task queue drained");
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::PacsError;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let queue = PriorityTaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        // 先占住worker，保证后续任务全部入队后才开始出队
        let (release, gate) = oneshot::channel::<()>();
        let blocker = queue.submit(i32::MAX, async move {
            let _ = gate.await;
            Ok(())
        });

        let mut handles = Vec::new();
        for (label, priority) in [("1-first", 1), ("5", 5), ("1-second", 1), ("3", 3)] {
            let order = order.clone();
            handles.push(queue.submit(priority, async move {
                order.lock().unwrap().push(label);
                Ok(())
            }));
        }

        release.send(()).unwrap();
        blocker.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["5", "3", "1-first", "1-second"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_overlapping_work() {
        let queue = PriorityTaskQueue::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                queue.submit(i % 7, async move {
                    let now = in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
                    Ok(i)
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        assert_eq!(results.len(), 50);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(max_in_flight.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_only_rejects_its_task() {
        let queue = PriorityTaskQueue::new();
        let failing = queue.submit(0, async { Err::<u32, _>(PacsError::TagRead("bad".into())) });
        let ok = queue.submit(0, async { Ok(1u32) });

        assert!(matches!(failing.await, Err(PacsError::TagRead(_))));
        assert_eq!(ok.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_panic_does_not_stop_drain() {
        let queue = PriorityTaskQueue::new();
        let panicking = queue.submit(5, async {
            if true {
                panic!("worker crashed");
            }
            Ok(0u32)
        });
        let next = queue.submit(0, async { Ok(2u32) });

        assert!(matches!(panicking.await, Err(PacsError::Internal(_))));
        assert_eq!(next.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_task_is_skipped() {
        let queue = PriorityTaskQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let (release, gate) = oneshot::channel::<()>();
        let blocker = queue.submit(0, async move {
            let _ = gate.await;
            Ok(())
        });
        let abandoned = {
            let runs = runs.clone();
            queue.submit(0, async move {
                runs.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            })
        };
        drop(abandoned);

        release.send(()).unwrap();
        blocker.await.unwrap();
        assert_eq!(queue.submit(0, async { Ok(3u8) }).await.unwrap(), 3);
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drain_restarts_lazily() {
        let queue = PriorityTaskQueue::new();
        assert_eq!(queue.submit(0, async { Ok(1u8) }).await.unwrap(), 1);

        // 排空循环退出后再次提交
        for _ in 0..10 {
            if !queue.is_draining() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.submit(0, async { Ok(2u8) }).await.unwrap(), 2);
    }
}
